//! Backtrace capture that is usable from inside a signal handler.
//!
//! The crash handler uses [`walk`], which hands frames over one at a time
//! and stores none of them. [`Backtrace`] keeps raw addresses in a
//! fixed-size array for callers outside signal context.
//!
//! Symbol lookup is best effort and goes through `dladdr`; frames it
//! cannot place keep their bare address. `dladdr` does not allocate, but
//! glibc takes the loader lock inside it, so a fault raised while that
//! lock is held (in the middle of `dlopen`, say) would deadlock the
//! handler. Set `symbolize = false` where that risk matters.

use crate::config::MAX_FRAMES;
use std::ffi::{CStr, c_char};
use std::ptr;

/// One captured stack frame.
#[derive(Debug, Clone, Copy)]
pub struct Frame {
    address: usize,
    symbol: *const c_char,
    module: *const c_char,
    symbol_offset: usize,
    module_offset: usize,
}

impl Frame {
    pub const fn new(address: usize) -> Self {
        Frame {
            address,
            symbol: ptr::null(),
            module: ptr::null(),
            symbol_offset: 0,
            module_offset: 0,
        }
    }

    /// Instruction pointer (return address for all but the innermost frame).
    pub fn address(&self) -> usize {
        self.address
    }

    /// Nearest exported symbol, as reported by the dynamic loader.
    pub fn symbol(&self) -> Option<&CStr> {
        // SAFETY: non-null pointers come from `dladdr` and point into the
        // string tables of a loaded object.
        (!self.symbol.is_null()).then(|| unsafe { CStr::from_ptr(self.symbol) })
    }

    /// Offset of `address` from the start of [`Frame::symbol`].
    pub fn symbol_offset(&self) -> usize {
        self.symbol_offset
    }

    /// Path of the object containing the frame.
    pub fn module(&self) -> Option<&CStr> {
        // SAFETY: as for `symbol`.
        (!self.module.is_null()).then(|| unsafe { CStr::from_ptr(self.module) })
    }

    /// Offset of `address` from the load address of [`Frame::module`].
    pub fn module_offset(&self) -> usize {
        self.module_offset
    }

    /// A frame for `address`, symbolized if asked to. `innermost` is the
    /// faulting instruction itself rather than a return address.
    fn resolve(address: usize, innermost: bool, symbolize: bool) -> Self {
        let mut frame = Frame::new(address);
        if symbolize {
            let lookup = if innermost {
                address
            } else {
                address.saturating_sub(1)
            };
            frame.symbolize(lookup);
        }
        frame
    }

    /// Fill in symbol and module names. `lookup` is the address handed to
    /// the loader; for return addresses it points one byte back so the
    /// lookup lands inside the calling function.
    fn symbolize(&mut self, lookup: usize) {
        // SAFETY: `Dl_info` is plain data; all-zeroes is a valid value.
        let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
        // SAFETY: `dladdr` only inspects the address, it never dereferences it.
        if unsafe { libc::dladdr(lookup as *const libc::c_void, &mut info) } == 0 {
            return;
        }

        if !info.dli_fname.is_null() {
            self.module = info.dli_fname;
            self.module_offset = self.address.wrapping_sub(info.dli_fbase as usize);
        }
        if !info.dli_sname.is_null() {
            self.symbol = info.dli_sname;
            self.symbol_offset = self.address.wrapping_sub(info.dli_saddr as usize);
        }
    }
}

/// Options for a single capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureOptions {
    /// Frames to keep; values above [`MAX_FRAMES`] are clamped.
    pub max_frames: usize,
    /// Innermost frames to drop before counting.
    pub skip: usize,
    /// Resolve symbol and module names.
    pub symbolize: bool,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        CaptureOptions {
            max_frames: MAX_FRAMES,
            skip: 0,
            symbolize: true,
        }
    }
}

/// One entry of a captured backtrace, as rendered in a report.
#[derive(Debug, Clone, Copy)]
pub enum FrameEntry {
    Frame { index: usize, frame: Frame },
    /// The stack continued past the frame bound.
    Truncated { bound: usize },
}

/// Walk the current thread's stack, handing each frame to `visit` as soon
/// as it is found.
///
/// Nothing is collected, so the stack cost stays at one [`Frame`] no
/// matter how deep the walk goes. This is what the crash handler uses:
/// it may be running on a thread's small alternate signal stack. A stack
/// deeper than the bound ends with a [`FrameEntry::Truncated`] entry.
#[inline(never)]
pub fn walk(options: CaptureOptions, mut visit: impl FnMut(FrameEntry)) {
    let bound = options.max_frames.clamp(1, MAX_FRAMES);
    let mut skipped = 0;
    let mut index = 0;

    // SAFETY: the unsynchronized variant takes no locks, which is what
    // makes it usable from a signal handler.
    unsafe {
        backtrace::trace_unsynchronized(|raw| {
            if skipped < options.skip {
                skipped += 1;
                return true;
            }
            if index == bound {
                visit(FrameEntry::Truncated { bound });
                return false;
            }
            let frame = Frame::resolve(raw.ip() as usize, index == 0, options.symbolize);
            visit(FrameEntry::Frame { index, frame });
            index += 1;
            true
        });
    }
}

/// A captured backtrace. Only addresses are stored; names are looked up
/// when the frames are read.
pub struct Backtrace {
    addresses: [usize; MAX_FRAMES],
    len: usize,
    bound: usize,
    truncated: bool,
    symbolize: bool,
}

impl Backtrace {
    /// Capture up to `max_frames` frames of the current thread's stack.
    pub fn capture(max_frames: usize) -> Self {
        Self::capture_with(CaptureOptions {
            max_frames,
            ..Default::default()
        })
    }

    /// Capture with explicit options.
    ///
    /// Never fails: if the unwinder cannot make progress the result is
    /// simply shorter, possibly empty.
    #[inline(never)]
    pub fn capture_with(options: CaptureOptions) -> Self {
        let mut bt = Backtrace::empty(options.max_frames);
        bt.symbolize = options.symbolize;
        let mut skipped = 0;

        // SAFETY: as in `walk`. The closure only writes into `bt`, which
        // lives on this stack frame.
        unsafe {
            backtrace::trace_unsynchronized(|frame| {
                if skipped < options.skip {
                    skipped += 1;
                    return true;
                }
                if bt.len == bt.bound {
                    bt.truncated = true;
                    return false;
                }
                bt.addresses[bt.len] = frame.ip() as usize;
                bt.len += 1;
                true
            });
        }
        bt
    }

    fn empty(max_frames: usize) -> Self {
        Backtrace {
            addresses: [0; MAX_FRAMES],
            len: 0,
            bound: max_frames.clamp(1, MAX_FRAMES),
            truncated: false,
            symbolize: false,
        }
    }

    /// Build a backtrace from known addresses without walking the stack.
    /// The frames are not symbolized.
    pub fn from_addresses(addresses: &[usize], max_frames: usize) -> Self {
        let mut bt = Backtrace::empty(max_frames);
        for &address in addresses {
            if bt.len == bt.bound {
                bt.truncated = true;
                break;
            }
            bt.addresses[bt.len] = address;
            bt.len += 1;
        }
        bt
    }

    pub fn addresses(&self) -> &[usize] {
        &self.addresses[..self.len]
    }

    /// Frames in order, innermost first.
    pub fn frames(&self) -> impl Iterator<Item = Frame> + '_ {
        self.addresses()
            .iter()
            .enumerate()
            .map(|(i, &address)| Frame::resolve(address, i == 0, self.symbolize))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Frame bound this backtrace was captured with.
    pub fn bound(&self) -> usize {
        self.bound
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Frames in order, followed by a [`FrameEntry::Truncated`] sentinel if
    /// the stack was deeper than the bound.
    pub fn entries(&self) -> impl Iterator<Item = FrameEntry> + '_ {
        let sentinel = self
            .truncated
            .then_some(FrameEntry::Truncated { bound: self.bound });
        self.frames()
            .enumerate()
            .map(|(index, frame)| FrameEntry::Frame { index, frame })
            .chain(sentinel)
    }
}
