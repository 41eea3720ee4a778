//! Dedicated alternate signal stack for the crash handler.
//!
//! A stack overflow raises SIGSEGV with no usable stack left, so the
//! handler has to run somewhere else. The Rust runtime installs a small
//! alternate stack of its own, but a report with a few hundred frames
//! needs more room than that, so we map a larger one with a guard page
//! below it.

use crate::error::{CrashError, CrashResult};
use std::io;
use std::ptr;

/// Usable size of the alternate stack, before rounding to pages.
const ALT_STACK_SIZE: usize = 256 * 1024;

/// An alternate stack registered for the thread that called `init`.
pub(crate) struct AltStack {
    /// Start of the mapping, guard page included.
    mapping: *mut libc::c_void,
    mapping_len: usize,
    /// Start of the usable stack, just above the guard page.
    stack: *mut libc::c_void,
    /// Whatever was registered before, put back on release.
    previous: libc::stack_t,
}

// SAFETY: the pointers describe a private mapping owned by this value;
// nothing else frees it.
unsafe impl Send for AltStack {}

impl AltStack {
    /// Map a new stack and make it the calling thread's alternate stack.
    pub(crate) fn install() -> CrashResult<Self> {
        let page = page_size();
        let size = round_up(ALT_STACK_SIZE.max(libc::SIGSTKSZ), page);
        let mapping_len = size + page;

        // SAFETY: anonymous private mapping with no address hint.
        let mapping = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mapping_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if mapping == libc::MAP_FAILED {
            return Err(CrashError::AltStack(io::Error::last_os_error()));
        }

        // SAFETY: the first page of the mapping we just created.
        if unsafe { libc::mprotect(mapping, page, libc::PROT_NONE) } != 0 {
            let err = io::Error::last_os_error();
            // SAFETY: unmapping our own mapping.
            unsafe { libc::munmap(mapping, mapping_len) };
            return Err(CrashError::AltStack(err));
        }

        // SAFETY: still inside the mapping.
        let stack = unsafe { mapping.cast::<u8>().add(page) }.cast::<libc::c_void>();
        let new_stack = libc::stack_t {
            ss_sp: stack,
            ss_flags: 0,
            ss_size: size,
        };
        // SAFETY: stack_t is plain data and is filled in by sigaltstack.
        let mut previous: libc::stack_t = unsafe { std::mem::zeroed() };

        // SAFETY: `new_stack` describes readable and writable memory.
        if unsafe { libc::sigaltstack(&new_stack, &mut previous) } != 0 {
            let err = io::Error::last_os_error();
            // SAFETY: unmapping our own mapping.
            unsafe { libc::munmap(mapping, mapping_len) };
            return Err(CrashError::AltStack(err));
        }

        log::debug!("Installed {} byte alternate signal stack", size);
        Ok(AltStack {
            mapping,
            mapping_len,
            stack,
            previous,
        })
    }

    /// Whether this stack is the calling thread's current alternate stack.
    fn is_current(&self) -> bool {
        // SAFETY: stack_t is plain data and is filled in by sigaltstack.
        let mut current: libc::stack_t = unsafe { std::mem::zeroed() };
        // SAFETY: a null new stack makes this a pure query.
        if unsafe { libc::sigaltstack(ptr::null(), &mut current) } != 0 {
            return false;
        }
        current.ss_sp == self.stack && current.ss_flags & libc::SS_DISABLE == 0
    }
}

impl Drop for AltStack {
    fn drop(&mut self) {
        // The stack can only be unregistered from the thread that
        // registered it. From any other thread it stays mapped.
        if !self.is_current() {
            log::debug!("Alternate signal stack belongs to another thread; leaving it mapped");
            return;
        }

        // SAFETY: `previous` is what sigaltstack reported at install time.
        if unsafe { libc::sigaltstack(&self.previous, ptr::null_mut()) } != 0 {
            log::warn!(
                "Failed to restore previous alternate signal stack: {}",
                io::Error::last_os_error()
            );
            return;
        }
        // SAFETY: no longer registered anywhere.
        unsafe { libc::munmap(self.mapping, self.mapping_len) };
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as usize } else { 4096 }
}

fn round_up(value: usize, multiple: usize) -> usize {
    value.div_ceil(multiple) * multiple
}
