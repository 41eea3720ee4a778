//! Dispositions that were in place before the crash handler took over.
//!
//! One slot per [`MonitoredSignal`]. Slots are written during `init`
//! before the crash handler is installed for that signal, and read from
//! inside the handler. Each slot is published with a release store of its
//! state, so the handler never sees a half-written action and needs no
//! lock.

use crate::error::{CrashError, CrashResult};
use crate::signal::MonitoredSignal;
use std::cell::UnsafeCell;
use std::fmt;
use std::io;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicU8, Ordering};

/// Handler installed with `sa_handler`.
pub type SimpleHandler = extern "C" fn(libc::c_int);

/// Handler installed with `sa_sigaction` and `SA_SIGINFO`.
pub type DetailedHandler = extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void);

/// What a signal was set to before the crash handler was installed.
#[derive(Clone, Copy)]
pub enum PreviousDisposition {
    /// `SIG_DFL`.
    Default,
    /// `SIG_IGN`.
    Ignore,
    /// A plain `void (*)(int)` handler.
    Simple {
        handler: SimpleHandler,
        flags: libc::c_int,
        mask: libc::sigset_t,
    },
    /// A three-argument `SA_SIGINFO` handler.
    Detailed {
        handler: DetailedHandler,
        flags: libc::c_int,
        mask: libc::sigset_t,
    },
}

impl PreviousDisposition {
    fn from_raw(action: &libc::sigaction) -> Self {
        match action.sa_sigaction {
            libc::SIG_DFL => PreviousDisposition::Default,
            libc::SIG_IGN => PreviousDisposition::Ignore,
            address if action.sa_flags & libc::SA_SIGINFO != 0 => PreviousDisposition::Detailed {
                // SAFETY: with SA_SIGINFO the kernel calls this address with
                // the three-argument signature.
                handler: unsafe { std::mem::transmute::<usize, DetailedHandler>(address) },
                flags: action.sa_flags,
                mask: action.sa_mask,
            },
            address => PreviousDisposition::Simple {
                // SAFETY: without SA_SIGINFO the address is a one-argument
                // handler.
                handler: unsafe { std::mem::transmute::<usize, SimpleHandler>(address) },
                flags: action.sa_flags,
                mask: action.sa_mask,
            },
        }
    }

    /// Whether the previous handler asked to be reset to `SIG_DFL` on
    /// delivery (`SA_RESETHAND`).
    pub fn resets_on_delivery(&self) -> bool {
        match self {
            PreviousDisposition::Simple { flags, .. } | PreviousDisposition::Detailed { flags, .. } => {
                flags & libc::SA_RESETHAND != 0
            }
            _ => false,
        }
    }

    /// Address of the previous handler function, if any.
    pub fn handler_address(&self) -> Option<usize> {
        match self {
            PreviousDisposition::Simple { handler, .. } => Some(*handler as usize),
            PreviousDisposition::Detailed { handler, .. } => Some(*handler as usize),
            _ => None,
        }
    }
}

impl fmt::Debug for PreviousDisposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PreviousDisposition::Default => f.write_str("Default"),
            PreviousDisposition::Ignore => f.write_str("Ignore"),
            PreviousDisposition::Simple { handler, flags, .. } => f
                .debug_struct("Simple")
                .field("handler", &(*handler as usize as *const ()))
                .field("flags", flags)
                .finish_non_exhaustive(),
            PreviousDisposition::Detailed { handler, flags, .. } => f
                .debug_struct("Detailed")
                .field("handler", &(*handler as usize as *const ()))
                .field("flags", flags)
                .finish_non_exhaustive(),
        }
    }
}

const EMPTY: u8 = 0;
const WRITING: u8 = 1;
const RECORDED: u8 = 2;

struct Slot {
    state: AtomicU8,
    action: UnsafeCell<MaybeUninit<libc::sigaction>>,
}

impl Slot {
    const fn new() -> Self {
        Slot {
            state: AtomicU8::new(EMPTY),
            action: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

/// Per-signal store of previous dispositions.
pub struct HandlerRegistry {
    slots: [Slot; MonitoredSignal::COUNT],
}

// SAFETY: a slot's `action` is only written while its state is WRITING,
// which a single writer claims with a compare-exchange, and only read
// after observing RECORDED with acquire ordering.
unsafe impl Sync for HandlerRegistry {}

/// The process-wide registry used by the crash handler.
pub(crate) static REGISTRY: HandlerRegistry = HandlerRegistry::new();

/// The disposition `signal` had before the active session installed the
/// crash handler, or `None` outside a session.
pub fn previous_disposition(signal: MonitoredSignal) -> Option<PreviousDisposition> {
    REGISTRY.get(signal)
}

impl HandlerRegistry {
    pub const fn new() -> Self {
        HandlerRegistry {
            slots: [const { Slot::new() }; MonitoredSignal::COUNT],
        }
    }

    /// Read the current disposition of `signal` and store it.
    ///
    /// If the slot already holds a disposition it is kept as is and
    /// returned; a predecessor is only ever captured once per session.
    pub fn record(&self, signal: MonitoredSignal) -> CrashResult<PreviousDisposition> {
        let slot = &self.slots[signal.index()];

        if slot
            .state
            .compare_exchange(EMPTY, WRITING, Ordering::Acquire, Ordering::Acquire)
            .is_err()
        {
            return self
                .get(signal)
                .ok_or(CrashError::AlreadyInitialized);
        }

        // SAFETY: a null new action makes `sigaction` a pure query.
        let mut current = MaybeUninit::<libc::sigaction>::zeroed();
        let rc = unsafe { libc::sigaction(signal.as_raw(), ptr::null(), current.as_mut_ptr()) };
        if rc != 0 {
            slot.state.store(EMPTY, Ordering::Release);
            return Err(CrashError::QueryHandler {
                signal,
                source: io::Error::last_os_error(),
            });
        }

        // SAFETY: `sigaction` succeeded and filled the struct.
        let current = unsafe { current.assume_init() };
        // SAFETY: we hold the slot in the WRITING state.
        unsafe { (*slot.action.get()).write(current) };
        slot.state.store(RECORDED, Ordering::Release);

        log::debug!(
            "Recorded previous disposition for {}: {:?}",
            signal,
            PreviousDisposition::from_raw(&current)
        );
        Ok(PreviousDisposition::from_raw(&current))
    }

    /// The recorded disposition for `signal`, if any.
    ///
    /// Lock-free and allocation-free; safe to call from the crash handler.
    pub fn get(&self, signal: MonitoredSignal) -> Option<PreviousDisposition> {
        self.raw(signal).map(|action| PreviousDisposition::from_raw(&action))
    }

    fn raw(&self, signal: MonitoredSignal) -> Option<libc::sigaction> {
        let slot = &self.slots[signal.index()];
        if slot.state.load(Ordering::Acquire) != RECORDED {
            return None;
        }
        // SAFETY: RECORDED is only published after the action was written.
        Some(unsafe { (*slot.action.get()).assume_init() })
    }

    pub fn is_recorded(&self, signal: MonitoredSignal) -> bool {
        self.slots[signal.index()].state.load(Ordering::Acquire) == RECORDED
    }

    /// Reinstall the recorded disposition for `signal` and clear the slot.
    ///
    /// Does nothing if nothing was recorded.
    pub fn restore(&self, signal: MonitoredSignal) -> CrashResult<()> {
        let Some(action) = self.raw(signal) else {
            return Ok(());
        };

        // SAFETY: `action` is exactly what the kernel handed us earlier.
        let rc = unsafe { libc::sigaction(signal.as_raw(), &action, ptr::null_mut()) };
        if rc != 0 {
            return Err(CrashError::RestoreHandler {
                signal,
                source: io::Error::last_os_error(),
            });
        }

        self.forget(signal);
        log::debug!("Restored previous disposition for {}", signal);
        Ok(())
    }

    /// Drop the recorded disposition without touching the signal table.
    pub(crate) fn forget(&self, signal: MonitoredSignal) {
        self.slots[signal.index()]
            .state
            .store(EMPTY, Ordering::Release);
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet};
    use serial_test::serial;

    extern "C" fn noop_handler(_: libc::c_int) {}

    extern "C" fn noop_detailed(_: libc::c_int, _: *mut libc::siginfo_t, _: *mut libc::c_void) {}

    fn set(signal: MonitoredSignal, handler: SigHandler, flags: SaFlags) -> SigAction {
        let action = SigAction::new(handler, flags, SigSet::empty());
        unsafe { signal::sigaction(signal.as_nix(), &action) }.unwrap()
    }

    fn current_handler(signal: MonitoredSignal) -> SigHandler {
        let probe = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        let old = unsafe { signal::sigaction(signal.as_nix(), &probe) }.unwrap();
        unsafe { signal::sigaction(signal.as_nix(), &old) }.unwrap();
        old.handler()
    }

    #[test]
    #[serial]
    fn test_record_default_and_restore() {
        let registry = HandlerRegistry::new();
        let signal = MonitoredSignal::Fpe;
        set(signal, SigHandler::SigDfl, SaFlags::empty());

        let recorded = registry.record(signal).unwrap();
        assert!(matches!(recorded, PreviousDisposition::Default));
        assert!(registry.is_recorded(signal));

        set(signal, SigHandler::Handler(noop_handler), SaFlags::empty());
        registry.restore(signal).unwrap();

        assert!(!registry.is_recorded(signal));
        assert_eq!(current_handler(signal), SigHandler::SigDfl);
    }

    #[test]
    #[serial]
    fn test_record_simple_handler_with_flags() {
        let registry = HandlerRegistry::new();
        let signal = MonitoredSignal::Ill;
        let original = set(
            signal,
            SigHandler::Handler(noop_handler),
            SaFlags::SA_RESETHAND,
        );

        let recorded = registry.record(signal).unwrap();
        assert!(matches!(recorded, PreviousDisposition::Simple { .. }));
        assert!(recorded.resets_on_delivery());
        assert_eq!(recorded.handler_address(), Some(noop_handler as usize));

        registry.restore(signal).unwrap();
        unsafe { signal::sigaction(signal.as_nix(), &original) }.unwrap();
    }

    #[test]
    #[serial]
    fn test_record_detailed_and_ignore() {
        let registry = HandlerRegistry::new();

        let original_fpe = set(
            MonitoredSignal::Fpe,
            SigHandler::SigAction(noop_detailed),
            SaFlags::empty(),
        );
        let original_abrt = set(MonitoredSignal::Abrt, SigHandler::SigIgn, SaFlags::empty());

        let detailed = registry.record(MonitoredSignal::Fpe).unwrap();
        assert!(matches!(detailed, PreviousDisposition::Detailed { .. }));
        assert!(!detailed.resets_on_delivery());
        assert_eq!(detailed.handler_address(), Some(noop_detailed as usize));

        let ignored = registry.record(MonitoredSignal::Abrt).unwrap();
        assert!(matches!(ignored, PreviousDisposition::Ignore));
        assert_eq!(ignored.handler_address(), None);

        registry.forget(MonitoredSignal::Fpe);
        registry.forget(MonitoredSignal::Abrt);
        unsafe { signal::sigaction(MonitoredSignal::Fpe.as_nix(), &original_fpe) }.unwrap();
        unsafe { signal::sigaction(MonitoredSignal::Abrt.as_nix(), &original_abrt) }.unwrap();
    }

    #[test]
    #[serial]
    fn test_second_record_keeps_first_entry() {
        let registry = HandlerRegistry::new();
        let signal = MonitoredSignal::Fpe;
        let original = set(signal, SigHandler::SigDfl, SaFlags::empty());

        registry.record(signal).unwrap();
        set(signal, SigHandler::Handler(noop_handler), SaFlags::empty());

        // The slot still describes what was there first.
        let again = registry.record(signal).unwrap();
        assert!(matches!(again, PreviousDisposition::Default));
        assert!(matches!(
            registry.get(signal),
            Some(PreviousDisposition::Default)
        ));

        registry.restore(signal).unwrap();
        assert_eq!(current_handler(signal), SigHandler::SigDfl);
        unsafe { signal::sigaction(signal.as_nix(), &original) }.unwrap();
    }

    #[test]
    fn test_restore_without_record_is_noop() {
        let registry = HandlerRegistry::new();
        assert!(registry.get(MonitoredSignal::Bus).is_none());
        assert!(registry.restore(MonitoredSignal::Bus).is_ok());
    }
}
