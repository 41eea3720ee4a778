//! The signal action installed for every monitored signal.
//!
//! On delivery the handler moves through
//! `Idle -> Handling -> Chaining -> (Idle | Terminated)`:
//!
//! 1. Handling: walk the stack and append a report to the log.
//! 2. Chaining: hand the signal to whatever was installed before us.
//!    `SIG_DFL` is restored and the signal raised again so the process
//!    dies (and dumps core) exactly as it would have without us. A real
//!    fault still ends that way after a previous handler returns.
//!
//! The report is always written before chaining. Nothing in this module
//! allocates, locks, or goes through `std::fmt`.

use crate::config::{CrashConfig, DEFAULT_MAX_FRAMES, DEFAULT_MAX_REPORTS};
use crate::registry::{PreviousDisposition, REGISTRY};
use crate::report::{CrashReport, sent_by_kernel};
use crate::signal::MonitoredSignal;
use crate::stack::CaptureOptions;
use crate::writer::SignalSafeWriter;
use nix::errno::Errno;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet};
use std::os::fd::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicU32, AtomicUsize, Ordering};

/// Where the crash handler currently is in handling a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerPhase {
    /// No fault in progress.
    Idle,
    /// Capturing and writing a report.
    Handling,
    /// Passing the signal on to the previous disposition.
    Chaining,
    /// The default action has been re-armed; the process is going down.
    Terminated,
}

impl HandlerPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => HandlerPhase::Handling,
            2 => HandlerPhase::Chaining,
            3 => HandlerPhase::Terminated,
            _ => HandlerPhase::Idle,
        }
    }
}

static PHASE: AtomicU8 = AtomicU8::new(HandlerPhase::Idle as u8);

/// Most recent phase entered by the crash handler on any thread.
pub fn phase() -> HandlerPhase {
    HandlerPhase::from_u8(PHASE.load(Ordering::Acquire))
}

fn enter(phase: HandlerPhase) {
    PHASE.store(phase as u8, Ordering::Release);
}

/// Settings the handler reads on delivery.
///
/// Plain atomics so they can be read without locking. `log_fd` is -1
/// whenever no session is active.
pub(crate) struct HandlerSettings {
    log_fd: AtomicI32,
    max_frames: AtomicUsize,
    skip_frames: AtomicUsize,
    symbolize: AtomicBool,
    max_reports: AtomicU32,
    reports_written: AtomicU32,
}

pub(crate) static SETTINGS: HandlerSettings = HandlerSettings::new();

impl HandlerSettings {
    const fn new() -> Self {
        HandlerSettings {
            log_fd: AtomicI32::new(-1),
            max_frames: AtomicUsize::new(DEFAULT_MAX_FRAMES),
            skip_frames: AtomicUsize::new(0),
            symbolize: AtomicBool::new(true),
            max_reports: AtomicU32::new(DEFAULT_MAX_REPORTS),
            reports_written: AtomicU32::new(0),
        }
    }

    /// Point the handler at `log_fd` with the limits from `config`.
    pub(crate) fn arm(&self, log_fd: RawFd, config: &CrashConfig) {
        self.max_frames
            .store(config.effective_max_frames(), Ordering::Relaxed);
        self.skip_frames.store(config.skip_frames, Ordering::Relaxed);
        self.symbolize.store(config.symbolize, Ordering::Relaxed);
        self.max_reports.store(config.max_reports, Ordering::Relaxed);
        self.reports_written.store(0, Ordering::Relaxed);
        self.log_fd.store(log_fd, Ordering::Release);
    }

    /// Stop writing reports. Called before the log descriptor is closed.
    pub(crate) fn disarm(&self) {
        self.log_fd.store(-1, Ordering::Release);
    }

    pub(crate) fn reports_written(&self) -> u32 {
        self.reports_written.load(Ordering::Acquire)
    }

    /// Claim one report slot. Returns the writer to use, or `None` if no
    /// log is armed or the report cap is reached.
    fn claim_report(&self) -> Option<SignalSafeWriter> {
        let fd = self.log_fd.load(Ordering::Acquire);
        if fd < 0 {
            return None;
        }
        let cap = self.max_reports.load(Ordering::Relaxed);
        self.reports_written
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < cap).then_some(n + 1))
            .ok()
            .map(|_| SignalSafeWriter::new(fd))
    }

    fn capture_options(&self) -> CaptureOptions {
        CaptureOptions {
            max_frames: self.max_frames.load(Ordering::Relaxed),
            skip: self.skip_frames.load(Ordering::Relaxed),
            symbolize: self.symbolize.load(Ordering::Relaxed),
        }
    }
}

/// The `SA_SIGINFO` action installed for each monitored signal.
pub(crate) extern "C" fn handle_fatal_signal(
    signum: libc::c_int,
    info: *mut libc::siginfo_t,
    context: *mut libc::c_void,
) {
    let saved_errno = Errno::last_raw();

    let Some(signal) = MonitoredSignal::from_raw(signum) else {
        return;
    };

    enter(HandlerPhase::Handling);
    if let Some(writer) = SETTINGS.claim_report() {
        // SAFETY: `info` is what the kernel passed to this handler.
        let report = unsafe { CrashReport::from_siginfo(signal, info) };
        report.write_live(&writer, SETTINGS.capture_options());
    }

    enter(HandlerPhase::Chaining);
    // SAFETY: `info` and `context` are forwarded untouched from the kernel.
    unsafe { chain(signal, info, context) };

    // A re-raised default action is still pending; stay Terminated.
    if phase() != HandlerPhase::Terminated {
        enter(HandlerPhase::Idle);
    }
    Errno::set_raw(saved_errno);
}

/// Pass the signal on to the disposition recorded before `init`.
///
/// A missing registry entry (teardown racing a fault) is treated as
/// `SIG_DFL`. A kernel fault that the previous disposition lets return
/// would re-execute the faulting instruction and land back here, so it
/// ends in the default action. Signals sent by `kill` or `raise` return
/// normally.
unsafe fn chain(signal: MonitoredSignal, info: *mut libc::siginfo_t, context: *mut libc::c_void) {
    // SAFETY: `info` is null or kernel-provided.
    let kernel_fault = !info.is_null() && sent_by_kernel(unsafe { (*info).si_code });

    match REGISTRY.get(signal) {
        None | Some(PreviousDisposition::Default) => reraise_with_default(signal),
        Some(PreviousDisposition::Ignore) => {
            // The kernel forces the default action on an ignored fault.
            if kernel_fault {
                reraise_with_default(signal);
            }
        }
        Some(previous @ PreviousDisposition::Simple { handler, mask, .. }) => {
            if previous.resets_on_delivery() {
                restore_default(signal);
            }
            // SAFETY: `mask` is the previous handler's own sa_mask.
            unsafe { with_mask(&mask, || handler(signal.as_raw())) };
            if kernel_fault {
                reraise_with_default(signal);
            }
        }
        Some(previous @ PreviousDisposition::Detailed { handler, mask, .. }) => {
            if previous.resets_on_delivery() {
                restore_default(signal);
            }
            // SAFETY: as above.
            unsafe { with_mask(&mask, || handler(signal.as_raw(), info, context)) };
            if kernel_fault {
                reraise_with_default(signal);
            }
        }
    }
}

/// Re-arm `SIG_DFL` and raise the signal again.
///
/// The signal is blocked while we run, so the raised copy stays pending
/// and is delivered, with its default action, as soon as the handler
/// returns. For a genuine fault, returning re-executes the faulting
/// instruction, which has the same effect.
fn reraise_with_default(signal: MonitoredSignal) {
    enter(HandlerPhase::Terminated);
    restore_default(signal);
    let _ = signal::raise(signal.as_nix());
}

fn restore_default(signal: MonitoredSignal) {
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    // SAFETY: installing SIG_DFL has no preconditions.
    let _ = unsafe { signal::sigaction(signal.as_nix(), &default) };
}

/// Run `f` with `mask` added to the blocked set, as the kernel would have
/// done when delivering to the previous handler.
unsafe fn with_mask(mask: &libc::sigset_t, f: impl FnOnce()) {
    // SAFETY: sigset_t is plain data and is filled in below.
    let mut old: libc::sigset_t = unsafe { std::mem::zeroed() };
    // SAFETY: pthread_sigmask is async-signal-safe; both pointers are valid.
    let blocked = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, mask, &mut old) } == 0;
    f();
    if blocked {
        // SAFETY: `old` was filled in by the call above.
        unsafe { libc::pthread_sigmask(libc::SIG_SETMASK, &old, ptr::null_mut()) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_round_trip() {
        for phase in [
            HandlerPhase::Idle,
            HandlerPhase::Handling,
            HandlerPhase::Chaining,
            HandlerPhase::Terminated,
        ] {
            assert_eq!(HandlerPhase::from_u8(phase as u8), phase);
        }
        assert_eq!(HandlerPhase::from_u8(200), HandlerPhase::Idle);
    }

    #[test]
    fn test_report_cap() {
        let settings = HandlerSettings::new();
        // Not armed yet
        assert!(settings.claim_report().is_none());

        settings.arm(2, &CrashConfig::new("crash.log").with_max_reports(2));
        assert_eq!(settings.claim_report(), Some(SignalSafeWriter::new(2)));
        assert_eq!(settings.claim_report(), Some(SignalSafeWriter::new(2)));
        assert!(settings.claim_report().is_none());
        assert_eq!(settings.reports_written(), 2);

        settings.disarm();
        assert!(settings.claim_report().is_none());
    }

    #[test]
    fn test_capture_options_follow_config() {
        let settings = HandlerSettings::new();
        settings.arm(
            3,
            &CrashConfig::new("crash.log")
                .with_max_frames(5000)
                .with_skip_frames(2)
                .with_symbolize(false),
        );
        let options = settings.capture_options();
        assert_eq!(options.max_frames, crate::config::MAX_FRAMES);
        assert_eq!(options.skip, 2);
        assert!(!options.symbolize);
    }
}
