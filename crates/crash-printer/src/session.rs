//! Process-wide crash handling session: `init` and `shutdown`.
//!
//! The signal table belongs to the process, so the session is a global
//! with an explicit lifecycle rather than a value with a destructor.

use crate::altstack::AltStack;
use crate::config::CrashConfig;
use crate::error::{CrashError, CrashResult};
use crate::handler::{SETTINGS, handle_fatal_signal};
use crate::registry::REGISTRY;
use crate::signal::MonitoredSignal;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet};
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, PoisonError};

const UNINITIALIZED: u8 = 0;
const TRANSITIONING: u8 = 1;
const ACTIVE: u8 = 2;

static LIFECYCLE: AtomicU8 = AtomicU8::new(UNINITIALIZED);

/// Host-side state of the active session. Never touched by the handler.
static SESSION: Mutex<Option<Session>> = Mutex::new(None);

struct Session {
    log_path: PathBuf,
    /// Kept open for the whole session; the handler writes to its
    /// descriptor.
    _log: File,
    installed: Vec<MonitoredSignal>,
    _alt_stack: Option<AltStack>,
}

/// Install crash handlers for all monitored signals, appending reports to
/// `log_path`.
///
/// The log is opened immediately so that an unusable destination is
/// reported here rather than discovered during a crash.
pub fn init(log_path: impl AsRef<Path>) -> CrashResult<()> {
    init_with(CrashConfig::new(log_path.as_ref()))
}

/// Install crash handlers with an explicit configuration.
///
/// Fails with [`CrashError::AlreadyInitialized`] if a session is already
/// active; the recorded previous dispositions are left untouched in that
/// case. On any other failure every handler installed so far is rolled
/// back.
pub fn init_with(config: CrashConfig) -> CrashResult<()> {
    config.validate()?;

    if LIFECYCLE
        .compare_exchange(UNINITIALIZED, TRANSITIONING, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        log::warn!("Crash handlers are already installed; ignoring init");
        return Err(CrashError::AlreadyInitialized);
    }

    match start(&config) {
        Ok(session) => {
            log::info!(
                "Crash handlers installed for {:?}; reports go to {}",
                session.installed,
                session.log_path.display()
            );
            *lock_session() = Some(session);
            LIFECYCLE.store(ACTIVE, Ordering::Release);
            Ok(())
        }
        Err(e) => {
            LIFECYCLE.store(UNINITIALIZED, Ordering::Release);
            Err(e)
        }
    }
}

/// Restore every previous disposition and close the log.
///
/// Handlers are removed before the log is closed, so no delivery can
/// write to a closed descriptor.
pub fn shutdown() -> CrashResult<()> {
    if LIFECYCLE
        .compare_exchange(ACTIVE, TRANSITIONING, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return Err(CrashError::NotInitialized);
    }

    let Some(session) = lock_session().take() else {
        LIFECYCLE.store(UNINITIALIZED, Ordering::Release);
        return Err(CrashError::NotInitialized);
    };

    let mut first_error = None;
    for &signal in session.installed.iter().rev() {
        if let Err(e) = REGISTRY.restore(signal) {
            log::warn!("{}", e);
            first_error.get_or_insert(e);
        }
    }

    SETTINGS.disarm();
    log::info!(
        "Crash handlers removed; {} report(s) written to {}",
        SETTINGS.reports_written(),
        session.log_path.display()
    );
    drop(session);

    LIFECYCLE.store(UNINITIALIZED, Ordering::Release);
    first_error.map_or(Ok(()), Err)
}

/// Whether crash handlers are currently installed.
pub fn is_initialized() -> bool {
    LIFECYCLE.load(Ordering::Acquire) == ACTIVE
}

/// Log destination of the active session.
pub fn log_path() -> Option<PathBuf> {
    lock_session()
        .as_ref()
        .map(|session| session.log_path.clone())
}

/// Signals monitored by the active session.
pub fn monitored_signals() -> Vec<MonitoredSignal> {
    lock_session()
        .as_ref()
        .map(|session| session.installed.clone())
        .unwrap_or_default()
}

fn lock_session() -> std::sync::MutexGuard<'static, Option<Session>> {
    SESSION.lock().unwrap_or_else(PoisonError::into_inner)
}

fn start(config: &CrashConfig) -> CrashResult<Session> {
    let log = open_log(&config.log_path)?;

    let alt_stack = if config.alt_stack {
        Some(AltStack::install()?)
    } else {
        None
    };

    SETTINGS.arm(log.as_raw_fd(), config);

    let mut installed = Vec::new();
    for signal in config.monitored_signals() {
        if let Err(e) = install(signal, config.alt_stack) {
            log::warn!("{}; rolling back", e);
            rollback(&installed);
            SETTINGS.disarm();
            return Err(e);
        }
        installed.push(signal);
    }

    Ok(Session {
        log_path: config.log_path.clone(),
        _log: log,
        installed,
        _alt_stack: alt_stack,
    })
}

fn open_log(path: &Path) -> CrashResult<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o644)
        .open(path)
        .map_err(|source| CrashError::OpenLog {
            path: path.to_path_buf(),
            source,
        })
}

/// Record the current disposition of `signal`, then install the crash
/// handler over it.
fn install(signal: MonitoredSignal, on_alt_stack: bool) -> CrashResult<()> {
    REGISTRY.record(signal)?;

    let mut mask = SigSet::empty();
    mask.add(signal.as_nix());
    let flags = if on_alt_stack {
        SaFlags::SA_ONSTACK
    } else {
        SaFlags::empty()
    };
    let action = SigAction::new(SigHandler::SigAction(handle_fatal_signal), flags, mask);

    // SAFETY: `handle_fatal_signal` only performs async-signal-safe work.
    if let Err(errno) = unsafe { signal::sigaction(signal.as_nix(), &action) } {
        REGISTRY.forget(signal);
        return Err(CrashError::InstallHandler {
            signal,
            source: errno.into(),
        });
    }
    Ok(())
}

fn rollback(installed: &[MonitoredSignal]) {
    for &signal in installed.iter().rev() {
        if let Err(e) = REGISTRY.restore(signal) {
            log::warn!("{}", e);
        }
    }
}
