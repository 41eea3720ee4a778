//! A stand-in for a handler the host installed before crash-printer.
//!
//! It appends one line to a marker file, saying whether the crash log
//! already had content at that point. By default it is installed with
//! `SA_RESETHAND`, the way one-shot crash hooks usually are; a persistent
//! install stays in place and simply returns each time.

use anyhow::{Context, Result};
use crash_printer::{MonitoredSignal, SignalSafeWriter};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet};
use std::ffi::CString;
use std::fs::OpenOptions;
use std::os::fd::IntoRawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicI32, Ordering};

static MARKER_FD: AtomicI32 = AtomicI32::new(-1);
static CRASH_LOG: OnceLock<CString> = OnceLock::new();

extern "C" fn append_marker(_signum: libc::c_int) {
    let fd = MARKER_FD.load(Ordering::Acquire);
    if fd < 0 {
        return;
    }
    let writer = SignalSafeWriter::new(fd);
    if crash_log_has_content() {
        writer.write(b"prev-ran after-report\n");
    } else {
        writer.write(b"prev-ran before-report\n");
    }
}

/// `stat` is async-signal-safe; reading the file back is not needed.
fn crash_log_has_content() -> bool {
    let Some(path) = CRASH_LOG.get() else {
        return false;
    };
    // SAFETY: stat is plain data; all-zeroes is a valid value.
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    // SAFETY: `path` is NUL-terminated and `st` is a valid out pointer.
    unsafe { libc::stat(path.as_ptr(), &mut st) == 0 && st.st_size > 0 }
}

/// Install the marker handler for `signal`.
pub fn install_marker_handler(
    signal: MonitoredSignal,
    marker: &Path,
    crash_log: &Path,
    persistent: bool,
) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(marker)
        .with_context(|| format!("Failed to open marker file {}", marker.display()))?;
    MARKER_FD.store(file.into_raw_fd(), Ordering::Release);

    let crash_log = CString::new(crash_log.as_os_str().as_bytes())
        .context("Crash log path contains a NUL byte")?;
    let _ = CRASH_LOG.set(crash_log);

    let target = signal::Signal::try_from(signal.as_raw())?;
    let flags = if persistent {
        SaFlags::empty()
    } else {
        SaFlags::SA_RESETHAND
    };
    let action = SigAction::new(SigHandler::Handler(append_marker), flags, SigSet::empty());
    // SAFETY: `append_marker` only calls async-signal-safe functions.
    unsafe { signal::sigaction(target, &action) }
        .with_context(|| format!("Failed to install marker handler for {}", signal))?;

    log::debug!(
        "Installed marker handler for {} -> {} (persistent: {})",
        signal,
        marker.display(),
        persistent
    );
    Ok(())
}
