//! Signal-safe crash reports for fatal process signals.
//!
//! [`init`] opens a log file and installs a handler for SIGSEGV, SIGILL,
//! SIGBUS, SIGFPE and SIGABRT. When one of them is delivered, the handler
//! appends a report (signal, fault address, backtrace) to the log and then
//! passes the signal on to whatever handler was installed before, or
//! re-raises it with the default action so the process terminates as it
//! otherwise would have.
//!
//! ```no_run
//! crash_printer::init("crash.log")?;
//! // ... run the application ...
//! crash_printer::shutdown()?;
//! # Ok::<(), crash_printer::CrashError>(())
//! ```
//!
//! Only the handler-side modules (`writer`, `stack`, `report`, `handler`,
//! `registry`) run in signal context. None of them allocate, and the only
//! lock they can reach is the dynamic loader's, inside `dladdr` when
//! symbolization is enabled (see [`CrashConfig::symbolize`]).

mod config;
mod error;
mod signal;

#[cfg(unix)]
mod altstack;
#[cfg(unix)]
mod handler;
#[cfg(unix)]
mod registry;
#[cfg(unix)]
mod report;
#[cfg(unix)]
mod session;
#[cfg(unix)]
mod stack;
#[cfg(unix)]
mod writer;

pub use config::*;
pub use error::*;
pub use signal::*;

#[cfg(unix)]
pub use handler::{HandlerPhase, phase};
#[cfg(unix)]
pub use registry::{
    DetailedHandler, HandlerRegistry, PreviousDisposition, SimpleHandler, previous_disposition,
};
#[cfg(unix)]
pub use report::{CrashReport, LINE_CAPACITY};
#[cfg(unix)]
pub use session::{init, init_with, is_initialized, log_path, monitored_signals, shutdown};
#[cfg(unix)]
pub use stack::{Backtrace, CaptureOptions, Frame, FrameEntry};
#[cfg(unix)]
pub use writer::{LineBuf, SignalSafeWriter};

#[cfg(not(unix))]
mod unsupported {
    use crate::config::CrashConfig;
    use crate::error::{CrashError, CrashResult};
    use std::path::Path;

    pub fn init(_log_path: impl AsRef<Path>) -> CrashResult<()> {
        Err(CrashError::Unsupported)
    }

    pub fn init_with(_config: CrashConfig) -> CrashResult<()> {
        Err(CrashError::Unsupported)
    }

    pub fn shutdown() -> CrashResult<()> {
        Err(CrashError::Unsupported)
    }

    pub fn is_initialized() -> bool {
        false
    }
}

#[cfg(not(unix))]
pub use unsupported::*;
