//! Error types for crash-printer.
//!
//! These only ever surface from host-side calls (`init`, `shutdown`,
//! configuration loading). Code running inside the signal handler never
//! produces an error value.

use crate::signal::MonitoredSignal;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while installing or removing crash handlers.
#[derive(Error, Debug)]
pub enum CrashError {
    /// `init` was called while a session is already active.
    #[error("Crash handlers are already installed")]
    AlreadyInitialized,

    /// `shutdown` was called without an active session.
    #[error("Crash handlers are not installed")]
    NotInitialized,

    /// The log destination could not be opened for appending.
    #[error("Failed to open crash log {}: {source}", path.display())]
    OpenLog {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Reading the current disposition of a signal failed.
    #[error("Failed to query the current handler for {signal}: {source}")]
    QueryHandler {
        signal: MonitoredSignal,
        #[source]
        source: io::Error,
    },

    /// Installing the crash handler for a signal failed.
    #[error("Failed to install crash handler for {signal}: {source}")]
    InstallHandler {
        signal: MonitoredSignal,
        #[source]
        source: io::Error,
    },

    /// Putting the previous disposition of a signal back failed.
    #[error("Failed to restore previous handler for {signal}: {source}")]
    RestoreHandler {
        signal: MonitoredSignal,
        #[source]
        source: io::Error,
    },

    /// Allocating or registering the alternate signal stack failed.
    #[error("Failed to set up alternate signal stack: {0}")]
    AltStack(#[source] io::Error),

    /// The signal name is not one of the monitored signals.
    #[error("Unknown signal: {0}")]
    UnknownSignal(String),

    /// The configuration is not usable.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The configuration file is not valid TOML for `CrashConfig`.
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Generic I/O failure (reading configuration files).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Crash handling is not available on this platform.
    #[error("Crash handling is not supported on this platform")]
    Unsupported,
}

/// Result type for crash-printer operations.
pub type CrashResult<T> = Result<T, CrashError>;
