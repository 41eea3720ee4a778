//! Crash handler configuration.

use crate::error::{CrashError, CrashResult};
use crate::signal::MonitoredSignal;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Upper bound on captured frames per report.
pub const MAX_FRAMES: usize = 256;

/// Frames captured per report unless configured otherwise.
pub const DEFAULT_MAX_FRAMES: usize = 64;

/// Reports written per session unless configured otherwise.
pub const DEFAULT_MAX_REPORTS: u32 = 16;

/// Default log destination, relative to the working directory.
const DEFAULT_LOG_PATH: &str = "crash.log";

/// Settings for a crash handling session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrashConfig {
    /// File that reports are appended to. Created if missing.
    pub log_path: PathBuf,
    /// Signals to monitor.
    pub signals: Vec<MonitoredSignal>,
    /// Maximum frames per backtrace, clamped to [`MAX_FRAMES`].
    pub max_frames: usize,
    /// Innermost frames to drop from each backtrace.
    pub skip_frames: usize,
    /// Look up symbol and module names for each frame.
    ///
    /// Lookup goes through `dladdr`, which takes the dynamic loader's lock
    /// on glibc. A fault raised while another thread holds that lock (for
    /// example inside `dlopen`) leaves the handler waiting on it forever.
    /// Turn this off for processes that load libraries while running.
    pub symbolize: bool,
    /// Run the handler on a dedicated alternate signal stack.
    pub alt_stack: bool,
    /// Reports written before further deliveries only chain.
    pub max_reports: u32,
}

impl Default for CrashConfig {
    fn default() -> Self {
        CrashConfig {
            log_path: PathBuf::from(DEFAULT_LOG_PATH),
            signals: MonitoredSignal::ALL.to_vec(),
            max_frames: DEFAULT_MAX_FRAMES,
            skip_frames: 0,
            symbolize: true,
            alt_stack: true,
            max_reports: DEFAULT_MAX_REPORTS,
        }
    }
}

impl CrashConfig {
    /// Default configuration writing to `log_path`.
    pub fn new(log_path: impl Into<PathBuf>) -> Self {
        CrashConfig {
            log_path: log_path.into(),
            ..Default::default()
        }
    }

    pub fn with_signals(mut self, signals: impl IntoIterator<Item = MonitoredSignal>) -> Self {
        self.signals = signals.into_iter().collect();
        self
    }

    pub fn with_max_frames(mut self, max_frames: usize) -> Self {
        self.max_frames = max_frames;
        self
    }

    pub fn with_skip_frames(mut self, skip_frames: usize) -> Self {
        self.skip_frames = skip_frames;
        self
    }

    pub fn with_symbolize(mut self, symbolize: bool) -> Self {
        self.symbolize = symbolize;
        self
    }

    pub fn with_alt_stack(mut self, alt_stack: bool) -> Self {
        self.alt_stack = alt_stack;
        self
    }

    pub fn with_max_reports(mut self, max_reports: u32) -> Self {
        self.max_reports = max_reports;
        self
    }

    /// Parse a configuration from TOML. Missing keys take their defaults.
    pub fn from_toml_str(content: &str) -> CrashResult<Self> {
        let config: CrashConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file.
    pub fn load(path: &Path) -> CrashResult<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Check that the configuration can be used to start a session.
    pub fn validate(&self) -> CrashResult<()> {
        if self.log_path.as_os_str().is_empty() {
            return Err(CrashError::InvalidConfig(
                "log_path must not be empty".to_string(),
            ));
        }
        if self.signals.is_empty() {
            return Err(CrashError::InvalidConfig(
                "at least one signal must be monitored".to_string(),
            ));
        }
        if self.max_frames == 0 {
            return Err(CrashError::InvalidConfig(
                "max_frames must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Monitored signals, deduplicated, in registry order.
    pub fn monitored_signals(&self) -> Vec<MonitoredSignal> {
        let mut signals = self.signals.clone();
        signals.sort();
        signals.dedup();
        signals
    }

    /// Frame bound actually used by the handler.
    pub fn effective_max_frames(&self) -> usize {
        self.max_frames.clamp(1, MAX_FRAMES)
    }
}
