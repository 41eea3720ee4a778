//! The fixed set of fatal signals that get crash reports.

use crate::error::CrashError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A fatal signal monitored by the crash handler.
///
/// The discriminant doubles as the slot index in the handler registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitoredSignal {
    /// Invalid memory reference.
    #[serde(alias = "SIGSEGV", alias = "sigsegv")]
    Segv = 0,
    /// Illegal instruction.
    #[serde(alias = "SIGILL", alias = "sigill")]
    Ill = 1,
    /// Bus error (bad memory access).
    #[serde(alias = "SIGBUS", alias = "sigbus")]
    Bus = 2,
    /// Erroneous arithmetic operation.
    #[serde(alias = "SIGFPE", alias = "sigfpe")]
    Fpe = 3,
    /// Abort signal, usually from `abort()`.
    #[serde(alias = "SIGABRT", alias = "sigabrt", alias = "abort")]
    Abrt = 4,
}

impl MonitoredSignal {
    /// Number of monitored signals.
    pub const COUNT: usize = 5;

    /// Every monitored signal, in registry order.
    pub const ALL: [MonitoredSignal; Self::COUNT] = [
        MonitoredSignal::Segv,
        MonitoredSignal::Ill,
        MonitoredSignal::Bus,
        MonitoredSignal::Fpe,
        MonitoredSignal::Abrt,
    ];

    /// Slot index of this signal in per-signal tables.
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Conventional signal name, e.g. `SIGSEGV`.
    pub const fn name(self) -> &'static str {
        match self {
            MonitoredSignal::Segv => "SIGSEGV",
            MonitoredSignal::Ill => "SIGILL",
            MonitoredSignal::Bus => "SIGBUS",
            MonitoredSignal::Fpe => "SIGFPE",
            MonitoredSignal::Abrt => "SIGABRT",
        }
    }

    /// Short human-readable description.
    pub const fn description(self) -> &'static str {
        match self {
            MonitoredSignal::Segv => "segmentation fault",
            MonitoredSignal::Ill => "illegal instruction",
            MonitoredSignal::Bus => "bus error",
            MonitoredSignal::Fpe => "floating-point exception",
            MonitoredSignal::Abrt => "abort",
        }
    }

    /// The platform signal number.
    #[cfg(unix)]
    pub const fn as_raw(self) -> libc::c_int {
        match self {
            MonitoredSignal::Segv => libc::SIGSEGV,
            MonitoredSignal::Ill => libc::SIGILL,
            MonitoredSignal::Bus => libc::SIGBUS,
            MonitoredSignal::Fpe => libc::SIGFPE,
            MonitoredSignal::Abrt => libc::SIGABRT,
        }
    }

    /// Map a platform signal number back to a monitored signal.
    #[cfg(unix)]
    pub fn from_raw(signum: libc::c_int) -> Option<Self> {
        Self::ALL.into_iter().find(|signal| signal.as_raw() == signum)
    }

    #[cfg(unix)]
    pub(crate) fn as_nix(self) -> nix::sys::signal::Signal {
        use nix::sys::signal::Signal;
        match self {
            MonitoredSignal::Segv => Signal::SIGSEGV,
            MonitoredSignal::Ill => Signal::SIGILL,
            MonitoredSignal::Bus => Signal::SIGBUS,
            MonitoredSignal::Fpe => Signal::SIGFPE,
            MonitoredSignal::Abrt => Signal::SIGABRT,
        }
    }
}

impl fmt::Display for MonitoredSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MonitoredSignal {
    type Err = CrashError;

    /// Accepts `segv`, `SIGSEGV`, `sigsegv` and so on; `abort` is an alias
    /// for `abrt`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        let short = lower.strip_prefix("sig").unwrap_or(&lower);
        match short {
            "segv" => Ok(MonitoredSignal::Segv),
            "ill" => Ok(MonitoredSignal::Ill),
            "bus" => Ok(MonitoredSignal::Bus),
            "fpe" => Ok(MonitoredSignal::Fpe),
            "abrt" | "abort" => Ok(MonitoredSignal::Abrt),
            _ => Err(CrashError::UnknownSignal(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indices_match_registry_order() {
        for (i, signal) in MonitoredSignal::ALL.iter().enumerate() {
            assert_eq!(signal.index(), i);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_from_raw() {
        assert_eq!(
            MonitoredSignal::from_raw(libc::SIGSEGV),
            Some(MonitoredSignal::Segv)
        );
        assert_eq!(
            MonitoredSignal::from_raw(libc::SIGABRT),
            Some(MonitoredSignal::Abrt)
        );
        assert_eq!(MonitoredSignal::from_raw(libc::SIGINT), None);
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("segv".parse::<MonitoredSignal>().unwrap(), MonitoredSignal::Segv);
        assert_eq!("SIGBUS".parse::<MonitoredSignal>().unwrap(), MonitoredSignal::Bus);
        assert_eq!(" sigfpe ".parse::<MonitoredSignal>().unwrap(), MonitoredSignal::Fpe);
        assert_eq!("abort".parse::<MonitoredSignal>().unwrap(), MonitoredSignal::Abrt);
        assert!(matches!(
            "sigint".parse::<MonitoredSignal>(),
            Err(CrashError::UnknownSignal(name)) if name == "sigint"
        ));
    }

    #[test]
    fn test_display_uses_conventional_name() {
        assert_eq!(MonitoredSignal::Ill.to_string(), "SIGILL");
        assert_eq!(MonitoredSignal::Ill.description(), "illegal instruction");
    }
}
