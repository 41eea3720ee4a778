//! Command-line interface definition using clap.

use clap::{Args, Parser, Subcommand, ValueHint};
use crash_printer::MonitoredSignal;
use std::path::PathBuf;

/// Install crash-printer's handlers and crash on purpose.
#[derive(Parser, Debug)]
#[command(name = "crash-probe")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Install crash handlers, then raise a fatal signal
    Trigger(TriggerArgs),

    /// List the signals that can be monitored
    Signals,
}

#[derive(Args, Debug)]
pub struct TriggerArgs {
    /// Signal to raise: segv, ill, bus, fpe or abrt
    pub signal: MonitoredSignal,

    /// Crash log destination (overrides the config file)
    #[arg(short, long, value_hint = ValueHint::FilePath)]
    pub log: Option<PathBuf>,

    /// Path to a TOML configuration file
    #[arg(short, long, value_hint = ValueHint::FilePath)]
    pub config: Option<PathBuf>,

    /// Maximum backtrace frames per report (overrides the config file)
    #[arg(long)]
    pub max_frames: Option<usize>,

    /// Before init, install a handler that appends to this file
    #[arg(long, value_hint = ValueHint::FilePath)]
    pub marker: Option<PathBuf>,

    /// Install the marker handler without SA_RESETHAND, so it stays
    /// installed after it runs
    #[arg(long, requires = "marker")]
    pub marker_persistent: bool,

    /// Fault on a newly spawned thread instead of the main thread
    #[arg(long)]
    pub on_thread: bool,

    /// Nest this many calls before faulting
    #[arg(long, default_value_t = 0)]
    pub depth: usize,

    /// Call init a second time and report the result on stderr
    #[arg(long)]
    pub init_twice: bool,

    /// Remove the crash handlers again before faulting
    #[arg(long)]
    pub shutdown_first: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_trigger() {
        let cli = Cli::try_parse_from([
            "crash-probe",
            "trigger",
            "SIGBUS",
            "--log",
            "crash.log",
            "--depth",
            "12",
            "--shutdown-first",
        ])
        .unwrap();
        let Commands::Trigger(args) = cli.command else {
            panic!("expected trigger subcommand");
        };
        assert_eq!(args.signal, MonitoredSignal::Bus);
        assert_eq!(args.log, Some(PathBuf::from("crash.log")));
        assert_eq!(args.depth, 12);
        assert!(args.shutdown_first);
        assert!(!args.init_twice);
        assert!(!args.on_thread);
    }

    #[test]
    fn test_persistent_marker_requires_marker() {
        let result = Cli::try_parse_from(["crash-probe", "trigger", "segv", "--marker-persistent"]);
        assert!(result.is_err());

        let cli = Cli::try_parse_from([
            "crash-probe",
            "trigger",
            "segv",
            "--marker",
            "marker.txt",
            "--marker-persistent",
            "--on-thread",
        ])
        .unwrap();
        let Commands::Trigger(args) = cli.command else {
            panic!("expected trigger subcommand");
        };
        assert!(args.marker_persistent);
        assert!(args.on_thread);
    }

    #[test]
    fn test_unknown_signal_is_rejected() {
        let result = Cli::try_parse_from(["crash-probe", "trigger", "sigint"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
