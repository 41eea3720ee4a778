//! crash-probe: exercise crash-printer's handlers by crashing on purpose.

mod cli;
#[cfg(unix)]
mod fault;
#[cfg(unix)]
mod prior;

use anyhow::{Context, Result, bail};
use clap::Parser;
use cli::{Cli, Commands, TriggerArgs};
use crash_printer::{CrashConfig, MonitoredSignal};
use std::process::ExitCode;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Signals => {
            print_signals();
            Ok(())
        }
        Commands::Trigger(args) => trigger(args),
    }
}

fn print_signals() {
    for signal in MonitoredSignal::ALL {
        println!("{:<8} {}", signal.name(), signal.description());
    }
}

fn build_config(args: &TriggerArgs) -> Result<CrashConfig> {
    let mut config = match &args.config {
        Some(path) => CrashConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => CrashConfig::default(),
    };
    if let Some(log) = &args.log {
        config.log_path = log.clone();
    }
    if let Some(max_frames) = args.max_frames {
        config.max_frames = max_frames;
    }
    Ok(config)
}

#[cfg(unix)]
fn trigger(args: TriggerArgs) -> Result<()> {
    let config = build_config(&args)?;
    log::info!(
        "Triggering {} with reports going to {}",
        args.signal,
        config.log_path.display()
    );

    if let Some(marker) = &args.marker {
        prior::install_marker_handler(
            args.signal,
            marker,
            &config.log_path,
            args.marker_persistent,
        )?;
    }

    crash_printer::init_with(config.clone()).context("Failed to install crash handlers")?;

    if args.init_twice {
        match crash_printer::init_with(config) {
            Ok(()) => bail!("second init unexpectedly succeeded"),
            Err(e) => eprintln!("second init rejected: {}", e),
        }
    }

    if args.shutdown_first {
        crash_printer::shutdown().context("Failed to remove crash handlers")?;
    }

    if args.on_thread {
        let (depth, signal) = (args.depth, args.signal);
        std::thread::Builder::new()
            .name("faulting".to_string())
            .spawn(move || fault::fault_at_depth(depth, signal))
            .context("Failed to spawn faulting thread")?
            .join()
            .map_err(|_| anyhow::anyhow!("faulting thread panicked"))?;
    } else {
        fault::fault_at_depth(args.depth, args.signal);
    }

    bail!("{} was delivered but the process did not terminate", args.signal)
}

#[cfg(not(unix))]
fn trigger(args: TriggerArgs) -> Result<()> {
    let _config = build_config(&args)?;
    bail!("crash handlers are not supported on this platform")
}
