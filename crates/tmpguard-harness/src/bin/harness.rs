//! CLI entrypoint for the tmpguard crash-test harness.

use std::io::Write;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tmpguard_core::config;
use tmpguard_harness::{HarnessError, Scenario};

/// Crash-test tooling for tmpguard.
#[derive(Debug, Parser)]
#[command(name = "tmpguard-harness")]
#[command(about = "Crash-test harness for the tmpguard temporary-resource registry")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Build a scenario, print its manifest, then die by a fatal signal.
    Victim {
        /// Scenario to build.
        #[arg(long, value_enum)]
        scenario: Scenario,
        /// Directory the scenario creates its files in.
        #[arg(long)]
        dir: PathBuf,
        /// Signal to raise (name or number).
        #[arg(long, default_value = "TERM")]
        signal: String,
    },
    /// Print the resolved fatal-signal set as JSON.
    Signals,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Victim {
            scenario,
            dir,
            signal,
        } => {
            let sig = config::parse_signal_name(&signal)
                .ok_or_else(|| HarnessError::UnknownSignal(signal.clone()))?;
            let (manifest, held) = tmpguard_harness::prepare(scenario, &dir, sig)?;
            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "{}", serde_json::to_string(&manifest)?)?;
            stdout.flush()?;
            drop(stdout);

            let _ = tmpguard_core::sys::raise(sig);
            // Still alive: the signal is ignored or not in the fatal set.
            drop(held);
            return Err(HarnessError::Survived(config::signal_name(sig)).into());
        }
        Command::Signals => {
            let report = tmpguard_harness::signal_report();
            println!("{}", serde_json::to_string(&report)?);
        }
    }

    Ok(())
}
