//! Command-line interface for running the roadsync engine.
#![forbid(unsafe_code)]

use clap::{Parser, Subcommand};

mod config;
mod error;
mod exporter;
mod runner;

pub use error::CliError;

use config::{ResetArgs, SyncArgs};

/// Run the roadsync CLI with the current process arguments and environment.
///
/// # Errors
///
/// Returns [`CliError`] when arguments are invalid or a sync phase fails.
pub fn run() -> Result<(), CliError> {
    let cli = Cli::try_parse().map_err(CliError::ArgumentParsing)?;
    let mut stdout = std::io::stdout().lock();
    match cli.command {
        Command::Sync(args) => runner::run_sync(args, &mut stdout),
        Command::ResetBackfill(args) => runner::run_reset(args, &mut stdout),
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "roadsync",
    about = "Replicate a road network and export feature change batches",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Backfill, poll for updates and export changes.
    Sync(SyncArgs),
    /// Discard backfill checkpoints so the initial load runs again.
    ResetBackfill(ResetArgs),
}

#[cfg(test)]
mod tests;
