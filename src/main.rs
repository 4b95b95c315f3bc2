//! FerryMQ - CLI entrypoint.
//!
//! Usage:
//!   ferrymq start --config config/ferrymq.toml
//!   ferrymq check --config config/ferrymq.toml
//!   ferrymq snapshot inspect <dir>

use anyhow::Result;
use clap::Parser;
use ferrymq::cli::commands::{run_check, run_snapshot, run_start};
use ferrymq::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start(args) => run_start(args).await,
        Commands::Check(args) => run_check(args),
        Commands::Snapshot(args) => run_snapshot(args),
    }
}
