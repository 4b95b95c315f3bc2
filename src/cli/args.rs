//! CLI argument definitions using clap.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// FerryMQ - topic / consumer-group message broker.
#[derive(Parser)]
#[command(name = "ferrymq")]
#[command(version)]
#[command(about = "FerryMQ broker and diagnostic tools")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the broker
    Start(StartArgs),

    /// Validate a configuration file
    Check(CheckArgs),

    /// Snapshot inspection
    Snapshot(SnapshotArgs),
}

// -----------------------------------------------------------------------------
// Start / check commands
// -----------------------------------------------------------------------------

#[derive(Args)]
pub struct StartArgs {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/ferrymq.toml")]
    pub config: PathBuf,
}

#[derive(Args)]
pub struct CheckArgs {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/ferrymq.toml")]
    pub config: PathBuf,
}

// -----------------------------------------------------------------------------
// Snapshot command
// -----------------------------------------------------------------------------

#[derive(Args)]
pub struct SnapshotArgs {
    #[command(subcommand)]
    pub action: SnapshotAction,
}

#[derive(Subcommand)]
pub enum SnapshotAction {
    /// Summarise a snapshot directory
    Inspect(SnapshotInspectArgs),
}

#[derive(Args)]
pub struct SnapshotInspectArgs {
    /// Snapshot directory
    pub dir: PathBuf,
    /// Emit JSON instead of table output
    #[arg(long)]
    pub json: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_snapshot_inspect() {
        let cli = Cli::try_parse_from(["ferrymq", "snapshot", "inspect", "data/snapshot", "--json"]).unwrap();
        match cli.command {
            Commands::Snapshot(SnapshotArgs {
                action: SnapshotAction::Inspect(args),
            }) => {
                assert_eq!(args.dir, PathBuf::from("data/snapshot"));
                assert!(args.json);
            }
            _ => panic!("unexpected command"),
        }
    }

    #[test]
    fn start_defaults_config_path() {
        let cli = Cli::try_parse_from(["ferrymq", "start"]).unwrap();
        match cli.command {
            Commands::Start(args) => assert_eq!(args.config, PathBuf::from("config/ferrymq.toml")),
            _ => panic!("unexpected command"),
        }
    }
}
