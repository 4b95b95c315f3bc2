//! Check command - loads and validates a configuration file.

use crate::cli::args::CheckArgs;
use crate::config::Config;
use anyhow::Result;

pub fn run_check(args: CheckArgs) -> Result<()> {
    let config = Config::load(&args.config)?;
    config.validate()?;
    println!("{}: ok", args.config.display());
    println!("mode: {}", config.broker.mode.as_str());
    println!("backends: {}", config.broker.backends.len());
    println!(
        "snapshots: {}",
        if config.snapshot.enabled {
            config.snapshot.dir.display().to_string()
        } else {
            "disabled".to_string()
        }
    );
    Ok(())
}
