//! FerryMQ CLI.
//!
//! - `ferrymq start` - Start the broker
//! - `ferrymq check` - Validate a configuration file
//! - `ferrymq snapshot inspect` - Summarise a snapshot directory

mod args;
pub mod commands;

pub use args::{Cli, Commands};
