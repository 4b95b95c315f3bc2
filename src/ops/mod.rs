//! Operations.
//!
//! - `telemetry` - Structured logging setup and live filter reloads

pub mod telemetry;

pub use telemetry::*;
