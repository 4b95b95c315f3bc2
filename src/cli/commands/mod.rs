//! CLI command implementations.

mod check;
mod snapshot;
mod start;

pub use check::run_check;
pub use snapshot::run_snapshot;
pub use start::run_start;
