//! Local persistence.
//!
//! - `snapshot` - JSON snapshot watcher for subscriptions and pending messages

pub mod snapshot;

pub use snapshot::{inspect, SnapshotReport, SnapshotWatcher};
