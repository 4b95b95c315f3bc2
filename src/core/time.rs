use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Clock abstraction to keep time sourcing injectable in delivery paths.
///
/// Scheduling is expressed in epoch milliseconds because scheduled and
/// expiration times travel in message metadata.
pub trait Clock: Send + Sync + 'static {
    fn now_millis(&self) -> u64;
    fn sleep(&self, duration: Duration) -> tokio::time::Sleep;
}

/// System-backed clock; replaceable in tests or deterministic replay.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
    }

    fn sleep(&self, duration: Duration) -> tokio::time::Sleep {
        tokio::time::sleep(duration)
    }
}
