//! Redelivery backoff policy.

use std::time::Duration;

/// Maximum time a QoS1 delivery may stay unacknowledged.
pub const DEFAULT_MAX_IN_FLIGHT: Duration = Duration::from_secs(2 * 60 * 60);

pub const DEFAULT_BACKOFF_STEPS_SECS: [u64; 10] = [0, 5, 10, 30, 60, 120, 300, 600, 1_800, 3_600];

/// Maps an attempt count to the delay before the next delivery.
///
/// Steps are normalised to a running maximum and clamped to `max_in_flight`,
/// so the schedule is non-decreasing. Attempts past the last step use the cap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    steps: Vec<Duration>,
    max_in_flight: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_BACKOFF_STEPS_SECS.iter().map(|s| Duration::from_secs(*s)),
            DEFAULT_MAX_IN_FLIGHT,
        )
    }
}

impl BackoffPolicy {
    pub fn new(steps: impl IntoIterator<Item = Duration>, max_in_flight: Duration) -> Self {
        let mut floor = Duration::ZERO;
        let steps = steps
            .into_iter()
            .map(|step| {
                floor = floor.max(step).min(max_in_flight);
                floor
            })
            .collect();
        Self {
            steps,
            max_in_flight,
        }
    }

    pub fn from_millis(steps: &[u64], max_in_flight_ms: u64) -> Self {
        Self::new(
            steps.iter().map(|ms| Duration::from_millis(*ms)),
            Duration::from_millis(max_in_flight_ms),
        )
    }

    pub fn next_delay(&self, attempts: u32) -> Duration {
        self.steps
            .get(attempts as usize)
            .copied()
            .unwrap_or(self.max_in_flight)
    }

    /// Delay used when nobody is bound to the queue.
    pub fn min_delay(&self) -> Duration {
        self.next_delay(0)
    }

    pub fn max_in_flight(&self) -> Duration {
        self.max_in_flight
    }
}
