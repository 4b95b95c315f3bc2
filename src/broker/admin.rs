//! Administrative force operations.
//!
//! These always act on the local registry. Absent queues are not an error.

use super::Broker;
use crate::messaging::queue::{QueueKey, QueueView};

impl Broker {
    /// One summary per queue, staging included, sorted by key.
    pub fn view_queues(&self) -> Vec<QueueView> {
        self.registry().queues().iter().map(|q| q.view()).collect()
    }

    /// Makes every pending holder of the queue due now.
    pub fn force_distribute(&self, topic: &str, consumer_group: &str) -> usize {
        let key = QueueKey::new(topic, consumer_group);
        let moved = self
            .registry()
            .queue(&key)
            .map_or(0, |queue| queue.force_distribute());
        tracing::info!(queue = %key, moved, "force distribute");
        moved
    }

    /// Drops every message of the queue; bindings stay.
    pub fn force_clear(&self, topic: &str, consumer_group: &str) -> usize {
        let key = QueueKey::new(topic, consumer_group);
        let cleared = self.registry().queue(&key).map_or(0, |queue| queue.clear());
        tracing::info!(queue = %key, cleared, "force clear");
        cleared
    }

    /// Removes the queue together with its messages and bindings.
    pub fn force_delete(&self, topic: &str, consumer_group: &str) -> bool {
        let key = QueueKey::new(topic, consumer_group);
        if self.registry().remove_queue(&key).is_none() {
            return false;
        }
        for mut keys in self.inner.session_queues.iter_mut() {
            keys.remove(&key);
        }
        tracing::info!(queue = %key, "force delete");
        true
    }
}
