//! Head-of-line admission for sequenced messages.
//!
//! Holders sharing a lane are released one at a time in enqueue order; the
//! next one becomes eligible only after the current head is terminal.

use std::collections::{HashMap, VecDeque};

#[derive(Debug, Default)]
pub struct PartitionGate {
    lanes: HashMap<String, VecDeque<String>>,
}

impl PartitionGate {
    /// Appends `tid` to `lane`. Returns true when it is the head.
    pub fn admit(&mut self, lane: &str, tid: &str) -> bool {
        let queue = self.lanes.entry(lane.to_string()).or_default();
        queue.push_back(tid.to_string());
        queue.len() == 1
    }

    /// Removes `tid` from its lane. Returns the new head if the head changed.
    pub fn release(&mut self, lane: &str, tid: &str) -> Option<String> {
        let queue = self.lanes.get_mut(lane)?;
        let was_head = queue.front().is_some_and(|head| head == tid);
        queue.retain(|t| t != tid);
        let next = if was_head { queue.front().cloned() } else { None };
        if queue.is_empty() {
            self.lanes.remove(lane);
        }
        next
    }

    pub fn clear(&mut self) {
        self.lanes.clear();
    }
}
