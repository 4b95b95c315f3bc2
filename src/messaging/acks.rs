//! In-flight attempt tracking for QoS1 deliveries.
//!
//! Each delivery attempt gets a token. An ack carries the token it was
//! issued with, so a reply for a superseded attempt (already timed out and
//! redelivered) resolves nothing.

use std::collections::{BTreeMap, HashMap};

// ---------------------------------------------------------------------------
// Acknowledgment Types
// ---------------------------------------------------------------------------

/// How an in-flight attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Consumer accepted the message.
    Accepted,
    /// Consumer rejected it; redeliver after backoff.
    Rejected,
}

impl AckOutcome {
    pub fn from_reply(ack: Option<&str>) -> Self {
        if ack == Some("1") {
            Self::Accepted
        } else {
            Self::Rejected
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, AckOutcome::Accepted)
    }
}

/// One outstanding attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlightEntry {
    pub tid: String,
    pub token: u64,
    pub session_id: String,
    /// Epoch milliseconds after which the attempt is considered lost.
    pub deadline: u64,
}

// ---------------------------------------------------------------------------
// In-flight Tracker
// ---------------------------------------------------------------------------

/// At most one entry per tid; re-tracking a tid supersedes the previous token.
#[derive(Debug, Default)]
pub struct InFlightTracker {
    entries: HashMap<String, InFlightEntry>,
    deadlines: BTreeMap<(u64, u64), String>,
    next_token: u64,
}

impl InFlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, tid: &str, session_id: &str, deadline: u64) -> u64 {
        self.remove(tid);
        self.next_token = self.next_token.wrapping_add(1);
        let token = self.next_token;
        self.deadlines.insert((deadline, token), tid.to_string());
        self.entries.insert(
            tid.to_string(),
            InFlightEntry {
                tid: tid.to_string(),
                token,
                session_id: session_id.to_string(),
                deadline,
            },
        );
        token
    }

    /// Resolves the attempt if `token` is still the current one for `tid`.
    pub fn resolve(&mut self, tid: &str, token: u64) -> Option<InFlightEntry> {
        if self.entries.get(tid).map(|e| e.token) != Some(token) {
            return None;
        }
        self.remove(tid)
    }

    /// Drops and returns every attempt whose deadline is at or before `now`.
    pub fn expire(&mut self, now: u64) -> Vec<InFlightEntry> {
        let mut expired = Vec::new();
        while let Some((&(deadline, _), _)) = self.deadlines.first_key_value() {
            if deadline > now {
                break;
            }
            if let Some((_, tid)) = self.deadlines.pop_first() {
                if let Some(entry) = self.entries.remove(&tid) {
                    expired.push(entry);
                }
            }
        }
        expired
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.deadlines.first_key_value().map(|(&(at, _), _)| at)
    }

    pub fn remove(&mut self, tid: &str) -> Option<InFlightEntry> {
        let entry = self.entries.remove(tid)?;
        self.deadlines.remove(&(entry.deadline, entry.token));
        Some(entry)
    }

    pub fn contains(&self, tid: &str) -> bool {
        self.entries.contains_key(tid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.deadlines.clear();
    }
}
