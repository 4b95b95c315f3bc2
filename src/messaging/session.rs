//! Session abstraction owned by the transport.
//!
//! The broker only addresses sessions: it never frames bytes or manages
//! connection lifecycle. Queues hold `SessionRef`s for the time a session
//! is bound to them.

use crate::messaging::protocol::{Event, Message};
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Callback invoked once with the peer's reply.
pub type ReplyHandler = Box<dyn FnOnce(Message) + Send + 'static>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session {0} closed")]
    Closed(String),
    #[error("send failed: {0}")]
    Send(String),
}

/// A connected endpoint as seen by the delivery engine.
pub trait Session: Send + Sync + 'static {
    fn session_id(&self) -> &str;

    /// Whether the underlying connection can still carry frames.
    fn is_valid(&self) -> bool {
        true
    }

    fn send(&self, event: Event, message: Message) -> Result<(), SessionError>;

    /// Sends and registers `on_reply` for the peer's answer.
    fn send_and_subscribe(
        &self,
        event: Event,
        message: Message,
        on_reply: ReplyHandler,
    ) -> Result<(), SessionError>;
}

pub type SessionRef = Arc<dyn Session>;

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// Picks which bound session receives the next delivery.
pub trait SessionSelector: Send + Sync + 'static {
    fn select(&self, sessions: &[SessionRef]) -> Option<usize>;
}

/// Uniform random choice; spreads load across members of a consumer group.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomSelector;

impl SessionSelector for RandomSelector {
    fn select(&self, sessions: &[SessionRef]) -> Option<usize> {
        match sessions.len() {
            0 => None,
            1 => Some(0),
            n => Some(rand::thread_rng().gen_range(0..n)),
        }
    }
}

/// Deterministic rotation, used where delivery order across sessions matters.
#[derive(Debug, Default)]
pub struct RoundRobinSelector {
    next: AtomicUsize,
}

impl SessionSelector for RoundRobinSelector {
    fn select(&self, sessions: &[SessionRef]) -> Option<usize> {
        if sessions.is_empty() {
            return None;
        }
        Some(self.next.fetch_add(1, Ordering::Relaxed) % sessions.len())
    }
}
