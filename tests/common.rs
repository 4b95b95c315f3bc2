//! Common test harness utilities for integration tests.
//!
//! This module provides helpers for:
//! - Scripted mock sessions that record deliveries and answer acks
//! - Brokers with millisecond backoff schedules
//! - Polling until an asynchronous condition holds

// Not all test files use all helpers; silence dead_code warnings for unused exports.
#![allow(dead_code)]

use ferrymq::messaging::protocol::{meta, Event, Message};
use ferrymq::messaging::session::{ReplyHandler, Session, SessionError};
use ferrymq::messaging::BackoffPolicy;
use ferrymq::Broker;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Decides a consumer's answer from the delivered message and how many
/// times this tid has been received (1 on first receipt).
pub type AckScript = Box<dyn Fn(&Message, usize) -> bool + Send + Sync>;

pub enum AckMode {
    /// Answer every delivery from the script on a spawned task.
    Scripted(AckScript),
    /// Keep reply handlers until the test answers them.
    Manual,
}

pub struct MockSession {
    id: String,
    valid: AtomicBool,
    mode: AckMode,
    /// Answer to checkback requests; `None` leaves the producer undecided.
    checkback: Mutex<Option<bool>>,
    deliveries: Mutex<Vec<(Event, Message)>>,
    acked: Mutex<Vec<Message>>,
    receipts: Mutex<HashMap<String, usize>>,
    pending: Mutex<Vec<ReplyHandler>>,
}

impl MockSession {
    pub fn new(id: &str, mode: AckMode) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            valid: AtomicBool::new(true),
            mode,
            checkback: Mutex::new(None),
            deliveries: Mutex::new(Vec::new()),
            acked: Mutex::new(Vec::new()),
            receipts: Mutex::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
        })
    }

    pub fn accepting(id: &str) -> Arc<Self> {
        Self::new(id, AckMode::Scripted(Box::new(|_, _| true)))
    }

    /// Rejects the first receipt of every tid, accepts redeliveries.
    pub fn reject_first(id: &str) -> Arc<Self> {
        Self::new(id, AckMode::Scripted(Box::new(|_, seen| seen > 1)))
    }

    pub fn manual(id: &str) -> Arc<Self> {
        Self::new(id, AckMode::Manual)
    }

    pub fn answer_checkbacks(&self, commit: Option<bool>) {
        *self.checkback.lock() = commit;
    }

    pub fn disconnect(&self) {
        self.valid.store(false, Ordering::SeqCst);
    }

    pub fn deliveries(&self) -> Vec<(Event, Message)> {
        self.deliveries.lock().clone()
    }

    pub fn distributed(&self) -> Vec<Message> {
        self.deliveries
            .lock()
            .iter()
            .filter(|(event, _)| *event == Event::Distribute)
            .map(|(_, msg)| msg.clone())
            .collect()
    }

    pub fn checkback_requests(&self) -> usize {
        self.deliveries
            .lock()
            .iter()
            .filter(|(event, _)| *event == Event::Request)
            .count()
    }

    /// Messages this consumer answered with a positive ack, in ack order.
    pub fn acked_bodies(&self) -> Vec<String> {
        self.acked.lock().iter().map(|m| m.body.clone()).collect()
    }

    pub fn pending_replies(&self) -> usize {
        self.pending.lock().len()
    }

    /// Answers the oldest held reply handler.
    pub fn reply_next(&self, accepted: bool) -> bool {
        let handler = {
            let mut pending = self.pending.lock();
            if pending.is_empty() {
                return false;
            }
            pending.remove(0)
        };
        handler(Message::ack(accepted));
        true
    }
}

impl Session for MockSession {
    fn session_id(&self) -> &str {
        &self.id
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    fn send(&self, event: Event, message: Message) -> Result<(), SessionError> {
        if !self.is_valid() {
            return Err(SessionError::Closed(self.id.clone()));
        }
        self.deliveries.lock().push((event, message));
        Ok(())
    }

    fn send_and_subscribe(
        &self,
        event: Event,
        message: Message,
        on_reply: ReplyHandler,
    ) -> Result<(), SessionError> {
        self.send(event, message.clone())?;
        if event == Event::Request {
            let reply = match *self.checkback.lock() {
                Some(commit) => Message::ack(commit),
                None => Message::default(),
            };
            tokio::spawn(async move { on_reply(reply) });
            return Ok(());
        }
        match &self.mode {
            AckMode::Manual => self.pending.lock().push(on_reply),
            AckMode::Scripted(script) => {
                let seen = {
                    let mut receipts = self.receipts.lock();
                    let count = receipts.entry(message.tid().to_string()).or_default();
                    *count += 1;
                    *count
                };
                let accepted = script(&message, seen);
                if accepted {
                    self.acked.lock().push(message);
                }
                tokio::spawn(async move { on_reply(Message::ack(accepted)) });
            }
        }
        Ok(())
    }
}

/// Broker whose redelivery schedule runs in milliseconds.
pub fn fast_broker() -> Broker {
    Broker::builder()
        .with_backoff(BackoffPolicy::from_millis(&[0, 10, 20, 40], 500))
        .with_checkback_grace(Duration::from_millis(20))
        .build()
}

/// Polls `cond` every few milliseconds until it holds or `timeout` passes.
pub async fn wait_until<F>(timeout: Duration, mut cond: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Runs `fut` with a generous upper bound so a stuck dispatcher fails fast.
pub async fn bounded<T>(fut: impl Future<Output = T>) -> T {
    match tokio::time::timeout(Duration::from_secs(10), fut).await {
        Ok(value) => value,
        Err(_) => panic!("test timed out"),
    }
}

pub fn sequenced(topic: &str, partition: &str, id: u32) -> Message {
    Message::publish(topic, id.to_string())
        .with_tid(format!("m{id}"))
        .with_sequence(Some(partition))
}

pub fn times(message: &Message) -> u64 {
    message
        .meta(meta::TIMES)
        .and_then(|t| t.parse().ok())
        .unwrap_or(0)
}
