//! Wire-level vocabulary shared by the broker and its transport.
//!
//! Messages are a key/value metadata map plus a UTF-8 body. The transport
//! owns framing; this module only names the events and metadata keys and
//! knows how to read a delivery envelope out of a message.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Separator between topic and consumer group inside a queue key.
pub const SEP_TOPIC_CONSUMER_GROUP: &str = "#";

/// Consumer group reserved for transactional staging queues.
pub const RESERVED_TRAN_GROUP: &str = "!";

/// Metadata keys carried on every message.
pub mod meta {
    pub const TID: &str = "t0";
    pub const TOPIC: &str = "t1";
    pub const TIMES: &str = "t2";
    pub const TRANSACTION: &str = "t4";
    pub const TRANSACTION_ID: &str = "t5";
    pub const CONSUMER_GROUP: &str = "c1";
    pub const SCHEDULED: &str = "s1";
    pub const SEQUENCE: &str = "s2";
    pub const EXPIRATION: &str = "e1";
    pub const PARTITION: &str = "p1";
    pub const QOS: &str = "q1";
    pub const ACK: &str = "ack";
    pub const CONFIRM: &str = "confirm";
    pub const SENDER: &str = "sender";
    pub const FORWARDED: &str = "fwd";
    pub const BATCH: &str = "batch";
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Logical event names exchanged with sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    Subscribe,
    Unsubscribe,
    Publish,
    Unpublish,
    Distribute,
    Request,
    TranCommit,
    TranRollback,
    AdminViewQueue,
    AdminQueueForceDistribute,
    AdminQueueForceDelete,
    AdminQueueForceClear,
}

impl Event {
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::Subscribe => "mq.event.subscribe",
            Event::Unsubscribe => "mq.event.unsubscribe",
            Event::Publish => "mq.event.publish",
            Event::Unpublish => "mq.event.unpublish",
            Event::Distribute => "mq.event.distribute",
            Event::Request => "mq.event.request",
            Event::TranCommit => "mq.event.tran.commit",
            Event::TranRollback => "mq.event.tran.rollback",
            Event::AdminViewQueue => "mq.admin.view.queue",
            Event::AdminQueueForceDistribute => "mq.admin.queue.distribute",
            Event::AdminQueueForceDelete => "mq.admin.queue.delete",
            Event::AdminQueueForceClear => "mq.admin.queue.clear",
        }
    }

    /// Administrative events always apply to the local registry.
    pub fn is_admin(&self) -> bool {
        matches!(
            self,
            Event::AdminViewQueue
                | Event::AdminQueueForceDistribute
                | Event::AdminQueueForceDelete
                | Event::AdminQueueForceClear
        )
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Event {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let event = match s {
            "mq.event.subscribe" => Event::Subscribe,
            "mq.event.unsubscribe" => Event::Unsubscribe,
            "mq.event.publish" => Event::Publish,
            "mq.event.unpublish" => Event::Unpublish,
            "mq.event.distribute" => Event::Distribute,
            "mq.event.request" => Event::Request,
            "mq.event.tran.commit" => Event::TranCommit,
            "mq.event.tran.rollback" => Event::TranRollback,
            "mq.admin.view.queue" => Event::AdminViewQueue,
            "mq.admin.queue.distribute" => Event::AdminQueueForceDistribute,
            "mq.admin.queue.delete" => Event::AdminQueueForceDelete,
            "mq.admin.queue.clear" => Event::AdminQueueForceClear,
            other => return Err(ProtocolError::UnknownEvent(other.to_string())),
        };
        Ok(event)
    }
}

// ---------------------------------------------------------------------------
// Quality of service
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Qos {
    /// Fire and forget.
    AtMostOnce,
    /// Redelivered until acknowledged or expired.
    AtLeastOnce,
}

impl Qos {
    pub fn as_meta(&self) -> &'static str {
        match self {
            Qos::AtMostOnce => "0",
            Qos::AtLeastOnce => "1",
        }
    }
}

// ---------------------------------------------------------------------------
// Message envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown event {0}")]
    UnknownEvent(String),
    #[error("missing required meta `{0}`")]
    MissingMeta(&'static str),
    #[error("invalid value {value:?} for meta `{key}`")]
    InvalidMeta { key: &'static str, value: String },
    #[error("invalid body: {0}")]
    InvalidBody(String),
}

/// A message as seen by the broker: metadata plus body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    #[serde(default)]
    pub body: String,
}

impl Message {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            meta: BTreeMap::new(),
            body: body.into(),
        }
    }

    /// A fresh QoS1 publish with a generated tid.
    pub fn publish(topic: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(body)
            .with_meta(meta::TID, uuid::Uuid::new_v4().simple().to_string())
            .with_meta(meta::TOPIC, topic)
            .with_meta(meta::QOS, Qos::AtLeastOnce.as_meta())
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<String>) -> Self {
        self.meta.insert(key.to_string(), value.into());
        self
    }

    pub fn with_tid(self, tid: impl Into<String>) -> Self {
        self.with_meta(meta::TID, tid)
    }

    pub fn with_qos(self, qos: Qos) -> Self {
        self.with_meta(meta::QOS, qos.as_meta())
    }

    /// Marks the message as ordered within `partition` (or the queue-wide lane).
    pub fn with_sequence(self, partition: Option<&str>) -> Self {
        let msg = self.with_meta(meta::SEQUENCE, "1");
        match partition {
            Some(p) => msg.with_meta(meta::PARTITION, p),
            None => msg,
        }
    }

    pub fn with_scheduled(self, at_ms: u64) -> Self {
        self.with_meta(meta::SCHEDULED, at_ms.to_string())
    }

    pub fn with_expiration(self, at_ms: u64) -> Self {
        self.with_meta(meta::EXPIRATION, at_ms.to_string())
    }

    pub fn with_transaction(self, tx_id: impl Into<String>) -> Self {
        self.with_meta(meta::TRANSACTION, "1")
            .with_meta(meta::TRANSACTION_ID, tx_id)
    }

    pub fn set_meta(&mut self, key: &str, value: impl Into<String>) {
        self.meta.insert(key.to_string(), value.into());
    }

    pub fn remove_meta(&mut self, key: &str) -> Option<String> {
        self.meta.remove(key)
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.meta.get(key).map(String::as_str)
    }

    pub fn meta_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.meta(key).unwrap_or(default)
    }

    /// `"1"` is true, anything else (or absence) is false.
    pub fn meta_flag(&self, key: &str) -> bool {
        self.meta(key) == Some("1")
    }

    pub fn meta_u64(&self, key: &'static str) -> Result<Option<u64>, ProtocolError> {
        match self.meta(key) {
            None | Some("") => Ok(None),
            Some(raw) => raw
                .parse::<u64>()
                .map(Some)
                .map_err(|_| ProtocolError::InvalidMeta {
                    key,
                    value: raw.to_string(),
                }),
        }
    }

    pub fn tid(&self) -> &str {
        self.meta_or(meta::TID, "")
    }

    pub fn topic(&self) -> &str {
        self.meta_or(meta::TOPIC, "")
    }

    pub fn is_transaction(&self) -> bool {
        self.meta_flag(meta::TRANSACTION)
    }

    /// Reply used for acks and checkback answers.
    pub fn ack(accepted: bool) -> Self {
        Self::default().with_meta(meta::ACK, if accepted { "1" } else { "0" })
    }
}

/// Delivery envelope parsed out of a message's metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageMeta {
    pub tid: String,
    pub topic: String,
    pub qos: Qos,
    pub sequence: bool,
    pub partition: Option<String>,
    pub scheduled_at: Option<u64>,
    pub expiration_at: Option<u64>,
    pub transaction_id: Option<String>,
    pub sender: Option<String>,
    pub times: u32,
}

impl MessageMeta {
    pub fn resolve(message: &Message) -> Result<Self, ProtocolError> {
        let tid = message.tid();
        if tid.is_empty() {
            return Err(ProtocolError::MissingMeta(meta::TID));
        }
        let topic = message.topic();
        if topic.is_empty() {
            return Err(ProtocolError::MissingMeta(meta::TOPIC));
        }
        let qos = match message.meta(meta::QOS) {
            None | Some("1") => Qos::AtLeastOnce,
            Some("0") => Qos::AtMostOnce,
            Some(other) => {
                return Err(ProtocolError::InvalidMeta {
                    key: meta::QOS,
                    value: other.to_string(),
                })
            }
        };
        let times = match message.meta_u64(meta::TIMES)? {
            Some(t) => u32::try_from(t).unwrap_or(u32::MAX),
            None => 0,
        };
        let transaction_id = if message.is_transaction() {
            Some(
                message
                    .meta(meta::TRANSACTION_ID)
                    .filter(|id| !id.is_empty())
                    .unwrap_or(tid)
                    .to_string(),
            )
        } else {
            None
        };
        Ok(Self {
            tid: tid.to_string(),
            topic: topic.to_string(),
            qos,
            sequence: message.meta_flag(meta::SEQUENCE),
            partition: message
                .meta(meta::PARTITION)
                .filter(|p| !p.is_empty())
                .map(str::to_string),
            scheduled_at: message.meta_u64(meta::SCHEDULED)?.filter(|at| *at > 0),
            expiration_at: message.meta_u64(meta::EXPIRATION)?.filter(|at| *at > 0),
            transaction_id,
            sender: message
                .meta(meta::SENDER)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            times,
        })
    }
}
