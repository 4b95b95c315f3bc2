//! Inbound event dispatch.
//!
//! Transports decode a frame into an `Event` plus `Message` and hand both to
//! `Broker::handle_event`; the returned message, if any, is the reply.

use super::{Broker, BrokerError};
use crate::messaging::protocol::{meta, Event, Message, ProtocolError};
use crate::messaging::queue::QueueKey;
use crate::messaging::session::SessionRef;
use serde_json::json;

impl Broker {
    pub fn handle_event(
        &self,
        session: &SessionRef,
        event: Event,
        message: Message,
    ) -> Result<Option<Message>, BrokerError> {
        tracing::trace!(session = %session.session_id(), event = %event, "inbound event");
        match event {
            Event::Subscribe => {
                for key in subscription_targets(&message)? {
                    self.subscribe(Some(session.clone()), key.topic(), key.consumer_group())?;
                }
                Ok(None)
            }
            Event::Unsubscribe => {
                for key in subscription_targets(&message)? {
                    self.unsubscribe(session.session_id(), key.topic(), key.consumer_group());
                }
                Ok(None)
            }
            Event::Publish => self.publish(message, Some(session.session_id())),
            Event::Unpublish => {
                self.unpublish(&message);
                Ok(None)
            }
            Event::TranCommit => {
                let txn_id = transaction_id(&message)?;
                let released = self.commit_transaction(txn_id, Some(session.session_id()))?;
                Ok(Some(count_reply(txn_id, released)))
            }
            Event::TranRollback => {
                let txn_id = transaction_id(&message)?;
                let discarded = self.rollback_transaction(txn_id, Some(session.session_id()))?;
                Ok(Some(count_reply(txn_id, discarded)))
            }
            Event::AdminViewQueue => {
                let body = serde_json::to_string(&self.view_queues())?;
                Ok(Some(Message::new(body)))
            }
            Event::AdminQueueForceDistribute => {
                let key = admin_target(&message)?;
                let moved = self.force_distribute(key.topic(), key.consumer_group());
                Ok(Some(admin_reply(&key, moved)))
            }
            Event::AdminQueueForceClear => {
                let key = admin_target(&message)?;
                let cleared = self.force_clear(key.topic(), key.consumer_group());
                Ok(Some(admin_reply(&key, cleared)))
            }
            Event::AdminQueueForceDelete => {
                let key = admin_target(&message)?;
                let deleted = self.force_delete(key.topic(), key.consumer_group());
                Ok(Some(admin_reply(&key, usize::from(deleted))))
            }
            // Broker-to-session only.
            Event::Distribute | Event::Request => Err(BrokerError::UnsupportedEvent(event)),
        }
    }
}

/// Single `t1`/`c1` target, or a JSON array of `topic#group` keys when the
/// `batch` flag is set.
fn subscription_targets(message: &Message) -> Result<Vec<QueueKey>, ProtocolError> {
    if message.meta_flag(meta::BATCH) {
        return serde_json::from_str(&message.body)
            .map_err(|err| ProtocolError::InvalidBody(err.to_string()));
    }
    Ok(vec![admin_target(message)?])
}

fn admin_target(message: &Message) -> Result<QueueKey, ProtocolError> {
    let topic = message.topic();
    if topic.is_empty() {
        return Err(ProtocolError::MissingMeta(meta::TOPIC));
    }
    let group = message
        .meta(meta::CONSUMER_GROUP)
        .filter(|g| !g.is_empty())
        .ok_or(ProtocolError::MissingMeta(meta::CONSUMER_GROUP))?;
    Ok(QueueKey::new(topic, group))
}

fn transaction_id(message: &Message) -> Result<&str, ProtocolError> {
    message
        .meta(meta::TRANSACTION_ID)
        .filter(|id| !id.is_empty())
        .or_else(|| Some(message.tid()).filter(|id| !id.is_empty()))
        .ok_or(ProtocolError::MissingMeta(meta::TRANSACTION_ID))
}

fn admin_reply(key: &QueueKey, affected: usize) -> Message {
    Message::new(json!({ "queue": key.to_string(), "affected": affected }).to_string())
}

fn count_reply(txn_id: &str, count: usize) -> Message {
    Message::new(json!({ "transaction": txn_id, "messages": count }).to_string())
        .with_meta(meta::ACK, "1")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::session::{ReplyHandler, Session, SessionError};
    use crate::messaging::QueueView;
    use std::sync::Arc;

    struct Silent(&'static str);

    impl Session for Silent {
        fn session_id(&self) -> &str {
            self.0
        }

        fn send(&self, _event: Event, _message: Message) -> Result<(), SessionError> {
            Ok(())
        }

        fn send_and_subscribe(
            &self,
            _event: Event,
            _message: Message,
            _on_reply: ReplyHandler,
        ) -> Result<(), SessionError> {
            Ok(())
        }
    }

    fn target(topic: &str, group: &str) -> Message {
        Message::default()
            .with_meta(meta::TOPIC, topic)
            .with_meta(meta::CONSUMER_GROUP, group)
    }

    #[test]
    fn subscribe_single_and_batch() {
        let broker = Broker::builder().build();
        let session: SessionRef = Arc::new(Silent("s1"));
        broker
            .handle_event(&session, Event::Subscribe, target("orders", "billing"))
            .unwrap();
        let batch = Message::new(r#"["orders#audit","payments#ledger"]"#).with_meta(meta::BATCH, "1");
        broker.handle_event(&session, Event::Subscribe, batch).unwrap();
        assert_eq!(broker.registry().queue_count(), 3);

        let bad = Message::new("not json").with_meta(meta::BATCH, "1");
        assert!(matches!(
            broker.handle_event(&session, Event::Subscribe, bad),
            Err(BrokerError::Malformed(ProtocolError::InvalidBody(_)))
        ));

        broker
            .handle_event(&session, Event::Unsubscribe, target("orders", "billing"))
            .unwrap();
        let billing = broker.registry().queue(&QueueKey::new("orders", "billing")).unwrap();
        assert_eq!(billing.session_count(), 0);
    }

    #[test]
    fn admin_events_reply_with_json() {
        let broker = Broker::builder().build();
        let session: SessionRef = Arc::new(Silent("admin"));
        broker.subscribe(None, "orders", "billing").unwrap();
        broker
            .publish(Message::publish("orders", "x"), None)
            .unwrap();

        let reply = broker
            .handle_event(&session, Event::AdminViewQueue, Message::default())
            .unwrap()
            .unwrap();
        let views: Vec<QueueView> = serde_json::from_str(&reply.body).unwrap();
        assert_eq!(views[0].queue, "orders#billing");
        assert_eq!(views[0].message_count, 1);

        let reply = broker
            .handle_event(&session, Event::AdminQueueForceClear, target("orders", "billing"))
            .unwrap()
            .unwrap();
        let body: serde_json::Value = serde_json::from_str(&reply.body).unwrap();
        assert_eq!(body["affected"], 1);

        let reply = broker
            .handle_event(&session, Event::AdminQueueForceDelete, target("orders", "billing"))
            .unwrap()
            .unwrap();
        let body: serde_json::Value = serde_json::from_str(&reply.body).unwrap();
        assert_eq!(body["affected"], 1);
        assert_eq!(broker.registry().queue_count(), 0);
    }

    #[test]
    fn outbound_events_are_rejected() {
        let broker = Broker::builder().build();
        let session: SessionRef = Arc::new(Silent("s1"));
        assert!(matches!(
            broker.handle_event(&session, Event::Distribute, Message::default()),
            Err(BrokerError::UnsupportedEvent(Event::Distribute))
        ));
        assert!(matches!(
            broker.handle_event(&session, Event::TranCommit, Message::default()),
            Err(BrokerError::Malformed(ProtocolError::MissingMeta(_)))
        ));
    }

    #[test]
    fn commit_event_releases_transaction() {
        let broker = Broker::builder().build();
        let session: SessionRef = Arc::new(Silent("p1"));
        broker.subscribe(None, "orders", "billing").unwrap();
        let publish = Message::publish("orders", "x").with_transaction("tx-9");
        broker.handle_event(&session, Event::Publish, publish).unwrap();
        let commit = Message::default().with_meta(meta::TRANSACTION_ID, "tx-9");
        let reply = broker
            .handle_event(&session, Event::TranCommit, commit)
            .unwrap()
            .unwrap();
        assert_eq!(reply.meta(meta::ACK), Some("1"));
        let billing = broker.registry().queue(&QueueKey::new("orders", "billing")).unwrap();
        assert_eq!(billing.pending_count(), 1);
    }
}
