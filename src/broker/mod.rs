//! Broker facade.
//!
//! Owns the registry, the transaction coordinator, the session directory and
//! the forwarder, and is the single entry point transports call into.
//!
//! - `events` - Inbound event dispatch
//! - `admin` - Force operations and queue views

mod admin;
mod events;

use crate::cluster::{BrokerMode, ClusterForwarder, ForwardError, InboundForward};
use crate::core::time::{Clock, SystemClock};
use crate::messaging::backoff::BackoffPolicy;
use crate::messaging::holder::MessageHolder;
use crate::messaging::protocol::{meta, Message, MessageMeta, ProtocolError, Qos, RESERVED_TRAN_GROUP};
use crate::messaging::queue::{DispatchContext, Queue, QueueKey};
use crate::messaging::registry::SubscriptionRegistry;
use crate::messaging::routing;
use crate::messaging::session::{RandomSelector, SessionError, SessionRef, SessionSelector};
use crate::messaging::transactions::{StagedRef, StagingResolver, TransactionCoordinator, TransactionError};
use crate::messaging::watcher::{Watcher, WatcherChain};
use crate::messaging::Event;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

pub const DEFAULT_CHECKBACK_GRACE: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("malformed message: {0}")]
    Malformed(#[from] ProtocolError),
    #[error("event {0} is not accepted from sessions")]
    UnsupportedEvent(Event),
    #[error(transparent)]
    Transaction(#[from] TransactionError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("forward failed: {0}")]
    Forward(#[from] ForwardError),
    #[error("encode reply: {0}")]
    Encode(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct BrokerBuilder {
    mode: BrokerMode,
    origin: String,
    backoff: BackoffPolicy,
    checkback_grace: Duration,
    clock: Arc<dyn Clock>,
    selector: Arc<dyn SessionSelector>,
    watchers: WatcherChain,
    backends: Vec<SessionRef>,
}

impl Default for BrokerBuilder {
    fn default() -> Self {
        Self {
            mode: BrokerMode::Standalone,
            origin: uuid::Uuid::new_v4().simple().to_string(),
            backoff: BackoffPolicy::default(),
            checkback_grace: DEFAULT_CHECKBACK_GRACE,
            clock: Arc::new(SystemClock),
            selector: Arc::new(RandomSelector),
            watchers: WatcherChain::new(),
            backends: Vec::new(),
        }
    }
}

impl BrokerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mode(mut self, mode: BrokerMode) -> Self {
        self.mode = mode;
        self
    }

    /// Identity stamped on forwarded publishes.
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_checkback_grace(mut self, grace: Duration) -> Self {
        self.checkback_grace = grace;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_selector(mut self, selector: Arc<dyn SessionSelector>) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_watcher(mut self, watcher: Arc<dyn Watcher>) -> Self {
        self.watchers = self.watchers.with(watcher);
        self
    }

    pub fn with_backend(mut self, link: SessionRef) -> Self {
        self.backends.push(link);
        self
    }

    pub fn build(self) -> Broker {
        let Self {
            mode,
            origin,
            backoff,
            checkback_grace,
            clock,
            selector,
            watchers,
            backends,
        } = self;
        let forwarder = ClusterForwarder::new(origin);
        for link in backends {
            forwarder.add_link(link);
        }
        let inner = Arc::new_cyclic(|me: &Weak<BrokerInner>| {
            let resolver: Weak<dyn StagingResolver> = me.clone();
            let context = Arc::new(DispatchContext {
                backoff,
                checkback_grace,
                clock,
                selector,
                watcher: Arc::new(watchers),
                resolver,
            });
            BrokerInner {
                registry: SubscriptionRegistry::new(context),
                coordinator: Mutex::new(TransactionCoordinator::new()),
                sessions: DashMap::new(),
                session_queues: DashMap::new(),
                mode,
                forwarder,
            }
        });
        Broker { inner }
    }
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

struct BrokerInner {
    registry: SubscriptionRegistry,
    coordinator: Mutex<TransactionCoordinator>,
    /// Open sessions by id; checkbacks look producers up here.
    sessions: DashMap<String, SessionRef>,
    /// Queues each session is bound to, for unbinding on close.
    session_queues: DashMap<String, HashSet<QueueKey>>,
    mode: BrokerMode,
    forwarder: ClusterForwarder,
}

impl BrokerInner {
    fn watcher(&self) -> &Arc<dyn Watcher> {
        &self.registry.context().watcher
    }

    /// Routes a producer publish locally and, in aggregator mode, forwards it.
    /// Routes locally and, in aggregator mode, forwards to one backend. A
    /// forwarding failure only fails the publish when no local queue took it.
    fn fan_out(&self, message: &Message) -> Result<usize, BrokerError> {
        let routed = routing::route_publish(&self.registry, message)?;
        if self.mode == BrokerMode::Aggregator {
            match self.forwarder.forward(message) {
                Ok(Some(receipt)) => {
                    tracing::debug!(tid = %message.tid(), link = %receipt.link, seq = receipt.seq, "publish forwarded");
                }
                Ok(None) => {}
                Err(err) if routed > 0 => {
                    tracing::warn!(tid = %message.tid(), topic = %message.topic(), routed, "publish kept locally; forwarding failed: {err}");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(routed)
    }

    fn release(&self, holder: &MessageHolder) {
        if let Err(err) = self.fan_out(&holder.release_message()) {
            tracing::warn!(tid = %holder.tid, topic = %holder.topic, "release of staged message failed: {err:?}");
        }
    }

    fn forget(&self, holder: &MessageHolder) {
        if let Some(txn_id) = &holder.transaction_id {
            self.coordinator.lock().forget_staged(txn_id, &holder.tid);
        }
    }
}

impl StagingResolver for BrokerInner {
    fn producer_session(&self, sender: &str) -> Option<SessionRef> {
        self.sessions.get(sender).map(|s| s.value().clone())
    }

    fn commit_staged(&self, holder: MessageHolder) {
        self.forget(&holder);
        tracing::debug!(tid = %holder.tid, "checkback committed staged message");
        self.release(&holder);
    }

    fn rollback_staged(&self, holder: MessageHolder) {
        self.forget(&holder);
        tracing::debug!(tid = %holder.tid, "staged message rolled back");
    }
}

/// Cheap to clone; every clone drives the same broker.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Broker {
    pub fn builder() -> BrokerBuilder {
        BrokerBuilder::new()
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.inner.registry
    }

    pub fn mode(&self) -> BrokerMode {
        self.inner.mode
    }

    pub fn forwarder(&self) -> &ClusterForwarder {
        &self.inner.forwarder
    }

    fn watcher(&self) -> &Arc<dyn Watcher> {
        self.inner.watcher()
    }

    // ----- Lifecycle -----

    /// Runs the start hooks. `on_start_after` runs on a blocking task when a
    /// tokio runtime is available so recovery does not hold up the caller.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        self.watcher().on_start_before(self);
        if Handle::try_current().is_err() {
            tracing::debug!("no tokio runtime detected; running start hooks inline");
            self.watcher().on_start_after(self);
            return None;
        }
        let broker = self.clone();
        Some(tokio::task::spawn_blocking(move || {
            broker.watcher().on_start_after(&broker);
        }))
    }

    /// Runs the stop hooks, then closes every queue. Watchers see the final
    /// queue contents.
    pub fn stop(&self) {
        self.watcher().on_stop_before(self);
        self.watcher().on_stop_after(self);
        self.inner.registry.close_all();
        tracing::info!("broker stopped");
    }

    pub fn save(&self) {
        self.watcher().on_save(self);
    }

    // ----- Sessions -----

    pub fn on_open(&self, session: SessionRef) {
        tracing::debug!(session = %session.session_id(), "session opened");
        self.inner
            .sessions
            .insert(session.session_id().to_string(), session);
    }

    /// Unbinds the session everywhere and rolls back transactions it opened.
    /// Messages stay queued.
    pub fn on_close(&self, session_id: &str) {
        self.inner.sessions.remove(session_id);
        if let Some((_, keys)) = self.inner.session_queues.remove(session_id) {
            for key in keys {
                if self.inner.registry.unsubscribe(&key, session_id) {
                    self.watcher()
                        .on_unsubscribe(key.topic(), key.consumer_group(), session_id);
                }
            }
        }
        let owned = self.inner.coordinator.lock().owned_by(session_id);
        for txn_id in owned {
            if let Err(err) = self.rollback_transaction(&txn_id, None) {
                tracing::debug!(txn = %txn_id, "rollback on close skipped: {err:?}");
            }
        }
        tracing::debug!(session = %session_id, "session closed");
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    // ----- Subscriptions -----

    /// Binds `session` to `topic#consumer_group`, creating the queue if needed.
    /// Without a session the queue is only materialised.
    pub fn subscribe(
        &self,
        session: Option<SessionRef>,
        topic: &str,
        consumer_group: &str,
    ) -> Result<Arc<Queue>, BrokerError> {
        let key = subscription_key(topic, consumer_group)?;
        let session_id = session.as_ref().map(|s| s.session_id().to_string());
        if let Some(id) = &session_id {
            self.inner
                .session_queues
                .entry(id.clone())
                .or_default()
                .insert(key.clone());
        }
        let queue = self.inner.registry.subscribe(&key, session);
        self.watcher()
            .on_subscribe(topic, consumer_group, session_id.as_deref());
        tracing::debug!(queue = %key, session = ?session_id, "subscribed");
        Ok(queue)
    }

    /// Unbinds one session; the queue and its pending messages stay.
    pub fn unsubscribe(&self, session_id: &str, topic: &str, consumer_group: &str) -> bool {
        let key = QueueKey::new(topic, consumer_group);
        if let Some(mut keys) = self.inner.session_queues.get_mut(session_id) {
            keys.remove(&key);
        }
        let removed = self.inner.registry.unsubscribe(&key, session_id);
        if removed {
            self.watcher().on_unsubscribe(topic, consumer_group, session_id);
        }
        removed
    }

    // ----- Publishing -----

    /// Accepts a producer publish. QoS1 publishes get a `confirm` reply.
    pub fn publish(
        &self,
        mut message: Message,
        sender: Option<&str>,
    ) -> Result<Option<Message>, BrokerError> {
        if let Some(sender) = sender {
            message.set_meta(meta::SENDER, sender);
        }
        let envelope = MessageMeta::resolve(&message).map_err(|err| {
            tracing::warn!(topic = %message.topic(), "dropping malformed publish: {err}");
            err
        })?;
        if self.inner.forwarder.accept_inbound(&message)? == InboundForward::Duplicate {
            tracing::debug!(tid = %envelope.tid, "duplicate forwarded publish ignored");
            return Ok(confirm(&envelope));
        }
        match &envelope.transaction_id {
            Some(txn_id) => {
                let producer = envelope.sender.clone().unwrap_or_default();
                self.inner.coordinator.lock().stage(
                    txn_id,
                    &producer,
                    StagedRef {
                        queue: QueueKey::staging(envelope.topic.clone()),
                        tid: envelope.tid.clone(),
                    },
                )?;
                routing::stage(&self.inner.registry, &message)?;
                self.watcher().on_publish(&message);
            }
            None => {
                let routed = self.inner.fan_out(&message);
                self.watcher().on_publish(&message);
                routed?;
            }
        }
        Ok(confirm(&envelope))
    }

    /// Cancels a message in every queue of its topic.
    pub fn unpublish(&self, message: &Message) -> usize {
        let removed = routing::unroute(&self.inner.registry, message);
        if removed > 0 {
            self.watcher().on_unpublish(message);
        }
        removed
    }

    /// Enqueues into one named queue only.
    pub fn route_direct(&self, key: &QueueKey, message: &Message) -> Result<bool, BrokerError> {
        Ok(routing::route_direct(&self.inner.registry, key, message)?)
    }

    // ----- Transactions -----

    pub fn begin_transaction(&self, producer: &str) -> String {
        self.inner.coordinator.lock().begin(producer)
    }

    /// Releases every staged message of the transaction through fan-out.
    /// Returns how many were released.
    pub fn commit_transaction(
        &self,
        txn_id: &str,
        producer: Option<&str>,
    ) -> Result<usize, BrokerError> {
        let staged = self.take_staged(txn_id, producer, true)?;
        let mut released = 0;
        for holder in staged {
            self.inner.release(&holder);
            self.watcher()
                .on_acknowledge(&QueueKey::staging(holder.topic.clone()), &holder, true);
            released += 1;
        }
        tracing::info!(txn = %txn_id, released, "transaction committed");
        Ok(released)
    }

    /// Discards every staged message of the transaction.
    pub fn rollback_transaction(
        &self,
        txn_id: &str,
        producer: Option<&str>,
    ) -> Result<usize, BrokerError> {
        let staged = self.take_staged(txn_id, producer, false)?;
        for holder in &staged {
            self.watcher()
                .on_acknowledge(&QueueKey::staging(holder.topic.clone()), holder, false);
        }
        tracing::info!(txn = %txn_id, discarded = staged.len(), "transaction rolled back");
        Ok(staged.len())
    }

    fn take_staged(
        &self,
        txn_id: &str,
        producer: Option<&str>,
        commit: bool,
    ) -> Result<Vec<MessageHolder>, BrokerError> {
        let refs = {
            let mut coordinator = self.inner.coordinator.lock();
            if let (Some(producer), Some(txn)) = (producer, coordinator.get(txn_id)) {
                if txn.producer != producer {
                    return Err(TransactionError::ProducerMismatch {
                        txn_id: txn_id.to_string(),
                        producer: producer.to_string(),
                    }
                    .into());
                }
            }
            if commit {
                coordinator.take_for_commit(txn_id)?
            } else {
                coordinator.take_for_rollback(txn_id)?
            }
        };
        // Checkbacks may have settled some refs already; those are skipped.
        Ok(refs
            .into_iter()
            .filter_map(|r| self.inner.registry.queue(&r.queue)?.take(&r.tid))
            .collect())
    }

    pub fn open_transactions(&self) -> usize {
        self.inner.coordinator.lock().count()
    }
}

fn confirm(envelope: &MessageMeta) -> Option<Message> {
    match envelope.qos {
        Qos::AtLeastOnce => Some(
            Message::default()
                .with_tid(envelope.tid.clone())
                .with_meta(meta::CONFIRM, "1"),
        ),
        Qos::AtMostOnce => None,
    }
}

/// Subscriptions may not target the reserved staging group.
fn subscription_key(topic: &str, consumer_group: &str) -> Result<QueueKey, ProtocolError> {
    if topic.is_empty() {
        return Err(ProtocolError::MissingMeta(meta::TOPIC));
    }
    if consumer_group.is_empty() {
        return Err(ProtocolError::MissingMeta(meta::CONSUMER_GROUP));
    }
    if consumer_group == RESERVED_TRAN_GROUP || consumer_group.contains('#') {
        return Err(ProtocolError::InvalidMeta {
            key: meta::CONSUMER_GROUP,
            value: consumer_group.to_string(),
        });
    }
    Ok(QueueKey::new(topic, consumer_group))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::holder::HolderState;
    use crate::messaging::session::{ReplyHandler, Session};

    #[derive(Default)]
    struct Recorder {
        id: String,
        sent: Mutex<Vec<(Event, Message)>>,
        replies: Mutex<Vec<ReplyHandler>>,
    }

    impl Session for Recorder {
        fn session_id(&self) -> &str {
            &self.id
        }

        fn send(&self, event: Event, message: Message) -> Result<(), SessionError> {
            self.sent.lock().push((event, message));
            Ok(())
        }

        fn send_and_subscribe(
            &self,
            event: Event,
            message: Message,
            on_reply: ReplyHandler,
        ) -> Result<(), SessionError> {
            self.send(event, message)?;
            self.replies.lock().push(on_reply);
            Ok(())
        }
    }

    fn recorder(id: &str) -> Arc<Recorder> {
        Arc::new(Recorder {
            id: id.to_string(),
            ..Recorder::default()
        })
    }

    fn broker() -> Broker {
        Broker::builder()
            .with_backoff(BackoffPolicy::from_millis(&[0, 0], 60_000))
            .with_checkback_grace(Duration::ZERO)
            .build()
    }

    #[test]
    fn publish_fans_out_and_confirms() {
        let broker = broker();
        let consumer = recorder("c1");
        broker.subscribe(Some(consumer.clone()), "orders", "billing").unwrap();
        broker.subscribe(None, "orders", "audit").unwrap();

        let reply = broker
            .publish(Message::publish("orders", "o-1").with_tid("m1"), Some("p1"))
            .unwrap()
            .unwrap();
        assert_eq!(reply.meta(meta::CONFIRM), Some("1"));
        assert_eq!(reply.tid(), "m1");

        let qos0 = Message::publish("orders", "o-2").with_qos(Qos::AtMostOnce);
        assert!(broker.publish(qos0, Some("p1")).unwrap().is_none());

        let views = broker.view_queues();
        assert_eq!(views.len(), 2);
        assert!(views.iter().all(|v| v.message_count == 2));
    }

    #[test]
    fn malformed_publish_is_reported() {
        let broker = broker();
        let err = broker.publish(Message::new("x"), None).unwrap_err();
        assert!(matches!(err, BrokerError::Malformed(_)));
    }

    #[test]
    fn reserved_group_cannot_be_subscribed() {
        let broker = broker();
        assert!(broker.subscribe(None, "orders", "!").is_err());
        assert!(broker.subscribe(None, "", "g").is_err());
    }

    #[test]
    fn close_unbinds_but_keeps_messages() {
        let broker = broker();
        let consumer = recorder("c1");
        broker.on_open(consumer.clone());
        let queue = broker
            .subscribe(Some(consumer.clone()), "orders", "billing")
            .unwrap();
        broker
            .publish(Message::publish("orders", "x").with_tid("m1"), None)
            .unwrap();
        broker.on_close("c1");
        assert_eq!(queue.session_count(), 0);
        assert_eq!(queue.pending_count(), 1);
        assert_eq!(broker.session_count(), 0);
    }

    #[test]
    fn explicit_commit_releases_staged() {
        let broker = broker();
        broker.subscribe(None, "orders", "billing").unwrap();
        let txn = broker.begin_transaction("p1");
        let msg = Message::publish("orders", "x").with_tid("m1").with_transaction(txn.clone());
        broker.publish(msg, Some("p1")).unwrap();

        let billing = broker.registry().queue(&QueueKey::new("orders", "billing")).unwrap();
        let staging = broker.registry().queue(&QueueKey::staging("orders")).unwrap();
        assert_eq!(billing.pending_count(), 0);
        assert!(staging.contains("m1"));

        assert!(matches!(
            broker.commit_transaction(&txn, Some("intruder")),
            Err(BrokerError::Transaction(TransactionError::ProducerMismatch { .. }))
        ));
        assert_eq!(broker.commit_transaction(&txn, Some("p1")).unwrap(), 1);
        assert!(!staging.contains("m1"));
        assert_eq!(billing.holder_state("m1"), Some(HolderState::Pending));
        assert_eq!(broker.open_transactions(), 0);
    }

    #[test]
    fn checkback_commit_and_missing_producer_rollback() {
        let broker = broker();
        let producer = recorder("p1");
        broker.on_open(producer.clone());
        broker.subscribe(None, "orders", "billing").unwrap();
        let staging_key = QueueKey::staging("orders");

        let msg = Message::publish("orders", "x").with_tid("m1").with_transaction("tx-1");
        broker.publish(msg, Some("p1")).unwrap();
        let staging = broker.registry().queue(&staging_key).unwrap();
        staging.dispatch_due();
        {
            let sent = producer.sent.lock();
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].0, Event::Request);
        }
        let reply = producer.replies.lock().pop().unwrap();
        reply(Message::ack(true));
        let billing = broker.registry().queue(&QueueKey::new("orders", "billing")).unwrap();
        assert!(billing.contains("m1"));
        assert_eq!(staging.pending_count(), 0);

        // Producer gone: the next staged message is discarded at checkback.
        let msg = Message::publish("orders", "y").with_tid("m2").with_transaction("tx-2");
        broker.publish(msg, Some("ghost")).unwrap();
        staging.dispatch_due();
        assert_eq!(staging.pending_count(), 0);
        assert!(!billing.contains("m2"));
        assert_eq!(broker.open_transactions(), 0);
    }

    #[test]
    fn producer_close_rolls_back_its_transactions() {
        let broker = broker();
        let producer = recorder("p1");
        broker.on_open(producer);
        let txn = broker.begin_transaction("p1");
        broker
            .publish(
                Message::publish("orders", "x").with_tid("m1").with_transaction(txn),
                Some("p1"),
            )
            .unwrap();
        broker.on_close("p1");
        let staging = broker.registry().queue(&QueueKey::staging("orders")).unwrap();
        assert_eq!(staging.pending_count(), 0);
        assert_eq!(broker.open_transactions(), 0);
    }
}
