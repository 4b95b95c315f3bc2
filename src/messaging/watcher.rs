//! Lifecycle hooks for persistence and metrics collaborators.
//!
//! Every hook has a no-op default. Hooks run synchronously on the caller's
//! context and must return quickly; `on_start_after` is the exception and
//! runs on a blocking task so recovery does not hold up startup.

use crate::broker::Broker;
use crate::messaging::holder::MessageHolder;
use crate::messaging::protocol::Message;
use crate::messaging::queue::QueueKey;
use std::sync::Arc;

pub trait Watcher: Send + Sync + 'static {
    fn on_start_before(&self, _broker: &Broker) {}
    fn on_start_after(&self, _broker: &Broker) {}
    fn on_stop_before(&self, _broker: &Broker) {}
    fn on_stop_after(&self, _broker: &Broker) {}
    fn on_save(&self, _broker: &Broker) {}

    fn on_subscribe(&self, _topic: &str, _consumer_group: &str, _session: Option<&str>) {}
    fn on_unsubscribe(&self, _topic: &str, _consumer_group: &str, _session: &str) {}
    fn on_publish(&self, _message: &Message) {}
    fn on_unpublish(&self, _message: &Message) {}
    fn on_distribute(&self, _queue: &QueueKey, _holder: &MessageHolder) {}
    fn on_acknowledge(&self, _queue: &QueueKey, _holder: &MessageHolder, _accepted: bool) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWatcher;

impl Watcher for NoopWatcher {}

/// Fans every hook out to each watcher in registration order.
#[derive(Default, Clone)]
pub struct WatcherChain {
    watchers: Vec<Arc<dyn Watcher>>,
}

impl WatcherChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, watcher: Arc<dyn Watcher>) -> Self {
        self.watchers.push(watcher);
        self
    }

    pub fn len(&self) -> usize {
        self.watchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watchers.is_empty()
    }
}

impl Watcher for WatcherChain {
    fn on_start_before(&self, broker: &Broker) {
        self.watchers.iter().for_each(|w| w.on_start_before(broker));
    }

    fn on_start_after(&self, broker: &Broker) {
        self.watchers.iter().for_each(|w| w.on_start_after(broker));
    }

    fn on_stop_before(&self, broker: &Broker) {
        self.watchers.iter().for_each(|w| w.on_stop_before(broker));
    }

    fn on_stop_after(&self, broker: &Broker) {
        self.watchers.iter().for_each(|w| w.on_stop_after(broker));
    }

    fn on_save(&self, broker: &Broker) {
        self.watchers.iter().for_each(|w| w.on_save(broker));
    }

    fn on_subscribe(&self, topic: &str, consumer_group: &str, session: Option<&str>) {
        for w in &self.watchers {
            w.on_subscribe(topic, consumer_group, session);
        }
    }

    fn on_unsubscribe(&self, topic: &str, consumer_group: &str, session: &str) {
        for w in &self.watchers {
            w.on_unsubscribe(topic, consumer_group, session);
        }
    }

    fn on_publish(&self, message: &Message) {
        self.watchers.iter().for_each(|w| w.on_publish(message));
    }

    fn on_unpublish(&self, message: &Message) {
        self.watchers.iter().for_each(|w| w.on_unpublish(message));
    }

    fn on_distribute(&self, queue: &QueueKey, holder: &MessageHolder) {
        for w in &self.watchers {
            w.on_distribute(queue, holder);
        }
    }

    fn on_acknowledge(&self, queue: &QueueKey, holder: &MessageHolder, accepted: bool) {
        for w in &self.watchers {
            w.on_acknowledge(queue, holder, accepted);
        }
    }
}
