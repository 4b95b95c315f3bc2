//! Subscription index and queue registry.
//!
//! Two concurrent maps: topic to queue keys, and queue key to queue. The
//! queue-map entry guard for a key is the only create-or-get critical
//! section; the index update happens while it is held, so a publish never
//! sees a queue that is missing from its topic's index. Lock order is
//! always queues entry, then subscriptions entry.

use crate::messaging::queue::{DispatchContext, Queue, QueueKey};
use crate::messaging::session::SessionRef;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

pub struct SubscriptionRegistry {
    subscriptions: DashMap<String, HashSet<QueueKey>>,
    queues: DashMap<QueueKey, Arc<Queue>>,
    context: Arc<DispatchContext>,
}

impl SubscriptionRegistry {
    pub fn new(context: Arc<DispatchContext>) -> Self {
        Self {
            subscriptions: DashMap::new(),
            queues: DashMap::new(),
            context,
        }
    }

    pub fn context(&self) -> &Arc<DispatchContext> {
        &self.context
    }

    /// Returns the queue for `key`, creating it and indexing it under its topic.
    pub fn get_or_create_queue(&self, key: &QueueKey) -> Arc<Queue> {
        match self.queues.entry(key.clone()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let queue = Queue::new(key.clone(), self.context.clone());
                self.subscriptions
                    .entry(key.topic().to_string())
                    .or_default()
                    .insert(key.clone());
                entry.insert(queue.clone());
                queue.spawn_dispatcher();
                tracing::debug!(queue = %key, "queue created");
                queue
            }
        }
    }

    /// Binds `session` to the queue, creating the queue if needed. A `None`
    /// session only materialises the queue (snapshot recovery).
    pub fn subscribe(&self, key: &QueueKey, session: Option<SessionRef>) -> Arc<Queue> {
        let queue = self.get_or_create_queue(key);
        if let Some(session) = session {
            queue.add_session(session);
        }
        queue
    }

    /// Unbinds one session. The queue and its messages stay.
    pub fn unsubscribe(&self, key: &QueueKey, session_id: &str) -> bool {
        self.queue(key)
            .is_some_and(|queue| queue.remove_session(session_id))
    }

    /// Closes and forgets a queue together with its pending messages.
    pub fn remove_queue(&self, key: &QueueKey) -> Option<Arc<Queue>> {
        let queue = match self.queues.entry(key.clone()) {
            Entry::Occupied(entry) => {
                if let Some(mut keys) = self.subscriptions.get_mut(key.topic()) {
                    keys.remove(key);
                }
                entry.remove()
            }
            Entry::Vacant(_) => return None,
        };
        self.subscriptions
            .remove_if(key.topic(), |_, keys| keys.is_empty());
        queue.close();
        tracing::info!(queue = %key, "queue removed");
        Some(queue)
    }

    pub fn queue(&self, key: &QueueKey) -> Option<Arc<Queue>> {
        self.queues.get(key).map(|q| q.value().clone())
    }

    /// Queues indexed under `topic`, staging included.
    pub fn list_subscribed_queues(&self, topic: &str) -> Vec<Arc<Queue>> {
        let keys: Vec<QueueKey> = match self.subscriptions.get(topic) {
            Some(keys) => keys.iter().cloned().collect(),
            None => return Vec::new(),
        };
        keys.iter().filter_map(|key| self.queue(key)).collect()
    }

    pub fn queues(&self) -> Vec<Arc<Queue>> {
        let mut queues: Vec<Arc<Queue>> = self.queues.iter().map(|q| q.value().clone()).collect();
        queues.sort_by(|a, b| a.key().cmp(b.key()));
        queues
    }

    /// Topic to queue keys, sorted for stable snapshots.
    pub fn subscription_map(&self) -> BTreeMap<String, Vec<QueueKey>> {
        self.subscriptions
            .iter()
            .map(|entry| {
                let mut keys: Vec<QueueKey> = entry.value().iter().cloned().collect();
                keys.sort();
                (entry.key().clone(), keys)
            })
            .collect()
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    pub fn close_all(&self) {
        for queue in self.queues() {
            queue.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::time::SystemClock;
    use crate::messaging::backoff::BackoffPolicy;
    use crate::messaging::holder::MessageHolder;
    use crate::messaging::session::RandomSelector;
    use crate::messaging::transactions::StagingResolver;
    use crate::messaging::watcher::NoopWatcher;
    use std::sync::Weak;
    use std::time::Duration;

    struct NoResolver;

    impl StagingResolver for NoResolver {
        fn producer_session(&self, _sender: &str) -> Option<SessionRef> {
            None
        }
        fn commit_staged(&self, _holder: MessageHolder) {}
        fn rollback_staged(&self, _holder: MessageHolder) {}
    }

    fn registry() -> SubscriptionRegistry {
        let resolver: Weak<dyn StagingResolver> = Weak::<NoResolver>::new();
        SubscriptionRegistry::new(Arc::new(DispatchContext {
            backoff: BackoffPolicy::default(),
            checkback_grace: Duration::from_secs(1),
            clock: Arc::new(SystemClock),
            selector: Arc::new(RandomSelector),
            watcher: Arc::new(NoopWatcher),
            resolver,
        }))
    }

    #[test]
    fn create_or_get_is_idempotent_and_indexed() {
        let reg = registry();
        let key = QueueKey::new("orders", "billing");
        let a = reg.get_or_create_queue(&key);
        let b = reg.get_or_create_queue(&key);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(reg.queue_count(), 1);
        assert_eq!(reg.list_subscribed_queues("orders").len(), 1);
        assert!(reg.list_subscribed_queues("other").is_empty());
    }

    #[test]
    fn remove_queue_cleans_index() {
        let reg = registry();
        let key = QueueKey::new("orders", "billing");
        reg.get_or_create_queue(&key);
        reg.get_or_create_queue(&QueueKey::new("orders", "audit"));
        assert!(reg.remove_queue(&key).is_some());
        assert_eq!(reg.subscription_map()["orders"].len(), 1);
        assert!(reg.remove_queue(&QueueKey::new("orders", "audit")).is_some());
        assert!(reg.subscription_map().is_empty());
        assert!(reg.remove_queue(&key).is_none());
    }

    #[test]
    fn concurrent_create_yields_one_queue() {
        let reg = Arc::new(registry());
        let key = QueueKey::new("t", "g");
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reg = reg.clone();
                let key = key.clone();
                std::thread::spawn(move || reg.get_or_create_queue(&key))
            })
            .collect();
        let queues: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(queues.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(reg.subscription_map()["t"], vec![key]);
    }
}
