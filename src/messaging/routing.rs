//! Publish fan-out, direct routing and cancellation.
//!
//! Each receiving queue gets its own holder for the same logical message.

use crate::messaging::holder::MessageHolder;
use crate::messaging::protocol::{Message, MessageMeta, ProtocolError};
use crate::messaging::queue::QueueKey;
use crate::messaging::registry::SubscriptionRegistry;

/// Enqueues `message` into every queue of its topic except staging.
/// Returns how many queues accepted it.
pub fn route_publish(
    registry: &SubscriptionRegistry,
    message: &Message,
) -> Result<usize, ProtocolError> {
    let envelope = MessageMeta::resolve(message)?;
    let now = registry.context().clock.now_millis();
    let mut routed = 0;
    for queue in registry.list_subscribed_queues(&envelope.topic) {
        if queue.key().is_staging() {
            continue;
        }
        let holder = MessageHolder::new(
            envelope.clone(),
            message.clone(),
            queue.key().consumer_group(),
            now,
        );
        if queue.add(holder) {
            routed += 1;
        }
    }
    Ok(routed)
}

/// Enqueues into exactly one queue. A missing queue is not an error.
pub fn route_direct(
    registry: &SubscriptionRegistry,
    key: &QueueKey,
    message: &Message,
) -> Result<bool, ProtocolError> {
    let envelope = MessageMeta::resolve(message)?;
    let Some(queue) = registry.queue(key) else {
        tracing::debug!(queue = %key, tid = %envelope.tid, "direct route target absent");
        return Ok(false);
    };
    let now = registry.context().clock.now_millis();
    let holder = MessageHolder::new(envelope, message.clone(), key.consumer_group(), now);
    Ok(queue.add(holder))
}

/// Places a transactional message in its topic's staging queue, due for a
/// checkback after the grace period.
pub fn stage(registry: &SubscriptionRegistry, message: &Message) -> Result<QueueKey, ProtocolError> {
    let mut envelope = MessageMeta::resolve(message)?;
    let context = registry.context();
    let now = context.clock.now_millis();
    envelope.scheduled_at = Some(now + context.checkback_grace.as_millis() as u64);
    let key = QueueKey::staging(envelope.topic.clone());
    let queue = registry.get_or_create_queue(&key);
    let holder = MessageHolder::new(envelope, message.clone(), key.consumer_group(), now);
    queue.add(holder);
    Ok(key)
}

/// Cancels the message identified by `message`'s tid in every queue of its
/// topic. Returns how many holders were removed.
pub fn unroute(registry: &SubscriptionRegistry, message: &Message) -> usize {
    let tid = message.tid();
    if tid.is_empty() {
        tracing::warn!(topic = %message.topic(), "unpublish without tid dropped");
        return 0;
    }
    registry
        .list_subscribed_queues(message.topic())
        .iter()
        .filter(|queue| queue.remove(tid))
        .count()
}
