//! One message instance inside one queue.

use crate::messaging::protocol::{meta, Message, MessageMeta, Qos};

/// Lifecycle of a holder inside its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HolderState {
    /// Waiting in the ready structure for its scheduled time.
    Pending,
    /// Sequenced behind an unfinished predecessor of the same partition.
    Parked,
    /// Sent; waiting for an ack or the in-flight deadline.
    InFlight,
    /// Terminal.
    Done,
}

impl HolderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HolderState::Pending => "pending",
            HolderState::Parked => "parked",
            HolderState::InFlight => "in_flight",
            HolderState::Done => "done",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MessageHolder {
    pub tid: String,
    pub topic: String,
    pub consumer_group: String,
    pub qos: Qos,
    pub sequence: bool,
    pub partition: Option<String>,
    pub expiration_at: Option<u64>,
    pub transaction_id: Option<String>,
    pub sender: Option<String>,
    /// Completed delivery attempts.
    pub attempts: u32,
    /// Epoch milliseconds at which the holder becomes due.
    pub scheduled_at: u64,
    /// Enqueue order within the owning queue.
    pub enqueued: u64,
    state: HolderState,
    content: Message,
}

impl MessageHolder {
    pub fn new(envelope: MessageMeta, content: Message, consumer_group: &str, now: u64) -> Self {
        let mut content = content;
        content.set_meta(meta::CONSUMER_GROUP, consumer_group);
        Self {
            tid: envelope.tid,
            topic: envelope.topic,
            consumer_group: consumer_group.to_string(),
            qos: envelope.qos,
            sequence: envelope.sequence,
            partition: envelope.partition,
            expiration_at: envelope.expiration_at,
            transaction_id: envelope.transaction_id,
            sender: envelope.sender,
            attempts: envelope.times,
            scheduled_at: envelope.scheduled_at.unwrap_or(now),
            enqueued: 0,
            state: HolderState::Pending,
            content,
        }
    }

    pub fn state(&self) -> HolderState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state == HolderState::Done
    }

    /// Ordering lane for sequenced holders.
    pub fn lane(&self) -> Option<&str> {
        if self.sequence {
            Some(self.partition.as_deref().unwrap_or(""))
        } else {
            None
        }
    }

    pub(crate) fn set_state(&mut self, state: HolderState) {
        // Done is terminal.
        if self.state != HolderState::Done {
            self.state = state;
        }
    }

    pub fn mark_done(&mut self) {
        self.state = HolderState::Done;
    }

    /// Starts a delivery attempt and returns the message to put on the wire.
    ///
    /// `t2` carries the number of earlier attempts, so a consumer sees a
    /// redelivery as `t2 > 0`.
    pub fn begin_attempt(&mut self) -> Message {
        self.content.set_meta(meta::TIMES, self.attempts.to_string());
        self.content
            .set_meta(meta::SCHEDULED, self.scheduled_at.to_string());
        self.attempts = self.attempts.saturating_add(1);
        self.state = HolderState::InFlight;
        self.content.clone()
    }

    /// Undo `begin_attempt` after the send itself failed.
    pub fn revert_attempt(&mut self) {
        self.attempts = self.attempts.saturating_sub(1);
        self.set_state(HolderState::Pending);
    }

    /// Form written to snapshots; reloads through `MessageHolder::new`.
    pub fn to_persisted(&self) -> Message {
        let mut msg = self.content.clone();
        msg.set_meta(meta::SCHEDULED, self.scheduled_at.to_string());
        msg.set_meta(meta::TIMES, self.attempts.to_string());
        msg
    }

    /// The producer's message without the transactional markers, ready for fan-out.
    ///
    /// Staging owns the scheduled time, so a released message is due at commit.
    pub fn release_message(&self) -> Message {
        let mut msg = self.content.clone();
        for key in [
            meta::TRANSACTION,
            meta::TRANSACTION_ID,
            meta::TIMES,
            meta::SCHEDULED,
            meta::CONSUMER_GROUP,
        ] {
            msg.remove_meta(key);
        }
        msg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn holder(msg: Message) -> MessageHolder {
        let envelope = MessageMeta::resolve(&msg).unwrap();
        MessageHolder::new(envelope, msg, "g1", 1_000)
    }

    #[test]
    fn attempts_count_previous_deliveries() {
        let mut h = holder(Message::publish("t", "b"));
        assert_eq!(h.scheduled_at, 1_000);
        let first = h.begin_attempt();
        assert_eq!(first.meta(meta::TIMES), Some("0"));
        assert_eq!(first.meta(meta::CONSUMER_GROUP), Some("g1"));
        assert_eq!(h.state(), HolderState::InFlight);
        h.set_state(HolderState::Pending);
        let second = h.begin_attempt();
        assert_eq!(second.meta(meta::TIMES), Some("1"));
        assert_eq!(h.attempts, 2);
    }

    #[test]
    fn revert_keeps_attempt_count() {
        let mut h = holder(Message::publish("t", "b"));
        h.begin_attempt();
        h.revert_attempt();
        assert_eq!(h.attempts, 0);
        assert_eq!(h.state(), HolderState::Pending);
    }

    #[test]
    fn done_is_terminal() {
        let mut h = holder(Message::publish("t", "b"));
        h.mark_done();
        h.set_state(HolderState::Pending);
        assert!(h.is_done());
    }

    #[test]
    fn persisted_form_restores_schedule_and_attempts() {
        let mut h = holder(Message::publish("t", "b").with_expiration(9_000));
        h.begin_attempt();
        h.scheduled_at = 5_000;
        let restored = holder(h.to_persisted());
        assert_eq!(restored.attempts, 1);
        assert_eq!(restored.scheduled_at, 5_000);
        assert_eq!(restored.expiration_at, Some(9_000));
    }

    #[test]
    fn release_strips_transaction_markers() {
        let h = holder(
            Message::publish("t", "b")
                .with_transaction("tx")
                .with_scheduled(7_000),
        );
        assert_eq!(h.transaction_id.as_deref(), Some("tx"));
        let released = h.release_message();
        assert!(!released.is_transaction());
        assert_eq!(released.meta(meta::TRANSACTION_ID), None);
        assert_eq!(released.meta(meta::SCHEDULED), None);
        assert_eq!(released.body, "b");
    }
}
