//! Per (topic, consumer group) queue and its dispatcher.
//!
//! A queue owns its holders behind one `parking_lot::Mutex`. Pending holders
//! sit in a ready map keyed by `(scheduled_at, enqueued)`; the only way to
//! move a holder in time is remove-then-reinsert. Sends and watcher calls
//! happen after the lock is released.
//!
//! The dispatcher is one tokio task per queue. It sleeps until the earliest
//! of: the first ready holder, the first in-flight deadline, the first
//! expiration. `Notify` wakes it early on insert, ack or session bind.

use crate::core::time::Clock;
use crate::messaging::acks::{AckOutcome, InFlightEntry, InFlightTracker};
use crate::messaging::backoff::BackoffPolicy;
use crate::messaging::holder::{HolderState, MessageHolder};
use crate::messaging::ordering::PartitionGate;
use crate::messaging::protocol::{
    meta, Event, Message, Qos, RESERVED_TRAN_GROUP, SEP_TOPIC_CONSUMER_GROUP,
};
use crate::messaging::session::{ReplyHandler, SessionRef, SessionSelector};
use crate::messaging::transactions::StagingResolver;
use crate::messaging::watcher::Watcher;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};

// ---------------------------------------------------------------------------
// Queue key
// ---------------------------------------------------------------------------

/// `topic#consumer_group`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QueueKey {
    topic: String,
    consumer_group: String,
}

impl QueueKey {
    pub fn new(topic: impl Into<String>, consumer_group: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            consumer_group: consumer_group.into(),
        }
    }

    pub fn staging(topic: impl Into<String>) -> Self {
        Self::new(topic, RESERVED_TRAN_GROUP)
    }

    /// Splits on the last separator; topics may contain `#`, groups may not.
    pub fn parse(raw: &str) -> Option<Self> {
        let (topic, group) = raw.rsplit_once(SEP_TOPIC_CONSUMER_GROUP)?;
        if topic.is_empty() || group.is_empty() {
            return None;
        }
        Some(Self::new(topic, group))
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    pub fn is_staging(&self) -> bool {
        self.consumer_group == RESERVED_TRAN_GROUP
    }
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            self.topic, SEP_TOPIC_CONSUMER_GROUP, self.consumer_group
        )
    }
}

impl TryFrom<String> for QueueKey {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("invalid queue key {value:?}"))
    }
}

impl From<QueueKey> for String {
    fn from(key: QueueKey) -> Self {
        key.to_string()
    }
}

// ---------------------------------------------------------------------------
// Shared dispatch context
// ---------------------------------------------------------------------------

/// Collaborators shared by every queue of one broker.
pub struct DispatchContext {
    pub backoff: BackoffPolicy,
    /// How long a staged transactional message waits before a checkback.
    pub checkback_grace: Duration,
    pub clock: Arc<dyn Clock>,
    pub selector: Arc<dyn SessionSelector>,
    pub watcher: Arc<dyn Watcher>,
    pub resolver: Weak<dyn StagingResolver>,
}

impl DispatchContext {
    fn now(&self) -> u64 {
        self.clock.now_millis()
    }
}

/// Queues that deliver to consumers versus the transactional staging queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Consumer,
    Staging,
}

/// Admin-facing summary of one queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueView {
    pub queue: String,
    pub topic: String,
    pub consumer_group: String,
    pub session_count: usize,
    pub message_count: usize,
    pub in_flight_count: usize,
}

/// When the dispatcher should run again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    At(u64),
    /// Only a notification (insert, ack, bind, shutdown) can make progress.
    Idle,
}

// ---------------------------------------------------------------------------
// Queue state
// ---------------------------------------------------------------------------

#[derive(Default)]
struct QueueState {
    holders: HashMap<String, MessageHolder>,
    ready: BTreeMap<(u64, u64), String>,
    expiries: BTreeSet<(u64, String)>,
    in_flight: InFlightTracker,
    gate: PartitionGate,
    next_seq: u64,
    closed: bool,
}

impl QueueState {
    fn schedule(&mut self, tid: &str, at: u64) {
        if let Some(holder) = self.holders.get_mut(tid) {
            if holder.state() == HolderState::Pending {
                self.ready.remove(&(holder.scheduled_at, holder.enqueued));
            }
            holder.scheduled_at = at;
            holder.set_state(HolderState::Pending);
            self.ready.insert((at, holder.enqueued), tid.to_string());
        }
    }

    fn insert(&mut self, mut holder: MessageHolder, kind: QueueKind) {
        self.next_seq += 1;
        holder.enqueued = self.next_seq;
        if let Some(at) = holder.expiration_at {
            self.expiries.insert((at, holder.tid.clone()));
        }
        let head = match (kind, holder.lane()) {
            (QueueKind::Consumer, Some(lane)) => {
                let lane = lane.to_string();
                self.gate.admit(&lane, &holder.tid)
            }
            _ => true,
        };
        let tid = holder.tid.clone();
        let at = holder.scheduled_at;
        holder.set_state(HolderState::Parked);
        self.holders.insert(tid.clone(), holder);
        if head {
            self.schedule(&tid, at);
        }
    }

    /// Removes the holder from every structure and marks it done.
    fn finish(&mut self, tid: &str, kind: QueueKind) -> Option<MessageHolder> {
        let mut holder = self.holders.remove(tid)?;
        if holder.state() == HolderState::Pending {
            self.ready.remove(&(holder.scheduled_at, holder.enqueued));
        }
        self.in_flight.remove(tid);
        if let Some(at) = holder.expiration_at {
            self.expiries.remove(&(at, holder.tid.clone()));
        }
        if kind == QueueKind::Consumer {
            if let Some(lane) = holder.lane() {
                if let Some(next) = self.gate.release(lane, tid) {
                    let at = self.holders.get(&next).map(|h| h.scheduled_at);
                    if let Some(at) = at {
                        self.schedule(&next, at);
                    }
                }
            }
        }
        holder.mark_done();
        Some(holder)
    }

    fn purge_expired(&mut self, now: u64, kind: QueueKind) -> Vec<MessageHolder> {
        let mut expired = Vec::new();
        while let Some((at, tid)) = self.expiries.first().cloned() {
            if now <= at {
                break;
            }
            self.expiries.pop_first();
            if let Some(holder) = self.finish(&tid, kind) {
                expired.push(holder);
            }
        }
        expired
    }

    fn next_wake(&self, include_ready: bool) -> Wake {
        let ready = if include_ready {
            self.ready.first_key_value().map(|(&(at, _), _)| at)
        } else {
            None
        };
        let expiry = self.expiries.first().map(|(at, _)| at.saturating_add(1));
        [ready, self.in_flight.next_deadline(), expiry]
            .into_iter()
            .flatten()
            .min()
            .map_or(Wake::Idle, Wake::At)
    }

    fn clear(&mut self) -> usize {
        let count = self.holders.len();
        self.holders.clear();
        self.ready.clear();
        self.expiries.clear();
        self.in_flight.clear();
        self.gate.clear();
        count
    }
}

/// Work decided under the lock and carried out after it is released.
enum Step {
    Wait(Wake),
    Deliver(Attempt),
    Checkback(Attempt),
    Rollback(MessageHolder),
}

struct Attempt {
    session: SessionRef,
    message: Message,
    /// Present for attempts that await a reply.
    token: Option<u64>,
    snapshot: MessageHolder,
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

pub struct Queue {
    key: QueueKey,
    kind: QueueKind,
    state: Mutex<QueueState>,
    sessions: RwLock<Vec<SessionRef>>,
    notify: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    context: Arc<DispatchContext>,
    me: Weak<Queue>,
}

impl Queue {
    pub fn new(key: QueueKey, context: Arc<DispatchContext>) -> Arc<Self> {
        let kind = if key.is_staging() {
            QueueKind::Staging
        } else {
            QueueKind::Consumer
        };
        let (shutdown, _) = watch::channel(false);
        Arc::new_cyclic(|me| Self {
            key,
            kind,
            state: Mutex::new(QueueState::default()),
            sessions: RwLock::new(Vec::new()),
            notify: Arc::new(Notify::new()),
            shutdown,
            context,
            me: me.clone(),
        })
    }

    /// Starts the dispatcher task. Without a tokio runtime the queue only
    /// moves when `dispatch_due` is called directly.
    pub fn spawn_dispatcher(self: &Arc<Self>) {
        if Handle::try_current().is_err() {
            tracing::debug!(queue = %self.key, "skipping dispatcher; no tokio runtime detected");
            return;
        }
        let queue = Arc::downgrade(self);
        let notify = self.notify.clone();
        let shutdown = self.shutdown.subscribe();
        let clock = self.context.clock.clone();
        tokio::spawn(run_dispatcher(queue, notify, shutdown, clock));
    }

    pub fn key(&self) -> &QueueKey {
        &self.key
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    // ----- Sessions -----

    /// Binds a session; rebinding the same id is a no-op.
    pub fn add_session(&self, session: SessionRef) {
        {
            let mut sessions = self.sessions.write();
            if sessions
                .iter()
                .any(|s| s.session_id() == session.session_id())
            {
                return;
            }
            sessions.push(session);
        }
        self.notify.notify_one();
    }

    /// Unbinds one session. Pending messages stay queued.
    pub fn remove_session(&self, session_id: &str) -> bool {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|s| s.session_id() != session_id);
        sessions.len() != before
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    fn live_sessions(&self) -> Vec<SessionRef> {
        self.sessions
            .read()
            .iter()
            .filter(|s| s.is_valid())
            .cloned()
            .collect()
    }

    // ----- Messages -----

    /// Enqueues a holder. Duplicate tids and done holders are ignored.
    pub fn add(&self, holder: MessageHolder) -> bool {
        if holder.is_done() {
            return false;
        }
        {
            let mut state = self.state.lock();
            if state.closed || state.holders.contains_key(&holder.tid) {
                tracing::debug!(queue = %self.key, tid = %holder.tid, "ignoring duplicate enqueue");
                return false;
            }
            state.insert(holder, self.kind);
        }
        self.notify.notify_one();
        true
    }

    /// Cancels a holder by tid.
    pub fn remove(&self, tid: &str) -> bool {
        self.take(tid).is_some()
    }

    /// Removes and returns a holder, whatever its state.
    pub fn take(&self, tid: &str) -> Option<MessageHolder> {
        let holder = self.state.lock().finish(tid, self.kind);
        if holder.is_some() {
            self.notify.notify_one();
        }
        holder
    }

    pub fn contains(&self, tid: &str) -> bool {
        self.state.lock().holders.contains_key(tid)
    }

    pub fn holder_state(&self, tid: &str) -> Option<HolderState> {
        self.state.lock().holders.get(tid).map(MessageHolder::state)
    }

    /// Every holder that is not done, whatever its state.
    pub fn pending_count(&self) -> usize {
        self.state.lock().holders.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Makes every pending holder due now.
    pub fn force_distribute(&self) -> usize {
        let now = self.context.now();
        let moved = {
            let mut state = self.state.lock();
            let pending: Vec<String> = state.ready.values().cloned().collect();
            for tid in &pending {
                state.schedule(tid, now);
            }
            pending.len()
        };
        self.notify.notify_one();
        moved
    }

    /// Drops every holder; sessions stay bound.
    pub fn clear(&self) -> usize {
        let count = self.state.lock().clear();
        self.notify.notify_one();
        count
    }

    /// Stops the dispatcher and releases everything the queue holds.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            state.closed = true;
            state.clear();
        }
        self.sessions.write().clear();
        self.shutdown.send_replace(true);
        self.notify.notify_one();
    }

    /// Not-done messages in enqueue order, in their persisted form.
    pub fn snapshot_messages(&self) -> Vec<Message> {
        let state = self.state.lock();
        let mut holders: Vec<&MessageHolder> = state.holders.values().collect();
        holders.sort_by_key(|h| h.enqueued);
        holders.into_iter().map(MessageHolder::to_persisted).collect()
    }

    pub fn view(&self) -> QueueView {
        let session_count = self.session_count();
        let state = self.state.lock();
        QueueView {
            queue: self.key.to_string(),
            topic: self.key.topic().to_string(),
            consumer_group: self.key.consumer_group().to_string(),
            session_count,
            message_count: state.holders.len(),
            in_flight_count: state.in_flight.len(),
        }
    }

    // ----- Dispatch -----

    /// Delivers everything that is due and reports when to run again.
    pub fn dispatch_due(&self) -> Wake {
        loop {
            let now = self.context.now();
            let (step, expired) = {
                let mut state = self.state.lock();
                if state.closed {
                    return Wake::Idle;
                }
                let expired = state.purge_expired(now, self.kind);
                for entry in state.in_flight.expire(now) {
                    self.retry_later(&mut state, &entry, now);
                }
                (self.plan(&mut state, now), expired)
            };
            for holder in expired {
                tracing::debug!(queue = %self.key, tid = %holder.tid, "discarding expired message");
                self.context.watcher.on_acknowledge(&self.key, &holder, false);
                if self.kind == QueueKind::Staging {
                    if let Some(resolver) = self.context.resolver.upgrade() {
                        resolver.rollback_staged(holder);
                    }
                }
            }
            match step {
                Step::Wait(wake) => return wake,
                Step::Deliver(attempt) => self.deliver(attempt),
                Step::Checkback(attempt) => self.checkback(attempt),
                Step::Rollback(holder) => {
                    tracing::info!(
                        queue = %self.key,
                        tid = %holder.tid,
                        "producer session gone; rolling back staged message"
                    );
                    if let Some(resolver) = self.context.resolver.upgrade() {
                        resolver.rollback_staged(holder);
                    }
                }
            }
        }
    }

    fn plan(&self, state: &mut QueueState, now: u64) -> Step {
        let tid = match state.ready.first_key_value() {
            Some((&(at, _), tid)) if at <= now => tid.clone(),
            _ => return Step::Wait(state.next_wake(true)),
        };
        match self.kind {
            QueueKind::Consumer => self.plan_delivery(state, tid, now),
            QueueKind::Staging => self.plan_checkback(state, tid, now),
        }
    }

    fn plan_delivery(&self, state: &mut QueueState, tid: String, now: u64) -> Step {
        let sessions = self.live_sessions();
        let Some(idx) = self.context.selector.select(&sessions) else {
            state.schedule(&tid, now + millis(self.context.backoff.min_delay()));
            tracing::warn!(queue = %self.key, tid = %tid, "no bound session; message stays pending");
            return Step::Wait(state.next_wake(false));
        };
        let session = sessions[idx].clone();
        let Some(holder) = state.holders.get_mut(&tid) else {
            return Step::Wait(state.next_wake(true));
        };
        state.ready.remove(&(holder.scheduled_at, holder.enqueued));
        let message = holder.begin_attempt();
        let qos = holder.qos;
        let mut snapshot = holder.clone();
        let token = match qos {
            Qos::AtLeastOnce => {
                let deadline = now + millis(self.context.backoff.max_in_flight());
                Some(state.in_flight.track(&tid, session.session_id(), deadline))
            }
            Qos::AtMostOnce => {
                if let Some(done) = state.finish(&tid, self.kind) {
                    snapshot = done;
                }
                None
            }
        };
        Step::Deliver(Attempt {
            session,
            message,
            token,
            snapshot,
        })
    }

    fn plan_checkback(&self, state: &mut QueueState, tid: String, now: u64) -> Step {
        let producer = state
            .holders
            .get(&tid)
            .and_then(|h| h.sender.clone())
            .zip(self.context.resolver.upgrade())
            .and_then(|(sender, resolver)| resolver.producer_session(&sender))
            .filter(|s| s.is_valid());
        let Some(session) = producer else {
            return match state.finish(&tid, self.kind) {
                Some(holder) => Step::Rollback(holder),
                None => Step::Wait(state.next_wake(true)),
            };
        };
        let Some(holder) = state.holders.get_mut(&tid) else {
            return Step::Wait(state.next_wake(true));
        };
        state.ready.remove(&(holder.scheduled_at, holder.enqueued));
        let message = holder.begin_attempt();
        let snapshot = holder.clone();
        let deadline = now + millis(self.context.checkback_grace);
        let token = state.in_flight.track(&tid, session.session_id(), deadline);
        Step::Checkback(Attempt {
            session,
            message,
            token: Some(token),
            snapshot,
        })
    }

    fn retry_later(&self, state: &mut QueueState, entry: &InFlightEntry, now: u64) {
        let Some(attempts) = state.holders.get(&entry.tid).map(|h| h.attempts) else {
            return;
        };
        tracing::debug!(queue = %self.key, tid = %entry.tid, session = %entry.session_id, "in-flight deadline passed");
        let delay = self.context.backoff.next_delay(attempts);
        state.schedule(&entry.tid, now + millis(delay));
    }

    fn deliver(&self, attempt: Attempt) {
        let Attempt {
            session,
            message,
            token,
            snapshot,
        } = attempt;
        self.context.watcher.on_distribute(&self.key, &snapshot);
        let result = match token {
            Some(token) => session.send_and_subscribe(
                Event::Distribute,
                message,
                self.reply_handler(snapshot.tid.clone(), token),
            ),
            None => session.send(Event::Distribute, message),
        };
        match (result, token) {
            (Ok(()), None) => self.context.watcher.on_acknowledge(&self.key, &snapshot, true),
            (Ok(()), Some(_)) => {}
            (Err(err), None) => {
                tracing::warn!(queue = %self.key, tid = %snapshot.tid, "qos0 delivery dropped: {err:?}");
            }
            (Err(err), Some(token)) => {
                tracing::warn!(queue = %self.key, tid = %snapshot.tid, session = %session.session_id(), "delivery failed: {err:?}");
                self.send_failed(&snapshot.tid, token);
            }
        }
    }

    fn checkback(&self, attempt: Attempt) {
        let Attempt {
            session,
            message,
            token,
            snapshot,
        } = attempt;
        let Some(token) = token else {
            return;
        };
        let handler = self.reply_handler(snapshot.tid.clone(), token);
        if let Err(err) = session.send_and_subscribe(Event::Request, message, handler) {
            tracing::warn!(queue = %self.key, tid = %snapshot.tid, "checkback request failed: {err:?}");
            self.send_failed(&snapshot.tid, token);
        }
    }

    fn reply_handler(&self, tid: String, token: u64) -> ReplyHandler {
        let queue = self.me.clone();
        Box::new(move |reply: Message| {
            if let Some(queue) = queue.upgrade() {
                queue.on_reply(&tid, token, &reply);
            }
        })
    }

    fn on_reply(&self, tid: &str, token: u64, reply: &Message) {
        match (self.kind, reply.meta(meta::ACK)) {
            (QueueKind::Staging, Some("1")) => self.resolve_checkback(tid, token, true),
            (QueueKind::Staging, Some("0")) => self.resolve_checkback(tid, token, false),
            // Producer has not decided yet; ask again later.
            (QueueKind::Staging, _) => self.acknowledge(tid, token, AckOutcome::Rejected),
            (QueueKind::Consumer, ack) => self.acknowledge(tid, token, AckOutcome::from_reply(ack)),
        }
    }

    /// Applies a consumer's answer to the attempt identified by `token`.
    /// Answers for superseded attempts are ignored.
    pub fn acknowledge(&self, tid: &str, token: u64, outcome: AckOutcome) {
        let now = self.context.now();
        let snapshot = {
            let mut state = self.state.lock();
            if state.in_flight.resolve(tid, token).is_none() {
                tracing::debug!(queue = %self.key, tid = %tid, "ignoring stale ack");
                return;
            }
            if outcome.is_accepted() {
                state.finish(tid, self.kind)
            } else {
                let attempts = state.holders.get(tid).map_or(0, |h| h.attempts);
                let delay = self.context.backoff.next_delay(attempts);
                state.schedule(tid, now + millis(delay));
                state.holders.get(tid).cloned()
            }
        };
        if let Some(holder) = snapshot {
            self.context
                .watcher
                .on_acknowledge(&self.key, &holder, outcome.is_accepted());
        }
        self.notify.notify_one();
    }

    fn resolve_checkback(&self, tid: &str, token: u64, commit: bool) {
        let holder = {
            let mut state = self.state.lock();
            if state.in_flight.resolve(tid, token).is_none() {
                tracing::debug!(queue = %self.key, tid = %tid, "ignoring stale checkback answer");
                return;
            }
            state.finish(tid, self.kind)
        };
        let Some(holder) = holder else {
            return;
        };
        self.context.watcher.on_acknowledge(&self.key, &holder, commit);
        if let Some(resolver) = self.context.resolver.upgrade() {
            if commit {
                resolver.commit_staged(holder);
            } else {
                resolver.rollback_staged(holder);
            }
        }
        self.notify.notify_one();
    }

    fn send_failed(&self, tid: &str, token: u64) {
        let now = self.context.now();
        {
            let mut state = self.state.lock();
            if state.in_flight.resolve(tid, token).is_none() {
                return;
            }
            let Some(holder) = state.holders.get_mut(tid) else {
                return;
            };
            holder.revert_attempt();
            // One step further than the attempt count so a broken session cannot spin.
            let delay = self.context.backoff.next_delay(holder.attempts + 1);
            state.schedule(tid, now + millis(delay));
        }
        self.notify.notify_one();
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

async fn run_dispatcher(
    queue: Weak<Queue>,
    notify: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
    clock: Arc<dyn Clock>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        let wake = match queue.upgrade() {
            Some(queue) => queue.dispatch_due(),
            None => break,
        };
        let delay = match wake {
            Wake::At(at) => Some(Duration::from_millis(at.saturating_sub(clock.now_millis()))),
            Wake::Idle => None,
        };
        let timer = async {
            match delay {
                Some(delay) => clock.sleep(delay).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            () = notify.notified() => {}
            () = timer => {}
        }
    }
}
