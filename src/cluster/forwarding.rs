//! Publish forwarding across backend links.
//!
//! A backend link is a session to another broker. Every forwarded publish is
//! stamped with `fwd = origin:boot:seq`, where `boot` is fresh for each
//! process so a restarted origin never collides with its earlier stamps. A
//! stamped message is never forwarded again, and a receiver drops a stamp it
//! has already seen.

use crate::messaging::protocol::{meta, Event, Message, ProtocolError};
use crate::messaging::session::{SessionError, SessionRef};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Sequence numbers remembered per origin boot.
const SEEN_WINDOW: usize = 4096;
/// Boots remembered per origin; the oldest is forgotten first.
const BOOTS_PER_ORIGIN: usize = 2;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ForwardError {
    #[error("no live backend link")]
    NoLiveBackend,
    #[error("all {attempted} backend links failed; last error: {last}")]
    AllFailed { attempted: usize, last: SessionError },
}

/// Where a forwarded publish went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardReceipt {
    pub link: String,
    pub seq: u64,
}

/// Classification of an inbound publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundForward {
    /// Published by a producer attached to this broker.
    Local,
    /// First sighting of a forwarded publish.
    Fresh { origin: String, seq: u64 },
    /// Already applied.
    Duplicate,
}

/// Recently seen sequence numbers of one origin process.
#[derive(Debug)]
struct SeenWindow {
    boot: String,
    seqs: BTreeSet<u64>,
}

impl SeenWindow {
    fn new(boot: &str) -> Self {
        Self {
            boot: boot.to_string(),
            seqs: BTreeSet::new(),
        }
    }

    /// Records `seq`; false when it was already recorded. Arrival order does
    /// not matter. Once the window is full the lowest entry is evicted, so a
    /// very late straggler counts as fresh and may be applied twice.
    fn record(&mut self, seq: u64) -> bool {
        if !self.seqs.insert(seq) {
            return false;
        }
        if self.seqs.len() > SEEN_WINDOW {
            self.seqs.pop_first();
        }
        true
    }
}

pub struct ClusterForwarder {
    origin: String,
    boot: String,
    links: RwLock<Vec<SessionRef>>,
    next_seq: AtomicU64,
    seen: Mutex<HashMap<String, VecDeque<SeenWindow>>>,
}

impl ClusterForwarder {
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            boot: uuid::Uuid::new_v4().simple().to_string(),
            links: RwLock::new(Vec::new()),
            next_seq: AtomicU64::new(0),
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Per-process component of every stamp this forwarder issues.
    pub fn boot(&self) -> &str {
        &self.boot
    }

    /// Attaches a backend link; a link with the same id replaces the old one.
    pub fn add_link(&self, link: SessionRef) {
        let mut links = self.links.write();
        links.retain(|l| l.session_id() != link.session_id());
        links.push(link);
    }

    pub fn remove_link(&self, link_id: &str) -> bool {
        let mut links = self.links.write();
        let before = links.len();
        links.retain(|l| l.session_id() != link_id);
        links.len() != before
    }

    pub fn live_links(&self) -> usize {
        self.links.read().iter().filter(|l| l.is_valid()).count()
    }

    /// Sends `message` to one live backend, starting from a random link and
    /// failing over to the others. Already-forwarded messages are skipped.
    pub fn forward(&self, message: &Message) -> Result<Option<ForwardReceipt>, ForwardError> {
        if message.meta(meta::FORWARDED).is_some() {
            return Ok(None);
        }
        let live: Vec<SessionRef> = self
            .links
            .read()
            .iter()
            .filter(|l| l.is_valid())
            .cloned()
            .collect();
        if live.is_empty() {
            return Err(ForwardError::NoLiveBackend);
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let stamped = message.clone().with_meta(
            meta::FORWARDED,
            format!("{}:{}:{}", self.origin, self.boot, seq),
        );
        let start = rand::thread_rng().gen_range(0..live.len());
        let mut last = None;
        for offset in 0..live.len() {
            let link = &live[(start + offset) % live.len()];
            match link.send(Event::Publish, stamped.clone()) {
                Ok(()) => {
                    return Ok(Some(ForwardReceipt {
                        link: link.session_id().to_string(),
                        seq,
                    }))
                }
                Err(err) => {
                    tracing::warn!(link = %link.session_id(), "forward failed: {err:?}");
                    last = Some(err);
                }
            }
        }
        Err(ForwardError::AllFailed {
            attempted: live.len(),
            last: last.unwrap_or_else(|| SessionError::Send("no attempt made".into())),
        })
    }

    /// Duplicate suppression for publishes arriving from other brokers.
    pub fn accept_inbound(&self, message: &Message) -> Result<InboundForward, ProtocolError> {
        let Some(stamp) = message.meta(meta::FORWARDED) else {
            return Ok(InboundForward::Local);
        };
        let invalid = || ProtocolError::InvalidMeta {
            key: meta::FORWARDED,
            value: stamp.to_string(),
        };
        let (rest, seq) = stamp.rsplit_once(':').ok_or_else(invalid)?;
        let (origin, boot) = rest.rsplit_once(':').ok_or_else(invalid)?;
        if origin.is_empty() || boot.is_empty() {
            return Err(invalid());
        }
        let seq: u64 = seq.parse().map_err(|_| invalid())?;

        let mut seen = self.seen.lock();
        let boots = seen.entry(origin.to_string()).or_default();
        let idx = match boots.iter().position(|w| w.boot == boot) {
            Some(idx) => idx,
            None => {
                tracing::debug!(origin = %origin, boot = %boot, "new forwarding origin boot");
                boots.push_back(SeenWindow::new(boot));
                if boots.len() > BOOTS_PER_ORIGIN {
                    boots.pop_front();
                }
                boots.len() - 1
            }
        };
        if !boots[idx].record(seq) {
            return Ok(InboundForward::Duplicate);
        }
        Ok(InboundForward::Fresh {
            origin: origin.to_string(),
            seq,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::session::{ReplyHandler, Session};
    use std::sync::Arc;

    struct Link {
        id: &'static str,
        fail: bool,
        sent: Mutex<Vec<Message>>,
    }

    impl Link {
        fn new(id: &'static str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                id,
                fail,
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    impl Session for Link {
        fn session_id(&self) -> &str {
            self.id
        }

        fn send(&self, _event: Event, message: Message) -> Result<(), SessionError> {
            if self.fail {
                return Err(SessionError::Closed(self.id.into()));
            }
            self.sent.lock().push(message);
            Ok(())
        }

        fn send_and_subscribe(
            &self,
            event: Event,
            message: Message,
            _on_reply: ReplyHandler,
        ) -> Result<(), SessionError> {
            self.send(event, message)
        }
    }

    #[test]
    fn fails_over_to_a_working_link() {
        let fwd = ClusterForwarder::new("edge-1");
        let bad = Link::new("bad", true);
        let good = Link::new("good", false);
        fwd.add_link(bad);
        fwd.add_link(good.clone());
        for _ in 0..4 {
            let receipt = fwd.forward(&Message::publish("t", "x")).unwrap().unwrap();
            assert_eq!(receipt.link, "good");
        }
        let sent = good.sent.lock();
        assert_eq!(sent.len(), 4);
        assert_eq!(
            sent[3].meta(meta::FORWARDED),
            Some(format!("edge-1:{}:4", fwd.boot()).as_str())
        );
    }

    #[test]
    fn forwarded_messages_are_not_forwarded_again() {
        let fwd = ClusterForwarder::new("edge-1");
        fwd.add_link(Link::new("good", false));
        let stamped = Message::publish("t", "x").with_meta(meta::FORWARDED, "edge-0:b0:1");
        assert_eq!(fwd.forward(&stamped).unwrap(), None);
    }

    #[test]
    fn no_links_is_an_error() {
        let fwd = ClusterForwarder::new("edge-1");
        assert_eq!(
            fwd.forward(&Message::publish("t", "x")),
            Err(ForwardError::NoLiveBackend)
        );
        fwd.add_link(Link::new("bad", true));
        assert!(matches!(
            fwd.forward(&Message::publish("t", "x")),
            Err(ForwardError::AllFailed { attempted: 1, .. })
        ));
    }

    fn stamp(origin_boot: &str, seq: u64) -> Message {
        Message::publish("t", "x").with_meta(meta::FORWARDED, format!("{origin_boot}:{seq}"))
    }

    #[test]
    fn inbound_duplicates_are_detected() {
        let fwd = ClusterForwarder::new("backend");
        let local = Message::publish("t", "x");
        assert_eq!(fwd.accept_inbound(&local).unwrap(), InboundForward::Local);
        let first = stamp("edge-1:b1", 2);
        assert!(matches!(
            fwd.accept_inbound(&first).unwrap(),
            InboundForward::Fresh { seq: 2, .. }
        ));
        assert_eq!(fwd.accept_inbound(&first).unwrap(), InboundForward::Duplicate);
        for bogus in ["nonsense", "edge-1:7", ":b1:7", "edge-1:b1:x"] {
            let msg = local.clone().with_meta(meta::FORWARDED, bogus);
            assert!(fwd.accept_inbound(&msg).is_err(), "{bogus}");
        }
    }

    #[test]
    fn out_of_order_arrivals_are_all_fresh() {
        let fwd = ClusterForwarder::new("backend");
        for seq in [6, 5, 8, 7] {
            assert!(matches!(
                fwd.accept_inbound(&stamp("edge-1:b1", seq)).unwrap(),
                InboundForward::Fresh { .. }
            ));
        }
        assert_eq!(
            fwd.accept_inbound(&stamp("edge-1:b1", 5)).unwrap(),
            InboundForward::Duplicate
        );
    }

    #[test]
    fn restarted_origin_starts_a_new_window() {
        let fwd = ClusterForwarder::new("backend");
        for seq in 1..=3 {
            fwd.accept_inbound(&stamp("edge-1:b1", seq)).unwrap();
        }
        assert!(matches!(
            fwd.accept_inbound(&stamp("edge-1:b2", 1)).unwrap(),
            InboundForward::Fresh { seq: 1, .. }
        ));
        // Stragglers of the previous boot are still recognised.
        assert_eq!(
            fwd.accept_inbound(&stamp("edge-1:b1", 3)).unwrap(),
            InboundForward::Duplicate
        );
        // A third boot pushes out the first.
        fwd.accept_inbound(&stamp("edge-1:b3", 1)).unwrap();
        assert!(matches!(
            fwd.accept_inbound(&stamp("edge-1:b1", 3)).unwrap(),
            InboundForward::Fresh { .. }
        ));
    }

    #[test]
    fn each_process_stamps_with_its_own_boot() {
        let a = ClusterForwarder::new("edge-1");
        let b = ClusterForwarder::new("edge-1");
        assert_ne!(a.boot(), b.boot());
    }

    #[test]
    fn seen_window_is_bounded() {
        let mut window = SeenWindow::new("b1");
        for seq in 1..=(SEEN_WINDOW as u64 + 1) {
            assert!(window.record(seq));
        }
        assert_eq!(window.seqs.len(), SEEN_WINDOW);
        assert!(!window.record(SEEN_WINDOW as u64));
        // Evicted entries are treated as new.
        assert!(window.record(1));
    }
}
