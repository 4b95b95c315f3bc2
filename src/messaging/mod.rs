//! Delivery engine.
//!
//! Leaves first:
//! - `protocol` - Events, metadata keys and the message envelope
//! - `session` - Transport-owned session abstraction and selectors
//! - `holder` - One message instance inside one queue
//! - `backoff` - Redelivery delay schedule
//! - `acks` - In-flight attempt tracking
//! - `ordering` - Per-partition head-of-line gate
//! - `queue` - Per (topic, consumer group) queue and dispatcher
//! - `registry` - Subscription index and queue map
//! - `routing` - Fan-out, direct routing, staging and cancellation
//! - `transactions` - Transactional staging bookkeeping
//! - `watcher` - Lifecycle hooks

pub mod acks;
pub mod backoff;
pub mod holder;
pub mod ordering;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod routing;
pub mod session;
pub mod transactions;
pub mod watcher;

pub use acks::{AckOutcome, InFlightTracker};
pub use backoff::BackoffPolicy;
pub use holder::{HolderState, MessageHolder};
pub use protocol::{Event, Message, MessageMeta, ProtocolError, Qos};
pub use queue::{DispatchContext, Queue, QueueKey, QueueView};
pub use registry::SubscriptionRegistry;
pub use session::{RandomSelector, ReplyHandler, Session, SessionError, SessionRef, SessionSelector};
pub use transactions::{TransactionCoordinator, TransactionError};
pub use watcher::{NoopWatcher, Watcher, WatcherChain};
