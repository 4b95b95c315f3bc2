#![warn(unused, dead_code)]
#![deny(clippy::all, clippy::pedantic)]
// Module naming: common pattern in domain-driven code
#![allow(clippy::module_name_repetitions)]
// Function complexity: some functions are inherently complex
#![allow(clippy::too_many_lines)]
#![allow(clippy::too_many_arguments)]
// Documentation style: many terms don't need backticks
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
// API ergonomics: prefer simplicity over must_use annotations
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
// Format strings: allow non-inlined for readability
#![allow(clippy::uninlined_format_args)]
// Struct field patterns
#![allow(clippy::struct_excessive_bools)]
// Numeric casts: intentional in millisecond arithmetic
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
// Control flow style
#![allow(clippy::if_not_else)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::single_match_else)]
#![allow(clippy::manual_let_else)]
// Passing style
#![allow(clippy::needless_pass_by_value)]
// Option/Result patterns
#![allow(clippy::option_if_let_else)]
#![allow(clippy::map_unwrap_or)]
// Explicit type bounds
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::implicit_hasher)]

//! FerryMQ - topic / consumer-group message broker core.
//!
//! # Module Organization
//!
//! ## Core
//! - `core::config` - Configuration parsing and validation
//! - `core::runtime` - Runtime orchestration (broker, snapshots, shutdown)
//! - `core::time` - Clock abstraction
//!
//! ## Messaging
//! - `messaging::protocol` - Wire events, metadata keys and the message envelope
//! - `messaging::holder` - Per-queue message holder and its lifecycle state
//! - `messaging::backoff` - Redelivery backoff policy
//! - `messaging::acks` - In-flight attempt tracking
//! - `messaging::ordering` - Per-partition head-of-line admission
//! - `messaging::queue` - Per (topic, consumer group) queue and dispatcher
//! - `messaging::registry` - Subscription index and queue registry
//! - `messaging::routing` - Publish fan-out, direct routing and cancellation
//! - `messaging::transactions` - Transactional staging and release
//! - `messaging::session` - Session abstraction owned by the transport
//! - `messaging::watcher` - Lifecycle hooks for persistence and metrics
//!
//! ## Broker
//! - `broker` - Broker facade, inbound event handling and admin force operations
//!
//! ## Cluster
//! - `cluster::forwarding` - Aggregator mode publish forwarding across backend links
//!
//! ## Storage
//! - `storage::snapshot` - Best-effort JSON snapshot watcher
//!
//! ## Operations
//! - `ops::telemetry` - Tracing initialisation

// Core infrastructure
pub mod core;

// Delivery engine
pub mod messaging;

// Broker facade
pub mod broker;

// Aggregator mode
pub mod cluster;

// Persistence
pub mod storage;

// Operations
pub mod ops;

// CLI
pub mod cli;

pub use self::core::{config, runtime, time};
pub use broker::{Broker, BrokerBuilder, BrokerError};
pub use messaging::{
    backoff, holder, protocol, queue, registry, routing, session, transactions, watcher,
};
pub use ops::telemetry;
