//! Aggregator ("broker") mode.
//!
//! - `forwarding` - Producer publish forwarding across backend links

pub mod forwarding;

pub use forwarding::{ClusterForwarder, ForwardError, ForwardReceipt, InboundForward};

use anyhow::bail;
use serde::Deserialize;
use std::str::FromStr;

/// How the broker relates to other brokers.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BrokerMode {
    /// Serves producers and consumers on its own.
    #[default]
    Standalone,
    /// Serves its consumers locally and forwards producer publishes to backends.
    Aggregator,
}

impl BrokerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrokerMode::Standalone => "standalone",
            BrokerMode::Aggregator => "aggregator",
        }
    }
}

impl FromStr for BrokerMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "standalone" => Ok(Self::Standalone),
            "aggregator" | "broker" => Ok(Self::Aggregator),
            other => bail!("invalid broker.mode {}", other),
        }
    }
}
