use crate::cluster::BrokerMode;
use crate::messaging::backoff::{BackoffPolicy, DEFAULT_BACKOFF_STEPS_SECS};
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Top-level configuration for the FerryMQ runtime.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub mode: BrokerMode,
    /// Identity stamped on forwarded publishes; random when unset.
    #[serde(default)]
    pub node_id: Option<String>,
    /// Backend brokers an aggregator forwards publishes to. The transport
    /// dials these and attaches the resulting links.
    #[serde(default)]
    pub backends: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "default_max_in_flight_ms")]
    pub max_in_flight_ms: u64,
    /// Redelivery delay per attempt, in milliseconds.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: Vec<u64>,
    #[serde(default = "default_checkback_grace_ms")]
    pub checkback_grace_ms: u64,
}

impl DeliveryConfig {
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::from_millis(&self.backoff_ms, self.max_in_flight_ms)
    }

    pub fn checkback_grace(&self) -> Duration {
        Duration::from_millis(self.checkback_grace_ms)
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_in_flight_ms: default_max_in_flight_ms(),
            backoff_ms: default_backoff_ms(),
            checkback_grace_ms: default_checkback_grace_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_snapshot_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_save_interval_secs")]
    pub save_interval_secs: u64,
    /// Changes required before a periodic save writes anything.
    #[serde(default = "default_save_threshold")]
    pub save_threshold: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: default_snapshot_dir(),
            save_interval_secs: default_save_interval_secs(),
            save_threshold: default_save_threshold(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelemetryConfig {
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration from a path resolved via FERRYMQ_CONFIG or defaults to `config/ferrymq.toml`.
    /// Applies FERRYMQ_MODE and FERRYMQ_LOG_LEVEL after parsing.
    pub fn load_from_env() -> Result<Self> {
        let path = env_config_path();
        let mut cfg = Self::load(&path)?;
        cfg.apply_env_overrides()?;
        Ok(cfg)
    }

    /// Load configuration from a specific file (TOML or JSON based on extension).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path_ref = path.as_ref();
        let data = fs::read_to_string(path_ref)
            .with_context(|| format!("unable to read config {}", path_ref.display()))?;
        if is_json(path_ref) {
            Ok(serde_json::from_str(&data)
                .with_context(|| format!("invalid JSON config {}", path_ref.display()))?)
        } else {
            Ok(toml::from_str(&data)
                .with_context(|| format!("invalid TOML config {}", path_ref.display()))?)
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.delivery.max_in_flight_ms == 0 {
            bail!("delivery.max_in_flight_ms must be > 0");
        }
        if self.delivery.backoff_ms.is_empty() {
            bail!("delivery.backoff_ms must list at least one delay");
        }
        if self.broker.mode == BrokerMode::Aggregator && self.broker.backends.is_empty() {
            bail!("broker.mode aggregator requires at least one broker.backends entry");
        }
        if self.broker.node_id.as_deref() == Some("") {
            bail!("broker.node_id must be non-empty when set");
        }
        if self.snapshot.enabled {
            if self.snapshot.save_interval_secs == 0 {
                bail!("snapshot.save_interval_secs must be > 0");
            }
            if self.snapshot.dir.as_os_str().is_empty() {
                bail!("snapshot.dir must be set when snapshots are enabled");
            }
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(mode) = std::env::var("FERRYMQ_MODE") {
            self.broker.mode = BrokerMode::from_str(&mode)?;
        }
        if let Ok(level) = std::env::var("FERRYMQ_LOG_LEVEL") {
            self.telemetry.log_level = Some(level);
        }
        Ok(())
    }
}

fn env_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("FERRYMQ_CONFIG") {
        PathBuf::from(path)
    } else {
        PathBuf::from("config/ferrymq.toml")
    }
}

fn is_json(path: &Path) -> bool {
    matches!(path.extension().and_then(|s| s.to_str()), Some("json"))
}

fn default_max_in_flight_ms() -> u64 {
    2 * 60 * 60 * 1000
}

fn default_backoff_ms() -> Vec<u64> {
    DEFAULT_BACKOFF_STEPS_SECS.iter().map(|s| s * 1000).collect()
}

fn default_checkback_grace_ms() -> u64 {
    60_000
}

fn default_snapshot_dir() -> PathBuf {
    PathBuf::from("data/snapshot")
}

fn default_save_interval_secs() -> u64 {
    30
}

fn default_save_threshold() -> u64 {
    1
}
