use crate::broker::Broker;
use crate::config::Config;
use crate::core::time::SystemClock;
use crate::storage::SnapshotWatcher;
use crate::telemetry::LogHandle;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Runtime scaffold: wires config into the broker and its watchers, drives
/// periodic snapshot saves and coordinates shutdown.
pub struct Runtime {
    config: Config,
    broker: Broker,
    snapshots: Option<Arc<SnapshotWatcher>>,
    recovery: Option<JoinHandle<()>>,
    save_task: Option<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    log_handle: Option<LogHandle>,
}

impl Runtime {
    pub fn new(config: Config, log_handle: Option<LogHandle>) -> Result<Self> {
        config.validate()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let delivery = &config.delivery;
        let mut builder = Broker::builder()
            .with_mode(config.broker.mode)
            .with_backoff(delivery.backoff_policy())
            .with_checkback_grace(delivery.checkback_grace())
            .with_clock(Arc::new(SystemClock));
        if let Some(node_id) = &config.broker.node_id {
            builder = builder.with_origin(node_id.clone());
        }
        let snapshots = config
            .snapshot
            .enabled
            .then(|| Arc::new(SnapshotWatcher::new(config.snapshot.dir.clone())));
        if let Some(watcher) = &snapshots {
            builder = builder.with_watcher(watcher.clone());
        }
        let broker = builder.build();
        Ok(Self {
            config,
            broker,
            snapshots,
            recovery: None,
            save_task: None,
            shutdown_tx,
            shutdown_rx,
            log_handle,
        })
    }

    /// Start the broker and wait for shutdown.
    pub async fn run(&mut self) -> Result<()> {
        self.start();
        self.handle_shutdown().await
    }

    /// Runs the start hooks and the snapshot save loop without blocking.
    pub fn start(&mut self) {
        tracing::info!(mode = %self.config.broker.mode.as_str(), "starting broker");
        for backend in &self.config.broker.backends {
            tracing::info!(backend = %backend, "backend link expected from transport");
        }
        self.recovery = self.broker.start();
        if let Some(watcher) = &self.snapshots {
            let snapshot = &self.config.snapshot;
            self.save_task = Some(tokio::spawn(save_loop(
                self.broker.clone(),
                watcher.clone(),
                Duration::from_secs(snapshot.save_interval_secs),
                snapshot.save_threshold,
                self.shutdown_rx.clone(),
            )));
        }
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn log_handle(&self) -> Option<LogHandle> {
        self.log_handle.clone()
    }

    /// Sender a transport or test can use to request shutdown.
    pub fn shutdown_sender(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    async fn handle_shutdown(&mut self) -> Result<()> {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("shutdown signal received");
            }
            _ = self.shutdown_rx.changed() => {
                tracing::info!("shutdown requested by component");
            }
        }
        self.shutdown().await
    }

    /// Stops background tasks, runs the stop hooks and closes every queue.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.shutdown_tx.send_replace(true);
        if let Some(handle) = self.save_task.take() {
            if let Err(err) = handle.await {
                tracing::warn!("snapshot save loop ended abnormally: {err:?}");
            }
        }
        if let Some(handle) = self.recovery.take() {
            if let Err(err) = handle.await {
                tracing::warn!("snapshot recovery failed: {err:?}");
            }
        }
        let broker = self.broker.clone();
        tokio::task::spawn_blocking(move || broker.stop())
            .await
            .context("broker stop task failed")?;
        Ok(())
    }
}

async fn save_loop(
    broker: Broker,
    watcher: Arc<SnapshotWatcher>,
    every: Duration,
    threshold: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    // First tick completes immediately.
    ticker.tick().await;
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if watcher.changes() < threshold {
                    continue;
                }
                let broker = broker.clone();
                if let Err(err) = tokio::task::spawn_blocking(move || broker.save()).await {
                    tracing::warn!("periodic snapshot failed: {err:?}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::protocol::Message;
    use tempfile::tempdir;

    fn snapshot_config(dir: &std::path::Path) -> Config {
        let doc = format!(
            r#"
[snapshot]
enabled = true
dir = "{}"
save_interval_secs = 3600
"#,
            dir.display()
        );
        toml::from_str(&doc).unwrap()
    }

    #[tokio::test]
    async fn shutdown_writes_snapshot_and_restart_recovers() {
        let dir = tempdir().unwrap();
        let mut runtime = Runtime::new(snapshot_config(dir.path()), None).unwrap();
        runtime.start();
        runtime.broker().subscribe(None, "orders", "billing").unwrap();
        runtime
            .broker()
            .publish(Message::publish("orders", "o-1").with_tid("m1"), None)
            .unwrap();
        runtime.shutdown().await.unwrap();
        assert!(dir.path().join("subscriptions.json").exists());

        let mut restarted = Runtime::new(snapshot_config(dir.path()), None).unwrap();
        restarted.start();
        if let Some(handle) = restarted.recovery.take() {
            handle.await.unwrap();
        }
        let queue = restarted
            .broker()
            .registry()
            .queue(&crate::messaging::QueueKey::new("orders", "billing"))
            .unwrap();
        assert!(queue.contains("m1"));
        restarted.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_request_ends_run() {
        let mut runtime = Runtime::new(Config::default(), None).unwrap();
        runtime.shutdown_sender().send_replace(true);
        runtime.run().await.unwrap();
        assert!(runtime.log_handle().is_none());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let cfg: Config = toml::from_str("[delivery]\nmax_in_flight_ms = 0\n").unwrap();
        assert!(Runtime::new(cfg, None).is_err());
    }
}
