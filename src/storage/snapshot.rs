//! Best-effort JSON snapshots of subscriptions and pending messages.
//!
//! Layout under the snapshot directory:
//!
//! ```text
//! subscriptions.json              topic -> ["topic#group", ...]
//! queues/<topic>/<group>.json     { "queue": "topic#group", "messages": [...] }
//! ```
//!
//! Path components are percent-encoded; the queue key inside each file is
//! authoritative. Files are written to a temporary name and renamed.

use crate::broker::Broker;
use crate::messaging::holder::MessageHolder;
use crate::messaging::protocol::Message;
use crate::messaging::queue::QueueKey;
use crate::messaging::watcher::Watcher;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

const SUBSCRIPTIONS_FILE: &str = "subscriptions.json";
const QUEUES_DIR: &str = "queues";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueueFile {
    queue: QueueKey,
    #[serde(default)]
    messages: Vec<Message>,
}

/// Everything read back from a snapshot directory.
#[derive(Debug, Default, Clone)]
pub struct SnapshotData {
    pub subscriptions: BTreeMap<String, Vec<QueueKey>>,
    pub queues: BTreeMap<QueueKey, Vec<Message>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueReport {
    pub queue: String,
    pub messages: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotReport {
    pub dir: PathBuf,
    pub topics: usize,
    pub subscriptions: BTreeMap<String, Vec<QueueKey>>,
    pub queues: Vec<QueueReport>,
    pub total_messages: usize,
}

impl SnapshotReport {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "dir": self.dir,
            "topics": self.topics,
            "subscriptions": self.subscriptions,
            "queues": self.queues,
            "total_messages": self.total_messages,
        })
    }
}

/// Summarises a snapshot directory without touching a broker.
pub fn inspect(dir: &Path) -> Result<SnapshotReport> {
    let data = load(dir)?;
    let queues: Vec<QueueReport> = data
        .queues
        .iter()
        .map(|(key, messages)| QueueReport {
            queue: key.to_string(),
            messages: messages.len(),
        })
        .collect();
    Ok(SnapshotReport {
        dir: dir.to_path_buf(),
        topics: data.subscriptions.len(),
        total_messages: queues.iter().map(|q| q.messages).sum(),
        subscriptions: data.subscriptions,
        queues,
    })
}

/// Reads a snapshot directory. A missing directory is an empty snapshot;
/// unreadable queue files are skipped with a warning.
pub fn load(dir: &Path) -> Result<SnapshotData> {
    let mut data = SnapshotData::default();
    let subs_path = dir.join(SUBSCRIPTIONS_FILE);
    if subs_path.exists() {
        let bytes = fs::read(&subs_path)
            .with_context(|| format!("read {}", subs_path.display()))?;
        data.subscriptions = serde_json::from_slice(&bytes)
            .with_context(|| format!("decode {}", subs_path.display()))?;
    }
    for path in queue_files(&dir.join(QUEUES_DIR))? {
        match read_queue_file(&path) {
            Ok(file) => {
                data.queues.insert(file.queue, file.messages);
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), "skipping unreadable queue snapshot: {err:?}");
            }
        }
    }
    Ok(data)
}

fn read_queue_file(path: &Path) -> Result<QueueFile> {
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("decode {}", path.display()))
}

fn queue_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    if !root.exists() {
        return Ok(files);
    }
    for topic_dir in fs::read_dir(root).with_context(|| format!("list {}", root.display()))? {
        let topic_dir = topic_dir?.path();
        if !topic_dir.is_dir() {
            continue;
        }
        for entry in fs::read_dir(&topic_dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Percent-encodes everything outside `[A-Za-z0-9._-]`.
fn encode_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_' | b'-' => out.push(byte as char),
            b'.' if raw != "." && raw != ".." => out.push('.'),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn write_atomic(path: &Path, value: &impl Serialize) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let tmp = path.with_extension("json.tmp");
    let bytes = serde_json::to_vec_pretty(value)?;
    fs::write(&tmp, bytes).with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("rename {}", path.display()))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Watcher
// ---------------------------------------------------------------------------

pub struct SnapshotWatcher {
    dir: PathBuf,
    changes: AtomicU64,
    /// Messages read in `on_start_before`, reinjected in `on_start_after`.
    recovered: Mutex<BTreeMap<QueueKey, Vec<Message>>>,
}

impl SnapshotWatcher {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            changes: AtomicU64::new(0),
            recovered: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Changes observed since the last save.
    pub fn changes(&self) -> u64 {
        self.changes.load(Ordering::Relaxed)
    }

    fn touch(&self) {
        self.changes.fetch_add(1, Ordering::Relaxed);
    }

    fn queue_path(&self, key: &QueueKey) -> PathBuf {
        self.dir
            .join(QUEUES_DIR)
            .join(encode_component(key.topic()))
            .join(format!("{}.json", encode_component(key.consumer_group())))
    }

    /// Writes the broker's subscriptions and pending messages, removing
    /// files of queues that no longer exist. Returns the messages written.
    pub fn save(&self, broker: &Broker) -> Result<usize> {
        let observed = self.changes();
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create snapshot dir {}", self.dir.display()))?;
        let registry = broker.registry();
        write_atomic(&self.dir.join(SUBSCRIPTIONS_FILE), &registry.subscription_map())?;

        let mut written = HashSet::new();
        let mut total = 0;
        for queue in registry.queues() {
            let file = QueueFile {
                queue: queue.key().clone(),
                messages: queue.snapshot_messages(),
            };
            total += file.messages.len();
            let path = self.queue_path(&file.queue);
            write_atomic(&path, &file)?;
            written.insert(path);
        }
        for path in queue_files(&self.dir.join(QUEUES_DIR))? {
            if !written.contains(&path) {
                fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
                if let Some(parent) = path.parent() {
                    // Only succeeds once the topic directory is empty.
                    let _ = fs::remove_dir(parent);
                }
            }
        }
        self.changes.fetch_sub(observed, Ordering::Relaxed);
        tracing::debug!(dir = %self.dir.display(), queues = written.len(), messages = total, "snapshot saved");
        Ok(total)
    }

    fn save_logged(&self, broker: &Broker) {
        if let Err(err) = self.save(broker) {
            tracing::warn!(dir = %self.dir.display(), "snapshot save failed: {err:?}");
        }
    }
}

impl Watcher for SnapshotWatcher {
    fn on_start_before(&self, broker: &Broker) {
        let data = match load(&self.dir) {
            Ok(data) => data,
            Err(err) => {
                tracing::warn!(dir = %self.dir.display(), "snapshot restore failed: {err:?}");
                return;
            }
        };
        let registry = broker.registry();
        for key in data.subscriptions.values().flatten() {
            registry.subscribe(key, None);
        }
        tracing::info!(
            dir = %self.dir.display(),
            topics = data.subscriptions.len(),
            queues = data.queues.len(),
            "subscriptions restored"
        );
        *self.recovered.lock() = data.queues;
    }

    fn on_start_after(&self, broker: &Broker) {
        let recovered = std::mem::take(&mut *self.recovered.lock());
        let mut restored = 0;
        for (key, messages) in recovered {
            // Queues with pending messages come back even if unindexed.
            broker.registry().subscribe(&key, None);
            for message in messages {
                match broker.route_direct(&key, &message) {
                    Ok(true) => restored += 1,
                    Ok(false) => {}
                    Err(err) => {
                        tracing::warn!(queue = %key, "dropping unrecoverable message: {err}");
                    }
                }
            }
        }
        tracing::info!(dir = %self.dir.display(), restored, "pending messages restored");
    }

    fn on_save(&self, broker: &Broker) {
        self.save_logged(broker);
    }

    fn on_stop_after(&self, broker: &Broker) {
        self.save_logged(broker);
    }

    fn on_subscribe(&self, _topic: &str, _consumer_group: &str, _session: Option<&str>) {
        self.touch();
    }

    fn on_unsubscribe(&self, _topic: &str, _consumer_group: &str, _session: &str) {
        self.touch();
    }

    fn on_publish(&self, _message: &Message) {
        self.touch();
    }

    fn on_unpublish(&self, _message: &Message) {
        self.touch();
    }

    fn on_acknowledge(&self, _queue: &QueueKey, _holder: &MessageHolder, _accepted: bool) {
        self.touch();
    }
}
