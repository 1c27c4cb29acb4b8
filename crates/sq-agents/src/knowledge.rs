//! Shared knowledge bus.
//!
//! An append-only log of [`Discovery`] records with an index by
//! `(agent, kind)`. Publishing is serialized by a mutex; readers take
//! snapshots that later publishes never mutate. When a persistence path is
//! configured, a background thread rewrites the file atomically, coalescing
//! bursts of publishes into one write.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sq_core::persist;
use sq_core::status::RECENT_FILES_LIMIT;
use sq_core::types::{discovery_kind, Discovery};
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Immutable view of the log at one point in time.
#[derive(Debug, Clone, Default)]
pub struct KnowledgeSnapshot {
    entries: Vec<Arc<Discovery>>,
}

impl KnowledgeSnapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Discovery> {
        self.entries.iter().map(|d| d.as_ref())
    }
}

/// On-disk layout of the knowledge file.
#[derive(Debug, Serialize, Deserialize)]
pub struct KnowledgeFile {
    pub updated_at: DateTime<Utc>,
    pub count: usize,
    pub discoveries: Vec<Discovery>,
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Inner {
    log: Vec<Arc<Discovery>>,
    index: HashMap<(String, String), Vec<usize>>,
}

enum FlushMsg {
    Dirty,
    Sync(flume::Sender<()>),
    Shutdown,
}

struct Flusher {
    tx: flume::Sender<FlushMsg>,
    handle: Option<JoinHandle<()>>,
}

pub struct KnowledgeBus {
    inner: Arc<Mutex<Inner>>,
    flusher: Option<Flusher>,
}

impl Default for KnowledgeBus {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl KnowledgeBus {
    /// A bus that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            flusher: None,
        }
    }

    /// A bus persisted to `path`.
    pub fn persistent(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let inner = Arc::new(Mutex::new(Inner::default()));
        let (tx, rx) = flume::unbounded();
        let worker_inner = Arc::clone(&inner);
        let handle = std::thread::Builder::new()
            .name("knowledge-flush".into())
            .spawn(move || flush_loop(&path, &worker_inner, rx));
        let flusher = match handle {
            Ok(handle) => Some(Flusher {
                tx,
                handle: Some(handle),
            }),
            Err(e) => {
                warn!(error = %e, "could not start knowledge flusher; bus is memory-only");
                None
            }
        };
        Self { inner, flusher }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a discovery and return its sequence number.
    pub fn publish(&self, discovery: Discovery) -> usize {
        let seq = {
            let mut inner = self.lock();
            let seq = inner.log.len();
            inner
                .index
                .entry((discovery.agent.clone(), discovery.kind.clone()))
                .or_default()
                .push(seq);
            debug!(seq, agent = %discovery.agent, kind = %discovery.kind, "discovery published");
            inner.log.push(Arc::new(discovery));
            seq
        };
        if let Some(flusher) = &self.flusher {
            let _ = flusher.tx.send(FlushMsg::Dirty);
        }
        seq
    }

    pub fn len(&self) -> usize {
        self.lock().log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> KnowledgeSnapshot {
        KnowledgeSnapshot {
            entries: self.lock().log.clone(),
        }
    }

    /// Most recent discoveries from agents other than `excluding`, newest
    /// first.
    pub fn digest_for(&self, excluding: &str, max_items: usize) -> Vec<Discovery> {
        let inner = self.lock();
        inner
            .log
            .iter()
            .rev()
            .filter(|d| d.agent != excluding)
            .take(max_items)
            .map(|d| d.as_ref().clone())
            .collect()
    }

    /// Discoveries published by `agent` with `kind`, in publish order.
    pub fn by_agent_kind(&self, agent: &str, kind: &str) -> Vec<Discovery> {
        let inner = self.lock();
        inner
            .index
            .get(&(agent.to_string(), kind.to_string()))
            .map(|seqs| seqs.iter().map(|&i| inner.log[i].as_ref().clone()).collect())
            .unwrap_or_default()
    }

    /// Distinct paths from `file_modified` discoveries, in first-seen order.
    pub fn files_modified(&self) -> Vec<String> {
        let inner = self.lock();
        let mut files: Vec<String> = Vec::new();
        for d in inner.log.iter().filter(|d| d.kind == discovery_kind::FILE_MODIFIED) {
            if let Some(path) = file_path_of(&d.payload) {
                if !files.iter().any(|f| f == path) {
                    files.push(path.to_string());
                }
            }
        }
        files
    }

    /// The last few modified files, newest last.
    pub fn recent_files(&self) -> Vec<String> {
        let files = self.files_modified();
        let skip = files.len().saturating_sub(RECENT_FILES_LIMIT);
        files.into_iter().skip(skip).collect()
    }

    /// Block until everything published so far is on disk.
    pub fn flush(&self) {
        if let Some(flusher) = &self.flusher {
            let (ack_tx, ack_rx) = flume::bounded(1);
            if flusher.tx.send(FlushMsg::Sync(ack_tx)).is_ok() {
                let _ = ack_rx.recv();
            }
        }
    }

    /// Async variant of [`KnowledgeBus::flush`].
    pub async fn flush_async(&self) {
        if let Some(flusher) = &self.flusher {
            let (ack_tx, ack_rx) = flume::bounded(1);
            if flusher.tx.send(FlushMsg::Sync(ack_tx)).is_ok() {
                let _ = ack_rx.recv_async().await;
            }
        }
    }
}

impl Drop for KnowledgeBus {
    fn drop(&mut self) {
        if let Some(flusher) = self.flusher.as_mut() {
            let _ = flusher.tx.send(FlushMsg::Shutdown);
            if let Some(handle) = flusher.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

fn file_path_of(payload: &serde_json::Value) -> Option<&str> {
    match payload {
        serde_json::Value::String(s) => Some(s.as_str()),
        serde_json::Value::Object(map) => map
            .get("path")
            .or_else(|| map.get("file"))
            .and_then(|v| v.as_str()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Background flusher
// ---------------------------------------------------------------------------

fn flush_loop(path: &Path, inner: &Mutex<Inner>, rx: flume::Receiver<FlushMsg>) {
    while let Ok(msg) = rx.recv() {
        let mut acks = Vec::new();
        let mut shutdown = false;
        for msg in std::iter::once(msg).chain(rx.try_iter()) {
            match msg {
                FlushMsg::Dirty => {}
                FlushMsg::Sync(ack) => acks.push(ack),
                FlushMsg::Shutdown => shutdown = true,
            }
        }
        write_file(path, inner);
        for ack in acks {
            let _ = ack.send(());
        }
        if shutdown {
            break;
        }
    }
}

fn write_file(path: &Path, inner: &Mutex<Inner>) {
    let discoveries: Vec<Discovery> = {
        let inner = inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.log.iter().map(|d| d.as_ref().clone()).collect()
    };
    let file = KnowledgeFile {
        updated_at: Utc::now(),
        count: discoveries.len(),
        discoveries,
    };
    let body = match serde_json::to_vec_pretty(&file) {
        Ok(body) => body,
        Err(e) => {
            warn!(error = %e, "failed to serialize knowledge file");
            return;
        }
    };
    if let Err(e) = persist::write_atomic_blocking(path, &body) {
        warn!(path = %path.display(), error = %e, "failed to write knowledge file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sequence_numbers_are_dense() {
        let bus = KnowledgeBus::in_memory();
        assert_eq!(bus.publish(Discovery::new("a", "note", json!(1))), 0);
        assert_eq!(bus.publish(Discovery::new("b", "note", json!(2))), 1);
        assert_eq!(bus.len(), 2);
    }

    #[test]
    fn snapshot_is_not_affected_by_later_publishes() {
        let bus = KnowledgeBus::in_memory();
        bus.publish(Discovery::new("a", "note", json!("x")));
        let snap = bus.snapshot();
        bus.publish(Discovery::new("a", "note", json!("y")));
        assert_eq!(snap.len(), 1);
        assert_eq!(bus.snapshot().len(), 2);
    }

    #[test]
    fn digest_excludes_self_and_is_newest_first() {
        let bus = KnowledgeBus::in_memory();
        bus.publish(Discovery::new("qa", "note", json!(1)));
        bus.publish(Discovery::new("architect", "note", json!(2)));
        bus.publish(Discovery::new("devops", "note", json!(3)));
        bus.publish(Discovery::new("qa", "note", json!(4)));
        let digest = bus.digest_for("qa", 5);
        let payloads: Vec<_> = digest.iter().map(|d| d.payload.clone()).collect();
        assert_eq!(payloads, vec![json!(3), json!(2)]);
        assert_eq!(bus.digest_for("qa", 1).len(), 1);
    }

    #[test]
    fn index_by_agent_and_kind() {
        let bus = KnowledgeBus::in_memory();
        bus.publish(Discovery::new("qa", "decision", json!("a")));
        bus.publish(Discovery::new("qa", "note", json!("b")));
        bus.publish(Discovery::new("qa", "decision", json!("c")));
        let found = bus.by_agent_kind("qa", "decision");
        assert_eq!(found.len(), 2);
        assert_eq!(found[1].payload, json!("c"));
        assert!(bus.by_agent_kind("devops", "decision").is_empty());
    }

    #[test]
    fn files_modified_are_distinct() {
        let bus = KnowledgeBus::in_memory();
        bus.publish(Discovery::new("a", "file_modified", json!({"path": "src/a.rs"})));
        bus.publish(Discovery::new("b", "file_modified", json!("src/b.rs")));
        bus.publish(Discovery::new("c", "file_modified", json!({"path": "src/a.rs"})));
        assert_eq!(bus.files_modified(), vec!["src/a.rs", "src/b.rs"]);
    }

    #[test]
    fn concurrent_publishers_lose_nothing() {
        let bus = Arc::new(KnowledgeBus::in_memory());
        let handles: Vec<_> = (0..8)
            .map(|n| {
                let bus = Arc::clone(&bus);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        bus.publish(Discovery::new(format!("agent{n}"), "note", json!(i)));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(bus.len(), 800);
        assert_eq!(bus.by_agent_kind("agent3", "note").len(), 100);
    }

    #[test]
    fn persistent_bus_writes_file_on_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("knowledge.json");
        let bus = KnowledgeBus::persistent(&path);
        bus.publish(Discovery::new("qa", "decision", json!({"use": "sqlite"})));
        bus.flush();
        let file: KnowledgeFile =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(file.count, 1);
        assert_eq!(file.discoveries[0].agent, "qa");
    }
}
