//! Status snapshot and event log written for external observers.
//!
//! The snapshot is a single JSON document replaced atomically on every state
//! change, so a poller always reads a complete document. The event log is an
//! append-only JSON-lines file next to it.

use std::collections::{BTreeMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::persist;
use crate::types::{AgentRole, TaskId};

pub const DEFAULT_LOG_TAIL: usize = 200;
pub const RECENT_FILES_LIMIT: usize = 10;

// ---------------------------------------------------------------------------
// Snapshot types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Inactive,
    Active,
    Blocked,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub status: AgentStatus,
    pub current_task: Option<TaskId>,
    pub progress: u8,
    pub role: AgentRole,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotStats {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub in_progress: usize,
    pub pending: usize,
    pub files_modified: usize,
    pub recent_files: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub agent: String,
    pub message: String,
    pub level: LogLevel,
}

impl LogRecord {
    pub fn new(level: LogLevel, agent: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            agent: agent.into(),
            message: message.into(),
            level,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub instance_id: String,
    #[serde(default)]
    pub mode: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub agents: BTreeMap<String, AgentSnapshot>,
    pub stats: SnapshotStats,
    pub logs: Vec<LogRecord>,
}

/// Read a snapshot written by [`StatusWriter`].
pub fn read_snapshot(path: &Path) -> std::io::Result<StatusSnapshot> {
    let text = std::fs::read_to_string(path)?;
    serde_json::from_str(&text).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

// ---------------------------------------------------------------------------
// EventLog
// ---------------------------------------------------------------------------

/// Append-only JSON-lines log.
pub struct EventLog {
    path: PathBuf,
    file: File,
}

impl EventLog {
    pub fn open(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, record: &LogRecord) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        line.push(b'\n');
        self.file.write_all(&line)
    }
}

// ---------------------------------------------------------------------------
// StatusWriter
// ---------------------------------------------------------------------------

/// Owns the in-memory log tail and rewrites the snapshot file.
///
/// Owned by the coordinator, which is the only writer.
pub struct StatusWriter {
    path: PathBuf,
    instance_id: String,
    tail: usize,
    logs: VecDeque<LogRecord>,
    event_log: Option<EventLog>,
}

impl StatusWriter {
    pub fn new(path: impl Into<PathBuf>, instance_id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            instance_id: instance_id.into(),
            tail: DEFAULT_LOG_TAIL,
            logs: VecDeque::new(),
            event_log: None,
        }
    }

    pub fn with_tail(mut self, tail: usize) -> Self {
        self.tail = tail.max(1);
        self
    }

    pub fn with_event_log(mut self, log: EventLog) -> Self {
        self.event_log = Some(log);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record an event in the tail and the append-only log.
    pub fn log(&mut self, level: LogLevel, agent: &str, message: impl Into<String>) {
        let record = LogRecord::new(level, agent, message);
        if let Some(log) = self.event_log.as_mut() {
            if let Err(e) = log.append(&record) {
                warn!(path = %log.path().display(), error = %e, "failed to append event log");
            }
        }
        self.logs.push_back(record);
        while self.logs.len() > self.tail {
            self.logs.pop_front();
        }
    }

    pub fn logs(&self) -> impl Iterator<Item = &LogRecord> {
        self.logs.iter()
    }

    pub fn build(
        &self,
        mode: Option<&str>,
        agents: BTreeMap<String, AgentSnapshot>,
        stats: SnapshotStats,
    ) -> StatusSnapshot {
        StatusSnapshot {
            instance_id: self.instance_id.clone(),
            mode: mode.map(str::to_string),
            updated_at: Utc::now(),
            agents,
            stats,
            logs: self.logs.iter().cloned().collect(),
        }
    }

    /// Serialize and atomically replace the snapshot file.
    pub async fn write(&self, snapshot: &StatusSnapshot) -> std::io::Result<()> {
        let body = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        persist::write_atomic(&self.path, body).await
    }
}
