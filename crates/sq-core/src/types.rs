use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque task identity.
pub type TaskId = Uuid;

/// Creator id stamped on tasks produced by the engine itself.
pub const DEFAULT_CREATOR: &str = "squadron";

// ---------------------------------------------------------------------------
// TaskType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Development,
    Testing,
    Documentation,
    Infrastructure,
    Security,
    Optimization,
    Research,
    Maintenance,
}

impl TaskType {
    pub const ALL: [TaskType; 8] = [
        TaskType::Development,
        TaskType::Testing,
        TaskType::Documentation,
        TaskType::Infrastructure,
        TaskType::Security,
        TaskType::Optimization,
        TaskType::Research,
        TaskType::Maintenance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Development => "development",
            TaskType::Testing => "testing",
            TaskType::Documentation => "documentation",
            TaskType::Infrastructure => "infrastructure",
            TaskType::Security => "security",
            TaskType::Optimization => "optimization",
            TaskType::Research => "research",
            TaskType::Maintenance => "maintenance",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    /// Accepts the canonical names plus the short forms planners tend to emit
    /// (`dev`, `test`, `docs`, `infra`, `perf`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "development" | "dev" | "feature" | "frontend" | "backend" => Ok(TaskType::Development),
            "testing" | "test" | "tests" | "qa" => Ok(TaskType::Testing),
            "documentation" | "docs" | "doc" => Ok(TaskType::Documentation),
            "infrastructure" | "infra" | "devops" | "deployment" => Ok(TaskType::Infrastructure),
            "security" | "audit" => Ok(TaskType::Security),
            "optimization" | "optimisation" | "perf" | "performance" => Ok(TaskType::Optimization),
            "research" | "investigation" | "analysis" => Ok(TaskType::Research),
            "maintenance" | "refactor" | "chore" => Ok(TaskType::Maintenance),
            other => Err(format!("unknown task type: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// TaskPriority
// ---------------------------------------------------------------------------

/// Declaration order is significant: `Ord` ranks `Critical` highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Trivial,
    Low,
    Medium,
    High,
    Critical,
}

impl TaskPriority {
    /// Map the planner's 1-5 scale onto priorities.
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            1 => Some(TaskPriority::Trivial),
            2 => Some(TaskPriority::Low),
            3 => Some(TaskPriority::Medium),
            4 => Some(TaskPriority::High),
            5 => Some(TaskPriority::Critical),
            _ => None,
        }
    }

    pub fn level(&self) -> u8 {
        match self {
            TaskPriority::Trivial => 1,
            TaskPriority::Low => 2,
            TaskPriority::Medium => 3,
            TaskPriority::High => 4,
            TaskPriority::Critical => 5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Trivial => "trivial",
            TaskPriority::Low => "low",
            TaskPriority::Medium => "medium",
            TaskPriority::High => "high",
            TaskPriority::Critical => "critical",
        }
    }
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Medium
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        if let Ok(level) = s.parse::<u8>() {
            return TaskPriority::from_level(level)
                .ok_or_else(|| format!("priority level out of range: {level}"));
        }
        match s.as_str() {
            "trivial" => Ok(TaskPriority::Trivial),
            "low" => Ok(TaskPriority::Low),
            "medium" | "normal" => Ok(TaskPriority::Medium),
            "high" => Ok(TaskPriority::High),
            "critical" | "urgent" => Ok(TaskPriority::Critical),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    InProgress,
    Completed,
    Failed,
    Blocked,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Blocked | TaskStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// FailureReason
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The subprocess exceeded its deadline.
    Timeout,
    /// The subprocess exited with a non-zero code.
    NonZeroExit,
    /// The subprocess could not be started.
    SpawnFailed,
    /// The task's branch could not be merged back.
    MergeConflict,
    /// A source-control operation failed.
    Adapter,
    /// The run was cancelled while the task was executing.
    Cancelled,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureReason::Timeout => "timeout",
            FailureReason::NonZeroExit => "non_zero_exit",
            FailureReason::SpawnFailed => "spawn_failed",
            FailureReason::MergeConflict => "merge_conflict",
            FailureReason::Adapter => "adapter",
            FailureReason::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

// ---------------------------------------------------------------------------
// AgentRole
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Architect,
    Devops,
    Qa,
    Frontend,
    Research,
}

impl AgentRole {
    /// Roster order. Routing ties that survive the load check fall back to it.
    pub const ALL: [AgentRole; 5] = [
        AgentRole::Architect,
        AgentRole::Devops,
        AgentRole::Qa,
        AgentRole::Frontend,
        AgentRole::Research,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Architect => "architect",
            AgentRole::Devops => "devops",
            AgentRole::Qa => "qa",
            AgentRole::Frontend => "frontend",
            AgentRole::Research => "research",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "architect" | "backend" => Ok(AgentRole::Architect),
            "devops" | "infra" | "infrastructure" => Ok(AgentRole::Devops),
            "qa" | "testing" | "tester" => Ok(AgentRole::Qa),
            "frontend" | "ui" => Ok(AgentRole::Frontend),
            "research" | "researcher" | "docs" => Ok(AgentRole::Research),
            other => Err(format!("unknown agent role: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionModeKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionModeKind {
    Safe,
    Fast,
    Parallel,
    Redundant,
    Auto,
}

impl ExecutionModeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionModeKind::Safe => "safe",
            ExecutionModeKind::Fast => "fast",
            ExecutionModeKind::Parallel => "parallel",
            ExecutionModeKind::Redundant => "redundant",
            ExecutionModeKind::Auto => "auto",
        }
    }
}

impl fmt::Display for ExecutionModeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionModeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "safe" => Ok(ExecutionModeKind::Safe),
            "fast" => Ok(ExecutionModeKind::Fast),
            "parallel" => Ok(ExecutionModeKind::Parallel),
            "redundant" => Ok(ExecutionModeKind::Redundant),
            "auto" => Ok(ExecutionModeKind::Auto),
            other => Err(format!("unknown execution mode: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// ParallelPolicy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelPolicy {
    pub allow_parallel: bool,
    pub max_parallel_instances: u32,
    /// Isolation the task asks for; `None` defers to the run's mode.
    #[serde(default)]
    pub isolation: Option<ExecutionModeKind>,
}

impl Default for ParallelPolicy {
    fn default() -> Self {
        Self {
            allow_parallel: true,
            max_parallel_instances: 1,
            isolation: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub task_type: TaskType,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub progress: u8,
    #[serde(default)]
    pub assigned_to: Option<AgentRole>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub estimated_hours: f64,
    #[serde(default)]
    pub actual_hours: Option<f64>,
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    #[serde(default)]
    pub blocks: Vec<TaskId>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub failure_reason: Option<FailureReason>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub metrics: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub parallel: ParallelPolicy,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Task {
    pub fn new(title: impl Into<String>, task_type: TaskType, priority: TaskPriority) -> Self {
        Self::with_id(Uuid::new_v4(), title, task_type, priority)
    }

    /// Build a task with a caller-chosen id (deterministic plans).
    pub fn with_id(
        id: TaskId,
        title: impl Into<String>,
        task_type: TaskType,
        priority: TaskPriority,
    ) -> Self {
        Self {
            id,
            title: title.into(),
            description: String::new(),
            task_type,
            priority,
            status: TaskStatus::Pending,
            progress: 0,
            assigned_to: None,
            created_by: DEFAULT_CREATOR.to_string(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            estimated_hours: 0.0,
            actual_hours: None,
            depends_on: Vec::new(),
            blocks: Vec::new(),
            command: None,
            working_dir: None,
            environment: BTreeMap::new(),
            output: String::new(),
            error: None,
            failure_reason: None,
            artifacts: Vec::new(),
            metrics: BTreeMap::new(),
            parallel: ParallelPolicy::default(),
            tags: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn with_assigned_to(mut self, role: AgentRole) -> Self {
        self.assigned_to = Some(role);
        self
    }

    pub fn with_estimate(mut self, hours: f64) -> Self {
        self.estimated_hours = hours;
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn depends_on(mut self, id: TaskId) -> Self {
        if !self.depends_on.contains(&id) {
            self.depends_on.push(id);
        }
        self
    }

    /// First eight hex digits of the id, used in branch and directory names.
    pub fn short_id(&self) -> String {
        self.id.simple().to_string()[..8].to_string()
    }

    /// Lower-cased title, description and tags, for keyword matching.
    pub fn search_text(&self) -> String {
        let mut text = format!("{} {}", self.title, self.description);
        for tag in &self.tags {
            text.push(' ');
            text.push_str(tag);
        }
        text.to_lowercase()
    }

    /// Record that execution began.
    pub fn mark_started(&mut self) {
        self.status = TaskStatus::InProgress;
        self.started_at = Some(Utc::now());
        self.completed_at = None;
        self.error = None;
        self.failure_reason = None;
    }

    /// Record a successful finish and derive `actual_hours`.
    pub fn mark_completed(&mut self) {
        self.status = TaskStatus::Completed;
        self.progress = 100;
        self.finish_clock();
    }

    /// Record a failed finish and derive `actual_hours`.
    pub fn mark_failed(&mut self, reason: FailureReason, message: impl Into<String>) {
        self.status = TaskStatus::Failed;
        self.failure_reason = Some(reason);
        self.error = Some(message.into());
        self.finish_clock();
    }

    fn finish_clock(&mut self) {
        let now = Utc::now();
        let started = *self.started_at.get_or_insert(now);
        let completed = if now < started { started } else { now };
        self.completed_at = Some(completed);
        let seconds = (completed - started).num_milliseconds() as f64 / 1000.0;
        self.actual_hours = Some(seconds / 3600.0);
    }

    /// Append a chunk of output, separating chunks with a blank line.
    pub fn append_output(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if !self.output.is_empty() && !self.output.ends_with('\n') {
            self.output.push('\n');
        }
        self.output.push_str(text);
    }

    pub fn add_artifact(&mut self, path: impl Into<String>) {
        let path = path.into();
        if !self.artifacts.contains(&path) {
            self.artifacts.push(path);
        }
    }

    pub fn set_metric(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.metrics.insert(key.into(), value.into());
    }
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

/// A record published on the shared knowledge bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discovery {
    pub agent: String,
    pub kind: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Discovery {
    pub fn new(
        agent: impl Into<String>,
        kind: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            agent: agent.into(),
            kind: kind.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Discovery kinds the engine itself publishes.
pub mod discovery_kind {
    pub const TASK_COMPLETED: &str = "task_completed";
    pub const TASK_FAILED: &str = "task_failed";
    pub const ERROR: &str = "error";
    pub const DECISION: &str = "decision";
    pub const FILE_MODIFIED: &str = "file_modified";
    pub const NOTE: &str = "note";
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
