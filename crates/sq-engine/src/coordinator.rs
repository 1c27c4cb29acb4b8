//! The coordinator: a single-writer loop that owns every task of a run.
//!
//! Workers only execute. Every state transition, merge, cascade and snapshot
//! write happens here, one completion message at a time.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use sq_agents::agent::{Agent, ExecutionContext};
use sq_agents::knowledge::KnowledgeBus;
use sq_core::cancel::CancelToken;
use sq_core::plan::{Plan, PlanError};
use sq_core::state_machine::{StateMachineError, TaskEvent, TaskStateMachine};
use sq_core::status::{AgentSnapshot, AgentStatus, LogLevel, SnapshotStats, StatusWriter};
use sq_core::types::{ExecutionModeKind, FailureReason, Task, TaskId, TaskStatus};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn, Instrument};

use crate::modes::{ExecutionMode, MergeOutcome, ModeError, TaskOutcome};

const COORDINATOR: &str = "coordinator";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("invalid plan: {0}")]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Transition(#[from] StateMachineError),
    #[error("mode preparation failed: {0}")]
    Mode(#[from] ModeError),
    #[error("no agents are enabled")]
    NoAgents,
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;

// ---------------------------------------------------------------------------
// Run report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    Failed,
    Cancelled,
}

impl RunOutcome {
    /// Process exit code for this outcome.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Success => 0,
            RunOutcome::Failed => 1,
            RunOutcome::Cancelled => 130,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Success => "success",
            RunOutcome::Failed => "failed",
            RunOutcome::Cancelled => "cancelled",
        }
    }
}

/// Everything a caller needs after a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub plan_id: uuid::Uuid,
    pub request: String,
    pub mode: ExecutionModeKind,
    pub outcome: RunOutcome,
    pub root: Task,
    /// Children in plan order.
    pub tasks: Vec<Task>,
    pub stats: SnapshotStats,
    pub files_modified: Vec<String>,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn exit_code(&self) -> i32 {
        self.outcome.exit_code()
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        if self.root.id == id {
            return Some(&self.root);
        }
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

/// Pick the agent for `task`: an enabled explicit assignment first, then the
/// highest keyword score, then the least loaded agent, then roster order.
pub fn route_task(task: &Task, roster: &[Arc<Agent>], load: &HashMap<String, usize>) -> Option<usize> {
    if roster.is_empty() {
        return None;
    }
    if let Some(role) = task.assigned_to {
        if let Some(index) = roster.iter().position(|a| a.role() == role) {
            return Some(index);
        }
        warn!(task_id = %task.id, role = %role.as_str(), "assigned role is disabled; routing by specialty");
    }
    let key = |agent: &Arc<Agent>| {
        let score = agent.keyword_score(task);
        let running = load.get(agent.name()).copied().unwrap_or(0);
        (score, Reverse(running))
    };
    let mut best = 0;
    let mut best_key = key(&roster[0]);
    for (index, agent) in roster.iter().enumerate().skip(1) {
        let candidate = key(agent);
        if candidate > best_key {
            best = index;
            best_key = candidate;
        }
    }
    Some(best)
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

struct Slot {
    task: Task,
    machine: TaskStateMachine,
    /// Indices of tasks that depend on this one.
    blocks: Vec<usize>,
    deps: Vec<usize>,
}

/// Per-agent bookkeeping for the status snapshot.
#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    assigned: usize,
    settled: usize,
    last_failed: bool,
}

impl Tally {
    fn progress(&self) -> u8 {
        if self.assigned == 0 {
            return 0;
        }
        (self.settled * 100 / self.assigned).min(100) as u8
    }
}

struct Done {
    index: usize,
    agent: String,
    outcome: TaskOutcome,
    /// Released only after the completion has been applied.
    permit: OwnedSemaphorePermit,
}

pub struct Coordinator {
    mode: Arc<dyn ExecutionMode>,
    roster: Vec<Arc<Agent>>,
    bus: Arc<KnowledgeBus>,
    cancel: CancelToken,
    workdir: Option<PathBuf>,
    context_files: Vec<PathBuf>,
    status: Option<StatusWriter>,

    slots: Vec<Slot>,
    root: usize,
    load: HashMap<String, usize>,
    current: HashMap<String, TaskId>,
    tally: HashMap<String, Tally>,
}

impl Coordinator {
    pub fn new(mode: Arc<dyn ExecutionMode>, roster: Vec<Arc<Agent>>, bus: Arc<KnowledgeBus>) -> Self {
        Self {
            mode,
            roster,
            bus,
            cancel: CancelToken::new(),
            workdir: None,
            context_files: Vec::new(),
            status: None,
            slots: Vec::new(),
            root: 0,
            load: HashMap::new(),
            current: HashMap::new(),
            tally: HashMap::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Directory tasks run in when the mode does not isolate them.
    pub fn with_workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn with_context_files(mut self, files: Vec<PathBuf>) -> Self {
        self.context_files = files;
        self
    }

    pub fn with_status(mut self, writer: StatusWriter) -> Self {
        self.status = Some(writer);
        self
    }

    /// Drive `plan` to completion. Cleanup runs on every path.
    pub async fn run(mut self, plan: Plan) -> Result<RunReport> {
        let started = Instant::now();
        let result = self.drive(&plan).await;
        self.mode.cleanup().await;
        self.bus.flush_async().await;
        let outcome = result?;

        let mut report = RunReport {
            plan_id: plan.id,
            request: plan.request.clone(),
            mode: self.mode.kind(),
            outcome,
            root: self.slots[self.root].task.clone(),
            tasks: Vec::with_capacity(self.slots.len().saturating_sub(1)),
            stats: self.stats(),
            files_modified: self.bus.files_modified(),
            elapsed: started.elapsed(),
        };
        for (index, slot) in self.slots.iter().enumerate() {
            if index != self.root {
                report.tasks.push(slot.task.clone());
            }
        }
        info!(
            outcome = outcome.as_str(),
            completed = report.stats.completed,
            failed = report.stats.failed,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "run finished"
        );
        Ok(report)
    }

    async fn drive(&mut self, plan: &Plan) -> Result<RunOutcome> {
        plan.validate()?;
        self.load_plan(plan);
        if self.slots.len() > 1 && self.roster.is_empty() {
            return Err(CoordinatorError::NoAgents);
        }

        info!(
            mode = %self.mode.kind().as_str(),
            tasks = self.slots.len() - 1,
            agents = self.roster.len(),
            "starting run"
        );
        self.mode.prepare(plan).await?;

        let root = self.root;
        self.apply(root, TaskEvent::DependenciesMet)?;
        self.apply(root, TaskEvent::Dispatch)?;
        self.slots[root].task.mark_started();
        self.promote_ready()?;
        self.log(LogLevel::Info, COORDINATOR, format!("run started: {}", plan.main_goal));
        self.write_status().await;

        let max = self.mode.max_parallel_tasks().max(1);
        let gate = Arc::new(Semaphore::new(max));
        let (tx, rx) = flume::unbounded::<Done>();
        let cancel = self.cancel.clone();
        let mut running = 0usize;
        let mut cancelling = false;

        loop {
            if !cancelling && cancel.is_cancelled() {
                cancelling = true;
                self.cancel_waiting()?;
                self.write_status().await;
            }
            if !cancelling {
                let started = self.dispatch_ready(&gate, &tx)?;
                if started > 0 {
                    running += started;
                    self.write_status().await;
                }
            }
            if running == 0 {
                break;
            }
            tokio::select! {
                msg = rx.recv_async() => {
                    let Ok(done) = msg else { break };
                    running -= 1;
                    self.complete(done).await?;
                }
                _ = cancel.cancelled(), if !cancelling => {
                    info!(running, "cancellation requested");
                }
            }
        }

        let cancelled = cancel.is_cancelled();
        self.settle_stragglers(cancelled)?;
        let outcome = self.finish_root(cancelled)?;
        self.log(LogLevel::Info, COORDINATOR, format!("run {}", outcome.as_str()));
        self.write_status().await;
        Ok(outcome)
    }

    fn load_plan(&mut self, plan: &Plan) {
        let index: HashMap<TaskId, usize> = plan
            .tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id, i))
            .collect();
        self.slots = plan
            .tasks
            .iter()
            .map(|task| Slot {
                task: task.clone(),
                machine: TaskStateMachine::new(),
                blocks: Vec::new(),
                deps: task
                    .depends_on
                    .iter()
                    .filter_map(|d| index.get(d).copied())
                    .collect(),
            })
            .collect();
        for i in 0..self.slots.len() {
            for d in self.slots[i].deps.clone() {
                self.slots[d].blocks.push(i);
            }
        }
        for slot in &mut self.slots {
            let ids = slot.blocks.iter().map(|&b| plan.tasks[b].id).collect();
            slot.task.blocks = ids;
            slot.task.status = TaskStatus::Pending;
        }
        self.root = index.get(&plan.root_id()).copied().unwrap_or(0);
    }

    fn apply(&mut self, index: usize, event: TaskEvent) -> Result<TaskStatus> {
        let slot = &mut self.slots[index];
        let next = slot.machine.transition(event)?;
        slot.task.status = next;
        Ok(next)
    }

    fn state(&self, index: usize) -> TaskStatus {
        self.slots[index].machine.state()
    }

    fn children(&self) -> impl Iterator<Item = usize> + '_ {
        let root = self.root;
        (0..self.slots.len()).filter(move |&i| i != root)
    }

    /// Move every pending child whose dependencies all completed to ready.
    fn promote_ready(&mut self) -> Result<()> {
        let candidates: Vec<usize> = self
            .children()
            .filter(|&i| self.state(i) == TaskStatus::Pending)
            .filter(|&i| {
                self.slots[i]
                    .deps
                    .iter()
                    .all(|&d| d == self.root || self.state(d) == TaskStatus::Completed)
            })
            .collect();
        for i in candidates {
            self.apply(i, TaskEvent::DependenciesMet)?;
            debug!(task_id = %self.slots[i].task.id, "task ready");
        }
        Ok(())
    }

    /// Dispatch ready tasks while slots are free. Returns how many started.
    fn dispatch_ready(&mut self, gate: &Arc<Semaphore>, tx: &flume::Sender<Done>) -> Result<usize> {
        let mut ready: Vec<usize> = self
            .children()
            .filter(|&i| self.state(i) == TaskStatus::Ready)
            .collect();
        ready.sort_by_key(|&i| {
            let slot = &self.slots[i];
            (Reverse(slot.task.priority.level()), Reverse(slot.blocks.len()), i)
        });

        let mut started = 0;
        for index in ready {
            let Ok(permit) = Arc::clone(gate).try_acquire_owned() else {
                break;
            };
            let Some(agent_index) = route_task(&self.slots[index].task, &self.roster, &self.load) else {
                return Err(CoordinatorError::NoAgents);
            };
            let agent = Arc::clone(&self.roster[agent_index]);
            self.apply(index, TaskEvent::Dispatch)?;
            let task = self.slots[index].task.clone();
            *self.load.entry(agent.name().to_string()).or_default() += 1;
            self.current.insert(agent.name().to_string(), task.id);
            self.tally.entry(agent.name().to_string()).or_default().assigned += 1;
            info!(task_id = %task.id, agent = %agent.name(), title = %task.title, "dispatching task");
            self.log(
                LogLevel::Info,
                agent.name(),
                format!("started {} ({})", task.title, task.short_id()),
            );
            self.spawn_worker(index, task, agent, permit, tx.clone());
            started += 1;
        }
        Ok(started)
    }

    fn spawn_worker(
        &self,
        index: usize,
        task: Task,
        agent: Arc<Agent>,
        permit: OwnedSemaphorePermit,
        tx: flume::Sender<Done>,
    ) {
        let mode = Arc::clone(&self.mode);
        let mut ctx = ExecutionContext::new(self.cancel.clone())
            .with_context_files(self.context_files.clone());
        if let Some(dir) = &self.workdir {
            ctx = ctx.in_dir(dir);
        }
        let span = sq_telemetry::spans::task_span(&task.id.to_string(), agent.name());
        let name = agent.name().to_string();
        let fallback = task.clone();

        tokio::spawn(async move {
            // The inner task turns a panic in a mode into a failed task.
            let inner = tokio::spawn(async move { mode.execute(task, agent, ctx).await }.instrument(span));
            let outcome = match inner.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(task_id = %fallback.id, error = %e, "worker aborted");
                    let mut task = fallback;
                    task.mark_started();
                    task.mark_failed(FailureReason::Adapter, format!("worker aborted: {e}"));
                    TaskOutcome { task, ok: false }
                }
            };
            if tx
                .send(Done {
                    index,
                    agent: name,
                    outcome,
                    permit,
                })
                .is_err()
            {
                warn!("coordinator gone; dropping task result");
            }
        });
    }

    async fn complete(&mut self, done: Done) -> Result<()> {
        let Done {
            index,
            agent,
            outcome,
            permit,
        } = done;
        if let Some(n) = self.load.get_mut(&agent) {
            *n = n.saturating_sub(1);
        }
        if self.load.get(&agent).copied().unwrap_or(0) == 0 {
            self.current.remove(&agent);
        }

        let TaskOutcome { mut task, mut ok } = outcome;
        if ok {
            match self.mode.merge(&task).await {
                MergeOutcome::Merged | MergeOutcome::NothingToMerge | MergeOutcome::Skipped => {}
                MergeOutcome::Conflict(files) => {
                    task.mark_failed(
                        FailureReason::MergeConflict,
                        format!("merge conflict in: {}", files.join(", ")),
                    );
                    task.set_metric("conflict_files", json!(files));
                    ok = false;
                }
                MergeOutcome::Failed(message) => {
                    task.mark_failed(FailureReason::Adapter, format!("merge failed: {message}"));
                    ok = false;
                }
            }
            if !ok {
                self.retract_completion(&task, &agent);
            }
        }

        let event = if ok {
            TaskEvent::Succeed
        } else if task.failure_reason == Some(FailureReason::Cancelled) {
            TaskEvent::Cancel
        } else {
            TaskEvent::Fail
        };
        let id = task.id;
        let title = task.title.clone();
        let error = task.error.clone().unwrap_or_default();
        self.slots[index].task = task;
        let next = self.apply(index, event)?;
        drop(permit);
        let tally = self.tally.entry(agent.clone()).or_default();
        tally.settled += 1;
        match next {
            TaskStatus::Completed => tally.last_failed = false,
            TaskStatus::Failed => tally.last_failed = true,
            _ => {}
        }

        match next {
            TaskStatus::Completed => {
                info!(task_id = %id, agent = %agent, "task completed");
                self.log(LogLevel::Info, &agent, format!("completed {title}"));
                self.promote_ready()?;
            }
            TaskStatus::Cancelled => {
                info!(task_id = %id, agent = %agent, "task cancelled");
                self.log(LogLevel::Warn, &agent, format!("cancelled {title}"));
            }
            _ => {
                warn!(task_id = %id, agent = %agent, error = %error, "task failed");
                self.log(LogLevel::Error, &agent, format!("failed {title}: {error}"));
                self.cascade_block(index)?;
            }
        }
        self.write_status().await;
        Ok(())
    }

    /// The executing agent already counted `task` as completed; the merge
    /// failed it afterwards. Redundant runs record the winning variant's
    /// agent in the task metadata.
    fn retract_completion(&self, task: &Task, dispatched_to: &str) {
        let name = task
            .metadata
            .get("agent")
            .and_then(|v| v.as_str())
            .unwrap_or(dispatched_to);
        if let Some(agent) = self.roster.iter().find(|a| a.name() == name) {
            agent.retract_completion(task);
        }
    }

    /// Block every non-terminal transitive dependent of `failed`.
    fn cascade_block(&mut self, failed: usize) -> Result<()> {
        let cause = self.slots[failed].task.short_id();
        let mut stack = self.slots[failed].blocks.clone();
        while let Some(i) = stack.pop() {
            let state = self.state(i);
            if state.is_terminal() || state == TaskStatus::InProgress {
                continue;
            }
            self.apply(i, TaskEvent::Block)?;
            let slot = &mut self.slots[i];
            slot.task.error = Some(format!("blocked by failed dependency {cause}"));
            let title = slot.task.title.clone();
            info!(task_id = %slot.task.id, cause = %cause, "task blocked");
            stack.extend(slot.blocks.iter().copied());
            self.log(LogLevel::Warn, COORDINATOR, format!("blocked {title}"));
        }
        Ok(())
    }

    fn cancel_waiting(&mut self) -> Result<()> {
        let waiting: Vec<usize> = self
            .children()
            .filter(|&i| matches!(self.state(i), TaskStatus::Pending | TaskStatus::Ready))
            .collect();
        for i in waiting {
            self.apply(i, TaskEvent::Cancel)?;
        }
        self.log(LogLevel::Warn, COORDINATOR, "run cancelled");
        Ok(())
    }

    /// Children that never became runnable end cancelled or blocked.
    fn settle_stragglers(&mut self, cancelled: bool) -> Result<()> {
        let open: Vec<usize> = self
            .children()
            .filter(|&i| !self.state(i).is_terminal())
            .collect();
        for i in open {
            let event = if cancelled { TaskEvent::Cancel } else { TaskEvent::Block };
            warn!(task_id = %self.slots[i].task.id, event = %event, "settling unfinished task");
            self.apply(i, event)?;
        }
        Ok(())
    }

    fn finish_root(&mut self, cancelled: bool) -> Result<RunOutcome> {
        let unfinished = self
            .children()
            .filter(|&i| self.state(i) != TaskStatus::Completed)
            .count();
        let root = self.root;
        let outcome = if unfinished == 0 {
            self.apply(root, TaskEvent::Succeed)?;
            self.slots[root].task.mark_completed();
            RunOutcome::Success
        } else if cancelled {
            self.apply(root, TaskEvent::Cancel)?;
            RunOutcome::Cancelled
        } else {
            self.apply(root, TaskEvent::Fail)?;
            RunOutcome::Failed
        };
        if outcome != RunOutcome::Success {
            let task = &mut self.slots[root].task;
            task.error = Some(format!("{unfinished} task(s) did not complete"));
            task.completed_at = Some(Utc::now());
        }
        Ok(outcome)
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    fn log(&mut self, level: LogLevel, agent: &str, message: impl Into<String>) {
        if let Some(writer) = self.status.as_mut() {
            writer.log(level, agent, message);
        }
    }

    fn stats(&self) -> SnapshotStats {
        let mut stats = SnapshotStats {
            files_modified: self.bus.files_modified().len(),
            recent_files: self.bus.recent_files(),
            ..SnapshotStats::default()
        };
        for i in self.children() {
            stats.total += 1;
            match self.state(i) {
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::InProgress => stats.in_progress += 1,
                TaskStatus::Pending | TaskStatus::Ready => stats.pending += 1,
                TaskStatus::Blocked | TaskStatus::Cancelled => {}
            }
        }
        stats
    }

    /// Busy agents are active; an idle agent whose last task failed is in
    /// error; idle agents are blocked while every open task waits on a
    /// running dependency.
    fn agent_snapshots(&self) -> BTreeMap<String, AgentSnapshot> {
        let waiting = self.children().any(|i| self.state(i) == TaskStatus::Pending)
            && !self.children().any(|i| self.state(i) == TaskStatus::Ready);
        self.roster
            .iter()
            .map(|agent| {
                let stats = agent.stats();
                let running = self.load.get(agent.name()).copied().unwrap_or(0);
                let tally = self.tally.get(agent.name()).copied().unwrap_or_default();
                let status = if running > 0 {
                    AgentStatus::Active
                } else if tally.last_failed {
                    AgentStatus::Error
                } else if waiting {
                    AgentStatus::Blocked
                } else {
                    AgentStatus::Inactive
                };
                let snapshot = AgentSnapshot {
                    status,
                    current_task: self.current.get(agent.name()).copied(),
                    progress: tally.progress(),
                    role: agent.role(),
                    tasks_completed: stats.tasks_completed,
                    tasks_failed: stats.tasks_failed,
                };
                (agent.name().to_string(), snapshot)
            })
            .collect()
    }

    async fn write_status(&self) {
        let Some(writer) = &self.status else { return };
        let snapshot = writer.build(
            Some(self.mode.kind().as_str()),
            self.agent_snapshots(),
            self.stats(),
        );
        if let Err(e) = writer.write(&snapshot).await {
            warn!(path = %writer.path().display(), error = %e, "failed to write status snapshot");
        }
    }
}
