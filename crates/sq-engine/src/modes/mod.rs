//! Execution modes.
//!
//! A mode decides where a task runs (in place or in its own worktree), how
//! many tasks may run at once, and how finished work is merged back. The
//! coordinator drives every mode through [`ExecutionMode`].

use std::sync::Arc;

use async_trait::async_trait;
use sq_agents::agent::{Agent, ExecutionContext};
use sq_core::config::Config;
use sq_core::plan::Plan;
use sq_core::types::{ExecutionModeKind, Task};
use sq_core::worktree::{WorktreeError, WorktreeInfo, WorktreeManager};
use thiserror::Error;

mod fast;
mod isolation;
mod parallel;
mod redundant;
mod safe;

pub use fast::FastMode;
pub use isolation::{IsolationSettings, WorktreeIsolation};
pub use parallel::ParallelMode;
pub use redundant::{RedundantMode, VARIATION_HINTS};
pub use safe::SafeMode;

// ---------------------------------------------------------------------------
// Errors / outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ModeError {
    #[error("worktree error: {0}")]
    Worktree(#[from] WorktreeError),
    #[error("background git task failed: {0}")]
    Join(String),
}

pub type Result<T> = std::result::Result<T, ModeError>;

/// A task after a mode ran it.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task: Task,
    pub ok: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged,
    NothingToMerge,
    /// The mode has nothing to merge or merging is switched off.
    Skipped,
    Conflict(Vec<String>),
    Failed(String),
}

// ---------------------------------------------------------------------------
// ExecutionMode trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ExecutionMode: Send + Sync {
    fn kind(&self) -> ExecutionModeKind;

    /// Called once before the first dispatch.
    async fn prepare(&self, plan: &Plan) -> Result<()>;

    /// Run one task with `agent`. The task comes back in a terminal state.
    async fn execute(&self, task: Task, agent: Arc<Agent>, ctx: ExecutionContext) -> TaskOutcome;

    /// Integrate a successfully executed task. Called by the coordinator,
    /// one task at a time, in completion order.
    async fn merge(&self, task: &Task) -> MergeOutcome;

    /// Release every resource. Calling it again is a no-op.
    async fn cleanup(&self);

    fn can_parallelize(&self) -> bool;

    fn max_parallel_tasks(&self) -> usize;
}

/// Mark `task` failed because its isolation could not be set up.
pub(crate) fn adapter_failure(mut task: Task, error: &ModeError) -> TaskOutcome {
    task.mark_started();
    task.mark_failed(sq_core::types::FailureReason::Adapter, error.to_string());
    TaskOutcome { task, ok: false }
}

/// Build the mode for `kind`. `Auto` must be resolved by the caller.
pub fn build_mode(
    kind: ExecutionModeKind,
    config: &Config,
    worktrees: Option<Arc<WorktreeManager>>,
    roster: &[Arc<Agent>],
) -> Arc<dyn ExecutionMode> {
    let settings = IsolationSettings::from_config(config);
    let isolation = || WorktreeIsolation::new(worktrees.clone(), settings.clone());
    match kind {
        ExecutionModeKind::Fast => Arc::new(FastMode::new(
            worktrees.clone(),
            config.execution.auto_commit,
        )),
        ExecutionModeKind::Parallel => Arc::new(ParallelMode::new(
            isolation(),
            config.execution.max_agents as usize,
        )),
        ExecutionModeKind::Redundant => Arc::new(RedundantMode::new(
            isolation(),
            roster.to_vec(),
            config.execution.redundant_copies as usize,
        )),
        ExecutionModeKind::Safe | ExecutionModeKind::Auto => Arc::new(SafeMode::new(
            isolation(),
            config.execution.safe_max_parallel as usize,
        )),
    }
}

/// Remember where a task ran so the branch can be found after the run.
pub(crate) fn record_worktree(task: &mut Task, info: &WorktreeInfo) {
    task.metadata.insert(
        "worktree".to_string(),
        serde_json::json!(info.path.display().to_string()),
    );
    task.metadata
        .insert("branch".to_string(), serde_json::json!(info.branch));
}

/// Run `task` in a fresh worktree (or in place when isolation is
/// unavailable) and commit the result so it can be merged.
pub(crate) async fn run_in_worktree(
    isolation: &WorktreeIsolation,
    mut task: Task,
    agent: Arc<Agent>,
    ctx: ExecutionContext,
) -> TaskOutcome {
    let info = match isolation.create(&task, None).await {
        Ok(info) => info,
        Err(e) => return adapter_failure(task, &e),
    };
    let ctx = match &info {
        Some(info) => {
            record_worktree(&mut task, info);
            ctx.in_dir(&info.path)
        }
        None => ctx,
    };
    let ok = agent.execute(&mut task, &ctx).await;
    let Some(info) = info else {
        return TaskOutcome { task, ok };
    };
    if !ok {
        return TaskOutcome { task, ok };
    }
    match isolation
        .commit(&info.path, &format!("squadron: {}", task.title))
        .await
    {
        Ok(_) => {
            isolation.hold_for_merge(task.id, info);
            TaskOutcome { task, ok: true }
        }
        Err(e) => {
            task.mark_failed(
                sq_core::types::FailureReason::Adapter,
                format!("commit failed: {e}"),
            );
            TaskOutcome { task, ok: false }
        }
    }
}
