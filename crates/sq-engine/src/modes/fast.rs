use std::sync::Arc;

use async_trait::async_trait;
use sq_agents::agent::{Agent, ExecutionContext};
use sq_core::plan::Plan;
use sq_core::types::{ExecutionModeKind, FailureReason, Task};
use sq_core::worktree::WorktreeManager;
use tracing::{debug, info, warn};

use super::{ExecutionMode, MergeOutcome, ModeError, Result, TaskOutcome};

/// Tasks run one at a time directly in the current tree.
pub struct FastMode {
    repo: Option<Arc<WorktreeManager>>,
    auto_commit: bool,
}

impl FastMode {
    pub fn new(repo: Option<Arc<WorktreeManager>>, auto_commit: bool) -> Self {
        Self { repo, auto_commit }
    }
}

#[async_trait]
impl ExecutionMode for FastMode {
    fn kind(&self) -> ExecutionModeKind {
        ExecutionModeKind::Fast
    }

    async fn prepare(&self, _plan: &Plan) -> Result<()> {
        let Some(repo) = self.repo.clone() else {
            return Ok(());
        };
        let clean = tokio::task::spawn_blocking(move || repo.is_clean(repo.repo_dir()))
            .await
            .map_err(|e| ModeError::Join(e.to_string()))?;
        match clean {
            Ok(true) => {}
            Ok(false) => warn!("working tree has uncommitted changes; fast mode edits it in place"),
            Err(e) => debug!(error = %e, "could not inspect working tree"),
        }
        Ok(())
    }

    async fn execute(&self, mut task: Task, agent: Arc<Agent>, ctx: ExecutionContext) -> TaskOutcome {
        let ok = agent.execute(&mut task, &ctx).await;
        if !(ok && self.auto_commit) {
            return TaskOutcome { task, ok };
        }
        let Some(repo) = self.repo.clone() else {
            return TaskOutcome { task, ok };
        };
        let message = format!("squadron: {}", task.title);
        let committed = tokio::task::spawn_blocking(move || {
            let dir = repo.repo_dir().to_path_buf();
            repo.commit_all(&dir, &message)
        })
        .await;
        match committed {
            Ok(Ok(made)) => {
                info!(task_id = %task.id, committed = made, "auto-commit");
                TaskOutcome { task, ok: true }
            }
            Ok(Err(e)) => {
                task.mark_failed(FailureReason::Adapter, format!("commit failed: {e}"));
                TaskOutcome { task, ok: false }
            }
            Err(e) => {
                task.mark_failed(FailureReason::Adapter, format!("commit failed: {e}"));
                TaskOutcome { task, ok: false }
            }
        }
    }

    async fn merge(&self, _task: &Task) -> MergeOutcome {
        MergeOutcome::Skipped
    }

    async fn cleanup(&self) {}

    fn can_parallelize(&self) -> bool {
        false
    }

    fn max_parallel_tasks(&self) -> usize {
        1
    }
}
