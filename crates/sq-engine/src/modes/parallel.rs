use std::sync::Arc;

use async_trait::async_trait;
use sq_agents::agent::{Agent, ExecutionContext};
use sq_core::plan::Plan;
use sq_core::types::{ExecutionModeKind, Task};
use tracing::info;

use super::{
    run_in_worktree, ExecutionMode, MergeOutcome, Result, TaskOutcome, WorktreeIsolation,
};

/// A worktree per running task and up to `max_agents` tasks at once.
pub struct ParallelMode {
    isolation: WorktreeIsolation,
    width: usize,
}

impl ParallelMode {
    pub fn new(isolation: WorktreeIsolation, width: usize) -> Self {
        Self {
            isolation,
            width: width.max(1),
        }
    }
}

#[async_trait]
impl ExecutionMode for ParallelMode {
    fn kind(&self) -> ExecutionModeKind {
        ExecutionModeKind::Parallel
    }

    async fn prepare(&self, plan: &Plan) -> Result<()> {
        info!(tasks = plan.children().len(), width = self.width, "preparing parallel run");
        self.isolation.prepare().await
    }

    async fn execute(&self, task: Task, agent: Arc<Agent>, ctx: ExecutionContext) -> TaskOutcome {
        run_in_worktree(&self.isolation, task, agent, ctx).await
    }

    async fn merge(&self, task: &Task) -> MergeOutcome {
        self.isolation.merge(task).await
    }

    async fn cleanup(&self) {
        self.isolation.cleanup().await
    }

    fn can_parallelize(&self) -> bool {
        self.width > 1
    }

    fn max_parallel_tasks(&self) -> usize {
        self.width
    }
}
