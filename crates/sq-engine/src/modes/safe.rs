use std::sync::Arc;

use async_trait::async_trait;
use sq_agents::agent::{Agent, ExecutionContext};
use sq_core::plan::Plan;
use sq_core::types::{ExecutionModeKind, Task};

use super::{
    run_in_worktree, ExecutionMode, MergeOutcome, Result, TaskOutcome, WorktreeIsolation,
};

/// Hard ceiling on safe-mode concurrency.
const SAFE_MAX_PARALLEL: usize = 2;

/// One worktree per task, at most two tasks at once, merged back in
/// completion order.
pub struct SafeMode {
    isolation: WorktreeIsolation,
    max_parallel: usize,
}

impl SafeMode {
    pub fn new(isolation: WorktreeIsolation, max_parallel: usize) -> Self {
        Self {
            isolation,
            max_parallel: max_parallel.clamp(1, SAFE_MAX_PARALLEL),
        }
    }
}

#[async_trait]
impl ExecutionMode for SafeMode {
    fn kind(&self) -> ExecutionModeKind {
        ExecutionModeKind::Safe
    }

    async fn prepare(&self, _plan: &Plan) -> Result<()> {
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
        self.max_parallel > 1
    }

    fn max_parallel_tasks(&self) -> usize {
        self.max_parallel
    }
}
