use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use sq_agents::agent::{Agent, ExecutionContext};
use sq_core::plan::Plan;
use sq_core::types::{ExecutionModeKind, FailureReason, Task};
use sq_core::worktree::WorktreeInfo;
use tracing::{debug, info};

use super::{ExecutionMode, MergeOutcome, Result, TaskOutcome, WorktreeIsolation};

/// Appended to each copy's description so the copies take different routes.
pub const VARIATION_HINTS: [&str; 5] = [
    "Favour simplicity and clarity.",
    "Favour performance and efficiency.",
    "Favour security and exhaustive input validation.",
    "Follow modern best practices.",
    "Favour scalability and maintainability.",
];

/// Runs K copies of each task in separate worktrees and keeps the best one.
///
/// A copy that succeeded beats one that failed; among equals the copy with
/// more output wins, then the earlier copy. Losing worktrees are discarded.
pub struct RedundantMode {
    isolation: WorktreeIsolation,
    roster: Vec<Arc<Agent>>,
    copies: usize,
}

struct Variant {
    index: usize,
    outcome: TaskOutcome,
    agent: String,
    worktree: Option<WorktreeInfo>,
}

impl RedundantMode {
    pub fn new(isolation: WorktreeIsolation, roster: Vec<Arc<Agent>>, copies: usize) -> Self {
        Self {
            isolation,
            roster,
            copies: copies.max(1),
        }
    }

    /// `primary` first, then the rest of the roster round-robin.
    fn agents_for(&self, primary: Arc<Agent>) -> Vec<Arc<Agent>> {
        let start = self
            .roster
            .iter()
            .position(|a| a.name() == primary.name())
            .unwrap_or(0);
        let mut picked = vec![primary];
        let others: Vec<&Arc<Agent>> = (1..self.roster.len())
            .map(|offset| &self.roster[(start + offset) % self.roster.len()])
            .collect();
        let mut i = 0;
        while picked.len() < self.copies {
            let next = if others.is_empty() {
                Arc::clone(&picked[0])
            } else {
                Arc::clone(others[i % others.len()])
            };
            picked.push(next);
            i += 1;
        }
        picked
    }

    async fn run_variant(
        &self,
        index: usize,
        mut task: Task,
        agent: Arc<Agent>,
        ctx: ExecutionContext,
    ) -> Variant {
        let name = agent.name().to_string();
        let worktree = match self.isolation.create(&task, Some(index)).await {
            Ok(w) => w,
            Err(e) => {
                return Variant {
                    index,
                    outcome: super::adapter_failure(task, &e),
                    agent: name,
                    worktree: None,
                }
            }
        };
        let ctx = match &worktree {
            Some(w) => {
                super::record_worktree(&mut task, w);
                ctx.in_dir(&w.path)
            }
            None => ctx,
        };
        let mut ok = agent.execute(&mut task, &ctx).await;
        if ok {
            if let Some(w) = &worktree {
                if let Err(e) = self
                    .isolation
                    .commit(&w.path, &format!("squadron: {} (variant {index})", task.title))
                    .await
                {
                    task.mark_failed(FailureReason::Adapter, format!("commit failed: {e}"));
                    ok = false;
                }
            }
        }
        Variant {
            index,
            outcome: TaskOutcome { task, ok },
            agent: name,
            worktree,
        }
    }
}

/// Index of the best variant.
fn pick_winner(variants: &[Variant]) -> usize {
    let mut best = 0;
    for (i, v) in variants.iter().enumerate().skip(1) {
        let current = &variants[best].outcome;
        let better = match (v.outcome.ok, current.ok) {
            (true, false) => true,
            (false, true) => false,
            _ => v.outcome.task.output.len() > current.task.output.len(),
        };
        if better {
            best = i;
        }
    }
    best
}

#[async_trait]
impl ExecutionMode for RedundantMode {
    fn kind(&self) -> ExecutionModeKind {
        ExecutionModeKind::Redundant
    }

    async fn prepare(&self, _plan: &Plan) -> Result<()> {
        info!(copies = self.copies, "preparing redundant run");
        self.isolation.prepare().await
    }

    async fn execute(&self, task: Task, agent: Arc<Agent>, ctx: ExecutionContext) -> TaskOutcome {
        let agents = self.agents_for(agent);
        let original_description = task.description.clone();
        let prepared: Vec<(usize, Task, Arc<Agent>)> = agents
            .into_iter()
            .enumerate()
            .map(|(i, a)| {
                let mut variant = task.clone();
                let hint = VARIATION_HINTS[i % VARIATION_HINTS.len()];
                variant.description = if original_description.is_empty() {
                    format!("Approach: {hint}")
                } else {
                    format!("{original_description}\n\nApproach: {hint}")
                };
                (i, variant, a)
            })
            .collect();

        let mut variants = if self.isolation.is_available() {
            futures::future::join_all(
                prepared
                    .into_iter()
                    .map(|(i, t, a)| self.run_variant(i, t, a, ctx.clone())),
            )
            .await
        } else {
            // Copies would share one directory, so run them one after another.
            let mut out = Vec::with_capacity(prepared.len());
            for (i, t, a) in prepared {
                out.push(self.run_variant(i, t, a, ctx.clone()).await);
            }
            out
        };

        let winner_index = pick_winner(&variants);
        let winner = variants.swap_remove(winner_index);
        for loser in &variants {
            debug!(task_id = %task.id, variant = loser.index, "discarding variant");
            if let Some(w) = &loser.worktree {
                self.isolation.discard(w).await;
            }
        }

        info!(
            task_id = %task.id,
            variant = winner.index,
            agent = %winner.agent,
            ok = winner.outcome.ok,
            "selected redundant variant"
        );
        let mut result = winner.outcome;
        result.task.description = original_description;
        result.task.set_metric("redundant_copies", self.copies as u64);
        result.task.set_metric("winning_variant", winner.index as u64);
        result
            .task
            .metadata
            .insert("agent".to_string(), json!(winner.agent));
        if result.ok {
            if let Some(w) = winner.worktree {
                self.isolation.hold_for_merge(result.task.id, w);
            }
        }
        result
    }

    async fn merge(&self, task: &Task) -> MergeOutcome {
        self.isolation.merge(task).await
    }

    async fn cleanup(&self) {
        self.isolation.cleanup().await
    }

    fn can_parallelize(&self) -> bool {
        false
    }

    fn max_parallel_tasks(&self) -> usize {
        1
    }
}
