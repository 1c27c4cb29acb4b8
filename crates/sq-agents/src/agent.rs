use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sq_core::cancel::CancelToken;
use sq_core::config::Config;
use sq_core::types::{discovery_kind, AgentRole, Discovery, FailureReason, Task};
use tracing::{debug, info, warn};

use crate::arsenal::Arsenal;
use crate::knowledge::KnowledgeBus;
use crate::output::{parse_agent_output, ParsedOutput};
use crate::prompt::{build_prompt, PromptInputs};
use crate::roles::{profile_for, RoleProfile};
use crate::runner::{CommandRunner, RunOutcome, RunRequest};

/// Shared-knowledge items included in each prompt.
pub const DEFAULT_DIGEST_ITEMS: usize = 10;

// ---------------------------------------------------------------------------
// AgentRecord
// ---------------------------------------------------------------------------

/// Immutable identity of an agent.
#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub name: String,
    pub role: AgentRole,
    profile: &'static RoleProfile,
}

impl AgentRecord {
    /// Record for `role`, named after the role unless `name` is given.
    pub fn for_role(role: AgentRole, name: Option<&str>) -> Self {
        Self {
            name: name.map(str::to_string).unwrap_or_else(|| role.to_string()),
            role,
            profile: profile_for(role),
        }
    }

    pub fn specialties(&self) -> &'static [&'static str] {
        self.profile.specialties
    }

    pub fn template(&self) -> &'static str {
        self.profile.template
    }

    pub fn preamble(&self) -> String {
        self.profile.preamble(&self.name)
    }

    pub fn keyword_score(&self, task: &Task) -> usize {
        self.profile.keyword_score(&task.search_text(), task.task_type)
    }
}

// ---------------------------------------------------------------------------
// Settings / context
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub program: String,
    pub max_turns: u32,
    pub extra_args: Vec<String>,
    pub timeout: Duration,
    pub use_real_agents: bool,
    pub digest_items: usize,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl AgentSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            program: config.agent_cli.program.clone(),
            max_turns: config.agent_cli.task_max_turns,
            extra_args: config.agent_cli.extra_args.clone(),
            timeout: Duration::from_secs(config.timeouts.task_seconds),
            use_real_agents: config.execution.use_real_agents,
            digest_items: DEFAULT_DIGEST_ITEMS,
        }
    }
}

/// Per-execution inputs supplied by the execution mode.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    /// Directory the task runs in (a worktree or the repository itself).
    pub working_dir: Option<PathBuf>,
    pub context_files: Vec<PathBuf>,
    pub cancel: CancelToken,
}

impl ExecutionContext {
    pub fn new(cancel: CancelToken) -> Self {
        Self {
            cancel,
            ..Default::default()
        }
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_context_files(mut self, files: Vec<PathBuf>) -> Self {
        self.context_files = files;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AgentStats {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tokens_observed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    completed: AtomicU64,
    failed: AtomicU64,
    tokens: AtomicU64,
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

pub struct Agent {
    record: AgentRecord,
    counters: Counters,
    runner: Arc<dyn CommandRunner>,
    bus: Arc<KnowledgeBus>,
    arsenal: Arc<Arsenal>,
    settings: AgentSettings,
}

impl Agent {
    pub fn new(
        record: AgentRecord,
        runner: Arc<dyn CommandRunner>,
        bus: Arc<KnowledgeBus>,
        arsenal: Arc<Arsenal>,
        settings: AgentSettings,
    ) -> Self {
        Self {
            record,
            counters: Counters::default(),
            runner,
            bus,
            arsenal,
            settings,
        }
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn role(&self) -> AgentRole {
        self.record.role
    }

    pub fn record(&self) -> &AgentRecord {
        &self.record
    }

    pub fn stats(&self) -> AgentStats {
        AgentStats {
            tasks_completed: self.counters.completed.load(Ordering::Relaxed),
            tasks_failed: self.counters.failed.load(Ordering::Relaxed),
            tokens_observed: self.counters.tokens.load(Ordering::Relaxed),
        }
    }

    pub fn keyword_score(&self, task: &Task) -> usize {
        self.record.keyword_score(task)
    }

    /// The prompt this agent would send for `task`.
    pub fn prompt_for(&self, task: &Task, ctx: &ExecutionContext) -> String {
        let tools = self.arsenal.tools_for_task(task);
        let digest = self.bus.digest_for(self.name(), self.settings.digest_items);
        build_prompt(&PromptInputs {
            task,
            agent: &self.record,
            tools: &tools,
            digest: &digest,
            context_files: &ctx.context_files,
            working_dir: ctx.working_dir.as_deref(),
        })
    }

    fn request_for(&self, task: &Task, ctx: &ExecutionContext) -> Option<RunRequest> {
        let dir = resolve_dir(ctx.working_dir.as_deref(), task.working_dir.as_deref());
        let request = if let Some(command) = &task.command {
            RunRequest::shell(command).with_envs(&task.environment)
        } else if self.settings.use_real_agents {
            let mut argv = vec![
                self.settings.program.clone(),
                "--print".to_string(),
                "--dangerously-skip-permissions".to_string(),
                "--max-turns".to_string(),
                self.settings.max_turns.to_string(),
            ];
            argv.extend(self.settings.extra_args.iter().cloned());
            argv.push(self.prompt_for(task, ctx));
            RunRequest::new(argv).with_envs(&task.environment)
        } else {
            return None;
        };
        let request = request.with_timeout(self.settings.timeout);
        Some(match dir {
            Some(dir) => request.in_dir(dir),
            None => request,
        })
    }

    /// Run `task` to a terminal state. Returns whether it completed.
    pub async fn execute(&self, task: &mut Task, ctx: &ExecutionContext) -> bool {
        task.mark_started();
        task.metadata
            .insert("agent".to_string(), json!(self.record.name));
        info!(task_id = %task.id, agent = %self.name(), title = %task.title, "task started");

        let outcome = match self.request_for(task, ctx) {
            Some(request) => match self.runner.run(request, &ctx.cancel).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(task_id = %task.id, agent = %self.name(), error = %e, "spawn failed");
                    task.mark_failed(FailureReason::SpawnFailed, e.to_string());
                    self.finish(task, false, None);
                    return false;
                }
            },
            None => simulated_outcome(task, &self.record),
        };

        let parsed = parse_agent_output(&outcome.stdout);
        self.record_outcome(task, &outcome, &parsed);

        let ok = if outcome.cancelled {
            task.mark_failed(FailureReason::Cancelled, "cancelled");
            false
        } else if outcome.timed_out {
            task.mark_failed(FailureReason::Timeout, "timeout");
            false
        } else if outcome.exit_code == 0 {
            task.mark_completed();
            true
        } else {
            let detail = last_line(&outcome.stderr)
                .or_else(|| last_line(&outcome.stdout))
                .unwrap_or_default();
            task.mark_failed(
                FailureReason::NonZeroExit,
                format!("exit code {}: {detail}", outcome.exit_code).trim_end_matches(": ").to_string(),
            );
            false
        };
        self.finish(task, ok, Some(&parsed));
        ok
    }

    fn record_outcome(&self, task: &mut Task, outcome: &RunOutcome, parsed: &ParsedOutput) {
        task.append_output(&outcome.stdout);
        if !outcome.stderr.is_empty() && !outcome.success() {
            task.append_output(&format!("[stderr]\n{}", outcome.stderr));
        }
        task.set_metric("exit_code", outcome.exit_code);
        task.set_metric("wall_clock_seconds", outcome.wall_clock_seconds());
        task.set_metric("timed_out", outcome.timed_out);
        if outcome.stdout_truncated || outcome.stderr_truncated {
            task.set_metric("output_truncated", true);
        }
        if let Some(tokens) = parsed.tokens {
            task.set_metric("tokens", tokens);
            self.counters.tokens.fetch_add(tokens, Ordering::Relaxed);
        }

        for d in &parsed.discoveries {
            self.bus.publish(Discovery::new(self.name(), &d.kind, d.payload.clone()));
        }
        for path in &parsed.artifacts {
            task.add_artifact(path.clone());
            self.bus.publish(Discovery::new(
                self.name(),
                discovery_kind::FILE_MODIFIED,
                json!({ "path": path, "task_id": task.id }),
            ));
        }
    }

    fn finish(&self, task: &Task, ok: bool, parsed: Option<&ParsedOutput>) {
        let summary = parsed.map(|p| p.summary.as_str()).unwrap_or("");
        if ok {
            self.counters.completed.fetch_add(1, Ordering::Relaxed);
            self.bus.publish(Discovery::new(
                self.name(),
                discovery_kind::TASK_COMPLETED,
                json!({ "task_id": task.id, "title": task.title, "summary": summary }),
            ));
            info!(task_id = %task.id, agent = %self.name(), hours = ?task.actual_hours, "task completed");
        } else {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            self.publish_failure(task);
            warn!(task_id = %task.id, agent = %self.name(), error = ?task.error, "task failed");
        }
    }

    /// Re-file a task this agent finished successfully as failed, after a
    /// later step (merging its branch) rejected it. Moves one count from
    /// completed to failed and publishes a superseding `task_failed`.
    pub fn retract_completion(&self, task: &Task) {
        self.counters
            .completed
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .ok();
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        self.publish_failure(task);
        warn!(task_id = %task.id, agent = %self.name(), error = ?task.error, "completion retracted");
    }

    fn publish_failure(&self, task: &Task) {
        self.bus.publish(Discovery::new(
            self.name(),
            discovery_kind::TASK_FAILED,
            json!({
                "task_id": task.id,
                "title": task.title,
                "reason": task.failure_reason.map(|r| r.to_string()),
                "error": task.error,
            }),
        ));
    }
}

/// A relative task directory is resolved inside the execution directory.
fn resolve_dir(exec_dir: Option<&Path>, task_dir: Option<&Path>) -> Option<PathBuf> {
    match (exec_dir, task_dir) {
        (_, Some(t)) if t.is_absolute() => Some(t.to_path_buf()),
        (Some(e), Some(t)) => Some(e.join(t)),
        (Some(e), None) => Some(e.to_path_buf()),
        (None, t) => t.map(Path::to_path_buf),
    }
}

fn simulated_outcome(task: &Task, record: &AgentRecord) -> RunOutcome {
    debug!(task_id = %task.id, agent = %record.name, "simulating execution");
    RunOutcome {
        exit_code: 0,
        stdout: format!("[simulated] {} completed '{}'", record.name, task.title),
        stderr: String::new(),
        wall_clock: Duration::ZERO,
        timed_out: false,
        cancelled: false,
        stdout_truncated: false,
        stderr_truncated: false,
    }
}

fn last_line(text: &str) -> Option<String> {
    text.lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
}

/// One agent per enabled role, in roster order.
pub fn roster_from_config(
    config: &Config,
    runner: Arc<dyn CommandRunner>,
    bus: Arc<KnowledgeBus>,
    arsenal: Arc<Arsenal>,
) -> Vec<Arc<Agent>> {
    let settings = AgentSettings::from_config(config);
    config
        .agents
        .enabled_roles()
        .into_iter()
        .map(|role| {
            let record = AgentRecord::for_role(role, config.agents.toggle(role).name.as_deref());
            Arc::new(Agent::new(
                record,
                Arc::clone(&runner),
                Arc::clone(&bus),
                Arc::clone(&arsenal),
                settings.clone(),
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_task_dir_resolves_inside_worktree() {
        assert_eq!(
            resolve_dir(Some(Path::new("/wt")), Some(Path::new("sub"))),
            Some(PathBuf::from("/wt/sub"))
        );
        assert_eq!(
            resolve_dir(Some(Path::new("/wt")), Some(Path::new("/abs"))),
            Some(PathBuf::from("/abs"))
        );
        assert_eq!(resolve_dir(None, None), None);
    }

    #[test]
    fn record_defaults_name_to_role() {
        let record = AgentRecord::for_role(AgentRole::Devops, None);
        assert_eq!(record.name, "devops");
        let named = AgentRecord::for_role(AgentRole::Devops, Some("Dana"));
        assert!(named.preamble().starts_with("You are Dana"));
    }
}
