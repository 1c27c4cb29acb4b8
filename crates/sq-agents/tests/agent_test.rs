//! Agent execution against scripted and real runners.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use sq_agents::agent::{Agent, AgentRecord, AgentSettings, ExecutionContext};
use sq_agents::arsenal::Arsenal;
use sq_agents::knowledge::KnowledgeBus;
use sq_agents::runner::{
    CommandRunner, ProcessRunner, Result as RunResult, RunOutcome, RunRequest, RunnerError,
};
use sq_core::cancel::CancelToken;
use sq_core::types::{
    discovery_kind, AgentRole, FailureReason, Task, TaskPriority, TaskStatus, TaskType,
};

// ---------------------------------------------------------------------------
// Scripted runner
// ---------------------------------------------------------------------------

/// Records requests and answers with a fixed outcome.
struct ScriptedRunner {
    outcome: Option<RunOutcome>,
    requests: Mutex<Vec<RunRequest>>,
}

impl ScriptedRunner {
    fn replying(stdout: &str, exit_code: i32) -> Self {
        Self {
            outcome: Some(RunOutcome {
                exit_code,
                stdout: stdout.to_string(),
                stderr: String::new(),
                wall_clock: Duration::from_millis(5),
                timed_out: false,
                cancelled: false,
                stdout_truncated: false,
                stderr_truncated: false,
            }),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn failing_to_spawn() -> Self {
        Self {
            outcome: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    fn requests(&self) -> Vec<RunRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, request: RunRequest, _cancel: &CancelToken) -> RunResult<RunOutcome> {
        let program = request.program().to_string();
        self.requests.lock().unwrap().push(request);
        self.outcome.clone().ok_or_else(|| RunnerError::Spawn {
            program,
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn agent_with(runner: Arc<dyn CommandRunner>, bus: Arc<KnowledgeBus>, settings: AgentSettings) -> Agent {
    Agent::new(
        AgentRecord::for_role(AgentRole::Architect, None),
        runner,
        bus,
        Arc::new(Arsenal::probe_with(|t| t == "rg" || t == "ls")),
        settings,
    )
}

fn real_settings() -> AgentSettings {
    AgentSettings {
        use_real_agents: true,
        ..AgentSettings::default()
    }
}

fn task() -> Task {
    Task::new("Search for the API handler", TaskType::Development, TaskPriority::Medium)
}

// ---------------------------------------------------------------------------
// CLI path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cli_invocation_shape() {
    let runner = Arc::new(ScriptedRunner::replying("ok", 0));
    let bus = Arc::new(KnowledgeBus::in_memory());
    let agent = agent_with(runner.clone(), bus, real_settings());
    let mut task = task();

    assert!(agent.execute(&mut task, &ExecutionContext::new(CancelToken::new()).in_dir("/wt")).await);

    let req = &runner.requests()[0];
    assert_eq!(
        req.argv[..5],
        ["claude", "--print", "--dangerously-skip-permissions", "--max-turns", "10"]
    );
    let prompt = req.argv.last().unwrap();
    assert!(prompt.contains("Search for the API handler"));
    assert!(prompt.contains("- search: rg"));
    assert_eq!(req.working_dir.as_deref(), Some(std::path::Path::new("/wt")));
    assert_eq!(req.timeout, Duration::from_secs(600));
}

#[tokio::test]
async fn success_publishes_discoveries_and_artifacts() {
    let stdout = r#"Implemented it.
{"summary": "added handler", "artifacts": ["src/api.rs"], "discoveries": [{"kind": "decision", "payload": "axum"}], "tokens": 42}"#;
    let runner = Arc::new(ScriptedRunner::replying(stdout, 0));
    let bus = Arc::new(KnowledgeBus::in_memory());
    let agent = agent_with(runner, bus.clone(), real_settings());
    let mut task = task();

    assert!(agent.execute(&mut task, &ExecutionContext::default()).await);
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.progress, 100);
    assert!(task.actual_hours.is_some());
    assert!(task.started_at <= task.completed_at);
    assert_eq!(task.artifacts, vec!["src/api.rs"]);
    assert!(task.output.contains("Implemented it."));

    assert_eq!(bus.by_agent_kind("architect", "decision").len(), 1);
    assert_eq!(bus.files_modified(), vec!["src/api.rs"]);
    let done = bus.by_agent_kind("architect", discovery_kind::TASK_COMPLETED);
    assert_eq!(done[0].payload["summary"], "added handler");

    let stats = agent.stats();
    assert_eq!(stats.tasks_completed, 1);
    assert_eq!(stats.tokens_observed, 42);
}

#[tokio::test]
async fn nonzero_exit_fails_the_task() {
    let runner = Arc::new(ScriptedRunner::replying("boom", 2));
    let bus = Arc::new(KnowledgeBus::in_memory());
    let agent = agent_with(runner, bus.clone(), real_settings());
    let mut task = task();

    assert!(!agent.execute(&mut task, &ExecutionContext::default()).await);
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.failure_reason, Some(FailureReason::NonZeroExit));
    assert_eq!(task.error.as_deref(), Some("exit code 2: boom"));
    assert_eq!(agent.stats().tasks_failed, 1);
    assert_eq!(bus.by_agent_kind("architect", discovery_kind::TASK_FAILED).len(), 1);
}

#[tokio::test]
async fn retracted_completion_counts_as_failure() {
    let runner = Arc::new(ScriptedRunner::replying("ok", 0));
    let bus = Arc::new(KnowledgeBus::in_memory());
    let agent = agent_with(runner, bus.clone(), real_settings());
    let mut task = task();
    assert!(agent.execute(&mut task, &ExecutionContext::default()).await);

    task.mark_failed(FailureReason::MergeConflict, "merge conflict in: src/api.rs");
    agent.retract_completion(&task);

    let stats = agent.stats();
    assert_eq!(stats.tasks_completed, 0);
    assert_eq!(stats.tasks_failed, 1);
    let failed = bus.by_agent_kind("architect", discovery_kind::TASK_FAILED);
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].payload["error"], "merge conflict in: src/api.rs");
    // The earlier completion stays in the log; the failure supersedes it.
    assert_eq!(bus.by_agent_kind("architect", discovery_kind::TASK_COMPLETED).len(), 1);
}

#[tokio::test]
async fn spawn_failure_fails_the_task() {
    let runner = Arc::new(ScriptedRunner::failing_to_spawn());
    let agent = agent_with(runner, Arc::new(KnowledgeBus::in_memory()), real_settings());
    let mut task = task();
    assert!(!agent.execute(&mut task, &ExecutionContext::default()).await);
    assert_eq!(task.failure_reason, Some(FailureReason::SpawnFailed));
}

#[tokio::test]
async fn simulation_skips_the_runner() {
    let runner = Arc::new(ScriptedRunner::failing_to_spawn());
    let settings = AgentSettings {
        use_real_agents: false,
        ..AgentSettings::default()
    };
    let agent = agent_with(runner.clone(), Arc::new(KnowledgeBus::in_memory()), settings);
    let mut task = task();
    assert!(agent.execute(&mut task, &ExecutionContext::default()).await);
    assert!(runner.requests().is_empty());
    assert!(task.output.starts_with("[simulated]"));
}

#[tokio::test]
async fn digest_includes_other_agents_only() {
    let runner = Arc::new(ScriptedRunner::replying("ok", 0));
    let bus = Arc::new(KnowledgeBus::in_memory());
    bus.publish(sq_core::types::Discovery::new("qa", "decision", serde_json::json!("use pytest")));
    bus.publish(sq_core::types::Discovery::new("architect", "decision", serde_json::json!("mine")));
    let agent = agent_with(runner.clone(), bus, real_settings());
    let mut task = task();
    agent.execute(&mut task, &ExecutionContext::default()).await;

    let prompt = runner.requests()[0].argv.last().unwrap().clone();
    assert!(prompt.contains("[qa] decision: use pytest"));
    assert!(!prompt.contains("mine"));
}

// ---------------------------------------------------------------------------
// Command path with the real runner
// ---------------------------------------------------------------------------

#[tokio::test]
async fn command_task_runs_in_working_dir() {
    let dir = tempfile::tempdir().unwrap();
    let agent = agent_with(
        Arc::new(ProcessRunner::new()),
        Arc::new(KnowledgeBus::in_memory()),
        AgentSettings::default(),
    );
    let mut task = Task::new("write file", TaskType::Development, TaskPriority::Low)
        .with_command("echo \"$VALUE\" > out.txt && echo wrote")
        .with_env("VALUE", "42");

    let ctx = ExecutionContext::new(CancelToken::new()).in_dir(dir.path());
    assert!(agent.execute(&mut task, &ctx).await);
    assert_eq!(std::fs::read_to_string(dir.path().join("out.txt")).unwrap(), "42\n");
    assert_eq!(task.output.trim(), "wrote");
    assert_eq!(task.metrics["exit_code"], 0);
}

#[tokio::test]
async fn command_timeout_sets_reason() {
    let settings = AgentSettings {
        timeout: Duration::from_millis(200),
        ..AgentSettings::default()
    };
    let agent = agent_with(
        Arc::new(ProcessRunner::new().with_grace(Duration::from_millis(200))),
        Arc::new(KnowledgeBus::in_memory()),
        settings,
    );
    let mut task = Task::new("slow", TaskType::Development, TaskPriority::Low).with_command("sleep 30");
    assert!(!agent.execute(&mut task, &ExecutionContext::default()).await);
    assert_eq!(task.failure_reason, Some(FailureReason::Timeout));
    assert_eq!(task.error.as_deref(), Some("timeout"));
    assert_eq!(task.metrics["timed_out"], true);
}
