//! End-to-end runs through the engine with real `sh` subprocesses.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sq_agents::arsenal::Arsenal;
use sq_agents::runner::ProcessRunner;
use sq_core::config::{Config, PathsConfig};
use sq_core::environment::RuntimeEnv;
use sq_core::plan::{Plan, PlanSource};
use sq_core::status::{read_snapshot, AgentStatus, StatusSnapshot};
use sq_core::types::{ExecutionModeKind, FailureReason, Task, TaskPriority, TaskStatus, TaskType};
use sq_engine::coordinator::CoordinatorError;
use sq_engine::{Engine, EngineError, RunOutcome};
use tempfile::TempDir;

// ===========================================================================
// Helpers
// ===========================================================================

struct Harness {
    _state: TempDir,
    work: TempDir,
    engine: Engine,
}

impl Harness {
    fn new(mode: ExecutionModeKind) -> Self {
        Self::with(mode, |_| {})
    }

    fn with(mode: ExecutionModeKind, tweak: impl FnOnce(&mut Config)) -> Self {
        let work = tempfile::tempdir().unwrap();
        Self::in_dir(work, mode, tweak)
    }

    fn in_dir(work: TempDir, mode: ExecutionModeKind, tweak: impl FnOnce(&mut Config)) -> Self {
        let state = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.paths = PathsConfig::rooted_at(state.path());
        config.execution.default_mode = mode;
        config.execution.use_real_agents = false;
        tweak(&mut config);
        let engine = Engine::with_parts(
            config,
            RuntimeEnv::local("e2e", state.path()),
            work.path(),
            Arc::new(ProcessRunner::new().with_grace(Duration::from_millis(200))),
            Arc::new(Arsenal::empty()),
        )
        .unwrap();
        Self {
            _state: state,
            work,
            engine,
        }
    }

    fn work(&self) -> &Path {
        self.work.path()
    }

    fn read(&self, name: &str) -> String {
        std::fs::read_to_string(self.work().join(name)).unwrap_or_default()
    }
}

fn cmd(title: &str, command: &str) -> Task {
    Task::new(title, TaskType::Development, TaskPriority::Medium).with_command(command)
}

fn plan(tasks: Vec<Task>) -> Plan {
    Plan::from_tasks("e2e request", "End to end", tasks, PlanSource::Manual)
}

fn git(dir: &Path, args: &[&str]) -> Option<String> {
    let out = Command::new("git").args(args).current_dir(dir).output().ok()?;
    out.status
        .success()
        .then(|| String::from_utf8_lossy(&out.stdout).trim().to_string())
}

/// A repository with one commit, or `None` when git is unavailable.
fn init_repo() -> Option<TempDir> {
    let dir = tempfile::tempdir().unwrap();
    git(dir.path(), &["init", "-q"])?;
    git(dir.path(), &["config", "user.email", "e2e@example.com"])?;
    git(dir.path(), &["config", "user.name", "e2e"])?;
    std::fs::write(dir.path().join("README.md"), "seed\n").unwrap();
    git(dir.path(), &["add", "-A"])?;
    git(dir.path(), &["commit", "-q", "-m", "init"])?;
    Some(dir)
}

fn worktree_of(task: &Task) -> PathBuf {
    PathBuf::from(task.metadata["worktree"].as_str().unwrap())
}

// ===========================================================================
// Single task
// ===========================================================================

#[tokio::test]
async fn trivial_fast_task_completes() {
    let h = Harness::new(ExecutionModeKind::Fast);
    let report = h
        .engine
        .run_plan(plan(vec![cmd("say hello", "echo hello > hello.txt")]), None)
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Success);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.mode, ExecutionModeKind::Fast);
    assert_eq!(report.stats.completed, 1);
    assert_eq!(report.root.status, TaskStatus::Completed);
    assert_eq!(report.tasks[0].progress, 100);
    assert_eq!(h.read("hello.txt"), "hello\n");

    let snapshot = read_snapshot(&h.engine.paths().status_file).unwrap();
    assert_eq!(snapshot.stats.completed, 1);
    assert_eq!(snapshot.stats.in_progress, 0);
    assert_eq!(snapshot.mode.as_deref(), Some("fast"));
    assert_eq!(snapshot.instance_id, "e2e");

    let reports: Vec<_> = std::fs::read_dir(&h.engine.paths().reports_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].starts_with("session-e2e-"));
    assert!(h.engine.paths().knowledge_file.exists());
}

#[tokio::test]
async fn empty_plan_succeeds_immediately() {
    let h = Harness::new(ExecutionModeKind::Safe);
    let report = h.engine.run_plan(plan(Vec::new()), None).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Success);
    assert_eq!(report.root.status, TaskStatus::Completed);
    assert_eq!(report.stats.total, 0);
}

#[tokio::test]
async fn relative_working_dir_resolves_inside_workdir() {
    let h = Harness::new(ExecutionModeKind::Fast);
    std::fs::create_dir(h.work().join("sub")).unwrap();
    let task = cmd("nested", "echo hi > here.txt").with_working_dir("sub");
    let report = h.engine.run_plan(plan(vec![task]), None).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Success);
    assert_eq!(h.read("sub/here.txt"), "hi\n");
}

// ===========================================================================
// Ordering and parallelism
// ===========================================================================

#[tokio::test]
async fn dependency_chain_runs_in_order() {
    let h = Harness::new(ExecutionModeKind::Parallel);
    let a = cmd("A", "sleep 0.1; echo A >> order.txt");
    let b = cmd("B", "sleep 0.1; echo B >> order.txt").depends_on(a.id);
    let c = cmd("C", "sleep 0.1; echo C >> order.txt").depends_on(b.id);

    let started = Instant::now();
    let report = h.engine.run_plan(plan(vec![c, a, b]), None).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Success);
    assert_eq!(h.read("order.txt"), "A\nB\nC\n");
    assert!(started.elapsed() >= Duration::from_millis(300));
    for task in &report.tasks {
        for dep in &task.depends_on {
            let dep = report.task(*dep).unwrap();
            assert!(dep.completed_at <= task.started_at);
        }
    }
}

#[tokio::test]
async fn parallel_width_caps_concurrency() {
    let h = Harness::with(ExecutionModeKind::Parallel, |c| c.execution.max_agents = 2);
    let tasks = (0..4).map(|i| cmd(&format!("t{i}"), "sleep 0.3")).collect();

    let started = Instant::now();
    let report = h.engine.run_plan(plan(tasks), None).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(report.outcome, RunOutcome::Success);
    assert!(elapsed >= Duration::from_millis(600), "ran too wide: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1200), "ran too narrow: {elapsed:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn status_snapshot_is_valid_json_while_running() {
    let h = Harness::with(ExecutionModeKind::Parallel, |c| c.execution.max_agents = 2);
    let path = h.engine.paths().status_file.clone();
    let stop = Arc::new(AtomicBool::new(false));

    let watcher = {
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            let (mut reads, mut max_running, mut saw_active) = (0usize, 0usize, false);
            while !stop.load(Ordering::SeqCst) {
                if let Ok(bytes) = std::fs::read(&path) {
                    let snapshot: StatusSnapshot = serde_json::from_slice(&bytes)
                        .unwrap_or_else(|e| panic!("torn snapshot after {reads} reads: {e}"));
                    reads += 1;
                    max_running = max_running.max(snapshot.stats.in_progress);
                    saw_active |= snapshot
                        .agents
                        .values()
                        .any(|a| a.status == AgentStatus::Active && a.current_task.is_some());
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            (reads, max_running, saw_active)
        })
    };

    let tasks = (0..4).map(|i| cmd(&format!("s{i}"), "sleep 0.3")).collect();
    let report = h.engine.run_plan(plan(tasks), None).await.unwrap();
    stop.store(true, Ordering::SeqCst);
    let (reads, max_running, saw_active) = watcher.await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Success);
    assert!(reads > 10, "only {reads} snapshot reads");
    assert!(max_running >= 1, "never observed a running task");
    assert!(max_running <= 2, "{max_running} tasks running at width 2");
    assert!(saw_active);
    let last = read_snapshot(&h.engine.paths().status_file).unwrap();
    assert_eq!(last.stats.completed, 4);
    assert_eq!(last.stats.in_progress, 0);
}

#[tokio::test]
async fn dispatch_follows_priority_then_downstream_count() {
    let h = Harness::new(ExecutionModeKind::Fast);
    let low = Task::new("low", TaskType::Development, TaskPriority::Low)
        .with_command("echo low >> order.txt");
    let critical = Task::new("critical", TaskType::Development, TaskPriority::Critical)
        .with_command("echo critical >> order.txt");
    let x = cmd("x", "echo x >> order.txt");
    let y = cmd("y", "echo y >> order.txt");
    let z = cmd("z", "echo z >> order.txt").depends_on(y.id);

    let report = h
        .engine
        .run_plan(plan(vec![low, x, y, z, critical]), None)
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Success);
    assert_eq!(h.read("order.txt"), "critical\ny\nx\nz\nlow\n");
}

// ===========================================================================
// Failure paths
// ===========================================================================

#[tokio::test]
async fn failure_blocks_dependents_only() {
    let h = Harness::new(ExecutionModeKind::Parallel);
    let a = cmd("A", "exit 3");
    let b = cmd("B", "echo b > b.txt").depends_on(a.id);
    let c = cmd("C", "echo c > c.txt");
    let (a_id, b_id, c_id) = (a.id, b.id, c.id);

    let report = h.engine.run_plan(plan(vec![a, b, c]), None).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Failed);
    assert_eq!(report.exit_code(), 1);
    let a = report.task(a_id).unwrap();
    assert_eq!(a.status, TaskStatus::Failed);
    assert_eq!(a.failure_reason, Some(FailureReason::NonZeroExit));
    assert_eq!(report.task(b_id).unwrap().status, TaskStatus::Blocked);
    assert_eq!(report.task(c_id).unwrap().status, TaskStatus::Completed);
    assert_eq!(report.root.status, TaskStatus::Failed);
    assert!(!h.work().join("b.txt").exists());
    assert_eq!(h.read("c.txt"), "c\n");
}

#[tokio::test]
async fn task_timeout_fails_with_reason() {
    let h = Harness::with(ExecutionModeKind::Fast, |c| c.timeouts.task_seconds = 1);
    let started = Instant::now();
    let report = h
        .engine
        .run_plan(plan(vec![cmd("slow", "sleep 30")]), None)
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(report.outcome, RunOutcome::Failed);
    let task = &report.tasks[0];
    assert_eq!(task.failure_reason, Some(FailureReason::Timeout));
    assert_eq!(task.error.as_deref(), Some("timeout"));
}

#[tokio::test]
async fn cancellation_stops_running_and_pending_tasks() {
    let h = Harness::new(ExecutionModeKind::Fast);
    let a = cmd("A", "sleep 30");
    let b = cmd("B", "echo b > b.txt").depends_on(a.id);
    let token = h.engine.cancel_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        token.cancel();
    });

    let started = Instant::now();
    let report = h.engine.run_plan(plan(vec![a, b]), None).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert_eq!(report.exit_code(), 130);
    assert_eq!(report.count(TaskStatus::Cancelled), 2);
    assert_eq!(report.root.status, TaskStatus::Cancelled);
    assert!(!h.work().join("b.txt").exists());
}

#[tokio::test]
async fn invalid_plan_aborts() {
    let h = Harness::new(ExecutionModeKind::Fast);
    let orphan = cmd("orphan", "true").depends_on(uuid::Uuid::new_v4());
    let err = h.engine.run_plan(plan(vec![orphan]), None).await.unwrap_err();
    assert!(matches!(err, EngineError::Coordinator(CoordinatorError::Plan(_))));
}

// ===========================================================================
// Planning
// ===========================================================================

#[tokio::test]
async fn fallback_plan_is_deterministic() {
    let first = Harness::new(ExecutionModeKind::Auto);
    let second = Harness::new(ExecutionModeKind::Auto);
    let a = first.engine.plan("build a REST api server").await;
    let b = second.engine.plan("build a REST api server").await;

    assert_eq!(a.source, PlanSource::Fallback);
    assert_eq!(a.children().len(), 5);
    let shape = |p: &Plan| {
        p.tasks
            .iter()
            .map(|t| (t.id, t.title.clone(), t.depends_on.clone()))
            .collect::<Vec<_>>()
    };
    assert_eq!(shape(&a), shape(&b));
    // Siblings under the root: nothing orders one subtask after another.
    assert!(a.children().iter().all(|t| t.depends_on.is_empty()));
    // Six estimated hours still resolve auto to safe.
    assert_eq!(first.engine.select_mode(&a, None), ExecutionModeKind::Safe);
    assert_eq!(
        first.engine.select_mode(&a, Some(ExecutionModeKind::Fast)),
        ExecutionModeKind::Fast
    );
}

#[tokio::test]
async fn simulated_request_runs_end_to_end() {
    let h = Harness::new(ExecutionModeKind::Auto);
    let report = h.engine.run_request("tidy the docs", None).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Success);
    assert_eq!(report.mode, ExecutionModeKind::Safe);
    assert_eq!(report.stats.completed, 5);
    assert!(report.tasks.iter().all(|t| t.output.starts_with("[simulated]")));
    assert!(report.tasks.iter().all(|t| t.depends_on.is_empty()));
}

// ===========================================================================
// Worktree isolation (skipped without git)
// ===========================================================================

#[tokio::test]
async fn parallel_tasks_get_their_own_worktrees() {
    let Some(repo) = init_repo() else {
        eprintln!("git unavailable; skipping");
        return;
    };
    let h = Harness::in_dir(repo, ExecutionModeKind::Parallel, |c| {
        c.execution.max_agents = 2;
        c.execution.auto_merge = false;
        c.execution.keep_worktrees = true;
    });
    assert!(h.engine.has_git());
    let a = cmd("write a", "echo a > out.txt");
    let b = cmd("write b", "echo b > out.txt");
    let (a_id, b_id) = (a.id, b.id);

    let report = h.engine.run_plan(plan(vec![a, b]), None).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Success);
    assert!(!h.work().join("out.txt").exists());
    let a = report.task(a_id).unwrap();
    let b = report.task(b_id).unwrap();
    assert_ne!(worktree_of(a), worktree_of(b));
    assert_eq!(std::fs::read_to_string(worktree_of(a).join("out.txt")).unwrap(), "a\n");
    assert_eq!(std::fs::read_to_string(worktree_of(b).join("out.txt")).unwrap(), "b\n");
    let branch = a.metadata["branch"].as_str().unwrap();
    assert!(branch.starts_with("squadron/"));
    assert!(git(h.work(), &["rev-parse", "--verify", branch]).is_some());
}

#[tokio::test]
async fn safe_mode_merges_back_and_cleans_up() {
    let Some(repo) = init_repo() else {
        eprintln!("git unavailable; skipping");
        return;
    };
    let h = Harness::in_dir(repo, ExecutionModeKind::Safe, |_| {});
    let task = cmd("add file", "echo merged > merged.txt");
    let report = h.engine.run_plan(plan(vec![task]), None).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Success);
    assert_eq!(h.read("merged.txt"), "merged\n");
    let task = &report.tasks[0];
    assert!(!worktree_of(task).exists());
    let branch = task.metadata["branch"].as_str().unwrap();
    assert!(git(h.work(), &["rev-parse", "--verify", branch]).is_none());
}

#[tokio::test]
async fn conflicting_merge_fails_the_later_task() {
    let Some(repo) = init_repo() else {
        eprintln!("git unavailable; skipping");
        return;
    };
    let h = Harness::in_dir(repo, ExecutionModeKind::Parallel, |c| c.execution.max_agents = 2);
    let a = cmd("first", "sleep 0.5; echo one > clash.txt");
    let b = cmd("second", "sleep 0.5; echo two > clash.txt");

    let report = h.engine.run_plan(plan(vec![a, b]), None).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Failed);
    assert_eq!(report.count(TaskStatus::Completed), 1);
    let loser = report
        .tasks
        .iter()
        .find(|t| t.status == TaskStatus::Failed)
        .unwrap();
    assert_eq!(loser.failure_reason, Some(FailureReason::MergeConflict));
    assert!(loser.error.as_deref().unwrap().contains("clash.txt"));
    // The conflicting branch survives for manual resolution.
    let branch = loser.metadata["branch"].as_str().unwrap();
    assert!(git(h.work(), &["rev-parse", "--verify", branch]).is_some());
}
