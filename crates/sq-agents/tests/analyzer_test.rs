//! TaskAnalyzer with a scripted planner.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sq_agents::analyzer::{fallback_plan, AnalyzerSettings, TaskAnalyzer};
use sq_agents::runner::{CommandRunner, Result as RunResult, RunOutcome, RunRequest};
use sq_core::cancel::CancelToken;
use sq_core::plan::PlanSource;
use sq_core::types::AgentRole;

struct PlannerStub {
    stdout: String,
    timed_out: bool,
    calls: AtomicUsize,
    last_argv: std::sync::Mutex<Vec<String>>,
}

impl PlannerStub {
    fn new(stdout: &str) -> Self {
        Self {
            stdout: stdout.to_string(),
            timed_out: false,
            calls: AtomicUsize::new(0),
            last_argv: std::sync::Mutex::new(Vec::new()),
        }
    }
}

#[async_trait::async_trait]
impl CommandRunner for PlannerStub {
    async fn run(&self, request: RunRequest, _cancel: &CancelToken) -> RunResult<RunOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_argv.lock().unwrap() = request.argv.clone();
        Ok(RunOutcome {
            exit_code: if self.timed_out { 143 } else { 0 },
            stdout: self.stdout.clone(),
            stderr: String::new(),
            wall_clock: Duration::from_millis(1),
            timed_out: self.timed_out,
            cancelled: false,
            stdout_truncated: false,
            stderr_truncated: false,
        })
    }
}

fn settings(real: bool) -> AnalyzerSettings {
    AnalyzerSettings {
        program: "claude".into(),
        max_turns: 1,
        extra_args: Vec::new(),
        timeout: Duration::from_secs(30),
        use_real_agents: real,
    }
}

const GOOD: &str = r#"{"main_goal": "Ship it", "complexity": "medium", "tasks": [
  {"title": "Build", "description": "b", "type": "dev", "priority": 5, "assigned_to": "devops", "estimated_hours": 1, "dependencies": []},
  {"title": "Verify", "description": "v", "type": "testing", "priority": 2, "assigned_to": "qa", "estimated_hours": 0.5, "dependencies": [1]}
]}"#;

#[tokio::test]
async fn planner_output_becomes_plan() {
    let stub = Arc::new(PlannerStub::new(GOOD));
    let analyzer = TaskAnalyzer::new(stub.clone(), settings(true));
    let plan = analyzer.analyze("ship it", &CancelToken::new()).await;

    assert_eq!(plan.source, PlanSource::Planner);
    assert_eq!(plan.children().len(), 2);
    assert_eq!(plan.children()[0].assigned_to, Some(AgentRole::Devops));
    assert_eq!(plan.children()[1].depends_on, vec![plan.children()[0].id]);
    let argv = stub.last_argv.lock().unwrap().clone();
    assert_eq!(argv[3..5], ["--max-turns", "1"]);
    assert!(argv.last().unwrap().contains("Request: ship it"));
}

#[tokio::test]
async fn identical_requests_hit_the_cache() {
    let stub = Arc::new(PlannerStub::new(GOOD));
    let analyzer = TaskAnalyzer::new(stub.clone(), settings(true));
    let a = analyzer.analyze("same", &CancelToken::new()).await;
    let b = analyzer.analyze("same", &CancelToken::new()).await;
    assert_eq!(stub.calls.load(Ordering::SeqCst), 1);
    assert_eq!(a.root_id(), b.root_id());
}

#[tokio::test]
async fn garbage_output_falls_back() {
    let stub = Arc::new(PlannerStub::new("I'd rather not."));
    let analyzer = TaskAnalyzer::new(stub, settings(true));
    let plan = analyzer.analyze("build a frontend dashboard", &CancelToken::new()).await;
    assert_eq!(plan.source, PlanSource::Fallback);
    let expected = fallback_plan("build a frontend dashboard");
    let titles = |p: &sq_core::plan::Plan| p.tasks.iter().map(|t| (t.id, t.title.clone())).collect::<Vec<_>>();
    assert_eq!(titles(&plan), titles(&expected));
}

#[tokio::test]
async fn timeout_falls_back() {
    let mut stub = PlannerStub::new(GOOD);
    stub.timed_out = true;
    let analyzer = TaskAnalyzer::new(Arc::new(stub), settings(true));
    let plan = analyzer.analyze("an api server", &CancelToken::new()).await;
    assert_eq!(plan.source, PlanSource::Fallback);
    assert_eq!(plan.children()[0].title, "Design API structure");
}

#[tokio::test]
async fn simulation_mode_never_calls_the_planner() {
    let stub = Arc::new(PlannerStub::new(GOOD));
    let analyzer = TaskAnalyzer::new(stub.clone(), settings(false));
    let plan = analyzer.analyze("anything", &CancelToken::new()).await;
    assert_eq!(stub.calls.load(Ordering::SeqCst), 0);
    assert_eq!(plan.source, PlanSource::Fallback);
    assert_eq!(plan.children()[0].title, "Analyze requirements");
}
