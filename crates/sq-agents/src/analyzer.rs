//! Request decomposition.
//!
//! [`TaskAnalyzer::analyze`] asks the agent CLI for a JSON plan. Anything
//! other than a schema-conforming, acyclic plan falls back to a fixed
//! keyword-selected plan, so analysis always yields something runnable.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use sq_core::cancel::CancelToken;
use sq_core::config::Config;
use sq_core::plan::{truncate_chars, Complexity, Plan, PlanSource};
use sq_core::types::{AgentRole, ExecutionModeKind, Task, TaskPriority, TaskType};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::output::json_object_spans;
use crate::runner::{CommandRunner, RunRequest};

/// Plans with more tasks than this run in safe mode under `auto`.
pub const AUTO_SAFE_TASK_THRESHOLD: usize = 10;
/// Plans estimated under this many hours run in fast mode under `auto`.
pub const AUTO_FAST_HOURS: f64 = 2.0;

const ID_NAMESPACE: Uuid = Uuid::NAMESPACE_OID;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq)]
pub enum PlanningError {
    #[error("planning disabled")]
    Disabled,
    #[error("planner could not be started: {0}")]
    Spawn(String),
    #[error("planner timed out")]
    Timeout,
    #[error("planner cancelled")]
    Cancelled,
    #[error("planner exited with code {0}")]
    Exit(i32),
    #[error("no JSON object in planner output")]
    NoJson,
    #[error("plan does not match schema: {0}")]
    Schema(String),
    #[error("plan dependencies form a cycle")]
    Cycle,
}

pub type Result<T> = std::result::Result<T, PlanningError>;

// ---------------------------------------------------------------------------
// Draft plan
// ---------------------------------------------------------------------------

/// A validated plan before ids are assigned.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanDraft {
    pub main_goal: String,
    pub complexity: Complexity,
    pub tasks: Vec<DraftTask>,
    pub execution_mode: Option<ExecutionModeKind>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DraftTask {
    pub title: String,
    pub description: String,
    pub task_type: TaskType,
    pub priority: TaskPriority,
    pub assigned_to: Option<AgentRole>,
    pub estimated_hours: f64,
    /// 1-based positions of prerequisite tasks.
    pub dependencies: Vec<usize>,
    pub tags: Vec<String>,
}

impl PlanDraft {
    /// Assign ids derived from `request`, so equal inputs give equal plans.
    pub fn into_plan(self, request: &str, source: PlanSource) -> Plan {
        let id_for = |index: usize| {
            Uuid::new_v5(&ID_NAMESPACE, format!("squadron:{request}:{index}").as_bytes())
        };
        let ids: Vec<Uuid> = (1..=self.tasks.len()).map(id_for).collect();
        let children = self
            .tasks
            .into_iter()
            .enumerate()
            .map(|(i, draft)| {
                let mut task = Task::with_id(ids[i], draft.title, draft.task_type, draft.priority)
                    .with_description(draft.description)
                    .with_estimate(draft.estimated_hours)
                    .with_tags(draft.tags);
                task.assigned_to = draft.assigned_to;
                for dep in draft.dependencies {
                    task = task.depends_on(ids[dep - 1]);
                }
                task
            })
            .collect();

        let mut plan =
            Plan::from_tasks_with_root_id(id_for(0), request, self.main_goal, children, source)
                .with_complexity(self.complexity);
        plan.id = Uuid::new_v5(&ID_NAMESPACE, format!("squadron-plan:{request}").as_bytes());
        plan.execution_mode = self.execution_mode;
        plan.notes = self.notes;
        plan
    }

    fn check_dependencies(&self) -> Result<()> {
        let n = self.tasks.len();
        for (i, task) in self.tasks.iter().enumerate() {
            for &dep in &task.dependencies {
                if dep == 0 || dep > n {
                    return Err(PlanningError::Schema(format!(
                        "task {} depends on unknown index {dep}",
                        i + 1
                    )));
                }
                if dep == i + 1 {
                    return Err(PlanningError::Cycle);
                }
            }
        }
        // Kahn over 1-based indices.
        let mut indegree: Vec<usize> = self.tasks.iter().map(|t| t.dependencies.len()).collect();
        let mut ready: Vec<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
        let mut seen = 0;
        while let Some(i) = ready.pop() {
            seen += 1;
            for (j, task) in self.tasks.iter().enumerate() {
                if task.dependencies.contains(&(i + 1)) {
                    indegree[j] -= 1;
                    if indegree[j] == 0 {
                        ready.push(j);
                    }
                }
            }
        }
        if seen == n {
            Ok(())
        } else {
            Err(PlanningError::Cycle)
        }
    }
}

// ---------------------------------------------------------------------------
// Planner response parsing
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct RawPlan {
    main_goal: String,
    #[serde(alias = "estimated_complexity")]
    complexity: String,
    tasks: Vec<RawTask>,
    #[serde(default)]
    execution_mode: Option<String>,
    #[serde(default)]
    notes: Option<Value>,
}

#[derive(Deserialize)]
struct RawTask {
    title: String,
    #[serde(default)]
    description: String,
    #[serde(rename = "type")]
    task_type: String,
    priority: i64,
    #[serde(default)]
    assigned_to: Option<String>,
    estimated_hours: f64,
    #[serde(default)]
    dependencies: Vec<usize>,
    #[serde(default)]
    tags: Vec<String>,
}

/// Parse planner output: the first embedded JSON object must match the
/// plan schema and describe an acyclic dependency graph.
pub fn parse_plan_response(text: &str) -> Result<PlanDraft> {
    let value = json_object_spans(text)
        .into_iter()
        .find_map(|span| match serde_json::from_str::<Value>(&text[span]) {
            Ok(v @ Value::Object(_)) => Some(v),
            _ => None,
        })
        .ok_or(PlanningError::NoJson)?;
    let raw: RawPlan =
        serde_json::from_value(value).map_err(|e| PlanningError::Schema(e.to_string()))?;

    if raw.main_goal.trim().is_empty() {
        return Err(PlanningError::Schema("main_goal is empty".into()));
    }
    if raw.tasks.is_empty() {
        return Err(PlanningError::Schema("plan has no tasks".into()));
    }
    let complexity = match raw.complexity.trim().to_lowercase().as_str() {
        "low" => Complexity::Low,
        "medium" => Complexity::Medium,
        "high" => Complexity::High,
        other => return Err(PlanningError::Schema(format!("unknown complexity: {other}"))),
    };
    let execution_mode = match raw.execution_mode.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(mode) => Some(
            mode.parse::<ExecutionModeKind>()
                .map_err(PlanningError::Schema)?,
        ),
    };
    let notes = match raw.notes {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    };

    let tasks = raw
        .tasks
        .into_iter()
        .map(draft_task)
        .collect::<Result<Vec<_>>>()?;
    let draft = PlanDraft {
        main_goal: raw.main_goal.trim().to_string(),
        complexity,
        tasks,
        execution_mode,
        notes,
    };
    draft.check_dependencies()?;
    Ok(draft)
}

fn draft_task(raw: RawTask) -> Result<DraftTask> {
    if raw.title.trim().is_empty() {
        return Err(PlanningError::Schema("task title is empty".into()));
    }
    let task_type = raw.task_type.parse::<TaskType>().map_err(PlanningError::Schema)?;
    let priority = u8::try_from(raw.priority)
        .ok()
        .and_then(TaskPriority::from_level)
        .ok_or_else(|| PlanningError::Schema(format!("priority {} outside 1..=5", raw.priority)))?;
    let assigned_to = match raw.assigned_to.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(role) => Some(role.parse::<AgentRole>().map_err(PlanningError::Schema)?),
    };
    if !raw.estimated_hours.is_finite() || raw.estimated_hours < 0.0 {
        return Err(PlanningError::Schema(format!(
            "estimated_hours {} is invalid",
            raw.estimated_hours
        )));
    }
    // Index 0 names the root, which every task implicitly belongs to.
    let dependencies: Vec<usize> = raw
        .dependencies
        .into_iter()
        .filter(|&d| d != 0)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    Ok(DraftTask {
        title: raw.title.trim().to_string(),
        description: raw.description,
        task_type,
        priority,
        assigned_to,
        estimated_hours: raw.estimated_hours,
        dependencies,
        tags: raw.tags,
    })
}

// ---------------------------------------------------------------------------
// Fallback plans
// ---------------------------------------------------------------------------

const BACKEND_TERMS: &[&str] = &["api", "backend", "server", "servidor", "endpoint", "database"];
const FRONTEND_TERMS: &[&str] = &["frontend", "ui", "interfaz", "web", "dashboard", "interface"];

struct Step {
    title: &'static str,
    lead: &'static str,
    task_type: TaskType,
    role: AgentRole,
    hours: f64,
    tags: &'static [&'static str],
}

const BACKEND_PLAN: [Step; 5] = [
    Step { title: "Design API structure", lead: "Design the API structure for", task_type: TaskType::Development, role: AgentRole::Architect, hours: 1.0, tags: &["api", "design"] },
    Step { title: "Implement endpoints", lead: "Implement the endpoints for", task_type: TaskType::Development, role: AgentRole::Architect, hours: 2.0, tags: &["api", "backend"] },
    Step { title: "Configure database", lead: "Configure the database for", task_type: TaskType::Infrastructure, role: AgentRole::Devops, hours: 1.0, tags: &["database"] },
    Step { title: "Write API tests", lead: "Write tests covering", task_type: TaskType::Testing, role: AgentRole::Qa, hours: 1.5, tags: &["testing"] },
    Step { title: "Document endpoints", lead: "Document the endpoints of", task_type: TaskType::Documentation, role: AgentRole::Research, hours: 0.5, tags: &["docs"] },
];

const FRONTEND_PLAN: [Step; 5] = [
    Step { title: "Design user interface", lead: "Design the user interface for", task_type: TaskType::Development, role: AgentRole::Frontend, hours: 1.0, tags: &["ui", "design"] },
    Step { title: "Implement components", lead: "Implement the components for", task_type: TaskType::Development, role: AgentRole::Frontend, hours: 2.0, tags: &["frontend"] },
    Step { title: "Configure build pipeline", lead: "Configure the build pipeline for", task_type: TaskType::Infrastructure, role: AgentRole::Devops, hours: 0.5, tags: &["build"] },
    Step { title: "Write UI tests", lead: "Write UI tests for", task_type: TaskType::Testing, role: AgentRole::Qa, hours: 1.0, tags: &["testing"] },
    Step { title: "Optimize performance", lead: "Optimize the performance of", task_type: TaskType::Optimization, role: AgentRole::Research, hours: 1.0, tags: &["performance"] },
];

const GENERIC_PLAN: [Step; 5] = [
    Step { title: "Analyze requirements", lead: "Analyze the requirements of", task_type: TaskType::Research, role: AgentRole::Research, hours: 0.5, tags: &["analysis"] },
    Step { title: "Implement functionality", lead: "Implement the core functionality of", task_type: TaskType::Development, role: AgentRole::Architect, hours: 2.0, tags: &["implementation"] },
    Step { title: "Create interface", lead: "Create the user-facing interface for", task_type: TaskType::Development, role: AgentRole::Frontend, hours: 1.0, tags: &["interface"] },
    Step { title: "Configure environment", lead: "Configure the environment for", task_type: TaskType::Infrastructure, role: AgentRole::Devops, hours: 0.5, tags: &["setup"] },
    Step { title: "Validate implementation", lead: "Validate the implementation of", task_type: TaskType::Testing, role: AgentRole::Qa, hours: 1.0, tags: &["testing", "validation"] },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackKind {
    Backend,
    Frontend,
    Generic,
}

/// Which fixed plan a request maps to. Terms match whole words.
pub fn fallback_kind(request: &str) -> FallbackKind {
    let lower = request.to_lowercase();
    let words: BTreeSet<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    if BACKEND_TERMS.iter().any(|t| words.contains(t)) {
        FallbackKind::Backend
    } else if FRONTEND_TERMS.iter().any(|t| words.contains(t)) {
        FallbackKind::Frontend
    } else {
        FallbackKind::Generic
    }
}

/// The fixed five-step plan for `request`: independent medium-priority
/// siblings under the root. Pure.
pub fn fallback_draft(request: &str) -> PlanDraft {
    let steps = match fallback_kind(request) {
        FallbackKind::Backend => &BACKEND_PLAN,
        FallbackKind::Frontend => &FRONTEND_PLAN,
        FallbackKind::Generic => &GENERIC_PLAN,
    };
    let subject = request.trim();
    let tasks = steps
        .iter()
        .map(|step| DraftTask {
            title: step.title.to_string(),
            description: format!("{}: {subject}", step.lead),
            task_type: step.task_type,
            priority: TaskPriority::Medium,
            assigned_to: Some(step.role),
            estimated_hours: step.hours,
            dependencies: Vec::new(),
            tags: step.tags.iter().map(|t| t.to_string()).collect(),
        })
        .collect();
    PlanDraft {
        main_goal: format!("Implement: {}", truncate_chars(subject, 80)),
        complexity: Complexity::Medium,
        tasks,
        execution_mode: None,
        notes: Some("fallback plan".to_string()),
    }
}

pub fn fallback_plan(request: &str) -> Plan {
    fallback_draft(request).into_plan(request, PlanSource::Fallback)
}

// ---------------------------------------------------------------------------
// Mode recommendation
// ---------------------------------------------------------------------------

/// Resolve `auto`: an explicit plan recommendation wins; otherwise large or
/// dependent plans run safe, short plans run fast.
pub fn recommend_mode(plan: &Plan) -> ExecutionModeKind {
    if let Some(mode) = plan.execution_mode.filter(|m| *m != ExecutionModeKind::Auto) {
        return mode;
    }
    let children = plan.children();
    if children.len() > AUTO_SAFE_TASK_THRESHOLD || plan.has_dependencies() {
        ExecutionModeKind::Safe
    } else if plan.total_estimated_hours() < AUTO_FAST_HOURS {
        ExecutionModeKind::Fast
    } else {
        ExecutionModeKind::Safe
    }
}

// ---------------------------------------------------------------------------
// TaskAnalyzer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AnalyzerSettings {
    pub program: String,
    pub max_turns: u32,
    pub extra_args: Vec<String>,
    pub timeout: Duration,
    pub use_real_agents: bool,
}

impl AnalyzerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            program: config.agent_cli.program.clone(),
            max_turns: config.agent_cli.planning_max_turns,
            extra_args: config.agent_cli.extra_args.clone(),
            timeout: Duration::from_secs(config.timeouts.planning_seconds),
            use_real_agents: config.execution.use_real_agents,
        }
    }
}

pub struct TaskAnalyzer {
    runner: Arc<dyn CommandRunner>,
    settings: AnalyzerSettings,
    cache: Mutex<HashMap<String, Plan>>,
}

impl TaskAnalyzer {
    pub fn new(runner: Arc<dyn CommandRunner>, settings: AnalyzerSettings) -> Self {
        Self {
            runner,
            settings,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Plan `request`, falling back to a fixed plan on any planning failure.
    /// Results are cached per exact request text.
    pub async fn analyze(&self, request: &str, cancel: &CancelToken) -> Plan {
        if let Some(plan) = self
            .cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(request)
        {
            debug!("plan cache hit");
            return plan.clone();
        }

        let plan = match self.plan_with_cli(request, cancel).await {
            Ok(draft) => {
                info!(tasks = draft.tasks.len(), "planner produced a plan");
                draft.into_plan(request, PlanSource::Planner)
            }
            Err(PlanningError::Disabled) => {
                info!("real agents disabled; using fallback plan");
                fallback_plan(request)
            }
            Err(e) => {
                warn!(error = %e, "planning failed; using fallback plan");
                fallback_plan(request)
            }
        };
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(request.to_string(), plan.clone());
        plan
    }

    async fn plan_with_cli(&self, request: &str, cancel: &CancelToken) -> Result<PlanDraft> {
        if !self.settings.use_real_agents {
            return Err(PlanningError::Disabled);
        }
        let mut argv = vec![
            self.settings.program.clone(),
            "--print".to_string(),
            "--dangerously-skip-permissions".to_string(),
            "--max-turns".to_string(),
            self.settings.max_turns.to_string(),
        ];
        argv.extend(self.settings.extra_args.iter().cloned());
        argv.push(planning_prompt(request));
        let outcome = self
            .runner
            .run(RunRequest::new(argv).with_timeout(self.settings.timeout), cancel)
            .await
            .map_err(|e| PlanningError::Spawn(e.to_string()))?;
        if outcome.cancelled {
            return Err(PlanningError::Cancelled);
        }
        if outcome.timed_out {
            return Err(PlanningError::Timeout);
        }
        if outcome.exit_code != 0 {
            return Err(PlanningError::Exit(outcome.exit_code));
        }
        parse_plan_response(&outcome.stdout)
    }
}

pub fn planning_prompt(request: &str) -> String {
    format!(
        r#"Decompose the following request into concrete tasks for a team of specialised agents.

Request: {request}

Agents:
- architect: backend, APIs, architecture, databases
- frontend: user interfaces, components, accessibility
- devops: automation, scripts, CI/CD, infrastructure
- qa: testing, validation, security review
- research: investigation, optimization, documentation

Reply with a single JSON object and nothing else:
{{
  "main_goal": "one sentence describing the goal",
  "complexity": "low|medium|high",
  "tasks": [
    {{
      "title": "short task title",
      "description": "what exactly to do",
      "type": "development|testing|documentation|infrastructure|security|optimization|research|maintenance",
      "priority": 3,
      "assigned_to": "architect|frontend|devops|qa|research",
      "estimated_hours": 1.0,
      "dependencies": [],
      "tags": ["tag"]
    }}
  ],
  "execution_mode": "safe|fast|parallel|redundant",
  "notes": "anything else worth knowing"
}}

Priorities run from 1 (trivial) to 5 (critical). Dependencies list the 1-based positions of
tasks that must finish first. Keep tasks small, specific and executable."#
    )
}
