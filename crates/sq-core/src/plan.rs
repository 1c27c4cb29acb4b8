use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::types::{ExecutionModeKind, Task, TaskId, TaskPriority, TaskType};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("duplicate task id: {0}")]
    DuplicateId(TaskId),
    #[error("task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: TaskId, dependency: TaskId },
    #[error("task {0} depends on itself")]
    SelfDependency(TaskId),
    #[error("dependency cycle through task {0}")]
    Cycle(TaskId),
    #[error("root task may not carry dependencies")]
    RootHasDependencies,
}

pub type Result<T> = std::result::Result<T, PlanError>;

// ---------------------------------------------------------------------------
// Complexity / PlanSource
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Complexity::Low => "low",
            Complexity::Medium => "medium",
            Complexity::High => "high",
        };
        f.write_str(label)
    }
}

/// Where a plan came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanSource {
    Planner,
    Fallback,
    Manual,
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// Dependency-ordered set of tasks sharing one root task.
///
/// `tasks[0]` is always the root. The root is never dispatched; it stands for
/// the request as a whole and its estimate is the sum of its children.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub request: String,
    pub main_goal: String,
    pub complexity: Complexity,
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub execution_mode: Option<ExecutionModeKind>,
    #[serde(default)]
    pub notes: Option<String>,
    pub source: PlanSource,
    pub created_at: DateTime<Utc>,
}

impl Plan {
    /// Assemble a plan from child tasks, synthesising the root task.
    pub fn from_tasks(
        request: impl Into<String>,
        main_goal: impl Into<String>,
        children: Vec<Task>,
        source: PlanSource,
    ) -> Self {
        Self::from_tasks_with_root_id(Uuid::new_v4(), request, main_goal, children, source)
    }

    /// Like [`Plan::from_tasks`] with a caller-chosen root id.
    pub fn from_tasks_with_root_id(
        root_id: TaskId,
        request: impl Into<String>,
        main_goal: impl Into<String>,
        children: Vec<Task>,
        source: PlanSource,
    ) -> Self {
        let request = request.into();
        let main_goal = main_goal.into();
        let total: f64 = children.iter().map(|t| t.estimated_hours).sum();
        let root = Task::with_id(
            root_id,
            truncate_chars(&main_goal, 100),
            TaskType::Development,
            TaskPriority::High,
        )
        .with_description(request.clone())
        .with_estimate(total)
        .with_tags(["main"]);

        let mut tasks = Vec::with_capacity(children.len() + 1);
        tasks.push(root);
        tasks.extend(children);

        Self {
            id: Uuid::new_v4(),
            request,
            main_goal,
            complexity: complexity_for_hours(total),
            tasks,
            execution_mode: None,
            notes: None,
            source,
            created_at: Utc::now(),
        }
    }

    pub fn with_mode(mut self, mode: ExecutionModeKind) -> Self {
        self.execution_mode = Some(mode);
        self
    }

    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.complexity = complexity;
        self
    }

    pub fn root(&self) -> &Task {
        &self.tasks[0]
    }

    pub fn root_id(&self) -> TaskId {
        self.tasks[0].id
    }

    /// Every task except the root.
    pub fn children(&self) -> &[Task] {
        &self.tasks[1..]
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn total_estimated_hours(&self) -> f64 {
        self.children().iter().map(|t| t.estimated_hours).sum()
    }

    pub fn has_dependencies(&self) -> bool {
        self.children().iter().any(|t| !t.depends_on.is_empty())
    }

    /// Check ids are unique, every dependency resolves, and the graph is acyclic.
    pub fn validate(&self) -> Result<()> {
        validate_tasks(&self.tasks)?;
        if !self.root().depends_on.is_empty() {
            return Err(PlanError::RootHasDependencies);
        }
        Ok(())
    }

    /// Children in an order where every task follows its dependencies.
    /// Ties keep plan order.
    pub fn topological_order(&self) -> Result<Vec<TaskId>> {
        topological_order(self.children())
    }
}

/// Validate an arbitrary task set as a DAG.
pub fn validate_tasks(tasks: &[Task]) -> Result<()> {
    let mut seen = HashSet::with_capacity(tasks.len());
    for task in tasks {
        if !seen.insert(task.id) {
            return Err(PlanError::DuplicateId(task.id));
        }
    }
    for task in tasks {
        for dep in &task.depends_on {
            if *dep == task.id {
                return Err(PlanError::SelfDependency(task.id));
            }
            if !seen.contains(dep) {
                return Err(PlanError::UnknownDependency {
                    task: task.id,
                    dependency: *dep,
                });
            }
        }
    }
    if let Some(id) = find_cycle(tasks) {
        return Err(PlanError::Cycle(id));
    }
    Ok(())
}

/// Depth-first search; returns a task on a cycle if there is one.
fn find_cycle(tasks: &[Task]) -> Option<TaskId> {
    let deps: HashMap<TaskId, &[TaskId]> = tasks
        .iter()
        .map(|t| (t.id, t.depends_on.as_slice()))
        .collect();
    // 0 = unvisited, 1 = on stack, 2 = done
    let mut state: HashMap<TaskId, u8> = HashMap::with_capacity(tasks.len());

    for task in tasks {
        if state.get(&task.id).copied().unwrap_or(0) != 0 {
            continue;
        }
        let mut stack: Vec<(TaskId, usize)> = vec![(task.id, 0)];
        state.insert(task.id, 1);
        while let Some((id, idx)) = stack.pop() {
            let edges = deps.get(&id).copied().unwrap_or(&[]);
            if idx < edges.len() {
                stack.push((id, idx + 1));
                let next = edges[idx];
                match state.get(&next).copied().unwrap_or(0) {
                    0 => {
                        state.insert(next, 1);
                        stack.push((next, 0));
                    }
                    1 => return Some(next),
                    _ => {}
                }
            } else {
                state.insert(id, 2);
            }
        }
    }
    None
}

/// Kahn's algorithm over `tasks`, ignoring dependencies outside the set.
pub fn topological_order(tasks: &[Task]) -> Result<Vec<TaskId>> {
    let ids: HashSet<TaskId> = tasks.iter().map(|t| t.id).collect();
    let mut indegree: HashMap<TaskId, usize> = HashMap::with_capacity(tasks.len());
    let mut dependents: HashMap<TaskId, Vec<TaskId>> = HashMap::new();

    for task in tasks {
        let count = task.depends_on.iter().filter(|d| ids.contains(d)).count();
        indegree.insert(task.id, count);
        for dep in task.depends_on.iter().filter(|d| ids.contains(d)) {
            dependents.entry(*dep).or_default().push(task.id);
        }
    }

    let position: HashMap<TaskId, usize> =
        tasks.iter().enumerate().map(|(i, t)| (t.id, i)).collect();
    let mut queue: VecDeque<TaskId> = tasks
        .iter()
        .filter(|t| indegree.get(&t.id) == Some(&0))
        .map(|t| t.id)
        .collect();
    let mut order = Vec::with_capacity(tasks.len());

    while let Some(id) = queue.pop_front() {
        order.push(id);
        let mut released = Vec::new();
        for next in dependents.get(&id).map(Vec::as_slice).unwrap_or(&[]) {
            if let Some(d) = indegree.get_mut(next) {
                *d -= 1;
                if *d == 0 {
                    released.push(*next);
                }
            }
        }
        released.sort_by_key(|id| position.get(id).copied().unwrap_or(usize::MAX));
        queue.extend(released);
    }

    if order.len() != tasks.len() {
        let stuck = tasks
            .iter()
            .find(|t| !order.contains(&t.id))
            .map(|t| t.id)
            .unwrap_or_default();
        return Err(PlanError::Cycle(stuck));
    }
    Ok(order)
}

fn complexity_for_hours(hours: f64) -> Complexity {
    if hours < 2.0 {
        Complexity::Low
    } else if hours < 8.0 {
        Complexity::Medium
    } else {
        Complexity::High
    }
}

/// Truncate on a char boundary.
pub fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
