use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::TaskStatus;

// ---------------------------------------------------------------------------
// TaskEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEvent {
    /// Every dependency reached `completed`.
    DependenciesMet,
    /// A worker slot was granted.
    Dispatch,
    Succeed,
    Fail,
    /// A transitive dependency failed.
    Block,
    Cancel,
}

impl fmt::Display for TaskEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskEvent::DependenciesMet => "DependenciesMet",
            TaskEvent::Dispatch => "Dispatch",
            TaskEvent::Succeed => "Succeed",
            TaskEvent::Fail => "Fail",
            TaskEvent::Block => "Block",
            TaskEvent::Cancel => "Cancel",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// An event was applied in a state that does not accept it.
///
/// The coordinator treats this as an internal invariant violation and aborts
/// the run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateMachineError {
    #[error("invalid transition: cannot apply {event} in state {state}")]
    InvalidTransition { state: TaskStatus, event: TaskEvent },
}

// ---------------------------------------------------------------------------
// TaskStateMachine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TaskStateMachine {
    current: TaskStatus,
    history: Vec<(TaskStatus, TaskEvent, TaskStatus)>,
}

impl TaskStateMachine {
    /// Create a new state machine starting in `Pending`.
    pub fn new() -> Self {
        Self {
            current: TaskStatus::Pending,
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> TaskStatus {
        self.current
    }

    pub fn history(&self) -> &[(TaskStatus, TaskEvent, TaskStatus)] {
        &self.history
    }

    /// Attempt a transition driven by `event`.
    ///
    /// Valid transitions:
    /// - Pending    + DependenciesMet -> Ready
    /// - Ready      + Dispatch        -> InProgress
    /// - InProgress + Succeed         -> Completed
    /// - InProgress + Fail            -> Failed
    /// - Pending    + Block           -> Blocked
    /// - Ready      + Block           -> Blocked
    /// - Pending    + Cancel          -> Cancelled
    /// - Ready      + Cancel          -> Cancelled
    /// - InProgress + Cancel          -> Cancelled
    pub fn transition(&mut self, event: TaskEvent) -> Result<TaskStatus, StateMachineError> {
        let next = match (self.current, event) {
            (TaskStatus::Pending, TaskEvent::DependenciesMet) => TaskStatus::Ready,
            (TaskStatus::Ready, TaskEvent::Dispatch) => TaskStatus::InProgress,
            (TaskStatus::InProgress, TaskEvent::Succeed) => TaskStatus::Completed,
            (TaskStatus::InProgress, TaskEvent::Fail) => TaskStatus::Failed,
            (TaskStatus::Pending | TaskStatus::Ready, TaskEvent::Block) => TaskStatus::Blocked,
            (TaskStatus::Pending | TaskStatus::Ready | TaskStatus::InProgress, TaskEvent::Cancel) => {
                TaskStatus::Cancelled
            }
            _ => {
                return Err(StateMachineError::InvalidTransition {
                    state: self.current,
                    event,
                });
            }
        };

        let from = self.current;
        self.current = next;
        self.history.push((from, event, next));
        tracing::debug!(from = %from, event = %event, to = %next, "task state transition");
        Ok(next)
    }

    pub fn can_transition(&self, event: TaskEvent) -> bool {
        self.clone().transition(event).is_ok()
    }
}

impl Default for TaskStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
