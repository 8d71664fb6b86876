//! Execution outcomes for tasks.

use crate::core::id::{AgentId, TaskId};
use crate::error::Error;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Terminal state of a task execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Completed,
    Failed,
    Timeout,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Completed => write!(f, "completed"),
            TaskState::Failed => write!(f, "failed"),
            TaskState::Timeout => write!(f, "timeout"),
        }
    }
}

/// Serializable record of the error that ended a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub kind: String,
    pub message: String,
}

impl From<&Error> for ErrorDescriptor {
    fn from(error: &Error) -> Self {
        Self {
            kind: error.kind().as_str().to_string(),
            message: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecutionResult {
    pub task_id: TaskId,
    pub state: TaskState,
    pub output: Option<Value>,
    /// Agent that produced the terminal outcome.
    pub agent_id: Option<AgentId>,
    pub elapsed_ms: u64,
    pub cost: f64,
    pub retry_count: u32,
    pub error: Option<ErrorDescriptor>,
}

impl TaskExecutionResult {
    pub fn completed(
        task_id: TaskId,
        agent_id: AgentId,
        output: Value,
        elapsed_ms: u64,
        cost: f64,
        retry_count: u32,
    ) -> Self {
        Self {
            task_id,
            state: TaskState::Completed,
            output: Some(output),
            agent_id: Some(agent_id),
            elapsed_ms,
            cost,
            retry_count,
            error: None,
        }
    }

    /// Terminal failure; a timeout error yields the `Timeout` state.
    pub fn failed(
        task_id: TaskId,
        agent_id: Option<AgentId>,
        error: &Error,
        elapsed_ms: u64,
        cost: f64,
        retry_count: u32,
    ) -> Self {
        let state = match error {
            Error::Timeout(_) => TaskState::Timeout,
            _ => TaskState::Failed,
        };
        Self {
            task_id,
            state,
            output: None,
            agent_id,
            elapsed_ms,
            cost,
            retry_count,
            error: Some(ErrorDescriptor::from(error)),
        }
    }

    pub fn is_success(&self) -> bool {
        self.state == TaskState::Completed
    }
}
