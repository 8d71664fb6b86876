use std::time::Duration;
use thiserror::Error;

use crate::core::{AgentId, TaskId};

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No config directory")]
    NoConfigDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Dependency cycle detected: {}", format_cycle(.0))]
    CycleDetected(Vec<TaskId>),

    #[error("No agent provides capabilities [{}] required by task {task_id}", .missing.join(", "))]
    MissingCapability { task_id: TaskId, missing: Vec<String> },

    #[error("Task {task_id} would run before its blocking dependency {dependency}")]
    DependencyViolation { task_id: TaskId, dependency: TaskId },

    #[error("Agent not available: {0}")]
    AgentUnavailable(String),

    #[error("Agent unhealthy: {0}")]
    AgentUnhealthy(AgentId),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Agent not found: {0}")]
    AgentNotFound(AgentId),

    #[error("Operation cancelled")]
    Cancelled,
}

fn format_cycle(ids: &[TaskId]) -> String {
    ids.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Stable, user-facing classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    CycleDetected,
    MissingCapability,
    DependencyViolation,
    AgentUnavailable,
    AgentUnhealthy,
    Timeout,
    ExecutionError,
    SchemaMismatch,
    NotFound,
    Validation,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::CycleDetected => "cycle_detected",
            ErrorKind::MissingCapability => "missing_capability",
            ErrorKind::DependencyViolation => "dependency_violation",
            ErrorKind::AgentUnavailable => "agent_unavailable",
            ErrorKind::AgentUnhealthy => "agent_unhealthy",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ExecutionError => "execution_error",
            ErrorKind::SchemaMismatch => "schema_mismatch",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Validation => "validation_error",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal_error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::CycleDetected(_) => ErrorKind::CycleDetected,
            Error::MissingCapability { .. } => ErrorKind::MissingCapability,
            Error::DependencyViolation { .. } => ErrorKind::DependencyViolation,
            Error::AgentUnavailable(_) => ErrorKind::AgentUnavailable,
            Error::AgentUnhealthy(_) => ErrorKind::AgentUnhealthy,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Execution(_) => ErrorKind::ExecutionError,
            Error::SchemaMismatch(_) => ErrorKind::SchemaMismatch,
            Error::TaskNotFound(_) | Error::AgentNotFound(_) => ErrorKind::NotFound,
            Error::Validation(_) => ErrorKind::Validation,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Io(_)
            | Error::Json(_)
            | Error::TomlParse(_)
            | Error::TomlSerialize(_)
            | Error::NoConfigDir => ErrorKind::Internal,
        }
    }

    /// Whether another attempt may succeed.
    ///
    /// Schema mismatches are retryable only against a different agent; see
    /// [`Error::is_agent_specific`].
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::Execution(_)
                | Error::AgentUnavailable(_)
                | Error::AgentUnhealthy(_)
                | Error::SchemaMismatch(_)
        )
    }

    /// Whether the failure is attributed to the agent rather than the input,
    /// so the next attempt should move down the fallback chain.
    pub fn is_agent_specific(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::AgentUnavailable(_)
                | Error::AgentUnhealthy(_)
                | Error::SchemaMismatch(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
