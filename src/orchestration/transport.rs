//! Boundary between the coordinator and external agents.

use crate::core::{Agent, AtomicTask, TaskCategory, TaskId};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Output of a dependency, handed to the agent as context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextItem {
    pub task_id: TaskId,
    pub output: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRequest {
    pub task_id: TaskId,
    pub content: String,
    pub category: TaskCategory,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_limit: Option<u32>,
    pub context: Vec<ContextItem>,
    /// Zero-based attempt number.
    pub attempt: u32,
}

impl AgentRequest {
    pub fn new(task: &AtomicTask, agent: &Agent, context: Vec<ContextItem>, attempt: u32) -> Self {
        Self {
            task_id: task.id.clone(),
            content: task.content.clone(),
            category: task.category,
            token_limit: agent.token_limit,
            context,
            attempt,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub output: Value,
    #[serde(default)]
    pub cost: f64,
}

impl AgentResponse {
    pub fn new(output: Value) -> Self {
        Self { output, cost: 0.0 }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }
}

/// How the engine talks to agents. Implementations must observe `cancel`:
/// the coordinator cancels it when an attempt times out or the workflow is
/// shut down.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn execute(
        &self,
        agent: &Agent,
        request: AgentRequest,
        cancel: CancellationToken,
    ) -> Result<AgentResponse>;

    /// Lightweight liveness check.
    async fn probe(&self, agent: &Agent) -> Result<()>;
}
