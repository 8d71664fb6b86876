//! Batch-level result assembly.

use crate::core::{AgentId, BatchId, MergeRule, TaskExecutionResult, TaskState};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const CONCAT_SEPARATOR: &str = "\n\n---\n\n";

/// Latency at which the latency component of confidence halves.
const LATENCY_SCALE_MS: f64 = 60_000.0;
/// Cost at which the cost component of confidence halves.
const COST_SCALE: f64 = 0.01;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub batch_id: BatchId,
    pub agent_id: Option<AgentId>,
    /// Per-member results in batch order.
    pub results: Vec<TaskExecutionResult>,
    pub merged_output: Value,
    pub confidence: f64,
    pub completed: usize,
    pub failed: usize,
    pub elapsed_ms: u64,
    pub total_cost: f64,
}

impl BatchResult {
    pub fn assemble(
        batch_id: BatchId,
        agent_id: Option<AgentId>,
        results: Vec<TaskExecutionResult>,
        rule: MergeRule,
        elapsed_ms: u64,
    ) -> Self {
        let completed = results.iter().filter(|r| r.is_success()).count();
        let failed = results.len() - completed;
        let total_cost = results.iter().map(|r| r.cost).sum();
        Self {
            merged_output: merge_outputs(&results, rule),
            confidence: confidence(&results),
            batch_id,
            agent_id,
            completed,
            failed,
            elapsed_ms,
            total_cost,
            results,
        }
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}

/// Combine the outputs of completed members.
pub fn merge_outputs(results: &[TaskExecutionResult], rule: MergeRule) -> Value {
    let outputs = results
        .iter()
        .filter(|r| r.state == TaskState::Completed)
        .filter_map(|r| r.output.as_ref().map(|output| (r, output)));

    match rule {
        MergeRule::Concatenate => {
            let parts: Vec<String> = outputs
                .map(|(_, output)| match output {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                })
                .collect();
            Value::String(parts.join(CONCAT_SEPARATOR))
        }
        MergeRule::Array => Value::Array(outputs.map(|(_, output)| output.clone()).collect()),
        MergeRule::Keyed => {
            let map: Map<String, Value> = outputs
                .map(|(r, output)| (r.task_id.to_string(), output.clone()))
                .collect();
            Value::Object(map)
        }
    }
}

/// Success ratio scaled by how fast and cheap the completed members were.
pub fn confidence(results: &[TaskExecutionResult]) -> f64 {
    let completed: Vec<&TaskExecutionResult> = results.iter().filter(|r| r.is_success()).collect();
    if completed.is_empty() {
        return 0.0;
    }
    let n = completed.len() as f64;
    let avg_latency = completed.iter().map(|r| r.elapsed_ms as f64).sum::<f64>() / n;
    let avg_cost = completed.iter().map(|r| r.cost).sum::<f64>() / n;

    let latency_score = 1.0 / (1.0 + avg_latency / LATENCY_SCALE_MS);
    let cost_score = 1.0 / (1.0 + avg_cost / COST_SCALE);
    let success_ratio = n / results.len() as f64;
    success_ratio * (0.5 * latency_score + 0.5 * cost_score)
}
