//! Capacity-constrained batch composition.
//!
//! Tasks are walked in topological order and packed into the current batch
//! until a token or size budget would be exceeded, or until the next task
//! blocks on a member of the current batch.

use crate::config::BatchingConfig;
use crate::core::{Batch, TaskArena, TaskId};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchingStats {
    pub total_batches: usize,
    pub total_tasks: usize,
    pub avg_batch_size: f64,
    pub avg_tokens_per_batch: f64,
    pub max_tokens_per_batch: u64,
    pub oversized_tasks: usize,
    pub dependency_violations: usize,
}

impl BatchingStats {
    pub fn from_batches(batches: &[Batch], oversized: usize, violations: usize) -> Self {
        let total_batches = batches.len();
        let total_tasks: usize = batches.iter().map(Batch::len).sum();
        let total_tokens = batches
            .iter()
            .map(|b| b.estimated_tokens)
            .fold(0, u64::saturating_add);
        let (avg_batch_size, avg_tokens_per_batch) = if total_batches == 0 {
            (0.0, 0.0)
        } else {
            (
                total_tasks as f64 / total_batches as f64,
                total_tokens as f64 / total_batches as f64,
            )
        };
        Self {
            total_batches,
            total_tasks,
            avg_batch_size,
            avg_tokens_per_batch,
            max_tokens_per_batch: batches.iter().map(|b| b.estimated_tokens).max().unwrap_or(0),
            oversized_tasks: oversized,
            dependency_violations: violations,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CapacityOutcome {
    /// Batches in execution order.
    pub batches: Vec<Batch>,
    /// Tasks too large for any batch, each scheduled alone.
    pub oversized: Vec<TaskId>,
    pub stats: BatchingStats,
}

pub struct CapacityBatcher {
    max_batch_size: usize,
    max_tokens_per_batch: u64,
    respect_dependencies: bool,
}

impl CapacityBatcher {
    pub fn new(config: &BatchingConfig) -> Self {
        Self {
            max_batch_size: config.max_batch_size.max(1),
            max_tokens_per_batch: config.max_tokens_per_batch,
            respect_dependencies: config.respect_dependencies,
        }
    }

    /// Pack `order` (a topological order over `arena`) into batches.
    pub fn compose(&self, arena: &TaskArena, order: &[TaskId]) -> CapacityOutcome {
        let mut batches = Vec::new();
        let mut oversized = Vec::new();
        let mut violations = 0;
        let mut open = OpenBatch::default();

        for id in order {
            let Some(task) = arena.get(id) else {
                continue;
            };

            if task.estimated_size > self.max_tokens_per_batch {
                debug!(task_id = %id, size = task.estimated_size, "oversized task scheduled alone");
                open.close(&mut batches, arena);
                batches.push(Batch::single(id.clone(), arena));
                oversized.push(id.clone());
                continue;
            }

            let blocks_on_open = task
                .blocking_dependencies()
                .any(|dep| open.task_ids.contains(dep));
            if blocks_on_open {
                if self.respect_dependencies {
                    open.close(&mut batches, arena);
                } else {
                    violations += 1;
                    open.parallel = false;
                }
            }

            let over_size = open.task_ids.len() + 1 > self.max_batch_size;
            let over_tokens =
                open.tokens.saturating_add(task.estimated_size) > self.max_tokens_per_batch;
            if over_size || over_tokens {
                open.close(&mut batches, arena);
            }

            open.task_ids.push(id.clone());
            open.tokens = open.tokens.saturating_add(task.estimated_size);
        }
        open.close(&mut batches, arena);

        let stats = BatchingStats::from_batches(&batches, oversized.len(), violations);
        debug!(
            batches = stats.total_batches,
            avg_size = stats.avg_batch_size,
            violations,
            "capacity batching complete"
        );
        CapacityOutcome {
            batches,
            oversized,
            stats,
        }
    }
}

struct OpenBatch {
    task_ids: Vec<TaskId>,
    tokens: u64,
    parallel: bool,
}

impl Default for OpenBatch {
    fn default() -> Self {
        Self {
            task_ids: Vec::new(),
            tokens: 0,
            parallel: true,
        }
    }
}

impl OpenBatch {
    fn close(&mut self, batches: &mut Vec<Batch>, arena: &TaskArena) {
        let closed = std::mem::take(self);
        if !closed.task_ids.is_empty() {
            batches.push(Batch::new(closed.task_ids, closed.parallel, arena));
        }
    }
}
