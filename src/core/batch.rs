//! Batches: groups of tasks scheduled together as one stage.

use crate::core::id::{BatchId, TaskId};
use crate::core::task::{AtomicTask, TaskArena, TaskCategory};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Weight of the token estimate in a batch's load.
pub const TOKEN_LOAD_FACTOR: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub task_ids: Vec<TaskId>,
    /// Members may run concurrently; otherwise strictly in order.
    pub parallel: bool,
    pub capabilities: BTreeSet<String>,
    pub estimated_tokens: u64,
    /// Estimated wall time: the longest member when parallel, the sum
    /// otherwise.
    pub estimated_duration_ms: u64,
    /// Summed member durations, used for load balancing.
    pub total_work_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimization_score: Option<f64>,
}

impl Batch {
    /// Build a batch over `task_ids`, deriving aggregates from the arena.
    ///
    /// `parallel` is downgraded to sequential if two members are linked by
    /// a blocking dependency.
    pub fn new(task_ids: Vec<TaskId>, parallel: bool, arena: &TaskArena) -> Self {
        let mut batch = Self {
            id: BatchId::new(),
            task_ids,
            parallel,
            capabilities: BTreeSet::new(),
            estimated_tokens: 0,
            estimated_duration_ms: 0,
            total_work_ms: 0,
            affinity_score: None,
            optimization_score: None,
        };
        batch.recompute(arena);
        batch
    }

    pub fn single(task_id: TaskId, arena: &TaskArena) -> Self {
        Self::new(vec![task_id], false, arena)
    }

    /// Refresh aggregates after membership changed.
    pub fn recompute(&mut self, arena: &TaskArena) {
        let members: Vec<&AtomicTask> =
            self.task_ids.iter().filter_map(|id| arena.get(id)).collect();
        self.capabilities = members
            .iter()
            .flat_map(|task| task.required_capabilities.iter().cloned())
            .collect();
        self.estimated_tokens = members
            .iter()
            .map(|task| task.estimated_size)
            .fold(0, u64::saturating_add);
        self.total_work_ms = members
            .iter()
            .map(|task| task.duration_ms())
            .fold(0, u64::saturating_add);
        if self.parallel && self.has_internal_blocking(arena) {
            self.parallel = false;
        }
        self.estimated_duration_ms = if self.parallel {
            members.iter().map(|task| task.duration_ms()).max().unwrap_or(0)
        } else {
            self.total_work_ms
        };
    }

    pub fn members<'a>(&'a self, arena: &'a TaskArena) -> impl Iterator<Item = &'a AtomicTask> {
        self.task_ids.iter().filter_map(|id| arena.get(id))
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.task_ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.task_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.task_ids.is_empty()
    }

    /// Whether any member blocks on another member.
    pub fn has_internal_blocking(&self, arena: &TaskArena) -> bool {
        self.members(arena).any(|task| {
            task.blocking_dependencies()
                .any(|dep| dep != &task.id && self.contains(dep))
        })
    }

    /// Load used by the workload balancer.
    pub fn load(&self) -> f64 {
        self.total_work_ms as f64 + TOKEN_LOAD_FACTOR * self.estimated_tokens as f64
    }

    /// The shared category, or `Generic` for mixed batches.
    pub fn category(&self, arena: &TaskArena) -> TaskCategory {
        let mut categories = self.members(arena).map(|task| task.category);
        match categories.next() {
            Some(first) if categories.all(|c| c == first) => first,
            _ => TaskCategory::Generic,
        }
    }
}
