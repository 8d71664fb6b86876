//! Similarity-based ("affinity") batch composition.
//!
//! Only batchable tasks without blocking dependencies take part. Within each
//! category a group is seeded with the first unassigned task and grown with
//! later tasks that are mutually compatible with every current member.

use crate::config::BatchingConfig;
use crate::core::{AtomicTask, Batch, TaskArena, TaskCategory, TaskId};
use crate::scheduling::similarity::similarity;
use std::collections::HashSet;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct AffinityOutcome {
    /// Groups sorted by optimization score, best first.
    pub groups: Vec<Batch>,
    /// Tasks left out of every group, in arena order.
    pub ungrouped: Vec<TaskId>,
}

pub struct AffinityBatcher {
    max_group_size: usize,
    max_tokens_per_group: u64,
    min_similarity: f64,
    allow_cross_category: bool,
}

impl AffinityBatcher {
    pub fn new(config: &BatchingConfig) -> Self {
        Self {
            max_group_size: config.max_group_size.max(2),
            max_tokens_per_group: config.max_tokens_per_group,
            min_similarity: config.min_similarity_threshold,
            allow_cross_category: config.allow_cross_category_batching,
        }
    }

    pub fn compose(&self, arena: &TaskArena) -> AffinityOutcome {
        let candidates: Vec<&AtomicTask> = arena
            .iter()
            .filter(|task| task.batchable && arena.blocking_dependencies_of(&task.id).is_empty())
            .collect();

        let mut categories: Vec<TaskCategory> = Vec::new();
        for task in &candidates {
            if !categories.contains(&task.category) {
                categories.push(task.category);
            }
        }

        let mut grouped: Vec<Vec<&AtomicTask>> = Vec::new();
        for category in categories {
            let members: Vec<&AtomicTask> = candidates
                .iter()
                .copied()
                .filter(|task| task.category == category)
                .collect();
            grouped.extend(self.greedy_groups(&members));
        }

        if self.allow_cross_category {
            let assigned: HashSet<&TaskId> =
                grouped.iter().flatten().map(|task| &task.id).collect();
            let leftovers: Vec<&AtomicTask> = candidates
                .iter()
                .copied()
                .filter(|task| !assigned.contains(&task.id))
                .collect();
            grouped.extend(self.greedy_groups(&leftovers));
        }

        let assigned: HashSet<&TaskId> = grouped.iter().flatten().map(|task| &task.id).collect();
        let ungrouped = arena
            .ids()
            .filter(|id| !assigned.contains(id))
            .cloned()
            .collect();

        let mut groups: Vec<Batch> = grouped
            .iter()
            .map(|members| self.to_batch(members, arena))
            .collect();
        groups.sort_by(|a, b| {
            let score = |batch: &Batch| batch.optimization_score.unwrap_or(0.0);
            score(b).total_cmp(&score(a))
        });

        debug!(groups = groups.len(), "affinity batching complete");
        AffinityOutcome { groups, ungrouped }
    }

    /// Greedy grouping; groups of one are dropped.
    fn greedy_groups<'a>(&self, tasks: &[&'a AtomicTask]) -> Vec<Vec<&'a AtomicTask>> {
        let mut used = vec![false; tasks.len()];
        let mut groups = Vec::new();

        for seed in 0..tasks.len() {
            if used[seed] {
                continue;
            }
            let mut group = vec![tasks[seed]];
            let mut tokens = tasks[seed].estimated_size;

            for candidate in (seed + 1)..tasks.len() {
                if group.len() >= self.max_group_size {
                    break;
                }
                if used[candidate] {
                    continue;
                }
                let task = tasks[candidate];
                if tokens.saturating_add(task.estimated_size) > self.max_tokens_per_group {
                    continue;
                }
                if group.iter().all(|member| self.compatible(member, task)) {
                    group.push(task);
                    tokens = tokens.saturating_add(task.estimated_size);
                    used[candidate] = true;
                }
            }

            if group.len() > 1 {
                used[seed] = true;
                groups.push(group);
            }
        }
        groups
    }

    /// Pairwise compatibility, apart from the group token budget.
    fn compatible(&self, a: &AtomicTask, b: &AtomicTask) -> bool {
        if !a.batchable || !b.batchable {
            return false;
        }
        if a.references(&b.id) || b.references(&a.id) {
            return false;
        }
        similarity(a, b).score() >= self.min_similarity
    }

    fn to_batch(&self, members: &[&AtomicTask], arena: &TaskArena) -> Batch {
        let mut batch = Batch::new(members.iter().map(|t| t.id.clone()).collect(), true, arena);
        let context_similarity = average_pairwise_similarity(members);
        let single_category = members
            .first()
            .map(|first| members.iter().all(|t| t.category == first.category))
            .unwrap_or(true);

        let size_fill = (members.len() as f64 / self.max_group_size as f64).min(1.0);
        let token_fill =
            (batch.estimated_tokens as f64 / self.max_tokens_per_group as f64).min(1.0);
        let score = context_similarity * 30.0
            + size_fill * 20.0
            + if batch.parallel { 25.0 } else { 0.0 }
            + if single_category { 15.0 } else { 0.0 }
            + token_fill * 10.0;

        batch.affinity_score = Some(context_similarity);
        batch.optimization_score = Some(score);
        batch
    }
}

fn average_pairwise_similarity(members: &[&AtomicTask]) -> f64 {
    let mut total = 0.0;
    let mut pairs = 0usize;
    for (i, a) in members.iter().enumerate() {
        for b in &members[i + 1..] {
            total += similarity(a, b).score();
            pairs += 1;
        }
    }
    if pairs == 0 {
        0.0
    } else {
        total / pairs as f64
    }
}
