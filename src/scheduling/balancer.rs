//! Workload balancing across formed batches.
//!
//! Load per batch is its summed member duration plus 0.1 per estimated
//! token. Each iteration moves the last member of the heaviest batch to the
//! lightest one until the spread drops under 20% of the heaviest load, the
//! heaviest batch is down to one member, or the iteration cap is reached.

use crate::core::{Batch, TaskArena, TaskId};
use tracing::debug;

pub const MAX_ITERATIONS: usize = 10;

/// Spread tolerated relative to the heaviest load.
pub const BALANCE_TOLERANCE: f64 = 0.2;

#[derive(Debug, Clone, PartialEq)]
pub struct BalanceOutcome {
    /// Batches in their original order, empty ones removed.
    pub batches: Vec<Batch>,
    pub moves: usize,
    pub iterations: usize,
}

/// Decides whether a task may move between two batch positions.
pub trait MoveGuard {
    fn allows(&self, task: &TaskId, from: usize, to: usize, batches: &[Batch]) -> bool;
}

/// Guard that accepts every move.
pub struct Unguarded;

impl MoveGuard for Unguarded {
    fn allows(&self, _task: &TaskId, _from: usize, _to: usize, _batches: &[Batch]) -> bool {
        true
    }
}

pub struct WorkloadBalancer<G = Unguarded> {
    guard: G,
}

impl WorkloadBalancer<Unguarded> {
    pub fn new() -> Self {
        Self { guard: Unguarded }
    }
}

impl Default for WorkloadBalancer<Unguarded> {
    fn default() -> Self {
        Self::new()
    }
}

impl<G: MoveGuard> WorkloadBalancer<G> {
    pub fn with_guard(guard: G) -> Self {
        Self { guard }
    }

    pub fn balance(&self, mut batches: Vec<Batch>, arena: &TaskArena) -> BalanceOutcome {
        let mut moves = 0;
        let mut iterations = 0;

        while iterations < MAX_ITERATIONS && batches.len() > 1 {
            iterations += 1;
            let Some((heaviest, lightest)) = extremes(&batches) else {
                break;
            };
            let high = batches[heaviest].load();
            let low = batches[lightest].load();
            if high - low <= 0.0 || high - low < high * BALANCE_TOLERANCE {
                break;
            }
            if batches[heaviest].len() <= 1 {
                break;
            }
            let Some(task) = batches[heaviest].task_ids.last().cloned() else {
                break;
            };
            if !self.guard.allows(&task, heaviest, lightest, &batches) {
                debug!(task_id = %task, "balancing move refused");
                break;
            }

            batches[heaviest].task_ids.pop();
            batches[heaviest].recompute(arena);
            batches[lightest].task_ids.push(task.clone());
            batches[lightest].recompute(arena);
            moves += 1;
            debug!(task_id = %task, from = heaviest, to = lightest, "moved task between batches");
        }

        batches.retain(|batch| !batch.is_empty());
        BalanceOutcome {
            batches,
            moves,
            iterations,
        }
    }
}

/// Indices of the heaviest (first on ties) and lightest (last on ties)
/// batches.
fn extremes(batches: &[Batch]) -> Option<(usize, usize)> {
    let mut heaviest: Option<usize> = None;
    let mut lightest: Option<usize> = None;
    for (i, batch) in batches.iter().enumerate() {
        let load = batch.load();
        if heaviest.map_or(true, |h| load > batches[h].load()) {
            heaviest = Some(i);
        }
        if lightest.map_or(true, |l| load <= batches[l].load()) {
            lightest = Some(i);
        }
    }
    match (heaviest, lightest) {
        (Some(h), Some(l)) if h != l => Some((h, l)),
        _ => None,
    }
}
