//! Dependency cycle detection, resolution and topological ordering.
//!
//! Detection is an iterative depth-first walk from every unvisited task
//! along dependency edges while keeping the current path on a stack; revisiting a
//! task that is on the stack closes a cycle made of the path slice from its
//! first occurrence. Each cycle is broken by dropping its least critical
//! edge, and the walk repeats until the graph is acyclic.

use crate::core::{AtomicTask, DependencyKind, DependencyPriority, TaskArena, TaskId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, warn};

/// An edge removed to break a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DroppedEdge {
    /// Task whose dependency list was pruned.
    pub from: TaskId,
    /// The dependency target that was removed.
    pub to: TaskId,
    pub kind: Option<DependencyKind>,
    pub priority: Option<DependencyPriority>,
    pub criticality: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    pub has_cycles: bool,
    /// Each cycle as the sequence of tasks along dependency edges; the last
    /// task depends on the first.
    pub cycles: Vec<Vec<TaskId>>,
    pub affected_tasks: BTreeSet<TaskId>,
    /// Tasks whose dependency lists were pruned.
    pub resolved_tasks: Vec<TaskId>,
    pub dropped_edges: Vec<DroppedEdge>,
}

/// Result of a full analysis pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Analysis {
    pub report: CycleReport,
    pub order: Vec<TaskId>,
}

struct CycleFinder<'a> {
    arena: &'a TaskArena,
    visited: HashSet<TaskId>,
    on_stack: HashSet<TaskId>,
    path: Vec<TaskId>,
    cycles: Vec<Vec<TaskId>>,
}

impl<'a> CycleFinder<'a> {
    fn new(arena: &'a TaskArena) -> Self {
        Self {
            arena,
            visited: HashSet::new(),
            on_stack: HashSet::new(),
            path: Vec::new(),
            cycles: Vec::new(),
        }
    }

    fn run(mut self) -> Vec<Vec<TaskId>> {
        for task in self.arena.iter() {
            if !self.visited.contains(&task.id) {
                self.visit(task);
            }
        }
        self.cycles
    }

    /// Walk from `root` with an explicit stack of (task, next dependency)
    /// frames, so chain depth is bounded by memory rather than the call stack.
    fn visit(&mut self, root: &'a AtomicTask) {
        self.enter(root);
        let mut stack = vec![(root, 0usize)];
        while let Some(frame) = stack.last_mut() {
            let (task, index) = *frame;
            frame.1 += 1;
            let Some(dep) = task.dependencies.get(index) else {
                self.path.pop();
                self.on_stack.remove(&task.id);
                stack.pop();
                continue;
            };
            let Some(next) = self.arena.get(&dep.target) else {
                continue;
            };
            if self.on_stack.contains(&next.id) {
                if let Some(start) = self.path.iter().position(|id| id == &next.id) {
                    self.cycles.push(self.path[start..].to_vec());
                }
            } else if !self.visited.contains(&next.id) {
                self.enter(next);
                stack.push((next, 0));
            }
        }
    }

    fn enter(&mut self, task: &AtomicTask) {
        self.visited.insert(task.id.clone());
        self.on_stack.insert(task.id.clone());
        self.path.push(task.id.clone());
    }
}

/// Find cycles among the arena's dependency edges. Edges to unknown ids are
/// ignored; a self-reference is a single-task cycle.
pub fn detect_cycles(arena: &TaskArena) -> Vec<Vec<TaskId>> {
    CycleFinder::new(arena).run()
}

/// Pick the least critical edge of a cycle; ties go to the first edge in
/// cycle order. Returns `None` if the cycle was already broken.
fn weakest_edge(arena: &TaskArena, cycle: &[TaskId]) -> Option<DroppedEdge> {
    let mut weakest: Option<DroppedEdge> = None;
    for (i, from) in cycle.iter().enumerate() {
        let to = &cycle[(i + 1) % cycle.len()];
        let dep = arena
            .get(from)?
            .dependencies
            .iter()
            .filter(|dep| &dep.target == to)
            .max_by_key(|dep| dep.criticality())?;
        let criticality = dep.criticality();
        if weakest
            .as_ref()
            .map_or(true, |current| criticality < current.criticality)
        {
            weakest = Some(DroppedEdge {
                from: from.clone(),
                to: to.clone(),
                kind: dep.kind,
                priority: dep.priority,
                criticality,
            });
        }
    }
    weakest
}

/// Break every cycle in place and report what was removed. On an acyclic
/// arena this leaves every dependency list untouched.
pub fn resolve_cycles(arena: &mut TaskArena) -> CycleReport {
    let mut report = CycleReport::default();

    // Every round removes at least one edge, so the edge count bounds it.
    let max_rounds = arena.iter().map(|t| t.dependencies.len()).sum::<usize>() + 1;
    for _ in 0..max_rounds {
        let cycles = detect_cycles(arena);
        if cycles.is_empty() {
            break;
        }
        report.has_cycles = true;

        for cycle in cycles {
            report.affected_tasks.extend(cycle.iter().cloned());
            if let Some(edge) = weakest_edge(arena, &cycle) {
                warn!(
                    from = %edge.from,
                    to = %edge.to,
                    criticality = edge.criticality,
                    cycle_len = cycle.len(),
                    "dropping dependency to break cycle"
                );
                arena.remove_dependency(&edge.from, &edge.to);
                if !report.resolved_tasks.contains(&edge.from) {
                    report.resolved_tasks.push(edge.from.clone());
                }
                report.dropped_edges.push(edge);
            }
            report.cycles.push(cycle);
        }
    }

    report
}

/// Post-order depth-first topological sort: every task follows the tasks it
/// depends on. Roots keep their arena order.
pub fn topological_order(arena: &TaskArena) -> Vec<TaskId> {
    let mut marked = HashSet::new();
    let mut order = Vec::with_capacity(arena.len());
    let mut stack: Vec<(&AtomicTask, usize)> = Vec::new();

    for root in arena.iter() {
        if !marked.insert(root.id.clone()) {
            continue;
        }
        stack.push((root, 0));
        while let Some(frame) = stack.last_mut() {
            let (task, index) = *frame;
            frame.1 += 1;
            match task.dependencies.get(index) {
                Some(dep) => {
                    if let Some(next) = arena.get(&dep.target) {
                        if marked.insert(next.id.clone()) {
                            stack.push((next, 0));
                        }
                    }
                }
                None => {
                    order.push(task.id.clone());
                    stack.pop();
                }
            }
        }
    }
    order
}

/// Resolve cycles, then order the tasks.
pub fn analyze(arena: &mut TaskArena) -> Analysis {
    let report = resolve_cycles(arena);
    let order = topological_order(arena);
    debug!(
        tasks = arena.len(),
        cycles = report.cycles.len(),
        dropped = report.dropped_edges.len(),
        "dependency analysis complete"
    );
    Analysis { report, order }
}
