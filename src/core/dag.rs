//! Task DAG (Directed Acyclic Graph) for dependency management.
//!
//! The DAG is built from an already cycle-free task arena and answers the
//! structural questions the planner needs: readiness, topological levels
//! and the critical path.

use crate::core::id::TaskId;
use crate::core::task::{AtomicTask, Dependency, TaskArena};
use crate::error::{Error, Result};
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::{HashMap, HashSet};

/// The task dependency graph.
///
/// Nodes are tasks; an edge `a -> b` means `b` depends on `a`, weighted by
/// the dependency that declared it.
pub struct TaskDAG {
    graph: DiGraph<AtomicTask, Dependency>,
    task_index: HashMap<TaskId, NodeIndex>,
}

impl TaskDAG {
    /// Create a new empty TaskDAG.
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
        }
    }

    /// Build a DAG from every task in the arena. Dependencies on ids the
    /// arena does not contain are ignored.
    ///
    /// # Errors
    /// Returns `Error::CycleDetected` if the arena still contains a cycle.
    pub fn from_arena(arena: &TaskArena) -> Result<Self> {
        let mut dag = Self::new();
        for task in arena.iter() {
            dag.add_task(task.clone());
        }
        for task in arena.iter() {
            let Some(&to) = dag.task_index.get(&task.id) else {
                continue;
            };
            for dep in &task.dependencies {
                if let Some(&from) = dag.task_index.get(&dep.target) {
                    dag.graph.add_edge(from, to, dep.clone());
                }
            }
        }
        if is_cyclic_directed(&dag.graph) {
            let at = toposort(&dag.graph, None)
                .err()
                .and_then(|cycle| dag.graph.node_weight(cycle.node_id()))
                .map(|task| task.id.clone());
            return Err(Error::CycleDetected(at.into_iter().collect()));
        }
        Ok(dag)
    }

    /// Add a task, or return the index of the task already holding its id.
    fn add_task(&mut self, task: AtomicTask) -> NodeIndex {
        if let Some(&index) = self.task_index.get(&task.id) {
            return index;
        }

        let id = task.id.clone();
        let index = self.graph.add_node(task);
        self.task_index.insert(id, index);
        index
    }

    /// Get the number of tasks in the DAG.
    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Get the number of dependencies (edges) in the DAG.
    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Ids of the blocking dependencies of a task.
    pub fn blocking_dependencies(&self, id: &TaskId) -> Vec<TaskId> {
        let Some(&index) = self.task_index.get(id) else {
            return Vec::new();
        };
        self.graph
            .edges_directed(index, Direction::Incoming)
            .filter(|edge| edge.weight().is_blocking())
            .map(|edge| edge.weight().target.clone())
            .collect()
    }

    // ========== Scheduling Operations ==========

    /// Tasks whose blocking dependencies are all in `completed`.
    ///
    /// Soft and reference edges never delay readiness.
    pub fn ready_tasks<'a>(&'a self, completed: &HashSet<TaskId>) -> Vec<&'a AtomicTask> {
        self.graph
            .node_indices()
            .filter_map(|index| {
                let task = self.graph.node_weight(index)?;
                if completed.contains(&task.id) {
                    return None;
                }

                let deps_satisfied = self
                    .graph
                    .edges_directed(index, Direction::Incoming)
                    .filter(|edge| edge.weight().is_blocking())
                    .all(|edge| completed.contains(&edge.weight().target));

                deps_satisfied.then_some(task)
            })
            .collect()
    }

    fn sorted_indices(&self) -> Result<Vec<NodeIndex>> {
        toposort(&self.graph, None).map_err(|cycle| {
            let at = self
                .graph
                .node_weight(cycle.node_id())
                .map(|task| task.id.clone());
            Error::CycleDetected(at.into_iter().collect())
        })
    }

    /// Topological level per task: 0 for tasks without dependencies,
    /// otherwise one more than the deepest dependency.
    pub fn levels(&self) -> Result<HashMap<TaskId, usize>> {
        let mut by_index: HashMap<NodeIndex, usize> = HashMap::new();
        for index in self.sorted_indices()? {
            let level = self
                .graph
                .neighbors_directed(index, Direction::Incoming)
                .filter_map(|pred| by_index.get(&pred))
                .map(|level| level + 1)
                .max()
                .unwrap_or(0);
            by_index.insert(index, level);
        }
        Ok(by_index
            .into_iter()
            .filter_map(|(index, level)| {
                self.graph
                    .node_weight(index)
                    .map(|task| (task.id.clone(), level))
            })
            .collect())
    }

    /// Longest dependency chain by estimated duration, and its length in ms.
    pub fn critical_path(&self) -> Result<(Vec<TaskId>, u64)> {
        let mut finish: HashMap<NodeIndex, u64> = HashMap::new();
        let mut previous: HashMap<NodeIndex, NodeIndex> = HashMap::new();
        let mut best: Option<(NodeIndex, u64)> = None;

        for index in self.sorted_indices()? {
            let Some(task) = self.graph.node_weight(index) else {
                continue;
            };
            let mut start = 0;
            let mut via = None;
            for pred in self.graph.neighbors_directed(index, Direction::Incoming) {
                let pred_finish = finish.get(&pred).copied().unwrap_or(0);
                if via.is_none() || pred_finish > start {
                    start = pred_finish;
                    via = Some(pred);
                }
            }
            if let Some(pred) = via {
                previous.insert(index, pred);
            }
            let end = start.saturating_add(task.duration_ms());
            finish.insert(index, end);
            if best.map_or(true, |(_, longest)| end > longest) {
                best = Some((index, end));
            }
        }

        let Some((mut cursor, total)) = best else {
            return Ok((Vec::new(), 0));
        };
        let mut path = Vec::new();
        loop {
            if let Some(task) = self.graph.node_weight(cursor) {
                path.push(task.id.clone());
            }
            match previous.get(&cursor) {
                Some(&pred) => cursor = pred,
                None => break,
            }
        }
        path.reverse();
        Ok((path, total))
    }
}

impl Default for TaskDAG {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskDAG {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDAG")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
