//! End-to-end scheduling pass.
//!
//! `plan` resolves cycles, forms batches with the configured strategy,
//! balances them without breaking dependency order, assigns an agent to
//! every batch and validates the result. The caller gets a plan that is
//! safe to dispatch or an error; never a partially valid plan.

use crate::config::{BatchingConfig, BatchingStrategy, EngineConfig, SelectionConstraints};
use crate::core::{Agent, AtomicTask, Batch, BatchId, TaskArena, TaskDAG, TaskId};
use crate::error::{Error, Result};
use crate::orchestration::registry::AgentRegistry;
use crate::orchestration::selector::{AgentSelection, AgentSelector, Requirement};
use crate::scheduling::affinity::AffinityBatcher;
use crate::scheduling::analyzer::{analyze, CycleReport};
use crate::scheduling::balancer::{MoveGuard, WorkloadBalancer};
use crate::scheduling::capacity::{BatchingStats, CapacityBatcher};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionPlan {
    pub strategy: BatchingStrategy,
    /// Batches in execution order.
    pub stages: Vec<Batch>,
    pub assignments: BTreeMap<BatchId, AgentSelection>,
    /// Topological order after cycle resolution.
    pub order: Vec<TaskId>,
    pub levels: BTreeMap<TaskId, usize>,
    pub critical_path: Vec<TaskId>,
    pub critical_path_ms: u64,
    pub stage_durations_ms: Vec<u64>,
    pub total_estimated_duration_ms: u64,
    pub cycle_report: CycleReport,
    pub stats: BatchingStats,
    pub balance_moves: usize,
    /// Tasks as scheduled, with cycle-breaking edges removed.
    #[serde(skip)]
    pub arena: TaskArena,
}

impl ExecutionPlan {
    fn empty(strategy: BatchingStrategy) -> Self {
        Self {
            strategy,
            stages: Vec::new(),
            assignments: BTreeMap::new(),
            order: Vec::new(),
            levels: BTreeMap::new(),
            critical_path: Vec::new(),
            critical_path_ms: 0,
            stage_durations_ms: Vec::new(),
            total_estimated_duration_ms: 0,
            cycle_report: CycleReport::default(),
            stats: BatchingStats::default(),
            balance_moves: 0,
            arena: TaskArena::new(),
        }
    }

    pub fn assignment(&self, batch_id: &BatchId) -> Option<&AgentSelection> {
        self.assignments.get(batch_id)
    }

    pub fn task_count(&self) -> usize {
        self.stages.iter().map(Batch::len).sum()
    }

    /// Index of the stage holding `task_id`.
    pub fn stage_of(&self, task_id: &TaskId) -> Option<usize> {
        self.stages.iter().position(|stage| stage.contains(task_id))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Refuses balancing moves that would break blocking dependency order.
struct DependencyGuard<'a> {
    arena: &'a TaskArena,
}

impl MoveGuard for DependencyGuard<'_> {
    fn allows(&self, task: &TaskId, _from: usize, to: usize, batches: &[Batch]) -> bool {
        let stage_of = |id: &TaskId| batches.iter().position(|batch| batch.contains(id));

        let dependencies_before = self
            .arena
            .blocking_dependencies_of(task)
            .iter()
            .all(|dep| stage_of(dep).map_or(true, |stage| stage < to));
        let dependents_after = self
            .arena
            .iter()
            .filter(|other| other.blocks_on(task))
            .all(|other| stage_of(&other.id).map_or(true, |stage| stage > to));
        dependencies_before && dependents_after
    }
}

/// Check that every task appears exactly once and that every blocking
/// dependency runs in an earlier stage, or earlier in the same sequential
/// stage.
pub fn validate_plan(stages: &[Batch], arena: &TaskArena) -> Result<()> {
    validate_stages(stages, arena, &TaskDAG::from_arena(arena)?)
}

/// Replay the stages in order: a parallel stage may only hold tasks that
/// are ready when it starts, a sequential one only tasks that are ready once
/// the members before them finished.
fn validate_stages(stages: &[Batch], arena: &TaskArena, dag: &TaskDAG) -> Result<()> {
    let mut seen: HashSet<&TaskId> = HashSet::new();
    for id in stages.iter().flat_map(|stage| stage.task_ids.iter()) {
        if !seen.insert(id) {
            return Err(Error::Validation(format!(
                "task {} is scheduled more than once",
                id
            )));
        }
    }
    if let Some(missing) = arena.ids().find(|id| !seen.contains(id)) {
        return Err(Error::Validation(format!("task {} is not scheduled", missing)));
    }

    let violation = |id: &TaskId, completed: &HashSet<TaskId>| {
        dag.blocking_dependencies(id)
            .into_iter()
            .find(|dependency| !completed.contains(dependency))
            .map(|dependency| Error::DependencyViolation {
                task_id: id.clone(),
                dependency,
            })
    };

    let mut completed: HashSet<TaskId> = HashSet::new();
    for stage in stages {
        if stage.parallel {
            let ready: HashSet<&TaskId> =
                dag.ready_tasks(&completed).into_iter().map(|task| &task.id).collect();
            for id in stage.task_ids.iter().filter(|id| !ready.contains(id)) {
                if let Some(error) = violation(id, &completed) {
                    return Err(error);
                }
            }
            completed.extend(stage.task_ids.iter().cloned());
        } else {
            for id in &stage.task_ids {
                if let Some(error) = violation(id, &completed) {
                    return Err(error);
                }
                completed.insert(id.clone());
            }
        }
    }
    Ok(())
}

pub struct ExecutionPlanner {
    batching: BatchingConfig,
    constraints: SelectionConstraints,
    selector: AgentSelector,
}

impl ExecutionPlanner {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            batching: config.batching.clone(),
            constraints: config.selection.constraints.clone(),
            selector: AgentSelector::new(config.selection.clone()),
        }
    }

    /// Replace the constraints every batch assignment must satisfy.
    pub fn with_constraints(mut self, constraints: SelectionConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn selector(&self) -> &AgentSelector {
        &self.selector
    }

    /// Plan against the current registry snapshot.
    pub fn plan(&self, tasks: Vec<AtomicTask>, registry: &AgentRegistry) -> Result<ExecutionPlan> {
        self.plan_with_agents(tasks, &registry.snapshot())
    }

    pub fn plan_with_agents(&self, tasks: Vec<AtomicTask>, agents: &[Agent]) -> Result<ExecutionPlan> {
        let mut arena = TaskArena::from_tasks(tasks);
        if arena.is_empty() {
            return Ok(ExecutionPlan::empty(self.batching.strategy));
        }

        let analysis = analyze(&mut arena);
        self.check_capabilities(&arena, agents)?;

        let (stages, stats) = self.compose(&arena, &analysis.order);
        let (stages, balance_moves) = if self.batching.balance_workloads {
            let outcome = WorkloadBalancer::with_guard(DependencyGuard { arena: &arena })
                .balance(stages, &arena);
            (outcome.batches, outcome.moves)
        } else {
            (stages, 0)
        };

        let (stages, assignments) = self.assign(stages, &arena, agents)?;
        let dag = TaskDAG::from_arena(&arena)?;
        validate_stages(&stages, &arena, &dag)?;

        let levels: BTreeMap<TaskId, usize> = dag.levels()?.into_iter().collect();
        let (critical_path, critical_path_ms) = dag.critical_path()?;
        let stage_durations_ms: Vec<u64> =
            stages.iter().map(|stage| stage.estimated_duration_ms).collect();
        let total_estimated_duration_ms = stage_durations_ms
            .iter()
            .copied()
            .fold(0, u64::saturating_add);

        info!(
            tasks = arena.len(),
            stages = stages.len(),
            dropped_edges = analysis.report.dropped_edges.len(),
            balance_moves,
            total_estimated_duration_ms,
            "execution plan ready"
        );
        Ok(ExecutionPlan {
            strategy: self.batching.strategy,
            stages,
            assignments,
            order: analysis.order,
            levels,
            critical_path,
            critical_path_ms,
            stage_durations_ms,
            total_estimated_duration_ms,
            cycle_report: analysis.report,
            stats,
            balance_moves,
            arena,
        })
    }

    /// Reject tasks whose capabilities no registered agent offers, before
    /// anything is dispatched.
    fn check_capabilities(&self, arena: &TaskArena, agents: &[Agent]) -> Result<()> {
        for task in arena.iter() {
            let required = &task.required_capabilities;
            if required.is_empty() || agents.iter().any(|agent| agent.covers(required)) {
                continue;
            }
            let missing = agents
                .iter()
                .map(|agent| agent.missing(required))
                .min_by_key(Vec::len)
                .unwrap_or_else(|| required.iter().cloned().collect());
            return Err(Error::MissingCapability {
                task_id: task.id.clone(),
                missing,
            });
        }
        if agents.is_empty() {
            return Err(Error::AgentUnavailable("no agents registered".into()));
        }
        Ok(())
    }

    fn compose(&self, arena: &TaskArena, order: &[TaskId]) -> (Vec<Batch>, BatchingStats) {
        match self.batching.strategy {
            BatchingStrategy::Capacity => {
                let outcome = CapacityBatcher::new(&self.batching).compose(arena, order);
                (outcome.batches, outcome.stats)
            }
            BatchingStrategy::Affinity => {
                let outcome = AffinityBatcher::new(&self.batching).compose(arena);
                let ungrouped: HashSet<&TaskId> = outcome.ungrouped.iter().collect();
                let mut stages = outcome.groups;
                stages.extend(
                    order
                        .iter()
                        .filter(|id| ungrouped.contains(id))
                        .map(|id| Batch::single(id.clone(), arena)),
                );
                let oversized = stages
                    .iter()
                    .filter(|stage| stage.estimated_tokens > self.batching.max_tokens_per_batch)
                    .count();
                let stats = BatchingStats::from_batches(&stages, oversized, 0);
                (stages, stats)
            }
        }
    }

    /// Pick an agent per stage. A stage whose combined capabilities no
    /// single agent offers is split into one stage per member.
    fn assign(
        &self,
        stages: Vec<Batch>,
        arena: &TaskArena,
        agents: &[Agent],
    ) -> Result<(Vec<Batch>, BTreeMap<BatchId, AgentSelection>)> {
        let mut assigned = Vec::with_capacity(stages.len());
        let mut assignments = BTreeMap::new();

        for stage in stages {
            match self.select_for(&stage, arena, agents) {
                Ok(selection) => {
                    assignments.insert(stage.id.clone(), selection);
                    assigned.push(stage);
                }
                Err(Error::MissingCapability { .. }) if stage.len() > 1 => {
                    debug!(batch_id = %stage.id, tasks = stage.len(), "no single agent covers batch, splitting");
                    for id in stage.task_ids {
                        let single = Batch::single(id, arena);
                        let selection = self.select_for(&single, arena, agents)?;
                        assignments.insert(single.id.clone(), selection);
                        assigned.push(single);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok((assigned, assignments))
    }

    fn select_for(&self, stage: &Batch, arena: &TaskArena, agents: &[Agent]) -> Result<AgentSelection> {
        let requirement = Requirement::for_batch(
            stage,
            arena,
            self.batching.small_task_tokens,
            self.batching.large_task_tokens,
        )
        .with_constraints(self.constraints.clone());
        self.selector.select(agents, &requirement)
    }
}
