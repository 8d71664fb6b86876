//! Atomic task data model.
//!
//! Atomic tasks arrive already labelled by the external classifier. The
//! engine treats every field as read-only except `dependencies`, which the
//! cycle resolver may prune.

use crate::core::id::TaskId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Strength of a dependency edge. Only `Blocking` gates readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    #[serde(alias = "BLOCKING")]
    Blocking,
    #[serde(alias = "SOFT")]
    Soft,
    #[serde(alias = "REFERENCE")]
    Reference,
}

impl DependencyKind {
    fn weight(kind: Option<Self>) -> u32 {
        match kind {
            Some(DependencyKind::Blocking) => 10,
            Some(DependencyKind::Soft) => 3,
            Some(DependencyKind::Reference) => 1,
            None => 5,
        }
    }
}

impl std::fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DependencyKind::Blocking => write!(f, "blocking"),
            DependencyKind::Soft => write!(f, "soft"),
            DependencyKind::Reference => write!(f, "reference"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyPriority {
    #[serde(alias = "LOW")]
    Low,
    #[serde(alias = "MEDIUM")]
    Medium,
    #[serde(alias = "HIGH")]
    High,
}

impl DependencyPriority {
    fn weight(priority: Option<Self>) -> u32 {
        match priority {
            Some(DependencyPriority::High) => 5,
            Some(DependencyPriority::Medium) => 3,
            Some(DependencyPriority::Low) => 1,
            None => 0,
        }
    }
}

/// An edge from a task to the task it depends on.
///
/// An unspecified `kind` is treated as blocking for readiness, but weighs
/// less than an explicit blocking edge when a cycle has to be broken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    #[serde(alias = "target_task_id")]
    pub target: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<DependencyKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<DependencyPriority>,
}

impl Dependency {
    pub fn blocking(target: impl Into<TaskId>) -> Self {
        Self {
            target: target.into(),
            kind: Some(DependencyKind::Blocking),
            priority: None,
        }
    }

    pub fn soft(target: impl Into<TaskId>) -> Self {
        Self {
            target: target.into(),
            kind: Some(DependencyKind::Soft),
            priority: None,
        }
    }

    pub fn reference(target: impl Into<TaskId>) -> Self {
        Self {
            target: target.into(),
            kind: Some(DependencyKind::Reference),
            priority: None,
        }
    }

    pub fn with_priority(mut self, priority: DependencyPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn is_blocking(&self) -> bool {
        matches!(self.kind, None | Some(DependencyKind::Blocking))
    }

    /// Cost of dropping this edge when breaking a cycle.
    pub fn criticality(&self) -> u32 {
        DependencyKind::weight(self.kind) + DependencyPriority::weight(self.priority)
    }
}

/// How the outputs of a batch's members are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeRule {
    /// Join textual outputs with a separator.
    Concatenate,
    /// Collect outputs into an array in member order.
    Array,
    /// Object keyed by task id.
    Keyed,
}

/// Closed set of task categories assigned by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    #[serde(alias = "RESEARCH")]
    Research,
    #[serde(alias = "ANALYSIS")]
    Analysis,
    #[serde(alias = "CREATION")]
    Creation,
    #[serde(alias = "DOCUMENTATION")]
    Documentation,
    #[serde(alias = "CODING")]
    Coding,
    #[serde(alias = "VALIDATION")]
    Validation,
    #[serde(alias = "GENERIC")]
    Generic,
}

impl TaskCategory {
    /// Agent types (or capability tags) considered a natural fit.
    pub fn expected_agent_types(&self) -> &'static [&'static str] {
        match self {
            TaskCategory::Research => &["research", "search", "web_search"],
            TaskCategory::Analysis => &["analysis", "analytics", "data"],
            TaskCategory::Creation => &["creative", "writer", "image_generation"],
            TaskCategory::Documentation => &["documentation", "writer", "text"],
            TaskCategory::Coding => &["code", "coding", "code_generation"],
            TaskCategory::Validation => &["validation", "review", "testing"],
            TaskCategory::Generic => &["general"],
        }
    }

    /// Baseline processing time before size is taken into account.
    pub fn base_duration_ms(&self) -> u64 {
        match self {
            TaskCategory::Research => 30_000,
            TaskCategory::Analysis => 25_000,
            TaskCategory::Creation => 40_000,
            TaskCategory::Documentation => 20_000,
            TaskCategory::Coding => 45_000,
            TaskCategory::Validation => 15_000,
            TaskCategory::Generic => 20_000,
        }
    }

    pub fn merge_rule(&self) -> MergeRule {
        match self {
            TaskCategory::Research | TaskCategory::Creation | TaskCategory::Documentation => {
                MergeRule::Concatenate
            }
            TaskCategory::Coding => MergeRule::Keyed,
            TaskCategory::Analysis | TaskCategory::Validation | TaskCategory::Generic => {
                MergeRule::Array
            }
        }
    }
}

impl Default for TaskCategory {
    fn default() -> Self {
        Self::Generic
    }
}

impl std::fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskCategory::Research => "research",
            TaskCategory::Analysis => "analysis",
            TaskCategory::Creation => "creation",
            TaskCategory::Documentation => "documentation",
            TaskCategory::Coding => "coding",
            TaskCategory::Validation => "validation",
            TaskCategory::Generic => "generic",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskComplexity {
    Small,
    Medium,
    Large,
}

/// Milliseconds added per unit of estimated size when no explicit
/// duration is provided.
pub const DURATION_MS_PER_TOKEN: u64 = 5;

fn default_batchable() -> bool {
    true
}

/// The smallest schedulable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomicTask {
    pub id: TaskId,
    pub content: String,
    #[serde(default)]
    pub category: TaskCategory,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    /// Opaque cost unit, approximately tokens.
    #[serde(default, alias = "estimated_tokens")]
    pub estimated_size: u64,
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,
    #[serde(default = "default_batchable")]
    pub batchable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration_ms: Option<u64>,
}

impl AtomicTask {
    pub fn new(id: impl Into<TaskId>, content: &str, category: TaskCategory) -> Self {
        Self {
            id: id.into(),
            content: content.to_string(),
            category,
            dependencies: Vec::new(),
            estimated_size: 0,
            required_capabilities: BTreeSet::new(),
            batchable: true,
            estimated_duration_ms: None,
        }
    }

    pub fn with_dependency(mut self, dependency: Dependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn depends_on(self, target: impl Into<TaskId>) -> Self {
        self.with_dependency(Dependency::blocking(target))
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.estimated_size = size;
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.estimated_duration_ms = Some(duration_ms);
        self
    }

    pub fn not_batchable(mut self) -> Self {
        self.batchable = false;
        self
    }

    /// Estimated processing time, explicit or derived from category and size.
    pub fn duration_ms(&self) -> u64 {
        self.estimated_duration_ms.unwrap_or_else(|| {
            self.category
                .base_duration_ms()
                .saturating_add(self.estimated_size.saturating_mul(DURATION_MS_PER_TOKEN))
        })
    }

    pub fn complexity(&self, small_threshold: u64, large_threshold: u64) -> TaskComplexity {
        if self.estimated_size >= large_threshold {
            TaskComplexity::Large
        } else if self.estimated_size <= small_threshold {
            TaskComplexity::Small
        } else {
            TaskComplexity::Medium
        }
    }

    pub fn blocking_dependencies(&self) -> impl Iterator<Item = &TaskId> {
        self.dependencies
            .iter()
            .filter(|dep| dep.is_blocking())
            .map(|dep| &dep.target)
    }

    /// Whether this task holds any dependency edge (of any kind) to `other`.
    pub fn references(&self, other: &TaskId) -> bool {
        self.dependencies.iter().any(|dep| &dep.target == other)
    }

    pub fn blocks_on(&self, other: &TaskId) -> bool {
        self.dependencies
            .iter()
            .any(|dep| dep.is_blocking() && &dep.target == other)
    }
}

/// Indexed arena of tasks. Insertion order is preserved and drives every
/// deterministic traversal in the scheduling passes.
#[derive(Debug, Clone, Default)]
pub struct TaskArena {
    tasks: Vec<AtomicTask>,
    index: HashMap<TaskId, usize>,
}

impl TaskArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an arena; a later task with an already-seen id replaces the
    /// earlier definition in place.
    pub fn from_tasks(tasks: impl IntoIterator<Item = AtomicTask>) -> Self {
        let mut arena = Self::new();
        for task in tasks {
            arena.insert(task);
        }
        arena
    }

    pub fn insert(&mut self, task: AtomicTask) {
        match self.index.get(&task.id) {
            Some(&slot) => self.tasks[slot] = task,
            None => {
                self.index.insert(task.id.clone(), self.tasks.len());
                self.tasks.push(task);
            }
        }
    }

    pub fn get(&self, id: &TaskId) -> Option<&AtomicTask> {
        self.index.get(id).map(|&slot| &self.tasks[slot])
    }

    pub fn get_mut(&mut self, id: &TaskId) -> Option<&mut AtomicTask> {
        match self.index.get(id) {
            Some(&slot) => self.tasks.get_mut(slot),
            None => None,
        }
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.index.contains_key(id)
    }

    /// Position of a task in insertion order.
    pub fn position(&self, id: &TaskId) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AtomicTask> {
        self.tasks.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = &TaskId> {
        self.tasks.iter().map(|task| &task.id)
    }

    /// Dependencies of `id` that resolve to a task in this arena. Edges to
    /// unknown ids are ignored.
    pub fn resolved_dependencies<'a>(
        &'a self,
        id: &TaskId,
    ) -> impl Iterator<Item = &'a Dependency> + 'a {
        self.get(id)
            .into_iter()
            .flat_map(|task| task.dependencies.iter())
            .filter(move |dep| self.contains(&dep.target))
    }

    /// Blocking dependencies of `id` that resolve to a task in this arena.
    pub fn blocking_dependencies_of(&self, id: &TaskId) -> Vec<TaskId> {
        self.resolved_dependencies(id)
            .filter(|dep| dep.is_blocking())
            .map(|dep| dep.target.clone())
            .collect()
    }

    /// Remove every edge from `source` to `target`. Returns whether any
    /// edge was removed.
    pub fn remove_dependency(&mut self, source: &TaskId, target: &TaskId) -> bool {
        match self.get_mut(source) {
            Some(task) => {
                let before = task.dependencies.len();
                task.dependencies.retain(|dep| &dep.target != target);
                task.dependencies.len() != before
            }
            None => false,
        }
    }

    pub fn into_tasks(self) -> Vec<AtomicTask> {
        self.tasks
    }
}
