//! Core domain models for the scheduling engine.
//!
//! This module contains the fundamental data structures shared by the
//! scheduling passes and the orchestration runtime: identifiers, atomic
//! tasks, agents, batches, execution results and the task DAG.

pub mod agent;
pub mod batch;
pub mod dag;
pub mod id;
pub mod result;
pub mod task;

pub use agent::{Agent, HealthState, PerformanceProfile, GENERAL_AGENT_TYPE};
pub use batch::Batch;
pub use dag::TaskDAG;
pub use id::{AgentId, BatchId, TaskId};
pub use result::{ErrorDescriptor, TaskExecutionResult, TaskState};
pub use task::{
    AtomicTask, Dependency, DependencyKind, DependencyPriority, MergeRule, TaskArena,
    TaskCategory, TaskComplexity,
};
