//! Scheduling passes.
//!
//! Everything here is a synchronous, deterministic transformation over an
//! in-memory task arena: cycle resolution and ordering, batch formation,
//! workload balancing and the planner that chains them.

pub mod affinity;
pub mod analyzer;
pub mod balancer;
pub mod capacity;
pub mod planner;
pub mod similarity;

pub use affinity::{AffinityBatcher, AffinityOutcome};
pub use analyzer::{
    analyze, detect_cycles, resolve_cycles, topological_order, Analysis, CycleReport, DroppedEdge,
};
pub use balancer::{BalanceOutcome, MoveGuard, Unguarded, WorkloadBalancer};
pub use capacity::{BatchingStats, CapacityBatcher, CapacityOutcome};
pub use planner::{validate_plan, ExecutionPlan, ExecutionPlanner};
pub use similarity::{similarity, Similarity};
