//! Orchestration layer for the taskweave engine.
//!
//! This module holds the concurrent runtime pieces: the agent registry and
//! its health monitor, agent selection, the execution coordinator with its
//! event bus and context pool, and the workflow orchestrator tying them
//! together.

pub mod assembly;
pub mod context;
pub mod events;
pub mod executor;
pub mod health;
pub mod registry;
pub mod selector;
pub mod transport;
pub mod workflow;

pub use assembly::{BatchResult, CONCAT_SEPARATOR};
pub use context::{ContextEntry, ContextPool, ContextPoolStats, ContextType};
pub use events::{EventBus, EventKind, EventSubject, ExecutionEvent};
pub use executor::ExecutionCoordinator;
pub use health::{HealthEvent, HealthMonitor};
pub use registry::{AgentRegistry, AgentStats, HealthTransition};
pub use selector::{AgentSelection, AgentSelector, FallbackOption, Requirement};
pub use transport::{AgentRequest, AgentResponse, AgentTransport, ContextItem};
pub use workflow::{Orchestrator, WorkflowResult};
