//! Agent records as seen by the scheduler.
//!
//! Agents are external workers. The engine only knows their capability
//! tags, declared performance, cost and the health/load it observes.

use crate::core::id::AgentId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Agent type that marks a general-purpose worker.
pub const GENERAL_AGENT_TYPE: &str = "general";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl HealthState {
    /// Healthy and degraded agents may receive work.
    pub fn is_available(&self) -> bool {
        matches!(self, HealthState::Healthy | HealthState::Degraded)
    }

    /// Sort rank used when ordering candidates: lower is preferred.
    pub fn rank(&self) -> u8 {
        match self {
            HealthState::Healthy => 0,
            HealthState::Degraded => 1,
            HealthState::Unknown => 2,
            HealthState::Unhealthy => 3,
        }
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::Unknown
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthState::Healthy => write!(f, "healthy"),
            HealthState::Degraded => write!(f, "degraded"),
            HealthState::Unhealthy => write!(f, "unhealthy"),
            HealthState::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceProfile {
    pub avg_latency_ms: f64,
    /// Fraction of successful executions, in [0, 1].
    pub reliability: f64,
    /// Output quality rating, in [0, 1].
    pub quality: f64,
    /// Units of work per second.
    pub throughput: f64,
}

impl Default for PerformanceProfile {
    fn default() -> Self {
        Self {
            avg_latency_ms: 1000.0,
            reliability: 0.9,
            quality: 0.8,
            throughput: 1.0,
        }
    }
}

fn default_agent_type() -> String {
    GENERAL_AGENT_TYPE.to_string()
}

fn default_max_latency_ms() -> u64 {
    30_000
}

fn default_max_concurrent() -> usize {
    4
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    #[serde(default)]
    pub provider: String,
    #[serde(default = "default_agent_type")]
    pub agent_type: String,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// Accepted input types; empty accepts anything.
    #[serde(default)]
    pub input_types: BTreeSet<String>,
    /// Produced output types; empty produces anything.
    #[serde(default)]
    pub output_types: BTreeSet<String>,
    #[serde(default)]
    pub performance: PerformanceProfile,
    #[serde(default)]
    pub cost_per_unit: f64,
    /// A probe slower than this marks the agent degraded.
    #[serde(default = "default_max_latency_ms")]
    pub max_latency_ms: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_tasks: usize,
    #[serde(default)]
    pub local: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_limit: Option<u32>,
    #[serde(default)]
    pub health: HealthState,
    /// Current load in [0, 1].
    #[serde(default)]
    pub load: f64,
}

impl Agent {
    pub fn new(id: impl Into<AgentId>) -> Self {
        Self {
            id: id.into(),
            provider: String::new(),
            agent_type: default_agent_type(),
            capabilities: BTreeSet::new(),
            input_types: BTreeSet::new(),
            output_types: BTreeSet::new(),
            performance: PerformanceProfile::default(),
            cost_per_unit: 0.0,
            max_latency_ms: default_max_latency_ms(),
            max_concurrent_tasks: default_max_concurrent(),
            local: false,
            token_limit: None,
            health: HealthState::Unknown,
            load: 0.0,
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_type(mut self, agent_type: &str) -> Self {
        self.agent_type = agent_type.to_string();
        self
    }

    pub fn with_provider(mut self, provider: &str) -> Self {
        self.provider = provider.to_string();
        self
    }

    pub fn with_performance(mut self, performance: PerformanceProfile) -> Self {
        self.performance = performance;
        self
    }

    pub fn with_cost(mut self, cost_per_unit: f64) -> Self {
        self.cost_per_unit = cost_per_unit;
        self
    }

    pub fn with_max_latency_ms(mut self, max_latency_ms: u64) -> Self {
        self.max_latency_ms = max_latency_ms;
        self
    }

    pub fn with_health(mut self, health: HealthState) -> Self {
        self.health = health;
        self
    }

    pub fn local(mut self) -> Self {
        self.local = true;
        self
    }

    pub fn is_general_purpose(&self) -> bool {
        self.agent_type == GENERAL_AGENT_TYPE
    }

    /// Whether every required capability is offered.
    pub fn covers(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.capabilities)
    }

    pub fn missing(&self, required: &BTreeSet<String>) -> Vec<String> {
        required.difference(&self.capabilities).cloned().collect()
    }

    pub fn accepts_input(&self, input_type: &str) -> bool {
        self.input_types.is_empty() || self.input_types.contains(input_type)
    }

    pub fn produces_output(&self, output_type: &str) -> bool {
        self.output_types.is_empty() || self.output_types.contains(output_type)
    }
}
