//! Concurrent agent registry.
//!
//! Each agent lives in its own slot behind a `parking_lot::RwLock`, so the
//! prober and concurrent executions only contend on the agent they touch.
//! The outer map lock is held just long enough to insert, remove or clone a
//! slot handle. The active-route table (task -> agent) is a separate mutex.

use crate::config::HealthConfig;
use crate::core::{Agent, AgentId, HealthState, TaskId};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};

/// A health change observed by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthTransition {
    pub agent_id: AgentId,
    pub from: HealthState,
    pub to: HealthState,
}

/// Runtime statistics tracked per agent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentStats {
    /// Verdict of the most recent liveness probe.
    pub probe_state: HealthState,
    /// Verdict from the execution error rate, once enough samples exist.
    pub error_state: Option<HealthState>,
    pub consecutive_failures: u32,
    pub active_tasks: usize,
    pub success_count: u32,
    pub failure_count: u32,
    pub error_rate: f64,
    pub latencies_ms: VecDeque<u64>,
    pub last_check: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl AgentStats {
    /// Effective health: the worse of the probe and error-rate verdicts.
    pub fn health(&self) -> HealthState {
        let severity = |state: HealthState| match state {
            HealthState::Unknown => 0,
            HealthState::Healthy => 1,
            HealthState::Degraded => 2,
            HealthState::Unhealthy => 3,
        };
        match self.error_state {
            Some(error_state) if severity(error_state) > severity(self.probe_state) => error_state,
            _ => self.probe_state,
        }
    }

    pub fn average_latency_ms(&self) -> Option<f64> {
        if self.latencies_ms.is_empty() {
            return None;
        }
        let total: u64 = self.latencies_ms.iter().sum();
        Some(total as f64 / self.latencies_ms.len() as f64)
    }

    fn record_latency(&mut self, latency_ms: u64, window: usize) {
        self.latencies_ms.push_back(latency_ms);
        while self.latencies_ms.len() > window.max(1) {
            self.latencies_ms.pop_front();
        }
    }
}

struct AgentSlot {
    agent: Agent,
    stats: AgentStats,
}

impl AgentSlot {
    /// Agent record with observed health, load and rolling statistics.
    fn view(&self, min_samples: u32) -> Agent {
        let mut agent = self.agent.clone();
        agent.health = self.stats.health();
        agent.load = if agent.max_concurrent_tasks == 0 {
            1.0
        } else {
            (self.stats.active_tasks as f64 / agent.max_concurrent_tasks as f64).min(1.0)
        };
        if let Some(latency) = self.stats.average_latency_ms() {
            agent.performance.avg_latency_ms = latency;
        }
        let samples = self.stats.success_count + self.stats.failure_count;
        if samples >= min_samples && samples > 0 {
            agent.performance.reliability = self.stats.success_count as f64 / samples as f64;
        }
        agent
    }
}

#[derive(Default)]
struct Slots {
    order: Vec<AgentId>,
    by_id: HashMap<AgentId, Arc<RwLock<AgentSlot>>>,
}

pub struct AgentRegistry {
    slots: RwLock<Slots>,
    routes: Mutex<HashMap<TaskId, AgentId>>,
    config: HealthConfig,
}

impl AgentRegistry {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            slots: RwLock::new(Slots::default()),
            routes: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn with_agents(config: HealthConfig, agents: impl IntoIterator<Item = Agent>) -> Self {
        let registry = Self::new(config);
        for agent in agents {
            registry.register(agent);
        }
        registry
    }

    fn slot(&self, id: &AgentId) -> Result<Arc<RwLock<AgentSlot>>> {
        self.slots
            .read()
            .by_id
            .get(id)
            .cloned()
            .ok_or_else(|| Error::AgentNotFound(id.clone()))
    }

    /// Register or replace an agent. The declared health seeds the probe
    /// verdict; statistics of a replaced agent are kept.
    pub fn register(&self, agent: Agent) {
        let mut slots = self.slots.write();
        let id = agent.id.clone();
        if let Some(existing) = slots.by_id.get(&id) {
            existing.write().agent = agent;
            debug!(agent_id = %id, "agent updated");
            return;
        }
        let stats = AgentStats {
            probe_state: agent.health,
            ..AgentStats::default()
        };
        slots.order.push(id.clone());
        slots
            .by_id
            .insert(id.clone(), Arc::new(RwLock::new(AgentSlot { agent, stats })));
        info!(agent_id = %id, "agent registered");
    }

    pub fn deregister(&self, id: &AgentId) -> Option<Agent> {
        let mut slots = self.slots.write();
        let slot = slots.by_id.remove(id)?;
        slots.order.retain(|existing| existing != id);
        let agent = slot.read().agent.clone();
        info!(agent_id = %id, "agent deregistered");
        Some(agent)
    }

    pub fn contains(&self, id: &AgentId) -> bool {
        self.slots.read().by_id.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.slots.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Agent ids in registration order.
    pub fn ids(&self) -> Vec<AgentId> {
        self.slots.read().order.clone()
    }

    /// Current view of one agent.
    pub fn get(&self, id: &AgentId) -> Option<Agent> {
        self.slot(id)
            .ok()
            .map(|slot| slot.read().view(self.config.min_samples))
    }

    pub fn health(&self, id: &AgentId) -> Option<HealthState> {
        self.slot(id).ok().map(|slot| slot.read().stats.health())
    }

    pub fn stats(&self, id: &AgentId) -> Option<AgentStats> {
        self.slot(id).ok().map(|slot| slot.read().stats.clone())
    }

    /// Copy of every agent, in registration order, for scoring.
    pub fn snapshot(&self) -> Vec<Agent> {
        let handles: Vec<Arc<RwLock<AgentSlot>>> = {
            let slots = self.slots.read();
            slots
                .order
                .iter()
                .filter_map(|id| slots.by_id.get(id).cloned())
                .collect()
        };
        handles
            .iter()
            .map(|slot| slot.read().view(self.config.min_samples))
            .collect()
    }

    fn update<F>(&self, id: &AgentId, f: F) -> Result<Option<HealthTransition>>
    where
        F: FnOnce(&mut AgentStats),
    {
        let slot = self.slot(id)?;
        let mut slot = slot.write();
        let before = slot.stats.health();
        f(&mut slot.stats);
        let after = slot.stats.health();
        if before == after {
            return Ok(None);
        }
        info!(agent_id = %id, from = %before, to = %after, "agent health changed");
        Ok(Some(HealthTransition {
            agent_id: id.clone(),
            from: before,
            to: after,
        }))
    }

    /// Force the probe verdict, e.g. from an operator action.
    pub fn set_health(&self, id: &AgentId, state: HealthState) -> Result<Option<HealthTransition>> {
        self.update(id, |stats| {
            stats.probe_state = state;
            if state != HealthState::Unhealthy {
                stats.consecutive_failures = 0;
            }
        })
    }

    /// A probe answered; `slow` marks it degraded.
    pub fn record_probe_success(
        &self,
        id: &AgentId,
        latency_ms: u64,
        slow: bool,
    ) -> Result<Option<HealthTransition>> {
        let window = self.config.latency_window;
        self.update(id, |stats| {
            stats.probe_state = if slow {
                HealthState::Degraded
            } else {
                HealthState::Healthy
            };
            stats.consecutive_failures = 0;
            stats.record_latency(latency_ms, window);
            stats.last_check = Some(Utc::now());
            // An unhealthy agent is never dispatched, so its error rate can
            // only recover through a fresh sample window.
            if stats.error_state == Some(HealthState::Unhealthy) {
                stats.error_state = None;
                stats.success_count = 0;
                stats.failure_count = 0;
                stats.error_rate = 0.0;
            }
        })
    }

    /// A probe failed or timed out.
    pub fn record_probe_failure(
        &self,
        id: &AgentId,
        error: &str,
    ) -> Result<Option<HealthTransition>> {
        self.update(id, |stats| {
            stats.probe_state = HealthState::Unhealthy;
            stats.consecutive_failures += 1;
            stats.last_error = Some(error.to_string());
            stats.last_check = Some(Utc::now());
        })
    }

    /// Record an execution outcome and re-derive the error-rate verdict.
    pub fn record_execution(
        &self,
        id: &AgentId,
        latency_ms: u64,
        success: bool,
    ) -> Result<Option<HealthTransition>> {
        let config = self.config.clone();
        self.update(id, |stats| {
            if success {
                stats.success_count += 1;
            } else {
                stats.failure_count += 1;
            }
            stats.record_latency(latency_ms, config.latency_window);

            let samples = stats.success_count + stats.failure_count;
            stats.error_rate = stats.failure_count as f64 / samples as f64;
            if samples >= config.min_samples {
                stats.error_state = Some(if stats.error_rate > config.unhealthy_error_rate {
                    HealthState::Unhealthy
                } else if stats.error_rate > config.degraded_error_rate {
                    HealthState::Degraded
                } else {
                    HealthState::Healthy
                });
            }
        })
    }

    /// Route a task to an agent and count it against the agent's load.
    pub fn begin_task(&self, task_id: &TaskId, agent_id: &AgentId) -> Result<()> {
        let slot = self.slot(agent_id)?;
        slot.write().stats.active_tasks += 1;
        self.routes.lock().insert(task_id.clone(), agent_id.clone());
        Ok(())
    }

    /// Release the route held by a task, if any.
    pub fn finish_task(&self, task_id: &TaskId) {
        let Some(agent_id) = self.routes.lock().remove(task_id) else {
            return;
        };
        if let Ok(slot) = self.slot(&agent_id) {
            let mut slot = slot.write();
            slot.stats.active_tasks = slot.stats.active_tasks.saturating_sub(1);
        }
    }

    pub fn route(&self, task_id: &TaskId) -> Option<AgentId> {
        self.routes.lock().get(task_id).cloned()
    }

    pub fn active_routes(&self) -> HashMap<TaskId, AgentId> {
        self.routes.lock().clone()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new(HealthConfig::default())
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agents", &self.len())
            .field("routes", &self.routes.lock().len())
            .finish()
    }
}
