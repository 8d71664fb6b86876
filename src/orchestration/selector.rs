//! Health-aware agent selection.
//!
//! Selection runs over a registry snapshot. Candidates are filtered on
//! capabilities, I/O types, health and constraints, scored, ordered by the
//! configured load-balancing strategy and split into a primary plus an
//! ordered fallback chain.

use crate::config::{
    LoadBalancingStrategy, Locality, ScoringMode, SelectionConfig, SelectionConstraints,
};
use crate::core::{
    Agent, AgentId, AtomicTask, Batch, HealthState, TaskArena, TaskCategory, TaskComplexity,
    TaskId,
};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// Candidates within this fraction of a hard limit are penalized.
const CONSTRAINT_PROXIMITY: f64 = 0.8;
const PROXIMITY_PENALTY: f64 = 0.8;

/// What a task or batch needs from an agent.
#[derive(Debug, Clone, PartialEq)]
pub struct Requirement {
    /// Task reported in capability errors.
    pub subject: TaskId,
    pub capabilities: BTreeSet<String>,
    pub category: TaskCategory,
    pub complexity: TaskComplexity,
    pub constraints: SelectionConstraints,
}

impl Requirement {
    pub fn for_task(task: &AtomicTask, small_tokens: u64, large_tokens: u64) -> Self {
        Self {
            subject: task.id.clone(),
            capabilities: task.required_capabilities.clone(),
            category: task.category,
            complexity: task.complexity(small_tokens, large_tokens),
            constraints: SelectionConstraints::default(),
        }
    }

    /// Union of member capabilities; complexity from the batch token total.
    pub fn for_batch(batch: &Batch, arena: &TaskArena, small_tokens: u64, large_tokens: u64) -> Self {
        let complexity = if batch.estimated_tokens >= large_tokens {
            TaskComplexity::Large
        } else if batch.estimated_tokens <= small_tokens {
            TaskComplexity::Small
        } else {
            TaskComplexity::Medium
        };
        Self {
            subject: batch.task_ids.first().cloned().unwrap_or_default(),
            capabilities: batch.capabilities.clone(),
            category: batch.category(arena),
            complexity,
            constraints: SelectionConstraints::default(),
        }
    }

    pub fn with_constraints(mut self, constraints: SelectionConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    fn rotation_key(&self) -> String {
        self.capabilities
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackOption {
    pub agent_id: AgentId,
    pub score: f64,
    /// Relative score loss against the primary, in [0, 1].
    pub confidence_penalty: f64,
    pub cost_delta: f64,
    pub duration_delta_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSelection {
    pub primary: AgentId,
    pub primary_score: f64,
    pub fallbacks: Vec<FallbackOption>,
    /// Confidence in the primary, in [0, 1].
    pub confidence: f64,
}

impl AgentSelection {
    /// Primary followed by the fallbacks, in the order they should be tried.
    pub fn chain(&self) -> Vec<AgentId> {
        std::iter::once(self.primary.clone())
            .chain(self.fallbacks.iter().map(|fb| fb.agent_id.clone()))
            .collect()
    }
}

/// Candidates that satisfy the requirement and may receive work.
pub fn filter_candidates<'a>(
    agents: &'a [Agent],
    requirement: &Requirement,
    admit_unknown: bool,
) -> Vec<&'a Agent> {
    let constraints = &requirement.constraints;
    agents
        .iter()
        .filter(|agent| agent.covers(&requirement.capabilities))
        .filter(|agent| match agent.health {
            HealthState::Healthy | HealthState::Degraded => true,
            HealthState::Unknown => admit_unknown,
            HealthState::Unhealthy => false,
        })
        .filter(|agent| {
            constraints
                .input_type
                .as_deref()
                .map_or(true, |t| agent.accepts_input(t))
                && constraints
                    .output_type
                    .as_deref()
                    .map_or(true, |t| agent.produces_output(t))
        })
        .filter(|agent| {
            (constraints.include_providers.is_empty()
                || constraints.include_providers.contains(&agent.provider))
                && !constraints.exclude_providers.contains(&agent.provider)
        })
        .filter(|agent| match constraints.locality {
            Locality::Any => true,
            Locality::LocalOnly => agent.local,
            Locality::RemoteOnly => !agent.local,
        })
        .filter(|agent| {
            constraints
                .max_cost_per_unit
                .map_or(true, |max| agent.cost_per_unit <= max)
                && constraints
                    .max_latency_ms
                    .map_or(true, |max| agent.performance.avg_latency_ms <= max as f64)
        })
        .collect()
}

/// Integration score in [0, 100]: capability overlap, category fit and
/// complexity fit.
pub fn score_capability_match(agent: &Agent, requirement: &Requirement) -> f64 {
    let overlap = if requirement.capabilities.is_empty() {
        1.0
    } else {
        let matched = requirement
            .capabilities
            .intersection(&agent.capabilities)
            .count();
        matched as f64 / requirement.capabilities.len() as f64
    };
    let mut score = overlap * 50.0;

    let expected = requirement.category.expected_agent_types();
    let type_match = expected.contains(&agent.agent_type.as_str())
        || agent
            .capabilities
            .iter()
            .any(|cap| expected.contains(&cap.as_str()));
    if type_match {
        score += 30.0;
    }

    match requirement.complexity {
        TaskComplexity::Large if !agent.is_general_purpose() => score += 20.0,
        TaskComplexity::Small if agent.is_general_purpose() => score += 10.0,
        _ => {}
    }
    score
}

/// Cross-provider score in [0, 1] blending quality, reliability, speed and
/// cost efficiency.
pub fn score_quality_weighted(agent: &Agent, constraints: &SelectionConstraints) -> f64 {
    let perf = &agent.performance;
    let speed = if perf.avg_latency_ms <= 0.0 {
        1.0
    } else {
        (1000.0 / perf.avg_latency_ms).min(1.0)
    };
    let cost_efficiency = if agent.cost_per_unit <= 0.0 {
        1.0
    } else {
        (0.01 / agent.cost_per_unit).min(1.0)
    };
    let mut score =
        perf.quality * 0.4 + perf.reliability * 0.25 + speed * 0.2 + cost_efficiency * 0.15;

    let near_cost = constraints
        .max_cost_per_unit
        .is_some_and(|max| agent.cost_per_unit > max * CONSTRAINT_PROXIMITY);
    let near_latency = constraints
        .max_latency_ms
        .is_some_and(|max| perf.avg_latency_ms > max as f64 * CONSTRAINT_PROXIMITY);
    if near_cost || near_latency {
        score *= PROXIMITY_PENALTY;
    }
    score
}

#[derive(Debug, Clone)]
struct Scored<'a> {
    agent: &'a Agent,
    score: f64,
    /// Position in the snapshot, the final tie-breaker.
    position: usize,
}

fn health_tier(agent: &Agent) -> u8 {
    agent.health.rank()
}

pub struct AgentSelector {
    config: SelectionConfig,
    cursors: Mutex<HashMap<String, usize>>,
}

impl AgentSelector {
    pub fn new(config: SelectionConfig) -> Self {
        Self {
            config,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SelectionConfig {
        &self.config
    }

    fn score(&self, agent: &Agent, requirement: &Requirement) -> f64 {
        match self.config.scoring_mode {
            ScoringMode::CapabilityMatch => score_capability_match(agent, requirement),
            ScoringMode::QualityWeighted => {
                score_quality_weighted(agent, &requirement.constraints)
            }
        }
    }

    fn confidence(&self, score: f64) -> f64 {
        let normalized = match self.config.scoring_mode {
            ScoringMode::CapabilityMatch => score / 100.0,
            ScoringMode::QualityWeighted => score,
        };
        normalized.clamp(0.0, 1.0)
    }

    /// Filtered candidates, best first. Healthy agents always precede
    /// degraded ones, which precede never-probed ones.
    pub fn rank<'a>(&self, agents: &'a [Agent], requirement: &Requirement) -> Vec<(&'a Agent, f64)> {
        let candidates =
            filter_candidates(agents, requirement, self.config.admit_unknown_health);
        let mut scored: Vec<Scored<'a>> = candidates
            .into_iter()
            .enumerate()
            .map(|(position, agent)| Scored {
                agent,
                score: self.score(agent, requirement),
                position,
            })
            .collect();

        match self.config.load_balancing_strategy {
            LoadBalancingStrategy::QualityWeighted => scored.sort_by(|a, b| {
                health_tier(a.agent)
                    .cmp(&health_tier(b.agent))
                    .then(b.score.total_cmp(&a.score))
                    .then(a.position.cmp(&b.position))
            }),
            LoadBalancingStrategy::LeastLoaded => scored.sort_by(|a, b| {
                health_tier(a.agent)
                    .cmp(&health_tier(b.agent))
                    .then(a.agent.load.total_cmp(&b.agent.load))
                    .then(b.score.total_cmp(&a.score))
                    .then(a.position.cmp(&b.position))
            }),
            LoadBalancingStrategy::CostOptimized => scored.sort_by(|a, b| {
                health_tier(a.agent)
                    .cmp(&health_tier(b.agent))
                    .then(a.agent.cost_per_unit.total_cmp(&b.agent.cost_per_unit))
                    .then(b.score.total_cmp(&a.score))
                    .then(a.position.cmp(&b.position))
            }),
            LoadBalancingStrategy::RoundRobin => {
                scored.sort_by(|a, b| {
                    health_tier(a.agent)
                        .cmp(&health_tier(b.agent))
                        .then(a.position.cmp(&b.position))
                });
                self.rotate(&mut scored, requirement);
            }
        }

        scored.into_iter().map(|s| (s.agent, s.score)).collect()
    }

    /// Rotate the best health tier by the per-capability cursor.
    fn rotate(&self, scored: &mut [Scored<'_>], requirement: &Requirement) {
        let Some(first) = scored.first() else {
            return;
        };
        let tier = health_tier(first.agent);
        let tier_len = scored
            .iter()
            .take_while(|s| health_tier(s.agent) == tier)
            .count();

        let mut cursors = self.cursors.lock();
        let cursor = cursors.entry(requirement.rotation_key()).or_insert(0);
        let offset = *cursor % tier_len;
        *cursor = cursor.wrapping_add(1);
        scored[..tier_len].rotate_left(offset);
    }

    pub fn select(&self, agents: &[Agent], requirement: &Requirement) -> Result<AgentSelection> {
        let ranked = self.rank(agents, requirement);
        let Some(&(primary, primary_score)) = ranked.first() else {
            return Err(self.rejection(agents, requirement));
        };

        let fallbacks = ranked
            .iter()
            .skip(1)
            .take(self.config.max_fallbacks)
            .map(|&(agent, score)| FallbackOption {
                agent_id: agent.id.clone(),
                score,
                confidence_penalty: if primary_score > 0.0 {
                    (1.0 - score / primary_score).clamp(0.0, 1.0)
                } else {
                    0.0
                },
                cost_delta: agent.cost_per_unit - primary.cost_per_unit,
                duration_delta_ms: agent.performance.avg_latency_ms
                    - primary.performance.avg_latency_ms,
            })
            .collect::<Vec<_>>();

        debug!(
            subject = %requirement.subject,
            agent_id = %primary.id,
            score = primary_score,
            fallbacks = fallbacks.len(),
            "agent selected"
        );
        Ok(AgentSelection {
            primary: primary.id.clone(),
            primary_score,
            fallbacks,
            confidence: self.confidence(primary_score),
        })
    }

    /// Why nothing survived: no capable agent at all, or none usable.
    fn rejection(&self, agents: &[Agent], requirement: &Requirement) -> Error {
        if agents.iter().any(|agent| agent.covers(&requirement.capabilities)) {
            return Error::AgentUnavailable(format!(
                "no healthy agent satisfies the requirements of task {}",
                requirement.subject
            ));
        }
        let missing = agents
            .iter()
            .map(|agent| agent.missing(&requirement.capabilities))
            .min_by_key(Vec::len)
            .unwrap_or_else(|| requirement.capabilities.iter().cloned().collect());
        Error::MissingCapability {
            task_id: requirement.subject.clone(),
            missing,
        }
    }
}

impl Default for AgentSelector {
    fn default() -> Self {
        Self::new(SelectionConfig::default())
    }
}
