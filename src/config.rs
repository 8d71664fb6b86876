use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::{Error, Result};

/// Batch formation strategy. The two are mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchingStrategy {
    Capacity,
    Affinity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    Continue,
    HaltOnFirstFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    RoundRobin,
    LeastLoaded,
    QualityWeighted,
    CostOptimized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringMode {
    /// Capability overlap, category fit and complexity fit.
    CapabilityMatch,
    /// Quality, reliability, speed and cost blend.
    QualityWeighted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    pub strategy: BatchingStrategy,
    pub max_batch_size: usize,
    pub max_tokens_per_batch: u64,
    pub min_similarity_threshold: f64,
    pub allow_cross_category_batching: bool,
    pub respect_dependencies: bool,
    pub balance_workloads: bool,
    pub max_group_size: usize,
    pub max_tokens_per_group: u64,
    /// Tasks at or above this size are "large".
    pub large_task_tokens: u64,
    /// Tasks at or below this size are "small".
    pub small_task_tokens: u64,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            strategy: BatchingStrategy::Capacity,
            max_batch_size: 10,
            max_tokens_per_batch: 8000,
            min_similarity_threshold: 0.3,
            allow_cross_category_batching: false,
            respect_dependencies: true,
            balance_workloads: true,
            max_group_size: 5,
            max_tokens_per_group: 8000,
            large_task_tokens: 2000,
            small_task_tokens: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub max_retries: u32,
    pub timeout_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub failure_policy: FailurePolicy,
    /// Capacity of each progress-event subscriber queue.
    pub event_buffer: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout_ms: 60_000,
            backoff_base_ms: 1000,
            backoff_max_ms: 30_000,
            failure_policy: FailurePolicy::Continue,
            event_buffer: 256,
        }
    }
}

impl ExecutionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Delay before the next attempt: `base * 2^retry`, capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let delay = self
            .backoff_base_ms
            .saturating_mul(2u64.saturating_pow(retry));
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Locality {
    #[default]
    Any,
    LocalOnly,
    RemoteOnly,
}

/// Hard limits an agent must meet to be selected at all.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConstraints {
    pub include_providers: BTreeSet<String>,
    pub exclude_providers: BTreeSet<String>,
    pub locality: Locality,
    pub max_cost_per_unit: Option<f64>,
    pub max_latency_ms: Option<u64>,
    pub input_type: Option<String>,
    pub output_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    pub load_balancing_strategy: LoadBalancingStrategy,
    pub scoring_mode: ScoringMode,
    pub max_fallbacks: usize,
    /// Admit never-probed agents, ranked after healthy and degraded ones.
    pub admit_unknown_health: bool,
    /// Applied to every batch the planner assigns.
    pub constraints: SelectionConstraints,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            load_balancing_strategy: LoadBalancingStrategy::QualityWeighted,
            scoring_mode: ScoringMode::CapabilityMatch,
            max_fallbacks: 3,
            admit_unknown_health: true,
            constraints: SelectionConstraints::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub probe_interval_secs: u64,
    pub probe_timeout_ms: u64,
    /// Number of recent latencies kept per agent.
    pub latency_window: usize,
    /// Executions needed before the error rate affects health.
    pub min_samples: u32,
    pub degraded_error_rate: f64,
    pub unhealthy_error_rate: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: 30,
            probe_timeout_ms: 5000,
            latency_window: 20,
            min_samples: 5,
            degraded_error_rate: 0.1,
            unhealthy_error_rate: 0.5,
        }
    }
}

impl HealthConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub batching: BatchingConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub selection: SelectionConfig,
    #[serde(default)]
    pub health: HealthConfig,
}

impl EngineConfig {
    pub fn config_dir() -> Result<PathBuf> {
        Ok(dirs::config_dir()
            .ok_or(Error::NoConfigDir)?
            .join("taskweave"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("taskweave.toml"))
    }

    /// Load from the default location, falling back to defaults when the
    /// file does not exist.
    pub fn load_default() -> Result<Self> {
        let path = Self::config_path()?;
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::load(&path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "loading config");
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        debug!(
            strategy = ?config.batching.strategy,
            max_retries = config.execution.max_retries,
            timeout_ms = config.execution.timeout_ms,
            "config loaded"
        );
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "config saved");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let b = &self.batching;
        if b.max_batch_size == 0 {
            return Err(Error::Validation("batching.max_batch_size must be > 0".into()));
        }
        if b.max_tokens_per_batch == 0 || b.max_tokens_per_group == 0 {
            return Err(Error::Validation(
                "batching token budgets must be > 0".into(),
            ));
        }
        if b.max_group_size < 2 {
            return Err(Error::Validation("batching.max_group_size must be >= 2".into()));
        }
        if !(0.0..=1.0).contains(&b.min_similarity_threshold) {
            return Err(Error::Validation(format!(
                "batching.min_similarity_threshold must be within [0, 1], got {}",
                b.min_similarity_threshold
            )));
        }
        if b.small_task_tokens >= b.large_task_tokens {
            return Err(Error::Validation(
                "batching.small_task_tokens must be below large_task_tokens".into(),
            ));
        }
        if self.execution.timeout_ms == 0 {
            return Err(Error::Validation("execution.timeout_ms must be > 0".into()));
        }
        if self.execution.event_buffer == 0 {
            return Err(Error::Validation("execution.event_buffer must be > 0".into()));
        }
        let h = &self.health;
        if h.probe_interval_secs == 0 || h.probe_timeout_ms == 0 {
            return Err(Error::Validation(
                "health probe interval and timeout must be > 0".into(),
            ));
        }
        if h.latency_window == 0 {
            return Err(Error::Validation("health.latency_window must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&h.degraded_error_rate)
            || !(0.0..=1.0).contains(&h.unhealthy_error_rate)
            || h.degraded_error_rate > h.unhealthy_error_rate
        {
            return Err(Error::Validation(
                "health error-rate thresholds must satisfy 0 <= degraded <= unhealthy <= 1".into(),
            ));
        }
        Ok(())
    }
}
