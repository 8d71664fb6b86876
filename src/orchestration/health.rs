//! Health monitoring for agents.
//!
//! The `HealthMonitor` periodically probes every registered agent through
//! the [`AgentTransport`] and records the verdict in the [`AgentRegistry`],
//! which the selector reads on every decision.
//!
//! ## Probe verdicts
//!
//! - A probe that answers within the agent's declared `max_latency_ms`
//!   marks it `healthy` and resets its consecutive-failure counter.
//! - A probe that answers, but slower than `max_latency_ms`, marks it
//!   `degraded`.
//! - A probe that errors or exceeds the probe timeout marks it `unhealthy`
//!   and increments the consecutive-failure counter.
//!
//! Probes of different agents run concurrently and each is bounded by the
//! probe timeout, so one slow agent never delays the others. Dispatch never
//! waits on a probe: it reads whatever the registry last recorded.

use crate::config::HealthConfig;
use crate::core::{AgentId, HealthState};
use crate::orchestration::registry::{AgentRegistry, HealthTransition};
use crate::orchestration::transport::AgentTransport;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Events emitted by the health monitor.
///
/// Delivery is best effort: when the receiver falls behind, events are
/// dropped rather than delaying the probe loop.
#[derive(Debug, Clone, PartialEq)]
pub enum HealthEvent {
    /// A probe answered.
    ProbeSucceeded {
        /// The probed agent.
        agent_id: AgentId,
        /// Round-trip time of the probe.
        latency_ms: u64,
    },
    /// A probe errored or timed out.
    ProbeFailed {
        /// The probed agent.
        agent_id: AgentId,
        /// Failures in a row, including this one.
        consecutive_failures: u32,
        /// Why the probe failed.
        error: String,
    },
    /// The effective health of an agent changed.
    StateChanged {
        /// The agent whose state changed.
        agent_id: AgentId,
        /// Previous effective state.
        from: HealthState,
        /// New effective state.
        to: HealthState,
    },
}

impl From<HealthTransition> for HealthEvent {
    fn from(transition: HealthTransition) -> Self {
        HealthEvent::StateChanged {
            agent_id: transition.agent_id,
            from: transition.from,
            to: transition.to,
        }
    }
}

/// Periodic liveness prober.
pub struct HealthMonitor {
    registry: Arc<AgentRegistry>,
    transport: Arc<dyn AgentTransport>,
    config: HealthConfig,
    event_tx: mpsc::Sender<HealthEvent>,
}

impl HealthMonitor {
    /// Create a monitor and the receiving end of its event channel.
    pub fn new(
        registry: Arc<AgentRegistry>,
        transport: Arc<dyn AgentTransport>,
        config: HealthConfig,
        buffer: usize,
    ) -> (Self, mpsc::Receiver<HealthEvent>) {
        let (event_tx, event_rx) = mpsc::channel(buffer.max(1));
        (
            Self {
                registry,
                transport,
                config,
                event_tx,
            },
            event_rx,
        )
    }

    /// The configuration this monitor was created with.
    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    fn emit(&self, event: HealthEvent) {
        if self.event_tx.try_send(event).is_err() {
            debug!("health event dropped");
        }
    }

    fn emit_transition(&self, transition: Option<HealthTransition>) {
        if let Some(transition) = transition {
            self.emit(transition.into());
        }
    }

    /// Probe a single agent and record the verdict.
    ///
    /// Returns the agent's effective health afterwards, or `None` if the
    /// agent is not registered.
    pub async fn probe_once(&self, agent_id: &AgentId) -> Option<HealthState> {
        let agent = self.registry.get(agent_id)?;
        let started = Instant::now();
        let outcome = tokio::time::timeout(
            self.config.probe_timeout(),
            self.transport.probe(&agent),
        )
        .await;
        let latency = started.elapsed();

        let recorded = match outcome {
            Ok(Ok(())) => {
                let latency_ms = latency.as_millis() as u64;
                let slow = latency > Duration::from_millis(agent.max_latency_ms);
                if slow {
                    warn!(agent_id = %agent_id, latency_ms, "probe slower than declared max latency");
                }
                self.emit(HealthEvent::ProbeSucceeded {
                    agent_id: agent_id.clone(),
                    latency_ms,
                });
                self.registry.record_probe_success(agent_id, latency_ms, slow)
            }
            Ok(Err(e)) => self.probe_failed(agent_id, e.to_string()),
            Err(_) => self.probe_failed(
                agent_id,
                format!("probe timed out after {:?}", self.config.probe_timeout()),
            ),
        };

        match recorded {
            Ok(transition) => self.emit_transition(transition),
            // deregistered while the probe was in flight
            Err(e) => debug!(agent_id = %agent_id, error = %e, "probe result discarded"),
        }
        self.registry.health(agent_id)
    }

    fn probe_failed(
        &self,
        agent_id: &AgentId,
        error: String,
    ) -> crate::Result<Option<HealthTransition>> {
        let transition = self.registry.record_probe_failure(agent_id, &error)?;
        let consecutive_failures = self
            .registry
            .stats(agent_id)
            .map(|stats| stats.consecutive_failures)
            .unwrap_or(0);
        warn!(agent_id = %agent_id, consecutive_failures, error = %error, "probe failed");
        self.emit(HealthEvent::ProbeFailed {
            agent_id: agent_id.clone(),
            consecutive_failures,
            error,
        });
        Ok(transition)
    }

    /// Probe every registered agent concurrently.
    pub async fn probe_all(&self) -> Vec<(AgentId, Option<HealthState>)> {
        let ids = self.registry.ids();
        let probes = ids.iter().map(|id| self.probe_once(id));
        let states = join_all(probes).await;
        ids.into_iter().zip(states).collect()
    }

    /// Run the probe loop until `cancel` fires.
    ///
    /// The first round runs immediately; later rounds follow the configured
    /// interval. A round that overruns the interval delays the next one
    /// instead of stacking.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.probe_interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(
                interval_secs = self.config.probe_interval_secs,
                agents = self.registry.len(),
                "health monitor started"
            );
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let results = self.probe_all().await;
                        debug!(probed = results.len(), "health probe round complete");
                    }
                }
            }
            info!("health monitor stopped");
        })
    }
}
