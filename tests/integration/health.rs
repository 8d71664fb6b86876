//! Health monitor integration tests.
//!
//! These tests verify that probe outcomes and execution statistics drive
//! agent health in the registry, and that selection follows.

use std::time::Duration;

use taskweave::config::{HealthConfig, SelectionConfig};
use taskweave::core::{AgentId, HealthState};
use taskweave::orchestration::{
    AgentSelector, HealthEvent, HealthMonitor, Orchestrator, Requirement,
};
use tokio_util::sync::CancellationToken;

use crate::fixtures::{agent, fast_config, generic, registry, Probe, ScriptedTransport};

fn quick_health() -> HealthConfig {
    HealthConfig {
        probe_timeout_ms: 200,
        ..HealthConfig::default()
    }
}

/// Test: Slow probe degrades an agent
/// Given an agent declaring a 100ms maximum latency
/// When its probe takes 150ms
/// Then it is marked degraded and ranked after a healthy peer
#[tokio::test(start_paused = true)]
async fn test_slow_probe_degrades() {
    let mut sluggish = agent("sluggish", &["translate"]);
    sluggish.max_latency_ms = 100;
    let agents = registry(vec![sluggish, agent("brisk", &["translate"])]);
    let transport = ScriptedTransport::new();
    transport.script_probes("sluggish", [Probe::Slow(Duration::from_millis(150))]);

    let (monitor, _events) = HealthMonitor::new(agents.clone(), transport, quick_health(), 16);
    let state = monitor.probe_once(&AgentId::from("sluggish")).await;
    assert_eq!(state, Some(HealthState::Degraded));

    let selector = AgentSelector::new(SelectionConfig::default());
    let requirement = Requirement::for_task(
        &generic("greet").with_capabilities(["translate"]),
        500,
        2000,
    );
    let selection = selector.select(&agents.snapshot(), &requirement).unwrap();
    assert_eq!(selection.primary.as_str(), "brisk");
    assert_eq!(selection.chain().len(), 2);
}

/// Test: Probe timeout marks an agent unhealthy
/// Given a probe that outlasts the probe timeout
/// When the agent is probed
/// Then it is unhealthy with one consecutive failure and a recorded error
#[tokio::test(start_paused = true)]
async fn test_probe_timeout_marks_unhealthy() {
    let agents = registry(vec![agent("hung", &[])]);
    let transport = ScriptedTransport::new();
    transport.script_probes("hung", [Probe::Slow(Duration::from_secs(10))]);

    let (monitor, mut events) = HealthMonitor::new(agents.clone(), transport, quick_health(), 16);
    let hung = AgentId::from("hung");
    assert_eq!(monitor.probe_once(&hung).await, Some(HealthState::Unhealthy));

    let stats = agents.stats(&hung).unwrap();
    assert_eq!(stats.consecutive_failures, 1);
    assert!(stats.last_error.unwrap().contains("timed out"));
    assert!(matches!(
        events.try_recv(),
        Ok(HealthEvent::ProbeFailed { consecutive_failures: 1, .. })
    ));
}

/// Test: Periodic probing
/// Given a monitor on a 30s interval and an agent failing every probe
/// When three rounds elapse
/// Then the agent has three consecutive failures, and the loop stops on
/// cancellation
#[tokio::test(start_paused = true)]
async fn test_spawned_monitor_probes_each_interval() {
    let agents = registry(vec![agent("flaky", &[]), agent("steady", &[])]);
    let transport = ScriptedTransport::new();
    transport.script_probes("flaky", [Probe::Fail, Probe::Fail, Probe::Fail]);

    let (monitor, _events) =
        HealthMonitor::new(agents.clone(), transport.clone(), quick_health(), 64);
    let cancel = CancellationToken::new();
    let handle = std::sync::Arc::new(monitor).spawn(cancel.clone());

    // Rounds at 0s, 30s and 60s.
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(transport.probes_to("flaky"), 3);
    assert_eq!(transport.probes_to("steady"), 3);
    let flaky = agents.stats(&AgentId::from("flaky")).unwrap();
    assert_eq!(flaky.consecutive_failures, 3);
    assert_eq!(agents.health(&AgentId::from("steady")), Some(HealthState::Healthy));

    cancel.cancel();
    handle.await.unwrap();
}

/// Test: Execution error rate drives health
/// Given an agent with enough recorded executions
/// When the error rate crosses the degraded and unhealthy thresholds
/// Then health follows, even though probes keep succeeding
#[tokio::test]
async fn test_error_rate_overrides_probe_verdict() {
    let agents = registry(vec![agent("shaky", &[])]);
    let shaky = AgentId::from("shaky");

    for _ in 0..4 {
        agents.record_execution(&shaky, 100, true).unwrap();
    }
    assert_eq!(agents.health(&shaky), Some(HealthState::Healthy));

    let transition = agents.record_execution(&shaky, 100, false).unwrap();
    assert_eq!(agents.health(&shaky), Some(HealthState::Degraded));
    assert_eq!(transition.map(|t| t.to), Some(HealthState::Degraded));

    let transport = ScriptedTransport::new();
    let (monitor, _events) = HealthMonitor::new(agents.clone(), transport, quick_health(), 16);
    assert_eq!(monitor.probe_once(&shaky).await, Some(HealthState::Degraded));

    for _ in 0..6 {
        agents.record_execution(&shaky, 100, false).unwrap();
    }
    assert_eq!(agents.health(&shaky), Some(HealthState::Unhealthy));
    assert!(agents.stats(&shaky).unwrap().error_rate > 0.5);
}

/// Test: Error-rate exclusion ends with a successful probe
/// Given an agent excluded for its execution error rate
/// When its next probe succeeds
/// Then it is healthy again and selected ahead of its peer
#[tokio::test]
async fn test_error_rate_exclusion_lifted_by_probe() {
    let agents = registry(vec![agent("shaky", &["summarize"]), agent("backup", &["summarize"])]);
    let shaky = AgentId::from("shaky");
    for _ in 0..5 {
        agents.record_execution(&shaky, 100, false).unwrap();
    }
    assert_eq!(agents.health(&shaky), Some(HealthState::Unhealthy));

    let selector = AgentSelector::new(SelectionConfig::default());
    let requirement = Requirement::for_task(
        &generic("digest").with_capabilities(["summarize"]),
        500,
        2000,
    );
    let excluded = selector.select(&agents.snapshot(), &requirement).unwrap();
    assert_eq!(excluded.chain(), vec![AgentId::from("backup")]);

    let (monitor, mut events) =
        HealthMonitor::new(agents.clone(), ScriptedTransport::new(), quick_health(), 16);
    assert_eq!(monitor.probe_once(&shaky).await, Some(HealthState::Healthy));
    assert_eq!(agents.stats(&shaky).unwrap().error_rate, 0.0);

    let restored = selector.select(&agents.snapshot(), &requirement).unwrap();
    assert_eq!(restored.primary.as_str(), "shaky");
    let mut transitions = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let HealthEvent::StateChanged { from, to, .. } = event {
            transitions.push((from, to));
        }
    }
    assert_eq!(transitions, vec![(HealthState::Unhealthy, HealthState::Healthy)]);
}

/// Test: Orchestrator-owned monitor stops on shutdown
/// Given an orchestrator with a running health monitor
/// When the orchestrator shuts down
/// Then the monitor task finishes
#[tokio::test(start_paused = true)]
async fn test_orchestrator_monitor_stops_on_shutdown() {
    let transport = ScriptedTransport::new();
    let orchestrator = Orchestrator::new(
        fast_config(),
        registry(vec![agent("worker", &[])]),
        transport.clone(),
    )
    .unwrap();
    let (handle, mut events) = orchestrator.start_health_monitor();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(matches!(
        events.try_recv(),
        Ok(HealthEvent::ProbeSucceeded { .. })
    ));

    orchestrator.shutdown();
    handle.await.unwrap();
    assert_eq!(transport.probes_to("worker"), 1);
}
