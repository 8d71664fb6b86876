//! Execution integration tests.
//!
//! These tests verify retry, timeout and fallback behavior of the
//! execution coordinator, batch assembly, and stage-by-stage workflow
//! execution through the orchestrator.

use std::sync::Arc;

use serde_json::json;

use taskweave::config::FailurePolicy;
use taskweave::core::{AgentId, Batch, HealthState, TaskArena, TaskCategory, TaskId, TaskState};
use taskweave::orchestration::{
    AgentSelection, EventKind, ExecutionCoordinator, ExecutionEvent, Orchestrator,
    CONCAT_SEPARATOR,
};
use tokio::sync::mpsc;

use crate::fixtures::{agent, fast_config, generic, registry, task, ScriptedTransport, Step};

fn drain(rx: &mut mpsc::Receiver<ExecutionEvent>) -> Vec<ExecutionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn selection(chain: &[&str]) -> AgentSelection {
    AgentSelection {
        primary: AgentId::from(chain[0]),
        primary_score: 1.0,
        fallbacks: Vec::new(),
        confidence: 1.0,
    }
}

/// Test: Timeout falls back to the next agent
/// Given a primary agent that never answers and a healthy fallback
/// When the task is executed
/// Then the attempt times out, the coordinator switches agents and the
/// fallback completes the task
#[tokio::test(start_paused = true)]
async fn test_timeout_switches_to_fallback() {
    let agents = registry(vec![agent("stalled", &[]), agent("backup", &[])]);
    let transport = ScriptedTransport::new();
    transport.script("stalled", [Step::Hang]);

    let config = fast_config();
    let coordinator =
        ExecutionCoordinator::new(agents.clone(), transport.clone(), config.execution);
    let mut events = coordinator.events().subscribe();

    let result = coordinator
        .execute_task(
            &generic("report"),
            &[AgentId::from("stalled"), AgentId::from("backup")],
            "wf-test",
        )
        .await;

    assert_eq!(result.state, TaskState::Completed);
    assert_eq!(result.agent_id, Some(AgentId::from("backup")));
    assert_eq!(result.retry_count, 1);
    assert_eq!(transport.calls_to("stalled"), 1);
    assert_eq!(transport.calls_to("backup"), 1);

    let kinds: Vec<EventKind> = drain(&mut events).into_iter().map(|e| e.kind).collect();
    assert!(kinds.contains(&EventKind::AgentSwitched));
    assert!(kinds.contains(&EventKind::RetryAttempted));
    assert_eq!(kinds.first(), Some(&EventKind::TaskStarted));
    assert_eq!(kinds.last(), Some(&EventKind::TaskCompleted));

    // The abandoned call no longer counts against the stalled agent.
    assert!(agents.active_routes().is_empty());
    assert_eq!(agents.stats(&"stalled".into()).unwrap().failure_count, 1);
}

/// Test: Retries exhausted on timeouts
/// Given a single agent that never answers
/// When the task is executed with one retry allowed
/// Then the terminal state is timeout with the last error recorded
#[tokio::test(start_paused = true)]
async fn test_exhausted_timeouts_end_in_timeout_state() {
    let agents = registry(vec![agent("stalled", &[])]);
    let transport = ScriptedTransport::new();
    transport.script("stalled", [Step::Hang, Step::Hang]);

    let mut config = fast_config();
    config.execution.max_retries = 1;
    let coordinator = ExecutionCoordinator::new(agents, transport.clone(), config.execution);

    let result = coordinator
        .execute_task(&generic("report"), &[AgentId::from("stalled")], "wf-test")
        .await;

    assert_eq!(result.state, TaskState::Timeout);
    assert_eq!(result.retry_count, 1);
    assert_eq!(result.error.as_ref().unwrap().kind, "timeout");
    assert_eq!(transport.calls_to("stalled"), 2);
}

/// Test: Schema mismatch is not retried on the same agent
/// Given a single agent that returns a null output
/// When the task is executed
/// Then it fails immediately with schema_mismatch
#[tokio::test]
async fn test_schema_mismatch_without_fallback_is_terminal() {
    let agents = registry(vec![agent("garbled", &[])]);
    let transport = ScriptedTransport::new();
    transport.script("garbled", [Step::Null]);

    let coordinator =
        ExecutionCoordinator::new(agents, transport.clone(), fast_config().execution);
    let result = coordinator
        .execute_task(&generic("report"), &[AgentId::from("garbled")], "wf-test")
        .await;

    assert_eq!(result.state, TaskState::Failed);
    assert_eq!(result.retry_count, 0);
    assert_eq!(result.error.as_ref().unwrap().kind, "schema_mismatch");
    assert_eq!(transport.calls_to("garbled"), 1);
}

/// Test: Schema mismatch moves to the next agent
/// Given a garbling primary and a working fallback
/// When the task is executed
/// Then the fallback produces the output
#[tokio::test(start_paused = true)]
async fn test_schema_mismatch_with_fallback_switches() {
    let agents = registry(vec![agent("garbled", &[]), agent("backup", &[])]);
    let transport = ScriptedTransport::new();
    transport.script("garbled", [Step::Null]);

    let coordinator =
        ExecutionCoordinator::new(agents, transport.clone(), fast_config().execution);
    let result = coordinator
        .execute_task(
            &generic("report"),
            &[AgentId::from("garbled"), AgentId::from("backup")],
            "wf-test",
        )
        .await;

    assert_eq!(result.state, TaskState::Completed);
    assert_eq!(result.agent_id, Some(AgentId::from("backup")));
    assert_eq!(transport.calls_to("backup"), 1);
}

/// Test: Unhealthy agents are never attempted
/// Given a primary marked unhealthy after planning
/// When the task is executed
/// Then the primary is skipped without consuming a retry
#[tokio::test]
async fn test_unhealthy_primary_skipped() {
    let agents = registry(vec![agent("down", &[]), agent("backup", &[])]);
    agents
        .set_health(&"down".into(), HealthState::Unhealthy)
        .unwrap();
    let transport = ScriptedTransport::new();

    let coordinator =
        ExecutionCoordinator::new(agents, transport.clone(), fast_config().execution);
    let mut events = coordinator.events().subscribe();
    let result = coordinator
        .execute_task(
            &generic("report"),
            &[AgentId::from("down"), AgentId::from("backup")],
            "wf-test",
        )
        .await;

    assert_eq!(result.state, TaskState::Completed);
    assert_eq!(result.retry_count, 0);
    assert_eq!(transport.calls_to("down"), 0);
    assert!(drain(&mut events)
        .iter()
        .any(|e| e.kind == EventKind::AgentSwitched));
}

/// Test: Exhausted chain of unhealthy agents
/// Given a chain where every agent is unhealthy
/// When the task is executed
/// Then it fails with agent_unhealthy without any call
#[tokio::test]
async fn test_all_unhealthy_fails_with_reason() {
    let agents = registry(vec![agent("down", &[])]);
    agents
        .set_health(&"down".into(), HealthState::Unhealthy)
        .unwrap();
    let transport = ScriptedTransport::new();

    let coordinator =
        ExecutionCoordinator::new(agents, transport.clone(), fast_config().execution);
    let result = coordinator
        .execute_task(&generic("report"), &[AgentId::from("down")], "wf-test")
        .await;

    assert_eq!(result.state, TaskState::Failed);
    assert_eq!(result.error.as_ref().unwrap().kind, "agent_unhealthy");
    assert!(transport.calls().is_empty());
}

/// Test: Parallel batch continues past failures
/// Given a parallel batch where one member always fails
/// When the batch is executed
/// Then the other members complete and the merged output holds theirs
#[tokio::test(start_paused = true)]
async fn test_parallel_batch_collects_every_outcome() {
    let agents = registry(vec![agent("worker", &[])]);
    let transport = ScriptedTransport::new();
    transport.fail_task("b");

    let mut config = fast_config();
    config.execution.max_retries = 1;
    let coordinator = ExecutionCoordinator::new(agents, transport.clone(), config.execution);

    let arena = TaskArena::from_tasks(vec![generic("a"), generic("b"), generic("c")]);
    let batch = Batch::new(vec!["a".into(), "b".into(), "c".into()], true, &arena);
    let result = coordinator
        .execute_batch(&batch, &arena, &selection(&["worker"]), "wf-test")
        .await;

    assert_eq!(result.completed, 2);
    assert_eq!(result.failed, 1);
    assert!(!result.all_succeeded());
    assert_eq!(result.merged_output.as_array().unwrap().len(), 2);
    assert!(result.confidence > 0.0 && result.confidence < 1.0);
    assert_eq!(result.results[1].retry_count, 1);
    assert_eq!(
        result.results[1].error.as_ref().unwrap().kind,
        "execution_error"
    );
    assert_eq!(transport.calls_to("worker"), 4);
}

/// Test: Documentation batches concatenate outputs
/// Given a sequential documentation batch with string outputs
/// When the batch is executed
/// Then the merged output joins the members with the separator
#[tokio::test]
async fn test_documentation_batch_concatenates() {
    let agents = registry(vec![agent("writer", &[])]);
    let transport = ScriptedTransport::new();
    transport.script(
        "writer",
        [
            Step::Succeed(json!("# Intro")),
            Step::Succeed(json!("# Usage")),
        ],
    );
    let coordinator =
        ExecutionCoordinator::new(agents, transport, fast_config().execution);

    let arena = TaskArena::from_tasks(vec![
        task("intro", "write intro", TaskCategory::Documentation),
        task("usage", "write usage", TaskCategory::Documentation),
    ]);
    let batch = Batch::new(vec!["intro".into(), "usage".into()], false, &arena);
    let result = coordinator
        .execute_batch(&batch, &arena, &selection(&["writer"]), "wf-docs")
        .await;

    assert_eq!(
        result.merged_output,
        json!(format!("# Intro{}# Usage", CONCAT_SEPARATOR))
    );
}

/// Test: Failed dependencies short-circuit dependents
/// Given a -> b where a always fails, and an independent task c
/// When the workflow runs with the continue policy
/// Then b fails with dependency_violation without being attempted and c
/// still completes
#[tokio::test(start_paused = true)]
async fn test_failed_dependency_short_circuits() {
    let transport = ScriptedTransport::new();
    transport.fail_task("a");
    let mut config = fast_config();
    config.execution.max_retries = 0;
    config.execution.failure_policy = FailurePolicy::Continue;
    let orchestrator =
        Orchestrator::new(config, registry(vec![agent("worker", &[])]), transport.clone())
            .unwrap();

    let result = orchestrator
        .run(vec![generic("a"), generic("b").depends_on("a"), generic("c")])
        .await
        .unwrap();

    assert!(!result.is_success());
    assert_eq!(result.completed, 1);
    assert_eq!(result.failed, 2);
    let b = result.task(&TaskId::from("b")).unwrap();
    assert_eq!(b.error.as_ref().unwrap().kind, "dependency_violation");
    assert!(transport.calls().iter().all(|(_, task, _)| task != "b"));
    assert_eq!(
        result.task(&TaskId::from("c")).unwrap().state,
        TaskState::Completed
    );
}

/// Test: Workflow events and context flow
/// Given a two-step chain
/// When the workflow runs
/// Then the dependent receives its dependency's output as context, and
/// batch and task events bracket the work
#[tokio::test]
async fn test_workflow_events_and_context() {
    let transport = ScriptedTransport::new();
    let orchestrator = Orchestrator::new(
        fast_config(),
        registry(vec![agent("worker", &[])]),
        transport.clone(),
    )
    .unwrap();
    let mut events = orchestrator.subscribe();

    let result = orchestrator
        .run(vec![generic("fetch"), generic("summarize").depends_on("fetch")])
        .await
        .unwrap();
    assert!(result.is_success());
    assert_eq!(result.completed, 2);

    let summarize = result.task(&TaskId::from("summarize")).unwrap();
    assert_eq!(summarize.output.as_ref().unwrap()["context"], 1);
    // Outputs are released once the workflow finishes.
    assert_eq!(orchestrator.context().stats().total_entries, 0);

    let events = drain(&mut events);
    assert_eq!(events.first().map(|e| &e.kind), Some(&EventKind::BatchStarted));
    assert_eq!(events.last().map(|e| &e.kind), Some(&EventKind::BatchCompleted));
    let completed: Vec<&TaskId> = events
        .iter()
        .filter(|e| e.kind == EventKind::TaskCompleted)
        .filter_map(|e| e.task_id())
        .collect();
    assert_eq!(
        completed,
        vec![&TaskId::from("fetch"), &TaskId::from("summarize")]
    );
    assert!(events
        .iter()
        .any(|e| e.kind == EventKind::TaskProgress { percentage: 100 }));
}

/// Test: Shutdown cancels in-flight work
/// Given a task whose agent never answers
/// When the orchestrator is shut down mid-flight
/// Then the task fails as cancelled instead of waiting for the timeout
#[tokio::test]
async fn test_shutdown_cancels_in_flight_task() {
    let transport = ScriptedTransport::new();
    transport.script("worker", [Step::Hang]);
    let mut config = fast_config();
    config.execution.timeout_ms = 600_000;
    let orchestrator = Arc::new(
        Orchestrator::new(config, registry(vec![agent("worker", &[])]), transport).unwrap(),
    );

    let runner = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.run(vec![generic("stuck")]).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    orchestrator.shutdown();

    let result = tokio::time::timeout(std::time::Duration::from_secs(5), runner)
        .await
        .expect("run did not stop after shutdown")
        .unwrap()
        .unwrap();
    let stuck = result.task(&TaskId::from("stuck")).unwrap();
    assert_eq!(stuck.state, TaskState::Failed);
    assert_eq!(stuck.error.as_ref().unwrap().kind, "cancelled");
}

/// Test: A second workflow on the same orchestrator starts clean
/// Given a completed run of a -> b
/// When the same task ids run again and a now fails
/// Then b fails with dependency_violation instead of reusing the first
/// run's output for a
#[tokio::test(start_paused = true)]
async fn test_second_workflow_does_not_reuse_outputs() {
    let transport = ScriptedTransport::new();
    let mut config = fast_config();
    config.execution.max_retries = 0;
    let orchestrator =
        Orchestrator::new(config, registry(vec![agent("worker", &[])]), transport.clone())
            .unwrap();
    let tasks = || vec![generic("a"), generic("b").depends_on("a")];

    let first = orchestrator.run(tasks()).await.unwrap();
    assert!(first.is_success());
    assert_eq!(orchestrator.context().stats().total_entries, 0);

    transport.fail_task("a");
    let second = orchestrator.run(tasks()).await.unwrap();
    assert_ne!(first.workflow_id, second.workflow_id);
    assert_eq!(second.task(&TaskId::from("a")).unwrap().state, TaskState::Failed);
    let b = second.task(&TaskId::from("b")).unwrap();
    assert_eq!(b.state, TaskState::Failed);
    assert_eq!(b.error.as_ref().unwrap().kind, "dependency_violation");
    assert_eq!(
        transport.calls().iter().filter(|(_, task, _)| task == "b").count(),
        1
    );
}
