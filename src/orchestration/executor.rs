//! Per-task execution with retry, timeout and fallback.
//!
//! Each task walks `queued -> running -> {completed | failed | timeout}`.
//! A failed attempt is retried with exponential backoff while retries
//! remain; agent-specific failures (timeouts, unavailable or unhealthy
//! agents, malformed output) move on to the next agent of the fallback
//! chain. Unhealthy agents in the chain are skipped without spending a
//! retry.

use crate::config::ExecutionConfig;
use crate::core::{
    Agent, AgentId, AtomicTask, Batch, HealthState, TaskArena, TaskExecutionResult,
};
use crate::error::{Error, Result};
use crate::orchestration::assembly::BatchResult;
use crate::orchestration::context::ContextPool;
use crate::orchestration::events::{EventBus, EventKind, ExecutionEvent};
use crate::orchestration::registry::AgentRegistry;
use crate::orchestration::selector::AgentSelection;
use crate::orchestration::transport::{AgentRequest, AgentResponse, AgentTransport, ContextItem};
use futures::future::join_all;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct ExecutionCoordinator {
    registry: Arc<AgentRegistry>,
    transport: Arc<dyn AgentTransport>,
    events: Arc<EventBus>,
    context: Arc<ContextPool>,
    config: ExecutionConfig,
    cancel: CancellationToken,
}

impl ExecutionCoordinator {
    pub fn new(
        registry: Arc<AgentRegistry>,
        transport: Arc<dyn AgentTransport>,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            events: Arc::new(EventBus::new(config.event_buffer)),
            context: Arc::new(ContextPool::new()),
            cancel: CancellationToken::new(),
            registry,
            transport,
            config,
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn with_context(mut self, context: Arc<ContextPool>) -> Self {
        self.context = context;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn context(&self) -> &Arc<ContextPool> {
        &self.context
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// Abort in-flight attempts and pending backoffs.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    async fn emit_task(&self, kind: EventKind, task: &AtomicTask, message: String) {
        self.events
            .publish(ExecutionEvent::task(kind, &task.id, message))
            .await;
    }

    /// Outputs of every dependency this workflow has already recorded.
    fn build_context(&self, task: &AtomicTask, workflow_id: &str) -> Vec<ContextItem> {
        task.dependencies
            .iter()
            .filter_map(|dep| {
                self.context.task_output(workflow_id, &dep.target).map(|output| ContextItem {
                    task_id: dep.target.clone(),
                    output,
                })
            })
            .collect()
    }

    /// First usable agent at or after `index`, skipping unhealthy or
    /// deregistered ones.
    async fn next_usable(
        &self,
        task: &AtomicTask,
        chain: &[AgentId],
        index: &mut usize,
        last_error: &mut Option<Error>,
    ) -> Option<Agent> {
        while let Some(id) = chain.get(*index) {
            match self.registry.get(id) {
                Some(agent) if agent.health != HealthState::Unhealthy => return Some(agent),
                Some(_) => *last_error = Some(Error::AgentUnhealthy(id.clone())),
                None => *last_error = Some(Error::AgentNotFound(id.clone())),
            }
            *index += 1;
            if let Some(next) = chain.get(*index) {
                warn!(task_id = %task.id, skipped = %id, agent_id = %next, "skipping unusable agent");
                self.emit_task(
                    EventKind::AgentSwitched,
                    task,
                    format!("agent {} unusable, switching to {}", id, next),
                )
                .await;
            }
        }
        None
    }

    /// One bounded attempt against one agent.
    async fn attempt(
        &self,
        task: &AtomicTask,
        agent: &Agent,
        context: Vec<ContextItem>,
        attempt: u32,
    ) -> Result<AgentResponse> {
        let request = AgentRequest::new(task, agent, context, attempt);
        let token = self.cancel.child_token();
        self.registry.begin_task(&task.id, &agent.id)?;
        self.emit_task(
            EventKind::TaskProgress { percentage: 0 },
            task,
            format!("attempt {} on agent {}", attempt + 1, agent.id),
        )
        .await;

        let timeout = self.config.timeout();
        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = tokio::time::timeout(timeout, self.transport.execute(agent, request, token.clone())) => {
                match result {
                    Ok(response) => response,
                    Err(_) => {
                        token.cancel();
                        Err(Error::Timeout(timeout))
                    }
                }
            }
        };
        self.registry.finish_task(&task.id);

        let response = outcome?;
        if response.output.is_null() {
            return Err(Error::SchemaMismatch(format!(
                "agent {} returned no output for task {}",
                agent.id, task.id
            )));
        }
        Ok(response)
    }

    /// Run one task against a fallback chain until it completes or fails.
    pub async fn execute_task(
        &self,
        task: &AtomicTask,
        chain: &[AgentId],
        workflow_id: &str,
    ) -> TaskExecutionResult {
        let started = Instant::now();
        let context = self.build_context(task, workflow_id);
        let mut index = 0usize;
        let mut retry_count = 0u32;
        let mut last_error: Option<Error> = None;
        let mut last_agent: Option<AgentId> = None;

        self.emit_task(
            EventKind::TaskStarted,
            task,
            format!("task {} started in workflow {}", task.id, workflow_id),
        )
        .await;

        loop {
            let Some(agent) = self.next_usable(task, chain, &mut index, &mut last_error).await
            else {
                let error = last_error.take().unwrap_or_else(|| {
                    Error::AgentUnavailable(format!("no agent assigned to task {}", task.id))
                });
                return self
                    .fail(task, last_agent, error, started, retry_count)
                    .await;
            };
            last_agent = Some(agent.id.clone());

            let attempt_started = Instant::now();
            let outcome = self.attempt(task, &agent, context.clone(), retry_count).await;
            let attempt_ms = attempt_started.elapsed().as_millis() as u64;
            if !matches!(outcome, Err(Error::Cancelled)) {
                if let Err(e) = self
                    .registry
                    .record_execution(&agent.id, attempt_ms, outcome.is_ok())
                {
                    debug!(agent_id = %agent.id, error = %e, "execution outcome not recorded");
                }
            }

            let error = match outcome {
                Ok(response) => {
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    info!(task_id = %task.id, agent_id = %agent.id, retry_count, elapsed_ms, "task completed");
                    self.emit_task(EventKind::TaskProgress { percentage: 100 }, task, String::new())
                        .await;
                    self.emit_task(
                        EventKind::TaskCompleted,
                        task,
                        format!("task {} completed by {}", task.id, agent.id),
                    )
                    .await;
                    return TaskExecutionResult::completed(
                        task.id.clone(),
                        agent.id.clone(),
                        response.output,
                        elapsed_ms,
                        response.cost,
                        retry_count,
                    );
                }
                Err(error) => error,
            };

            let can_switch = error.is_agent_specific() && index + 1 < chain.len();
            let schema_dead_end = matches!(error, Error::SchemaMismatch(_)) && !can_switch;
            if !error.is_retryable() || retry_count >= self.config.max_retries || schema_dead_end {
                return self
                    .fail(task, last_agent, error, started, retry_count)
                    .await;
            }

            retry_count += 1;
            if can_switch {
                index += 1;
                warn!(task_id = %task.id, from = %agent.id, to = %chain[index], error = %error, "falling back to next agent");
                self.emit_task(
                    EventKind::AgentSwitched,
                    task,
                    format!("{}; switching from {} to {}", error, agent.id, chain[index]),
                )
                .await;
            }

            let delay = self.config.backoff(retry_count - 1);
            warn!(task_id = %task.id, retry = retry_count, delay_ms = delay.as_millis() as u64, error = %error, "retrying task");
            self.emit_task(
                EventKind::RetryAttempted,
                task,
                format!(
                    "retry {}/{} in {:?} after: {}",
                    retry_count, self.config.max_retries, delay, error
                ),
            )
            .await;

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return self
                        .fail(task, last_agent, Error::Cancelled, started, retry_count)
                        .await;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn fail(
        &self,
        task: &AtomicTask,
        agent_id: Option<AgentId>,
        error: Error,
        started: Instant,
        retry_count: u32,
    ) -> TaskExecutionResult {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        warn!(task_id = %task.id, retry_count, error = %error, "task failed");
        self.emit_task(
            EventKind::TaskFailed,
            task,
            format!("task {} failed: {}", task.id, error),
        )
        .await;
        TaskExecutionResult::failed(task.id.clone(), agent_id, &error, elapsed_ms, 0.0, retry_count)
    }

    /// Check blocking dependency outputs, run the task and store its output.
    async fn run_member(
        &self,
        task: &AtomicTask,
        arena: &TaskArena,
        chain: &[AgentId],
        workflow_id: &str,
    ) -> TaskExecutionResult {
        let blocking = arena.blocking_dependencies_of(&task.id);
        if let Err(dependency) = self.context.dependency_outputs(workflow_id, &blocking) {
            let error = Error::DependencyViolation {
                task_id: task.id.clone(),
                dependency,
            };
            warn!(task_id = %task.id, error = %error, "dependency output missing, task not attempted");
            self.emit_task(EventKind::TaskFailed, task, error.to_string())
                .await;
            return TaskExecutionResult::failed(task.id.clone(), None, &error, 0, 0.0, 0);
        }

        let result = self.execute_task(task, chain, workflow_id).await;
        if let (true, Some(output)) = (result.is_success(), &result.output) {
            self.context
                .record_output(workflow_id, &task.id, output.clone());
        }
        result
    }

    /// Execute a batch: members concurrently when `parallel`, otherwise one
    /// at a time in order. Individual failures never abort siblings.
    pub async fn execute_batch(
        &self,
        batch: &Batch,
        arena: &TaskArena,
        selection: &AgentSelection,
        workflow_id: &str,
    ) -> BatchResult {
        let started = Instant::now();
        let chain = selection.chain();
        info!(
            batch_id = %batch.id,
            tasks = batch.len(),
            parallel = batch.parallel,
            agent_id = %selection.primary,
            "batch started"
        );
        self.events
            .publish(ExecutionEvent::batch(
                EventKind::BatchStarted,
                &batch.id,
                format!("{} tasks on {}", batch.len(), selection.primary),
            ))
            .await;

        let results = if batch.parallel {
            join_all(
                batch
                    .members(arena)
                    .map(|task| self.run_member(task, arena, &chain, workflow_id)),
            )
            .await
        } else {
            let mut results = Vec::with_capacity(batch.len());
            for task in batch.members(arena) {
                results.push(self.run_member(task, arena, &chain, workflow_id).await);
            }
            results
        };

        let result = BatchResult::assemble(
            batch.id.clone(),
            Some(selection.primary.clone()),
            results,
            batch.category(arena).merge_rule(),
            started.elapsed().as_millis() as u64,
        );
        info!(
            batch_id = %batch.id,
            completed = result.completed,
            failed = result.failed,
            "batch completed"
        );
        self.events
            .publish(ExecutionEvent::batch(
                EventKind::BatchCompleted,
                &batch.id,
                format!("{}/{} tasks completed", result.completed, result.results.len()),
            ))
            .await;
        result
    }
}
