//! Workflow orchestration: plan, then execute stage by stage.

use crate::config::{EngineConfig, FailurePolicy};
use crate::core::{AtomicTask, TaskExecutionResult, TaskId, TaskState};
use crate::error::{Error, Result};
use crate::orchestration::assembly::BatchResult;
use crate::orchestration::context::ContextPool;
use crate::orchestration::events::{EventBus, ExecutionEvent};
use crate::orchestration::executor::ExecutionCoordinator;
use crate::orchestration::health::{HealthEvent, HealthMonitor};
use crate::orchestration::registry::AgentRegistry;
use crate::orchestration::transport::AgentTransport;
use crate::scheduling::planner::{ExecutionPlan, ExecutionPlanner};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowResult {
    pub workflow_id: String,
    pub plan: ExecutionPlan,
    pub batch_results: Vec<BatchResult>,
    pub task_results: BTreeMap<TaskId, TaskExecutionResult>,
    pub completed: usize,
    pub failed: usize,
    pub timed_out: usize,
    /// Tasks never attempted because the workflow halted.
    pub skipped: usize,
    pub halted: bool,
    pub elapsed_ms: u64,
}

impl WorkflowResult {
    pub fn is_success(&self) -> bool {
        !self.halted && self.failed == 0 && self.timed_out == 0 && self.skipped == 0
    }

    pub fn task(&self, task_id: &TaskId) -> Option<&TaskExecutionResult> {
        self.task_results.get(task_id)
    }
}

pub struct Orchestrator {
    config: EngineConfig,
    registry: Arc<AgentRegistry>,
    transport: Arc<dyn AgentTransport>,
    planner: ExecutionPlanner,
    events: Arc<EventBus>,
    context: Arc<ContextPool>,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Fails with [`Error::Validation`] when `config` does not validate.
    pub fn new(
        config: EngineConfig,
        registry: Arc<AgentRegistry>,
        transport: Arc<dyn AgentTransport>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            planner: ExecutionPlanner::new(&config),
            events: Arc::new(EventBus::new(config.execution.event_buffer)),
            context: Arc::new(ContextPool::new()),
            cancel: CancellationToken::new(),
            config,
            registry,
            transport,
        })
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn context(&self) -> &Arc<ContextPool> {
        &self.context
    }

    pub fn planner(&self) -> &ExecutionPlanner {
        &self.planner
    }

    pub fn subscribe(&self) -> mpsc::Receiver<ExecutionEvent> {
        self.events.subscribe()
    }

    /// Stop in-flight work and the health monitor.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Start periodic health probing; it stops on [`Orchestrator::shutdown`].
    pub fn start_health_monitor(&self) -> (JoinHandle<()>, mpsc::Receiver<HealthEvent>) {
        let (monitor, events) = HealthMonitor::new(
            self.registry.clone(),
            self.transport.clone(),
            self.config.health.clone(),
            self.config.execution.event_buffer,
        );
        let handle = Arc::new(monitor).spawn(self.cancel.child_token());
        (handle, events)
    }

    pub fn plan(&self, tasks: Vec<AtomicTask>) -> Result<ExecutionPlan> {
        self.planner.plan(tasks, &self.registry)
    }

    /// Plan and execute. Scheduling errors are returned before anything is
    /// dispatched; execution errors are recorded per task.
    pub async fn run(&self, tasks: Vec<AtomicTask>) -> Result<WorkflowResult> {
        let plan = self.plan(tasks)?;
        Ok(self.execute(plan).await)
    }

    pub async fn execute(&self, plan: ExecutionPlan) -> WorkflowResult {
        let started = Instant::now();
        let workflow_id = format!("wf-{}", uuid::Uuid::new_v4());
        let coordinator = ExecutionCoordinator::new(
            self.registry.clone(),
            self.transport.clone(),
            self.config.execution.clone(),
        )
        .with_events(self.events.clone())
        .with_context(self.context.clone())
        .with_cancel(self.cancel.child_token());
        let halt_on_failure = self.config.execution.failure_policy == FailurePolicy::HaltOnFirstFailure;

        info!(workflow_id = %workflow_id, stages = plan.stages.len(), "workflow started");
        let mut batch_results = Vec::with_capacity(plan.stages.len());
        let mut task_results = BTreeMap::new();
        let mut halted = false;
        let mut skipped = 0;

        for stage in &plan.stages {
            if halted {
                skipped += stage.len();
                continue;
            }
            let result = match plan.assignment(&stage.id) {
                Some(selection) => {
                    coordinator
                        .execute_batch(stage, &plan.arena, selection, &workflow_id)
                        .await
                }
                None => {
                    let error = Error::AgentUnavailable(format!("no agent assigned to batch {}", stage.id));
                    let results = stage
                        .task_ids
                        .iter()
                        .map(|id| TaskExecutionResult::failed(id.clone(), None, &error, 0, 0.0, 0))
                        .collect();
                    BatchResult::assemble(
                        stage.id.clone(),
                        None,
                        results,
                        stage.category(&plan.arena).merge_rule(),
                        0,
                    )
                }
            };

            for task_result in &result.results {
                task_results.insert(task_result.task_id.clone(), task_result.clone());
            }
            if halt_on_failure && result.failed > 0 {
                warn!(workflow_id = %workflow_id, batch_id = %stage.id, "halting workflow after failure");
                halted = true;
            }
            batch_results.push(result);
        }
        let released = self.context.clear_workflow(&workflow_id);
        debug!(workflow_id = %workflow_id, released, "workflow context released");

        let count = |state: TaskState| task_results.values().filter(|r| r.state == state).count();
        let completed = count(TaskState::Completed);
        let failed = count(TaskState::Failed);
        let timed_out = count(TaskState::Timeout);
        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            workflow_id = %workflow_id,
            completed,
            failed,
            timed_out,
            skipped,
            elapsed_ms,
            "workflow finished"
        );

        WorkflowResult {
            workflow_id,
            plan,
            batch_results,
            task_results,
            completed,
            failed,
            timed_out,
            skipped,
            halted,
            elapsed_ms,
        }
    }
}
