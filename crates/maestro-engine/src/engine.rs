use crate::depgraph::DependencyGraph;
use crate::ingest::{EventHandler, EventIngestionPipeline};
use crate::notify::NotificationSink;
use crate::pipeline::{compute_stats, FailureDisposition, PipelineExecutor};
use crate::ratelimit::RateLimiter;
use crate::scheduler::{AgentScheduler, TaskDisposition};
use crate::tasks::TaskStore;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use maestro_core::{
    Agent, AgentTask, AgentTaskStatus, DependencyEdge, DependencyKind, ExecutionOutcome,
    ExecutionRequest, InboundEvent, IngestOutcome, MaestroResult, NotificationKind, OutcomeStatus,
    PipelineDefinition, PipelineExecution, Task, TaskStatus, WebhookEvent,
};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

/// Executes agent work. The execution engine behind this trait is external
/// and opaque to the orchestration core: the scheduler calls out with an
/// [`ExecutionRequest`] and records whatever comes back.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Runs one request to completion.
    async fn execute(&self, request: &ExecutionRequest) -> MaestroResult<ExecutionOutcome>;
}

/// Placeholder executor for local runs and tests: echoes the prompt as a
/// completed outcome with zero cost.
pub struct NoopExecutor;

#[async_trait]
impl AgentExecutor for NoopExecutor {
    async fn execute(&self, request: &ExecutionRequest) -> MaestroResult<ExecutionOutcome> {
        Ok(ExecutionOutcome {
            status: OutcomeStatus::Completed,
            result: request.prompt.clone(),
            tokens_used: 0,
            cost_cents: 0,
        })
    }
}

/// Engine tuning knobs, loadable from the `[engine]` section of the config
/// file. Every field has a default.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Cap on executions of one pipeline sitting in queued/running.
    #[serde(default = "default_max_concurrent_executions")]
    pub max_concurrent_executions: usize,
    /// Ancestor-chain ceiling for the task hierarchy.
    #[serde(default = "default_max_hierarchy_depth")]
    pub max_hierarchy_depth: u32,
    /// Depth ceiling for dependency-graph traversals.
    #[serde(default = "default_dependency_ceiling")]
    pub dependency_traversal_ceiling: u32,
    /// Trailing window for pipeline and agent statistics, in days.
    #[serde(default = "default_stats_window_days")]
    pub stats_window_days: i64,
    /// Attempt budget for webhook event processing.
    #[serde(default = "default_event_max_attempts")]
    pub event_max_attempts: u32,
    /// Linear backoff step between event processing attempts, in minutes.
    #[serde(default = "default_event_backoff_minutes")]
    pub event_backoff_minutes: i64,
    /// Default per-window request limit for rate-limit buckets.
    #[serde(default = "default_rate_limit_requests")]
    pub rate_limit_requests: u32,
    /// Default rate-limit window, in seconds.
    #[serde(default = "default_rate_limit_window_seconds")]
    pub rate_limit_window_seconds: i64,
    /// Running-time ceiling for pipeline executions, in minutes.
    #[serde(default = "default_execution_timeout_minutes")]
    pub execution_timeout_minutes: i64,
    /// Running-time ceiling for agent tasks, in minutes.
    #[serde(default = "default_agent_task_timeout_minutes")]
    pub agent_task_timeout_minutes: i64,
}

fn default_max_concurrent_executions() -> usize {
    3
}
fn default_max_hierarchy_depth() -> u32 {
    50
}
fn default_dependency_ceiling() -> u32 {
    50
}
fn default_stats_window_days() -> i64 {
    30
}
fn default_event_max_attempts() -> u32 {
    5
}
fn default_event_backoff_minutes() -> i64 {
    5
}
fn default_rate_limit_requests() -> u32 {
    60
}
fn default_rate_limit_window_seconds() -> i64 {
    60
}
fn default_execution_timeout_minutes() -> i64 {
    30
}
fn default_agent_task_timeout_minutes() -> i64 {
    15
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_executions: default_max_concurrent_executions(),
            max_hierarchy_depth: default_max_hierarchy_depth(),
            dependency_traversal_ceiling: default_dependency_ceiling(),
            stats_window_days: default_stats_window_days(),
            event_max_attempts: default_event_max_attempts(),
            event_backoff_minutes: default_event_backoff_minutes(),
            rate_limit_requests: default_rate_limit_requests(),
            rate_limit_window_seconds: default_rate_limit_window_seconds(),
            execution_timeout_minutes: default_execution_timeout_minutes(),
            agent_task_timeout_minutes: default_agent_task_timeout_minutes(),
        }
    }
}

/// The orchestration engine.
///
/// Composes the task store, dependency graph, pipeline executor, agent
/// scheduler, rate limiter, and event ingestion pipeline behind per-entity
/// locks. There is no global lock: each check-then-act sequence runs under
/// exactly one component lock, and external collaborators (the agent
/// execution engine, event handlers) are always invoked with no lock held.
///
/// Lock order, where two components are touched in one operation, is
/// tasks → dependencies. No operation holds more than two locks.
pub struct Orchestrator {
    config: EngineConfig,
    tasks: Arc<RwLock<TaskStore>>,
    dependencies: Arc<RwLock<DependencyGraph>>,
    pipelines: Arc<RwLock<PipelineExecutor>>,
    scheduler: Arc<RwLock<AgentScheduler>>,
    ingestion: Arc<EventIngestionPipeline>,
    notifications: Arc<NotificationSink>,
    executor: Arc<dyn AgentExecutor>,
}

impl Orchestrator {
    /// Builds an engine from config, wiring the given external agent
    /// executor.
    pub fn new(config: EngineConfig, executor: Arc<dyn AgentExecutor>) -> Self {
        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit_requests,
            Duration::seconds(config.rate_limit_window_seconds),
        ));
        let notifications = Arc::new(NotificationSink::new());
        let ingestion = Arc::new(EventIngestionPipeline::new(
            config.event_max_attempts,
            Duration::minutes(config.event_backoff_minutes),
            limiter,
            notifications.clone(),
        ));

        Self {
            tasks: Arc::new(RwLock::new(TaskStore::new(config.max_hierarchy_depth))),
            dependencies: Arc::new(RwLock::new(DependencyGraph::new(
                config.dependency_traversal_ceiling,
            ))),
            pipelines: Arc::new(RwLock::new(PipelineExecutor::new(
                config.max_concurrent_executions,
            ))),
            scheduler: Arc::new(RwLock::new(AgentScheduler::new(Duration::days(
                config.stats_window_days,
            )))),
            ingestion,
            notifications,
            executor,
            config,
        }
    }

    /// The shared task store.
    pub fn tasks(&self) -> &Arc<RwLock<TaskStore>> {
        &self.tasks
    }

    /// The notification sink, drained by an external delivery service.
    pub fn notifications(&self) -> &Arc<NotificationSink> {
        &self.notifications
    }

    // --- Tasks & hierarchy ---

    /// Inserts a task into the hierarchy.
    pub async fn create_task(&self, task: Task) -> MaestroResult<Uuid> {
        let mut tasks = self.tasks.write().await;
        tasks.insert(task)
    }

    /// Returns a copy of a task.
    pub async fn task(&self, tenant_id: Uuid, task_id: Uuid) -> MaestroResult<Task> {
        let tasks = self.tasks.read().await;
        tasks.get(tenant_id, task_id).cloned()
    }

    /// Transitions a task's status; the parent's progress is rolled up as
    /// an explicit post-transition hook inside the same lock hold.
    pub async fn set_task_status(
        &self,
        tenant_id: Uuid,
        task_id: Uuid,
        status: TaskStatus,
    ) -> MaestroResult<()> {
        let mut tasks = self.tasks.write().await;
        tasks.set_status(tenant_id, task_id, status, Utc::now())?;
        Ok(())
    }

    /// Moves a task under a new parent, rebuilding the materialized
    /// ancestor sets of the task and all of its descendants.
    pub async fn set_task_parent(
        &self,
        tenant_id: Uuid,
        task_id: Uuid,
        new_parent_id: Option<Uuid>,
    ) -> MaestroResult<()> {
        let mut tasks = self.tasks.write().await;
        tasks.set_parent(tenant_id, task_id, new_parent_id, Utc::now())
    }

    /// Removes a task, dropping every dependency edge that touches it.
    pub async fn remove_task(&self, tenant_id: Uuid, task_id: Uuid) -> MaestroResult<Task> {
        let mut tasks = self.tasks.write().await;
        let removed = tasks.remove(tenant_id, task_id, Utc::now())?;
        let mut dependencies = self.dependencies.write().await;
        dependencies.remove_task(task_id);
        Ok(removed)
    }

    /// Adds a typed dependency edge after validating both endpoints exist
    /// and the edge closes no cycle.
    pub async fn add_dependency(
        &self,
        tenant_id: Uuid,
        dependent_id: Uuid,
        dependency_id: Uuid,
        kind: DependencyKind,
    ) -> MaestroResult<()> {
        let tasks = self.tasks.read().await;
        tasks.get(tenant_id, dependent_id)?;
        tasks.get(tenant_id, dependency_id)?;
        let mut dependencies = self.dependencies.write().await;
        dependencies.add_dependency(dependent_id, dependency_id, kind, Utc::now())
    }

    /// Edges where the given task is the dependent.
    pub async fn dependencies_of(&self, task_id: Uuid) -> Vec<DependencyEdge> {
        let dependencies = self.dependencies.read().await;
        dependencies.dependencies_of(task_id).to_vec()
    }

    // --- Pipelines ---

    /// Registers a pipeline definition.
    pub async fn register_pipeline(&self, definition: PipelineDefinition) -> MaestroResult<Uuid> {
        let mut pipelines = self.pipelines.write().await;
        pipelines.register(definition)
    }

    /// Admits a new execution, subject to the per-pipeline concurrency cap.
    pub async fn trigger_pipeline(&self, tenant_id: Uuid, pipeline_id: Uuid) -> MaestroResult<Uuid> {
        let mut pipelines = self.pipelines.write().await;
        pipelines.trigger(tenant_id, pipeline_id, Utc::now())
    }

    /// Starts a queued execution; returns the initially eligible steps.
    pub async fn start_execution(
        &self,
        tenant_id: Uuid,
        execution_id: Uuid,
    ) -> MaestroResult<Vec<String>> {
        let mut pipelines = self.pipelines.write().await;
        pipelines.start(tenant_id, execution_id, Utc::now())
    }

    /// Starts an eligible step.
    pub async fn start_step(
        &self,
        tenant_id: Uuid,
        execution_id: Uuid,
        step_name: &str,
    ) -> MaestroResult<()> {
        let mut pipelines = self.pipelines.write().await;
        pipelines.start_step(tenant_id, execution_id, step_name, Utc::now())
    }

    /// Completes a step, re-evaluating sibling eligibility; when the
    /// execution settles, its pipeline's statistics are refreshed with no
    /// executor lock held.
    pub async fn complete_step(
        &self,
        tenant_id: Uuid,
        execution_id: Uuid,
        step_name: &str,
    ) -> MaestroResult<Vec<String>> {
        let (ready, settled) = {
            let mut pipelines = self.pipelines.write().await;
            let ready = pipelines.complete_step(tenant_id, execution_id, step_name, Utc::now())?;
            let execution = pipelines.execution(tenant_id, execution_id)?;
            let settled = execution
                .status
                .is_terminal()
                .then_some(execution.pipeline_id);
            (ready, settled)
        };
        if let Some(pipeline_id) = settled {
            self.refresh_pipeline_stats(pipeline_id).await;
        }
        Ok(ready)
    }

    /// Records a step failure. Exhausting the retry budget fails the
    /// execution, emits a pipeline-failure notification, and refreshes the
    /// pipeline's statistics.
    pub async fn fail_step(
        &self,
        tenant_id: Uuid,
        execution_id: Uuid,
        step_name: &str,
        error: &str,
    ) -> MaestroResult<FailureDisposition> {
        let now = Utc::now();
        let (disposition, pipeline_id) = {
            let mut pipelines = self.pipelines.write().await;
            let disposition = pipelines.fail_step(tenant_id, execution_id, step_name, error, now)?;
            let execution = pipelines.execution(tenant_id, execution_id)?;
            (disposition, execution.pipeline_id)
        };

        if disposition == FailureDisposition::Exhausted {
            self.notifications
                .emit(
                    NotificationKind::PipelineFailed,
                    serde_json::json!({
                        "pipeline_id": pipeline_id,
                        "execution_id": execution_id,
                        "step": step_name,
                    }),
                    now,
                )
                .await;
            self.refresh_pipeline_stats(pipeline_id).await;
        }
        Ok(disposition)
    }

    /// Cancels an execution cooperatively.
    pub async fn cancel_execution(&self, tenant_id: Uuid, execution_id: Uuid) -> MaestroResult<()> {
        let mut pipelines = self.pipelines.write().await;
        pipelines.cancel(tenant_id, execution_id, Utc::now())
    }

    /// Returns a copy of an execution.
    pub async fn execution(
        &self,
        tenant_id: Uuid,
        execution_id: Uuid,
    ) -> MaestroResult<PipelineExecution> {
        let pipelines = self.pipelines.read().await;
        pipelines.execution(tenant_id, execution_id).cloned()
    }

    /// Returns a copy of a pipeline definition, including its rolling
    /// statistics.
    pub async fn pipeline(
        &self,
        tenant_id: Uuid,
        pipeline_id: Uuid,
    ) -> MaestroResult<PipelineDefinition> {
        let pipelines = self.pipelines.read().await;
        pipelines.definition(tenant_id, pipeline_id).cloned()
    }

    /// Recomputes one pipeline's trailing-window statistics. The snapshot
    /// is taken under a read lock, the computation runs with no lock held,
    /// and the result is written back in a short write hold, so admission
    /// of new executions is never blocked.
    pub async fn refresh_pipeline_stats(&self, pipeline_id: Uuid) {
        let since = Utc::now() - Duration::days(self.config.stats_window_days);
        let snapshot = {
            let pipelines = self.pipelines.read().await;
            pipelines.stats_snapshot(pipeline_id, since)
        };
        let (success_rate, average) = compute_stats(&snapshot);
        let mut pipelines = self.pipelines.write().await;
        pipelines.apply_stats(pipeline_id, success_rate, average);
    }

    /// Refreshes statistics for every registered pipeline.
    pub async fn refresh_all_pipeline_stats(&self) {
        let ids = {
            let pipelines = self.pipelines.read().await;
            pipelines.pipeline_ids()
        };
        for pipeline_id in ids {
            self.refresh_pipeline_stats(pipeline_id).await;
        }
    }

    // --- Agents ---

    /// Registers an execution agent.
    pub async fn register_agent(&self, agent: Agent) -> MaestroResult<Uuid> {
        let mut scheduler = self.scheduler.write().await;
        scheduler.register_agent(agent)
    }

    /// Returns a copy of an agent, including its statistics.
    pub async fn agent(&self, tenant_id: Uuid, agent_id: Uuid) -> MaestroResult<Agent> {
        let scheduler = self.scheduler.read().await;
        scheduler.agent(tenant_id, agent_id).cloned()
    }

    /// Picks the best matching agent for a task type and capability set.
    pub async fn select_agent(
        &self,
        tenant_id: Uuid,
        task_type: &str,
        required_capabilities: &[String],
    ) -> MaestroResult<Uuid> {
        let scheduler = self.scheduler.read().await;
        scheduler.select_best_agent(tenant_id, task_type, required_capabilities)
    }

    /// Accepts a task for an agent, subject to its capacity.
    pub async fn enqueue_agent_task(&self, tenant_id: Uuid, task: AgentTask) -> MaestroResult<Uuid> {
        let mut scheduler = self.scheduler.write().await;
        scheduler.enqueue(tenant_id, task, Utc::now())
    }

    /// Returns a copy of an agent task.
    pub async fn agent_task(&self, tenant_id: Uuid, task_id: Uuid) -> MaestroResult<AgentTask> {
        let scheduler = self.scheduler.read().await;
        scheduler.task(tenant_id, task_id).cloned()
    }

    /// Cancels an agent task cooperatively; an in-flight result for it is
    /// discarded when it arrives.
    pub async fn cancel_agent_task(&self, task_id: Uuid) -> MaestroResult<()> {
        let mut scheduler = self.scheduler.write().await;
        scheduler.cancel_task(task_id, Utc::now())
    }

    /// Enqueues a task and drives it to a terminal state against the
    /// external execution engine, retrying within the task's budget.
    ///
    /// The executor is invoked with no scheduler lock held; its result is
    /// fed back through an atomic transition, and results for tasks that
    /// were cancelled in the meantime are discarded.
    pub async fn dispatch_agent_task(
        &self,
        tenant_id: Uuid,
        task: AgentTask,
    ) -> MaestroResult<AgentTask> {
        let task_id = self.enqueue_agent_task(tenant_id, task).await?;

        loop {
            let request = {
                let mut scheduler = self.scheduler.write().await;
                scheduler.start_task(task_id, Utc::now())?;
                scheduler.task(tenant_id, task_id)?.request.clone()
            };

            // External call: no lock held.
            let result = self.executor.execute(&request).await;

            let mut scheduler = self.scheduler.write().await;
            let current = scheduler.task(tenant_id, task_id)?;
            if current.status == AgentTaskStatus::Cancelled {
                info!(task_id = %task_id, "discarding result for cancelled agent task");
                return scheduler.task(tenant_id, task_id).cloned();
            }

            let disposition = match result {
                Ok(outcome) if outcome.status == OutcomeStatus::Completed => {
                    scheduler.complete_task(task_id, outcome, Utc::now())?;
                    None
                }
                Ok(outcome) => Some(scheduler.fail_task(task_id, &outcome.result, Utc::now())?),
                Err(err) => Some(scheduler.fail_task(task_id, &err.to_string(), Utc::now())?),
            };

            match disposition {
                None => return scheduler.task(tenant_id, task_id).cloned(),
                Some(TaskDisposition::Exhausted) => {
                    drop(scheduler);
                    self.notifications
                        .emit(
                            NotificationKind::AgentTaskFailed,
                            serde_json::json!({ "agent_task_id": task_id }),
                            Utc::now(),
                        )
                        .await;
                    let scheduler = self.scheduler.read().await;
                    return scheduler.task(tenant_id, task_id).cloned();
                }
                Some(TaskDisposition::Requeued { attempt }) => {
                    warn!(task_id = %task_id, attempt, "re-dispatching agent task");
                }
            }
        }
    }

    // --- Events ---

    /// Registers an event handler for a source.
    pub async fn register_handler(&self, source: impl Into<String>, handler: Arc<dyn EventHandler>) {
        self.ingestion.register_handler(source, handler).await;
    }

    /// Ingests an inbound event and, when it is new, runs its first
    /// processing attempt.
    pub async fn ingest_event(
        &self,
        tenant_id: Uuid,
        integration_id: Uuid,
        inbound: InboundEvent,
    ) -> MaestroResult<IngestOutcome> {
        let outcome = self
            .ingestion
            .ingest(tenant_id, integration_id, inbound, Utc::now())
            .await?;
        if let IngestOutcome::Accepted { event_id } = outcome {
            self.ingestion.process(event_id, Utc::now()).await?;
        }
        Ok(outcome)
    }

    /// Returns a copy of a tracked event.
    pub async fn event(&self, tenant_id: Uuid, event_id: Uuid) -> MaestroResult<WebhookEvent> {
        self.ingestion.event(tenant_id, event_id).await
    }

    // --- Background sweeps ---

    /// Re-submits retrying events whose backoff elapsed.
    pub async fn sweep_event_retries(&self) -> Vec<Uuid> {
        self.ingestion.sweep_due(Utc::now()).await
    }

    /// Times out executions running past the configured ceiling.
    pub async fn sweep_execution_timeouts(&self) -> Vec<Uuid> {
        let mut pipelines = self.pipelines.write().await;
        pipelines.sweep_timeouts(
            Utc::now(),
            Duration::minutes(self.config.execution_timeout_minutes),
        )
    }

    /// Times out agent tasks running past the configured ceiling.
    pub async fn sweep_agent_timeouts(&self) -> Vec<Uuid> {
        let mut scheduler = self.scheduler.write().await;
        scheduler.sweep_timeouts(
            Utc::now(),
            Duration::minutes(self.config.agent_task_timeout_minutes),
        )
    }
}
