use chrono::{DateTime, Duration, Utc};
use maestro_core::{
    ExecutionStatus, MaestroError, MaestroResult, PipelineDefinition, PipelineExecution,
    StepStatus,
};
use std::collections::HashMap;
use tracing::{info, warn};
use uuid::Uuid;

/// Default cap on executions of one pipeline sitting in queued/running.
pub const DEFAULT_MAX_CONCURRENT_EXECUTIONS: usize = 3;

/// What happened to a step that reported a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// The step is back in `pending` for another attempt.
    Retrying {
        /// The failure count so far.
        attempt: u32,
    },
    /// The retry budget is exhausted; step and execution are failed.
    Exhausted,
}

/// Drives pipeline executions and their step state machines.
///
/// Admission (the queued/running cap per pipeline) is a check-then-insert
/// inside one method, so the composing engine's lock makes it atomic with
/// respect to concurrent triggers. Rolling statistics are split into
/// snapshot / apply halves so the computation never holds this lock.
pub struct PipelineExecutor {
    max_concurrent: usize,
    definitions: HashMap<Uuid, PipelineDefinition>,
    executions: HashMap<Uuid, PipelineExecution>,
}

impl PipelineExecutor {
    /// Creates an executor with the given per-pipeline concurrency cap.
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            definitions: HashMap::new(),
            executions: HashMap::new(),
        }
    }

    /// Registers a definition. Names are unique per tenant, and a pipeline
    /// must have at least one step.
    pub fn register(&mut self, definition: PipelineDefinition) -> MaestroResult<Uuid> {
        if definition.steps.is_empty() {
            return Err(MaestroError::Config(format!(
                "pipeline '{}' has no steps",
                definition.name
            )));
        }
        if self
            .definitions
            .values()
            .any(|d| d.tenant_id == definition.tenant_id && d.name == definition.name)
        {
            return Err(MaestroError::Config(format!(
                "pipeline '{}' already exists for this tenant",
                definition.name
            )));
        }
        let id = definition.id;
        self.definitions.insert(id, definition);
        Ok(id)
    }

    /// Returns the definition if it exists and belongs to the tenant.
    pub fn definition(&self, tenant_id: Uuid, pipeline_id: Uuid) -> MaestroResult<&PipelineDefinition> {
        self.definitions
            .get(&pipeline_id)
            .filter(|d| d.tenant_id == tenant_id)
            .ok_or_else(|| MaestroError::NotFound(format!("pipeline {pipeline_id}")))
    }

    /// Ids of all registered definitions.
    pub fn pipeline_ids(&self) -> Vec<Uuid> {
        self.definitions.keys().copied().collect()
    }

    /// Admits a new execution unless the pipeline already has
    /// `max_concurrent` executions queued or running.
    pub fn trigger(
        &mut self,
        tenant_id: Uuid,
        pipeline_id: Uuid,
        now: DateTime<Utc>,
    ) -> MaestroResult<Uuid> {
        let definition = self
            .definitions
            .get(&pipeline_id)
            .filter(|d| d.tenant_id == tenant_id)
            .ok_or_else(|| MaestroError::NotFound(format!("pipeline {pipeline_id}")))?;

        let in_flight = self
            .executions
            .values()
            .filter(|e| e.pipeline_id == pipeline_id && !e.status.is_terminal())
            .count();
        if in_flight >= self.max_concurrent {
            return Err(MaestroError::CapacityExceeded(format!(
                "pipeline {pipeline_id} at {in_flight}/{} concurrent executions",
                self.max_concurrent
            )));
        }

        let execution = PipelineExecution::from_definition(definition, now);
        let id = execution.id;
        info!(pipeline_id = %pipeline_id, execution_id = %id, "execution admitted");
        self.executions.insert(id, execution);
        Ok(id)
    }

    /// Returns the execution if it exists and belongs to the tenant.
    pub fn execution(&self, tenant_id: Uuid, execution_id: Uuid) -> MaestroResult<&PipelineExecution> {
        self.executions
            .get(&execution_id)
            .filter(|e| e.tenant_id == tenant_id)
            .ok_or_else(|| MaestroError::NotFound(format!("execution {execution_id}")))
    }

    fn execution_mut(
        &mut self,
        tenant_id: Uuid,
        execution_id: Uuid,
    ) -> MaestroResult<&mut PipelineExecution> {
        self.executions
            .get_mut(&execution_id)
            .filter(|e| e.tenant_id == tenant_id)
            .ok_or_else(|| MaestroError::NotFound(format!("execution {execution_id}")))
    }

    /// Moves a queued execution to running and returns the initially
    /// eligible step names.
    pub fn start(
        &mut self,
        tenant_id: Uuid,
        execution_id: Uuid,
        now: DateTime<Utc>,
    ) -> MaestroResult<Vec<String>> {
        let execution = self.execution_mut(tenant_id, execution_id)?;
        if execution.status != ExecutionStatus::Queued {
            return Err(MaestroError::InvalidTransition {
                from: execution.status.to_string(),
                to: ExecutionStatus::Running.to_string(),
            });
        }
        execution.status = ExecutionStatus::Running;
        execution.started_at = Some(now);
        Ok(execution.ready_step_names())
    }

    /// Starts an eligible step. A step may only start once every step in
    /// its `depends_on` set is completed.
    pub fn start_step(
        &mut self,
        tenant_id: Uuid,
        execution_id: Uuid,
        step_name: &str,
        now: DateTime<Utc>,
    ) -> MaestroResult<()> {
        let execution = self.execution_mut(tenant_id, execution_id)?;
        if execution.status != ExecutionStatus::Running {
            return Err(MaestroError::InvalidTransition {
                from: execution.status.to_string(),
                to: "running step".to_string(),
            });
        }
        if !execution.ready_step_names().iter().any(|n| n == step_name) {
            let step = execution
                .step(step_name)
                .ok_or_else(|| MaestroError::NotFound(format!("step '{step_name}'")))?;
            return Err(MaestroError::InvalidTransition {
                from: step.status.to_string(),
                to: StepStatus::Running.to_string(),
            });
        }
        let step = execution
            .step_mut(step_name)
            .ok_or_else(|| MaestroError::NotFound(format!("step '{step_name}'")))?;
        step.status = StepStatus::Running;
        step.started_at = Some(now);
        Ok(())
    }

    /// Completes a running step and re-evaluates sibling eligibility.
    ///
    /// The step's duration becomes defined here, exactly once, when
    /// `completed_at` transitions from unset to set. Completing the last
    /// open step finalizes the execution. Returns the newly eligible step
    /// names.
    pub fn complete_step(
        &mut self,
        tenant_id: Uuid,
        execution_id: Uuid,
        step_name: &str,
        now: DateTime<Utc>,
    ) -> MaestroResult<Vec<String>> {
        let execution = self.execution_mut(tenant_id, execution_id)?;
        let step = execution
            .step_mut(step_name)
            .ok_or_else(|| MaestroError::NotFound(format!("step '{step_name}'")))?;
        if step.status != StepStatus::Running {
            return Err(MaestroError::InvalidTransition {
                from: step.status.to_string(),
                to: StepStatus::Completed.to_string(),
            });
        }
        step.status = StepStatus::Completed;
        if step.completed_at.is_none() {
            step.completed_at = Some(now);
        }
        step.error_details = None;

        Self::finalize_if_settled(execution, now);
        Ok(execution.ready_step_names())
    }

    /// Records a step failure, incrementing its retry count atomically with
    /// the transition. Within budget the step re-enters `pending`; beyond
    /// it the step and its execution fail terminally.
    pub fn fail_step(
        &mut self,
        tenant_id: Uuid,
        execution_id: Uuid,
        step_name: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> MaestroResult<FailureDisposition> {
        let execution = self.execution_mut(tenant_id, execution_id)?;
        let step = execution
            .step_mut(step_name)
            .ok_or_else(|| MaestroError::NotFound(format!("step '{step_name}'")))?;
        if step.status != StepStatus::Running {
            return Err(MaestroError::InvalidTransition {
                from: step.status.to_string(),
                to: StepStatus::Failed.to_string(),
            });
        }

        step.retry_count += 1;
        step.error_details = Some(error.to_string());

        if step.retry_count <= step.max_retries {
            let attempt = step.retry_count;
            step.status = StepStatus::Pending;
            step.started_at = None;
            warn!(
                execution_id = %execution_id,
                step = step_name,
                attempt,
                "step failed, retrying"
            );
            return Ok(FailureDisposition::Retrying { attempt });
        }

        step.status = StepStatus::Failed;
        execution.status = ExecutionStatus::Failed;
        execution.error_details = Some(format!("step '{step_name}': {error}"));
        if execution.completed_at.is_none() {
            execution.completed_at = Some(now);
        }
        warn!(
            execution_id = %execution_id,
            step = step_name,
            "step exhausted retries, execution failed"
        );
        Ok(FailureDisposition::Exhausted)
    }

    /// Marks a pending step skipped. Finalizes the execution if that was
    /// the last open step.
    pub fn skip_step(
        &mut self,
        tenant_id: Uuid,
        execution_id: Uuid,
        step_name: &str,
        now: DateTime<Utc>,
    ) -> MaestroResult<()> {
        let execution = self.execution_mut(tenant_id, execution_id)?;
        let step = execution
            .step_mut(step_name)
            .ok_or_else(|| MaestroError::NotFound(format!("step '{step_name}'")))?;
        if step.status != StepStatus::Pending {
            return Err(MaestroError::InvalidTransition {
                from: step.status.to_string(),
                to: StepStatus::Skipped.to_string(),
            });
        }
        step.status = StepStatus::Skipped;
        Self::finalize_if_settled(execution, now);
        Ok(())
    }

    /// Cancels a non-terminal execution cooperatively, cancelling every
    /// open step with it. In-flight work is expected to check status before
    /// applying its result.
    pub fn cancel(
        &mut self,
        tenant_id: Uuid,
        execution_id: Uuid,
        now: DateTime<Utc>,
    ) -> MaestroResult<()> {
        let execution = self.execution_mut(tenant_id, execution_id)?;
        if execution.status.is_terminal() {
            return Err(MaestroError::InvalidTransition {
                from: execution.status.to_string(),
                to: ExecutionStatus::Cancelled.to_string(),
            });
        }
        execution.status = ExecutionStatus::Cancelled;
        if execution.completed_at.is_none() {
            execution.completed_at = Some(now);
        }
        for step in &mut execution.steps {
            if !step.status.is_terminal() {
                step.status = StepStatus::Cancelled;
            }
        }
        info!(execution_id = %execution_id, "execution cancelled");
        Ok(())
    }

    /// Watchdog transition: moves running executions older than `max_age`
    /// to `timeout`. Returns the ids that timed out.
    pub fn sweep_timeouts(&mut self, now: DateTime<Utc>, max_age: Duration) -> Vec<Uuid> {
        let mut timed_out = Vec::new();
        for execution in self.executions.values_mut() {
            if execution.status != ExecutionStatus::Running {
                continue;
            }
            let Some(started_at) = execution.started_at else {
                continue;
            };
            if now - started_at < max_age {
                continue;
            }
            execution.status = ExecutionStatus::Timeout;
            if execution.completed_at.is_none() {
                execution.completed_at = Some(now);
            }
            for step in &mut execution.steps {
                if !step.status.is_terminal() {
                    step.status = StepStatus::Cancelled;
                }
            }
            warn!(execution_id = %execution.id, "execution timed out");
            timed_out.push(execution.id);
        }
        timed_out
    }

    /// Terminal (completed/failed) executions of a pipeline that finished
    /// within the window, as (status, duration) pairs. Taken under the
    /// lock; the statistics themselves are computed without it.
    pub fn stats_snapshot(
        &self,
        pipeline_id: Uuid,
        since: DateTime<Utc>,
    ) -> Vec<(ExecutionStatus, Option<i64>)> {
        self.executions
            .values()
            .filter(|e| e.pipeline_id == pipeline_id)
            .filter(|e| {
                matches!(
                    e.status,
                    ExecutionStatus::Completed | ExecutionStatus::Failed
                )
            })
            .filter(|e| e.completed_at.map(|t| t >= since).unwrap_or(false))
            .map(|e| (e.status, e.duration_secs()))
            .collect()
    }

    /// Writes back statistics computed from a snapshot.
    pub fn apply_stats(
        &mut self,
        pipeline_id: Uuid,
        success_rate: f64,
        average_duration_secs: Option<i64>,
    ) {
        if let Some(definition) = self.definitions.get_mut(&pipeline_id) {
            definition.success_rate = success_rate;
            definition.average_duration_secs = average_duration_secs;
        }
    }

    fn finalize_if_settled(execution: &mut PipelineExecution, now: DateTime<Utc>) {
        if !execution.all_steps_settled() || execution.status.is_terminal() {
            return;
        }
        let failed = execution.steps.iter().any(|s| s.status == StepStatus::Failed);
        let cancelled = execution
            .steps
            .iter()
            .any(|s| s.status == StepStatus::Cancelled);
        execution.status = if failed {
            ExecutionStatus::Failed
        } else if cancelled {
            ExecutionStatus::Cancelled
        } else {
            ExecutionStatus::Completed
        };
        if execution.completed_at.is_none() {
            execution.completed_at = Some(now);
        }
        info!(
            execution_id = %execution.id,
            status = %execution.status,
            "execution settled"
        );
    }
}

impl Default for PipelineExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENT_EXECUTIONS)
    }
}

/// Computes (success_rate, average_duration_secs) from a stats snapshot.
///
/// Success rate is completed over total terminal; the average covers only
/// completed executions with a recorded duration.
pub fn compute_stats(snapshot: &[(ExecutionStatus, Option<i64>)]) -> (f64, Option<i64>) {
    if snapshot.is_empty() {
        return (0.0, None);
    }
    let completed: Vec<i64> = snapshot
        .iter()
        .filter(|(status, _)| *status == ExecutionStatus::Completed)
        .filter_map(|(_, duration)| *duration)
        .collect();
    let successes = snapshot
        .iter()
        .filter(|(status, _)| *status == ExecutionStatus::Completed)
        .count();
    let success_rate = successes as f64 / snapshot.len() as f64;
    let average = if completed.is_empty() {
        None
    } else {
        Some(completed.iter().sum::<i64>() / completed.len() as i64)
    };
    (success_rate, average)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use maestro_core::StepTemplate;

    fn release_pipeline(executor: &mut PipelineExecutor, tenant: Uuid) -> Uuid {
        let definition = PipelineDefinition::new(tenant, "release")
            .with_step(StepTemplate::new("build"))
            .with_step(StepTemplate::new("test"))
            .with_step(StepTemplate::new("deploy").depends_on(&["build", "test"]));
        executor.register(definition).unwrap()
    }

    #[test]
    fn test_admission_cap() {
        let tenant = Uuid::new_v4();
        let mut executor = PipelineExecutor::default();
        let pipeline = release_pipeline(&mut executor, tenant);
        let now = Utc::now();

        for _ in 0..3 {
            executor.trigger(tenant, pipeline, now).unwrap();
        }
        let err = executor.trigger(tenant, pipeline, now).unwrap_err();
        assert!(matches!(err, MaestroError::CapacityExceeded(_)));
    }

    #[test]
    fn test_admission_frees_after_terminal() {
        let tenant = Uuid::new_v4();
        let mut executor = PipelineExecutor::default();
        let pipeline = release_pipeline(&mut executor, tenant);
        let now = Utc::now();

        let first = executor.trigger(tenant, pipeline, now).unwrap();
        executor.trigger(tenant, pipeline, now).unwrap();
        executor.trigger(tenant, pipeline, now).unwrap();

        executor.cancel(tenant, first, now).unwrap();
        executor.trigger(tenant, pipeline, now).unwrap();
    }

    #[test]
    fn test_deploy_waits_for_build_and_test() {
        let tenant = Uuid::new_v4();
        let mut executor = PipelineExecutor::default();
        let pipeline = release_pipeline(&mut executor, tenant);
        let now = Utc::now();

        let exec = executor.trigger(tenant, pipeline, now).unwrap();
        let mut ready = executor.start(tenant, exec, now).unwrap();
        ready.sort();
        assert_eq!(ready, vec!["build".to_string(), "test".to_string()]);

        executor.start_step(tenant, exec, "build", now).unwrap();
        let ready = executor.complete_step(tenant, exec, "build", now).unwrap();
        assert!(!ready.contains(&"deploy".to_string()));

        executor.start_step(tenant, exec, "test", now).unwrap();
        let ready = executor.complete_step(tenant, exec, "test", now).unwrap();
        assert_eq!(ready, vec!["deploy".to_string()]);

        // Starting deploy before its dependencies completed is rejected.
        let exec2 = executor.trigger(tenant, pipeline, now).unwrap();
        executor.start(tenant, exec2, now).unwrap();
        let err = executor.start_step(tenant, exec2, "deploy", now).unwrap_err();
        assert!(matches!(err, MaestroError::InvalidTransition { .. }));
    }

    #[test]
    fn test_completion_finalizes_execution() {
        let tenant = Uuid::new_v4();
        let mut executor = PipelineExecutor::default();
        let pipeline = release_pipeline(&mut executor, tenant);
        let start = Utc::now();

        let exec = executor.trigger(tenant, pipeline, start).unwrap();
        executor.start(tenant, exec, start).unwrap();
        for step in ["build", "test", "deploy"] {
            executor.start_step(tenant, exec, step, start).unwrap();
            executor
                .complete_step(tenant, exec, step, start + Duration::seconds(10))
                .unwrap();
        }

        let execution = executor.execution(tenant, exec).unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.duration_secs(), Some(10));
    }

    #[test]
    fn test_step_retry_budget() {
        let tenant = Uuid::new_v4();
        let mut executor = PipelineExecutor::default();
        let definition = PipelineDefinition::new(tenant, "flaky")
            .with_step(StepTemplate::new("only").with_max_retries(1));
        let pipeline = executor.register(definition).unwrap();
        let now = Utc::now();

        let exec = executor.trigger(tenant, pipeline, now).unwrap();
        executor.start(tenant, exec, now).unwrap();

        executor.start_step(tenant, exec, "only", now).unwrap();
        let disposition = executor
            .fail_step(tenant, exec, "only", "boom", now)
            .unwrap();
        assert_eq!(disposition, FailureDisposition::Retrying { attempt: 1 });

        // Back to pending, eligible again.
        executor.start_step(tenant, exec, "only", now).unwrap();
        let disposition = executor
            .fail_step(tenant, exec, "only", "boom again", now)
            .unwrap();
        assert_eq!(disposition, FailureDisposition::Exhausted);

        let execution = executor.execution(tenant, exec).unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(execution.error_details.as_deref().unwrap().contains("only"));
        let step = execution.step("only").unwrap();
        assert_eq!(step.retry_count, 2);
        assert_eq!(step.status, StepStatus::Failed);
    }

    #[test]
    fn test_timeout_sweep() {
        let tenant = Uuid::new_v4();
        let mut executor = PipelineExecutor::default();
        let pipeline = release_pipeline(&mut executor, tenant);
        let start = Utc::now();

        let exec = executor.trigger(tenant, pipeline, start).unwrap();
        executor.start(tenant, exec, start).unwrap();

        // Not old enough yet.
        let swept = executor.sweep_timeouts(start + Duration::minutes(5), Duration::minutes(30));
        assert!(swept.is_empty());

        let swept = executor.sweep_timeouts(start + Duration::minutes(31), Duration::minutes(30));
        assert_eq!(swept, vec![exec]);
        let execution = executor.execution(tenant, exec).unwrap();
        assert_eq!(execution.status, ExecutionStatus::Timeout);

        // A terminal transition never races a later completion.
        let err = executor.cancel(tenant, exec, start).unwrap_err();
        assert!(matches!(err, MaestroError::InvalidTransition { .. }));
    }

    #[test]
    fn test_compute_stats() {
        let snapshot = vec![
            (ExecutionStatus::Completed, Some(10)),
            (ExecutionStatus::Completed, Some(20)),
            (ExecutionStatus::Failed, None),
            (ExecutionStatus::Failed, None),
        ];
        let (rate, avg) = compute_stats(&snapshot);
        assert!((rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(avg, Some(15));

        assert_eq!(compute_stats(&[]), (0.0, None));
    }

    #[test]
    fn test_stats_snapshot_respects_window() {
        let tenant = Uuid::new_v4();
        let mut executor = PipelineExecutor::default();
        let pipeline = release_pipeline(&mut executor, tenant);
        let old = Utc::now() - Duration::days(60);

        let exec = executor.trigger(tenant, pipeline, old).unwrap();
        executor.start(tenant, exec, old).unwrap();
        for step in ["build", "test", "deploy"] {
            executor.start_step(tenant, exec, step, old).unwrap();
            executor.complete_step(tenant, exec, step, old).unwrap();
        }

        // Finished 60 days ago: outside a 30-day window.
        let since = Utc::now() - Duration::days(30);
        assert!(executor.stats_snapshot(pipeline, since).is_empty());
        assert_eq!(executor.stats_snapshot(pipeline, old - Duration::days(1)).len(), 1);
    }

    #[test]
    fn test_duplicate_definition_name_rejected() {
        let tenant = Uuid::new_v4();
        let mut executor = PipelineExecutor::default();
        release_pipeline(&mut executor, tenant);
        let duplicate =
            PipelineDefinition::new(tenant, "release").with_step(StepTemplate::new("x"));
        assert!(matches!(
            executor.register(duplicate),
            Err(MaestroError::Config(_))
        ));

        // Same name under another tenant is fine.
        let other = PipelineDefinition::new(Uuid::new_v4(), "release")
            .with_step(StepTemplate::new("x"));
        assert!(executor.register(other).is_ok());
    }
}
