use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Template for a single step within a pipeline definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepTemplate {
    /// Step name, unique within the definition.
    pub name: String,
    /// Names of sibling steps that must complete before this one may start.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// How many times the step may be retried after a failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    2
}

impl StepTemplate {
    /// Creates a step template with no dependencies.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            depends_on: Vec::new(),
            max_retries: default_max_retries(),
        }
    }

    /// Sets the step names this step depends on.
    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|s| (*s).to_string()).collect();
        self
    }

    /// Sets the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// A pipeline definition: step templates plus rolling statistics.
///
/// Unique per (tenant, name). Statistics are recomputed over a trailing
/// window on every terminal execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// Unique identifier.
    pub id: Uuid,
    /// Owning tenant.
    pub tenant_id: Uuid,
    /// Definition name, unique within the tenant.
    pub name: String,
    /// Ordered step templates.
    pub steps: Vec<StepTemplate>,
    /// Share of terminal executions that completed, over the trailing window.
    pub success_rate: f64,
    /// Mean duration in seconds of completed executions over the trailing
    /// window, if any completed.
    pub average_duration_secs: Option<i64>,
    /// UTC timestamp of creation.
    pub created_at: DateTime<Utc>,
}

impl PipelineDefinition {
    /// Creates an empty definition for the given tenant.
    pub fn new(tenant_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            name: name.into(),
            steps: Vec::new(),
            success_rate: 0.0,
            average_duration_secs: None,
            created_at: Utc::now(),
        }
    }

    /// Appends a step template.
    pub fn with_step(mut self, step: StepTemplate) -> Self {
        self.steps.push(step);
        self
    }
}

/// Status of a pipeline execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Admitted but not yet started.
    Queued,
    /// Steps are being driven.
    Running,
    /// Every step reached a successful terminal state.
    Completed,
    /// A step exhausted its retry budget.
    Failed,
    /// Cancelled cooperatively.
    Cancelled,
    /// Exceeded the execution time ceiling.
    Timeout,
}

impl ExecutionStatus {
    /// Whether no further transition is defined from this status.
    pub fn is_terminal(self) -> bool {
        !matches!(self, ExecutionStatus::Queued | ExecutionStatus::Running)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::Queued => "queued",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::Timeout => "timeout",
        };
        write!(f, "{s}")
    }
}

/// Status of a single step within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Waiting for its dependencies to complete.
    Pending,
    /// Currently executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Exhausted its retry budget.
    Failed,
    /// Intentionally not executed.
    Skipped,
    /// Cancelled with its execution.
    Cancelled,
}

impl StepStatus {
    /// Whether no further transition is defined from this status.
    pub fn is_terminal(self) -> bool {
        !matches!(self, StepStatus::Pending | StepStatus::Running)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
            StepStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// A step instantiated from a [`StepTemplate`] for one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStep {
    /// Unique identifier.
    pub id: Uuid,
    /// Name copied from the template.
    pub name: String,
    /// Names of sibling steps that must complete first.
    pub depends_on: Vec<String>,
    /// Current status.
    pub status: StepStatus,
    /// Failures so far; never exceeds `max_retries + 1` increments.
    pub retry_count: u32,
    /// Retry budget copied from the template.
    pub max_retries: u32,
    /// Set when the step first starts running.
    pub started_at: Option<DateTime<Utc>>,
    /// Set exactly once, when the step completes.
    pub completed_at: Option<DateTime<Utc>>,
    /// Detail of the last failure, if any.
    pub error_details: Option<String>,
}

impl PipelineStep {
    /// Instantiates a pending step from a template.
    pub fn from_template(template: &StepTemplate) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: template.name.clone(),
            depends_on: template.depends_on.clone(),
            status: StepStatus::Pending,
            retry_count: 0,
            max_retries: template.max_retries,
            started_at: None,
            completed_at: None,
            error_details: None,
        }
    }

    /// Wall-clock duration in seconds, once both timestamps are set.
    pub fn duration_secs(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_seconds()),
            _ => None,
        }
    }
}

/// A running (or finished) instance of a pipeline definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineExecution {
    /// Unique identifier.
    pub id: Uuid,
    /// The definition this execution was instantiated from.
    pub pipeline_id: Uuid,
    /// Owning tenant, copied from the definition.
    pub tenant_id: Uuid,
    /// Current status.
    pub status: ExecutionStatus,
    /// Step instances, in definition order.
    pub steps: Vec<PipelineStep>,
    /// When the execution was admitted.
    pub queued_at: DateTime<Utc>,
    /// When the execution began running.
    pub started_at: Option<DateTime<Utc>>,
    /// Set exactly once, when the execution reaches a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Detail of the failure that terminated the execution, if any.
    pub error_details: Option<String>,
}

impl PipelineExecution {
    /// Instantiates a queued execution from a definition.
    pub fn from_definition(definition: &PipelineDefinition, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            pipeline_id: definition.id,
            tenant_id: definition.tenant_id,
            status: ExecutionStatus::Queued,
            steps: definition.steps.iter().map(PipelineStep::from_template).collect(),
            queued_at: now,
            started_at: None,
            completed_at: None,
            error_details: None,
        }
    }

    /// Returns the step with the given name.
    pub fn step(&self, name: &str) -> Option<&PipelineStep> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Returns the step with the given name, mutably.
    pub fn step_mut(&mut self, name: &str) -> Option<&mut PipelineStep> {
        self.steps.iter_mut().find(|s| s.name == name)
    }

    /// Names of pending steps whose entire `depends_on` set is completed.
    ///
    /// Re-evaluated by the executor after every sibling terminal transition,
    /// so a step never starts before its dependencies are observed complete.
    pub fn ready_step_names(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Pending)
            .filter(|s| {
                s.depends_on.iter().all(|dep| {
                    self.step(dep)
                        .map(|d| d.status == StepStatus::Completed)
                        .unwrap_or(false)
                })
            })
            .map(|s| s.name.clone())
            .collect()
    }

    /// Whether every step has reached a terminal state.
    pub fn all_steps_settled(&self) -> bool {
        self.steps.iter().all(|s| s.status.is_terminal())
    }

    /// Wall-clock duration in seconds, once both timestamps are set.
    pub fn duration_secs(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_seconds()),
            _ => None,
        }
    }
}
