use crate::task::TaskPriority;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A named capability an agent advertises, which can be toggled off without
/// unregistering the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    /// Capability name, matched against scheduling requirements.
    pub name: String,
    /// Disabled capabilities do not satisfy requirements.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Capability {
    /// Creates an enabled capability.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
        }
    }
}

/// A capacity-limited execution agent registered with the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Unique identifier.
    pub id: Uuid,
    /// Owning tenant.
    pub tenant_id: Uuid,
    /// Agent type, matched against scheduling requests.
    pub agent_type: String,
    /// Advertised capabilities.
    pub capabilities: Vec<Capability>,
    /// Inactive agents are never selected.
    pub active: bool,
    /// Maximum simultaneous queued + running tasks. Always > 0.
    pub max_concurrent_tasks: u32,
    /// Share of terminal tasks that completed, over the trailing window.
    pub success_rate: f64,
    /// Mean completion seconds over completed tasks with a recorded
    /// duration, if any.
    pub average_completion_secs: Option<i64>,
    /// Last time a task of this agent reached a terminal state.
    pub last_used_at: Option<DateTime<Utc>>,
    /// UTC timestamp of registration.
    pub registered_at: DateTime<Utc>,
}

impl Agent {
    /// Registers a new active agent of the given type.
    pub fn new(tenant_id: Uuid, agent_type: impl Into<String>, max_concurrent_tasks: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            agent_type: agent_type.into(),
            capabilities: Vec::new(),
            active: true,
            max_concurrent_tasks,
            success_rate: 0.0,
            average_completion_secs: None,
            last_used_at: None,
            registered_at: Utc::now(),
        }
    }

    /// Adds an enabled capability.
    pub fn with_capability(mut self, name: impl Into<String>) -> Self {
        self.capabilities.push(Capability::new(name));
        self
    }

    /// Whether the agent holds the named capability and it is enabled.
    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.iter().any(|c| c.name == name && c.enabled)
    }
}

/// Status of a task assigned to an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentTaskStatus {
    /// Accepted, waiting for the agent to pick it up.
    Queued,
    /// Handed to the external execution engine.
    Running,
    /// The engine reported success.
    Completed,
    /// Exhausted the retry budget.
    Failed,
    /// Cancelled cooperatively; in-flight results are discarded.
    Cancelled,
    /// Exceeded the running-time ceiling.
    Timeout,
}

impl AgentTaskStatus {
    /// Whether no further transition is defined from this status.
    pub fn is_terminal(self) -> bool {
        !matches!(self, AgentTaskStatus::Queued | AgentTaskStatus::Running)
    }
}

impl std::fmt::Display for AgentTaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentTaskStatus::Queued => "queued",
            AgentTaskStatus::Running => "running",
            AgentTaskStatus::Completed => "completed",
            AgentTaskStatus::Failed => "failed",
            AgentTaskStatus::Cancelled => "cancelled",
            AgentTaskStatus::Timeout => "timeout",
        };
        write!(f, "{s}")
    }
}

/// The request handed to the external execution engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Prompt or instruction for the execution engine.
    pub prompt: String,
    /// Arbitrary context forwarded verbatim.
    pub context: serde_json::Value,
    /// Task type, used to select a matching agent.
    pub task_type: String,
}

impl ExecutionRequest {
    /// Creates a request with empty context.
    pub fn new(task_type: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            context: serde_json::Value::Null,
            task_type: task_type.into(),
        }
    }
}

/// How the external execution engine reported its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// The engine produced a usable result.
    Completed,
    /// The engine reported a failure.
    Failed,
}

/// The result returned by the external execution engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    /// Success or failure as reported by the engine.
    pub status: OutcomeStatus,
    /// Result text (or failure description).
    pub result: String,
    /// Tokens consumed by the run.
    pub tokens_used: u64,
    /// Cost of the run, in cents.
    pub cost_cents: u64,
}

/// A unit of work assigned to one agent, retried up to its budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTask {
    /// Unique identifier.
    pub id: Uuid,
    /// The agent this task counts against.
    pub agent_id: Uuid,
    /// Optional back-reference to an orchestration task. Never ownership.
    pub task_id: Option<Uuid>,
    /// Current status.
    pub status: AgentTaskStatus,
    /// Scheduling priority.
    pub priority: TaskPriority,
    /// Failures so far.
    pub retry_count: u32,
    /// Retry budget.
    pub max_retries: u32,
    /// The request to hand to the execution engine.
    pub request: ExecutionRequest,
    /// The engine's result, once terminal.
    pub outcome: Option<ExecutionOutcome>,
    /// When the task was enqueued.
    pub queued_at: DateTime<Utc>,
    /// When the task last started running.
    pub started_at: Option<DateTime<Utc>>,
    /// Set exactly once, when the task reaches a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Detail of the last failure, if any.
    pub error_details: Option<String>,
}

impl AgentTask {
    /// Creates a queued task for the given agent.
    pub fn new(agent_id: Uuid, request: ExecutionRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id,
            task_id: None,
            status: AgentTaskStatus::Queued,
            priority: TaskPriority::default(),
            retry_count: 0,
            max_retries: 2,
            request,
            outcome: None,
            queued_at: now,
            started_at: None,
            completed_at: None,
            error_details: None,
        }
    }

    /// Links the agent task back to an orchestration task.
    pub fn for_task(mut self, task_id: Uuid) -> Self {
        self.task_id = Some(task_id);
        self
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Whether the task currently counts against its agent's capacity.
    pub fn counts_against_capacity(&self) -> bool {
        matches!(
            self.status,
            AgentTaskStatus::Queued | AgentTaskStatus::Running
        )
    }

    /// Wall-clock duration in seconds, once both timestamps are set.
    pub fn duration_secs(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_seconds()),
            _ => None,
        }
    }
}
