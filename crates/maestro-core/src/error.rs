use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

/// A convenience `Result` alias using [`MaestroError`].
pub type MaestroResult<T> = Result<T, MaestroError>;

/// Top-level error type for the Maestro orchestration engine.
///
/// Each variant corresponds to a rejection the engine surfaces synchronously
/// to its caller. Failures of external handlers are not errors at this level:
/// they are recorded as terminal status plus error detail on the owning
/// entity.
#[derive(Debug, Error)]
pub enum MaestroError {
    /// A proposed dependency edge (or reparent) would close a cycle.
    #[error("Circular dependency: {dependent_id} -> {dependency_id} would close a cycle")]
    CircularDependency {
        /// The node that would depend on the other.
        dependent_id: Uuid,
        /// The node being depended on.
        dependency_id: Uuid,
    },

    /// An ancestor walk exceeded the depth ceiling. Signals a corrupted or
    /// cyclic parent chain that escaped validation.
    #[error("Hierarchy too deep: ancestor chain of task {task_id} exceeds depth {depth}")]
    HierarchyTooDeep {
        /// The task whose chain was being walked.
        task_id: Uuid,
        /// The ceiling that was exceeded.
        depth: u32,
    },

    /// An agent or pipeline concurrency limit was reached. The caller may
    /// retry once in-flight work reaches a terminal state.
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// A rate-limit bucket is exhausted for the current window.
    #[error("Rate limit exceeded for {key}; retry at {retry_at}")]
    RateLimitExceeded {
        /// Human-readable bucket key (integration + endpoint).
        key: String,
        /// When the current window elapses and requests are admitted again.
        retry_at: DateTime<Utc>,
    },

    /// No registered agent matches the requested type, capabilities, and has
    /// spare capacity.
    #[error("No agent available for task type '{task_type}'")]
    NoAgentAvailable {
        /// The requested agent type.
        task_type: String,
    },

    /// A state-machine transition that is not defined for the entity.
    #[error("Invalid transition from '{from}' to '{to}'")]
    InvalidTransition {
        /// The current status.
        from: String,
        /// The requested status.
        to: String,
    },

    /// The referenced entity does not exist (or belongs to another tenant).
    #[error("Not found: {0}")]
    NotFound(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
