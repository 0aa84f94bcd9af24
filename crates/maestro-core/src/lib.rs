//! Core types and error definitions for the Maestro orchestration engine.
//!
//! This crate provides the domain entities shared across all Maestro crates:
//! tasks and their materialized hierarchy, dependency edges, pipeline
//! definitions and executions, agents and agent tasks, webhook events, and
//! notification records.
//!
//! # Main types
//!
//! - [`MaestroError`] — Unified error enum for all Maestro subsystems.
//! - [`MaestroResult`] — Convenience alias for `Result<T, MaestroError>`.
//! - [`Task`] — A unit of work within a tenant's task hierarchy.
//! - [`PipelineDefinition`] / [`PipelineExecution`] — Multi-step pipeline
//!   templates and their running instances.
//! - [`Agent`] / [`AgentTask`] — Capacity-limited execution agents and the
//!   work assigned to them.
//! - [`WebhookEvent`] — An inbound event tracked through idempotent,
//!   retry-safe processing.

/// Agents, agent tasks, and the external execution collaborator interface.
pub mod agent;
/// Unified error type and result alias.
pub mod error;
/// Webhook events, ingestion outcomes, and notification records.
pub mod event;
/// Pipeline definitions, executions, and step state machines.
pub mod pipeline;
/// Tasks, hierarchy records, and dependency edges.
pub mod task;

pub use agent::{
    Agent, AgentTask, AgentTaskStatus, Capability, ExecutionOutcome, ExecutionRequest,
    OutcomeStatus,
};
pub use error::{MaestroError, MaestroResult};
pub use event::{
    InboundEvent, IngestOutcome, NotificationKind, NotificationRecord, ProcessingStatus,
    WebhookEvent,
};
pub use pipeline::{
    ExecutionStatus, PipelineDefinition, PipelineExecution, PipelineStep, StepStatus, StepTemplate,
};
pub use task::{AncestorRecord, DependencyEdge, DependencyKind, Task, TaskPriority, TaskStatus};
