//! Orchestration engine: hierarchical tasks, dependency-safe graphs,
//! pipeline execution, capacity-limited agent scheduling, and idempotent
//! webhook ingestion.
//!
//! Correctness relies on per-entity atomic mutations rather than a global
//! lock: each component is a plain store composed behind its own lock by
//! [`Orchestrator`], and every check-then-act sequence (capacity check +
//! enqueue, rate-limit check + increment, cycle check + insert) runs under
//! one lock hold. External collaborators (the agent execution engine and
//! event handlers) are always invoked with no lock held.
//!
//! # Main types
//!
//! - [`Orchestrator`] — Top-level engine composing every component.
//! - [`TaskStore`] — Task hierarchy with a materialized ancestor closure.
//! - [`DependencyGraph`] — Typed dependency edges with cycle prevention.
//! - [`PipelineExecutor`] — Pipeline/step state machines and admission.
//! - [`AgentScheduler`] — Capacity-limited agent assignment and feedback.
//! - [`EventIngestionPipeline`] — Idempotent, retry-safe event processing.
//! - [`RateLimiter`] — Fixed-window per-key admission control.

/// Dependency graph with cycle prevention.
pub mod depgraph;
/// The composing orchestration engine and its configuration.
pub mod engine;
/// Built-in event handlers.
pub mod handlers;
/// Idempotent webhook event ingestion and retry scheduling.
pub mod ingest;
/// Notification record sink.
pub mod notify;
/// Pipeline execution and step state machines.
pub mod pipeline;
/// Fixed-window rate limiting.
pub mod ratelimit;
/// Agent registry, capacity accounting, and ranking.
pub mod scheduler;
/// Task store and materialized hierarchy.
pub mod tasks;

pub use depgraph::DependencyGraph;
pub use engine::{AgentExecutor, EngineConfig, NoopExecutor, Orchestrator};
pub use handlers::TaskEventHandler;
pub use ingest::{EventHandler, EventIngestionPipeline};
pub use notify::NotificationSink;
pub use pipeline::{compute_stats, FailureDisposition, PipelineExecutor};
pub use ratelimit::{RateLimitKey, RateLimiter};
pub use scheduler::{AgentScheduler, TaskDisposition};
pub use tasks::TaskStore;
