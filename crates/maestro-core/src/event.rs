use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// The wire format of an inbound event, as posted to the webhook gateway.
///
/// Signature verification happens at the gateway boundary before this
/// payload reaches the ingestion pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundEvent {
    /// Event source, used to select a processing handler.
    pub source: String,
    /// The sender's id for this event; dedup key together with the
    /// integration.
    pub external_event_id: String,
    /// Source-specific event type.
    pub event_type: String,
    /// Opaque payload forwarded to the handler.
    pub payload: serde_json::Value,
    /// Relevant headers captured at the boundary.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Processing status of a tracked webhook event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    /// Received, not yet processed.
    Pending,
    /// A handler is currently running.
    Processing,
    /// Handled successfully.
    Processed,
    /// Exhausted its attempt budget.
    Failed,
    /// Waiting for its backoff to elapse before the next attempt.
    Retrying,
}

impl ProcessingStatus {
    /// Whether no further transition is defined from this status.
    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessingStatus::Processed | ProcessingStatus::Failed)
    }
}

impl std::fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Processed => "processed",
            ProcessingStatus::Failed => "failed",
            ProcessingStatus::Retrying => "retrying",
        };
        write!(f, "{s}")
    }
}

/// A tracked inbound event, processed idempotently under at-least-once
/// delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    /// Unique identifier.
    pub id: Uuid,
    /// Owning tenant.
    pub tenant_id: Uuid,
    /// The integration that delivered the event.
    pub integration_id: Uuid,
    /// The sender's id; (integration_id, external_event_id) is unique.
    pub external_event_id: String,
    /// Event source, used to select a processing handler.
    pub source: String,
    /// Source-specific event type.
    pub event_type: String,
    /// Opaque payload forwarded to the handler.
    pub payload: serde_json::Value,
    /// Headers captured at the boundary.
    pub headers: HashMap<String, String>,
    /// Current processing status.
    pub processing_status: ProcessingStatus,
    /// Attempts made so far; never exceeds `max_attempts`.
    pub processing_attempts: u32,
    /// Attempt budget.
    pub max_attempts: u32,
    /// When the next attempt may run, while `Retrying`.
    pub retry_after: Option<DateTime<Utc>>,
    /// Detail of the last handler failure, if any.
    pub error_details: Option<String>,
    /// When the event was received.
    pub received_at: DateTime<Utc>,
}

impl WebhookEvent {
    /// Creates a pending event from its wire form.
    pub fn from_inbound(
        tenant_id: Uuid,
        integration_id: Uuid,
        inbound: InboundEvent,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            integration_id,
            external_event_id: inbound.external_event_id,
            source: inbound.source,
            event_type: inbound.event_type,
            payload: inbound.payload,
            headers: inbound.headers,
            processing_status: ProcessingStatus::Pending,
            processing_attempts: 0,
            max_attempts,
            retry_after: None,
            error_details: None,
            received_at: now,
        }
    }
}

/// Result of submitting an inbound event to the ingestion pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The event was new and is now tracked.
    Accepted {
        /// Id of the newly tracked event.
        event_id: Uuid,
    },
    /// The (integration, external id) pair was already seen; no-op success.
    Duplicate {
        /// Id of the previously tracked event.
        event_id: Uuid,
    },
}

/// What a notification record is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// A pipeline execution reached `failed`.
    PipelineFailed,
    /// A rate-limit bucket rejected a request.
    RateLimitBreached,
    /// An agent task exhausted its retry budget.
    AgentTaskFailed,
}

/// A notification record produced by the core and consumed by an external
/// delivery service. The core only produces the record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRecord {
    /// What happened.
    pub kind: NotificationKind,
    /// Delivery-specific configuration, opaque to the core.
    pub target_config: serde_json::Value,
    /// When the triggering transition happened.
    pub triggered_at: DateTime<Utc>,
}
