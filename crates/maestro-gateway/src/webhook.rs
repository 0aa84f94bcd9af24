use crate::signature::verify;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use maestro_core::{InboundEvent, IngestOutcome, MaestroError};
use maestro_engine::Orchestrator;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Header carrying the hex HMAC-SHA256 of the raw request body.
pub const SIGNATURE_HEADER: &str = "x-maestro-signature";

/// Per-integration authentication: which tenant the integration delivers
/// for, and the shared secret its requests are signed with.
#[derive(Debug, Clone, Deserialize)]
pub struct IntegrationAuth {
    /// The tenant inbound events are ingested under.
    pub tenant_id: Uuid,
    /// Shared secret for request signing.
    pub secret: String,
}

/// Shared state for the webhook intake routes.
pub struct GatewayState {
    /// The orchestration engine events are submitted to.
    pub engine: Arc<Orchestrator>,
    /// Known integrations by id.
    pub integrations: HashMap<Uuid, IntegrationAuth>,
}

/// Axum handler for inbound webhook deliveries.
///
/// Route: `POST /webhook/{integration_id}`
///
/// Verifies the body signature against the integration's shared secret
/// before anything reaches the ingestion pipeline, then maps the ingest
/// outcome: new events and duplicates are both `200` (ingestion is
/// idempotent), an exhausted rate-limit bucket is `429` with the retry
/// time.
pub async fn webhook_handler(
    Path(integration_id): Path<Uuid>,
    headers: HeaderMap,
    State(state): State<Arc<GatewayState>>,
    body: String,
) -> impl IntoResponse {
    let Some(integration) = state.integrations.get(&integration_id) else {
        warn!(integration_id = %integration_id, "unknown integration");
        return (
            StatusCode::NOT_FOUND,
            serde_json::json!({"error": "unknown integration"}).to_string(),
        );
    };

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !verify(&integration.secret, body.as_bytes(), signature) {
        warn!(integration_id = %integration_id, "webhook signature verification failed");
        return (
            StatusCode::UNAUTHORIZED,
            serde_json::json!({"error": "invalid signature"}).to_string(),
        );
    }

    let inbound: InboundEvent = match serde_json::from_str(&body) {
        Ok(inbound) => inbound,
        Err(err) => {
            warn!(integration_id = %integration_id, error = %err, "malformed event payload");
            return (
                StatusCode::BAD_REQUEST,
                serde_json::json!({"error": format!("malformed event: {err}")}).to_string(),
            );
        }
    };

    match state
        .engine
        .ingest_event(integration.tenant_id, integration_id, inbound)
        .await
    {
        Ok(IngestOutcome::Accepted { event_id }) => {
            info!(integration_id = %integration_id, event_id = %event_id, "event accepted");
            (
                StatusCode::OK,
                serde_json::json!({"status": "accepted", "eventId": event_id}).to_string(),
            )
        }
        Ok(IngestOutcome::Duplicate { event_id }) => (
            StatusCode::OK,
            serde_json::json!({"status": "duplicate", "eventId": event_id}).to_string(),
        ),
        Err(MaestroError::RateLimitExceeded { retry_at, .. }) => (
            StatusCode::TOO_MANY_REQUESTS,
            serde_json::json!({"error": "rate limit exceeded", "retryAt": retry_at}).to_string(),
        ),
        Err(err) => {
            warn!(integration_id = %integration_id, error = %err, "event ingestion failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({"error": err.to_string()}).to_string(),
            )
        }
    }
}
