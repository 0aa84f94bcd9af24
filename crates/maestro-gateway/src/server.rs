use crate::webhook::{webhook_handler, GatewayState, IntegrationAuth};
use axum::{
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use maestro_engine::Orchestrator;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// The webhook intake server.
pub struct GatewayServer;

impl GatewayServer {
    /// Builds the intake router for the given engine and integrations.
    pub fn build(
        engine: Arc<Orchestrator>,
        integrations: HashMap<Uuid, IntegrationAuth>,
    ) -> Router {
        let state = Arc::new(GatewayState {
            engine,
            integrations,
        });

        Router::new()
            .route("/webhook/{integration_id}", post(webhook_handler))
            .route("/health", get(health_handler))
            .with_state(state)
    }
}

async fn health_handler() -> impl IntoResponse {
    serde_json::json!({"status": "ok", "service": "maestro"}).to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::signature::sign;
    use crate::webhook::SIGNATURE_HEADER;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use maestro_engine::{EngineConfig, NoopExecutor, TaskEventHandler};
    use tower::ServiceExt;

    fn event_body(external_id: &str) -> String {
        serde_json::json!({
            "source": "tasks",
            "externalEventId": external_id,
            "eventType": "task.create",
            "payload": {"title": "From webhook"}
        })
        .to_string()
    }

    async fn test_gateway() -> (Router, Uuid, String) {
        let engine = Arc::new(Orchestrator::new(
            EngineConfig::default(),
            Arc::new(NoopExecutor),
        ));
        engine
            .register_handler(
                "tasks",
                Arc::new(TaskEventHandler::new(engine.tasks().clone())),
            )
            .await;

        let integration_id = Uuid::new_v4();
        let secret = "gw-secret".to_string();
        let mut integrations = HashMap::new();
        integrations.insert(
            integration_id,
            IntegrationAuth {
                tenant_id: Uuid::new_v4(),
                secret: secret.clone(),
            },
        );
        (
            GatewayServer::build(engine, integrations),
            integration_id,
            secret,
        )
    }

    fn signed_post(integration_id: Uuid, secret: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(format!("/webhook/{integration_id}"))
            .header("content-type", "application/json")
            .header(SIGNATURE_HEADER, sign(secret, body.as_bytes()))
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _, _) = test_gateway().await;
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_signed_delivery_accepted_then_duplicate() {
        let (app, integration_id, secret) = test_gateway().await;
        let body = event_body("evt-1");

        let response = app
            .clone()
            .oneshot(signed_post(integration_id, &secret, &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["status"], "accepted");

        let response = app
            .oneshot(signed_post(integration_id, &secret, &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["status"], "duplicate");
    }

    #[tokio::test]
    async fn test_bad_signature_unauthorized() {
        let (app, integration_id, _) = test_gateway().await;
        let body = event_body("evt-1");

        let response = app
            .oneshot(signed_post(integration_id, "wrong-secret", &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_unknown_integration_not_found() {
        let (app, _, secret) = test_gateway().await;
        let body = event_body("evt-1");

        let response = app
            .oneshot(signed_post(Uuid::new_v4(), &secret, &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_malformed_payload_bad_request() {
        let (app, integration_id, secret) = test_gateway().await;
        let body = r#"{"not": "an event"}"#;

        let response = app
            .oneshot(signed_post(integration_id, &secret, body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
