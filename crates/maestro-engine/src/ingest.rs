use crate::notify::NotificationSink;
use crate::ratelimit::{RateLimitKey, RateLimiter};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use maestro_core::{
    InboundEvent, IngestOutcome, MaestroError, MaestroResult, NotificationKind, ProcessingStatus,
    WebhookEvent,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

/// Processes one kind of inbound event, keyed by the event's `source`.
///
/// Handlers run outside the event-store lock; their result is fed back
/// through an atomic status update.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handles the event. An `Err` counts as a failed attempt and is
    /// retried up to the event's attempt budget.
    async fn handle(&self, event: &WebhookEvent) -> MaestroResult<()>;
}

struct EventStore {
    events: HashMap<Uuid, WebhookEvent>,
    dedup: HashMap<(Uuid, String), Uuid>,
}

/// Ingests webhook events idempotently and drives their retry-safe
/// processing state machine.
///
/// Dedup key is `(integration_id, external_event_id)`: a duplicate is a
/// no-op success, which keeps ingestion idempotent under at-least-once
/// delivery. Admission consults the per-integration rate limiter before
/// anything is recorded.
pub struct EventIngestionPipeline {
    max_attempts: u32,
    backoff_step: Duration,
    store: RwLock<EventStore>,
    handlers: RwLock<HashMap<String, Arc<dyn EventHandler>>>,
    limiter: Arc<RateLimiter>,
    notifications: Arc<NotificationSink>,
}

impl EventIngestionPipeline {
    /// Creates a pipeline with the given attempt budget and linear backoff
    /// step.
    pub fn new(
        max_attempts: u32,
        backoff_step: Duration,
        limiter: Arc<RateLimiter>,
        notifications: Arc<NotificationSink>,
    ) -> Self {
        Self {
            max_attempts,
            backoff_step,
            store: RwLock::new(EventStore {
                events: HashMap::new(),
                dedup: HashMap::new(),
            }),
            handlers: RwLock::new(HashMap::new()),
            limiter,
            notifications,
        }
    }

    /// Registers the handler for an event source, replacing any previous
    /// one.
    pub async fn register_handler(&self, source: impl Into<String>, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.insert(source.into(), handler);
    }

    /// Records an inbound event unless it was already seen.
    ///
    /// Returns [`IngestOutcome::Duplicate`] for a repeated
    /// (integration, external id) pair; rejects with
    /// [`MaestroError::RateLimitExceeded`] when the integration's bucket is
    /// exhausted, emitting a rate-limit-breach notification.
    pub async fn ingest(
        &self,
        tenant_id: Uuid,
        integration_id: Uuid,
        inbound: InboundEvent,
        now: DateTime<Utc>,
    ) -> MaestroResult<IngestOutcome> {
        let key = RateLimitKey::new(integration_id, "webhook");
        if let Err(err) = self.limiter.admit(&key, now).await {
            warn!(integration_id = %integration_id, "inbound event rate limited");
            self.notifications
                .emit(
                    NotificationKind::RateLimitBreached,
                    serde_json::json!({ "integration_id": integration_id }),
                    now,
                )
                .await;
            return Err(err);
        }

        let mut store = self.store.write().await;
        let dedup_key = (integration_id, inbound.external_event_id.clone());
        if let Some(existing) = store.dedup.get(&dedup_key) {
            info!(
                integration_id = %integration_id,
                external_event_id = %dedup_key.1,
                "duplicate event ignored"
            );
            return Ok(IngestOutcome::Duplicate { event_id: *existing });
        }

        let event =
            WebhookEvent::from_inbound(tenant_id, integration_id, inbound, self.max_attempts, now);
        let event_id = event.id;
        store.dedup.insert(dedup_key, event_id);
        store.events.insert(event_id, event);
        Ok(IngestOutcome::Accepted { event_id })
    }

    /// Runs one processing attempt for the event.
    ///
    /// The event is claimed (`pending`/`retrying` → `processing`) under the
    /// store lock, the handler runs with no lock held, and the result is
    /// applied atomically afterwards: success settles the event as
    /// `processed`; failure schedules a retry with linear backoff until the
    /// attempt budget is exhausted, then settles it as `failed`.
    pub async fn process(&self, event_id: Uuid, now: DateTime<Utc>) -> MaestroResult<ProcessingStatus> {
        let snapshot = {
            let mut store = self.store.write().await;
            let event = store
                .events
                .get_mut(&event_id)
                .ok_or_else(|| MaestroError::NotFound(format!("event {event_id}")))?;
            match event.processing_status {
                ProcessingStatus::Pending | ProcessingStatus::Retrying => {}
                status => {
                    return Err(MaestroError::InvalidTransition {
                        from: status.to_string(),
                        to: ProcessingStatus::Processing.to_string(),
                    })
                }
            }
            event.processing_status = ProcessingStatus::Processing;
            event.clone()
        };

        let handler = {
            let handlers = self.handlers.read().await;
            handlers.get(&snapshot.source).cloned()
        };
        let result = match handler {
            Some(handler) => handler.handle(&snapshot).await,
            None => Err(MaestroError::Config(format!(
                "no handler registered for source '{}'",
                snapshot.source
            ))),
        };

        let mut store = self.store.write().await;
        let event = store
            .events
            .get_mut(&event_id)
            .ok_or_else(|| MaestroError::NotFound(format!("event {event_id}")))?;

        match result {
            Ok(()) => {
                event.processing_status = ProcessingStatus::Processed;
                event.error_details = None;
                event.retry_after = None;
                info!(event_id = %event_id, "event processed");
            }
            Err(err) => {
                event.processing_attempts += 1;
                event.error_details = Some(err.to_string());
                if event.processing_attempts < event.max_attempts {
                    event.processing_status = ProcessingStatus::Retrying;
                    event.retry_after =
                        Some(now + self.backoff_step * event.processing_attempts as i32);
                    warn!(
                        event_id = %event_id,
                        attempt = event.processing_attempts,
                        "event handler failed, retry scheduled"
                    );
                } else {
                    event.processing_status = ProcessingStatus::Failed;
                    event.retry_after = None;
                    warn!(event_id = %event_id, "event handler exhausted attempts");
                }
            }
        }
        Ok(event.processing_status)
    }

    /// Re-submits every retrying event whose backoff has elapsed through
    /// the same processing path. Returns the ids that were attempted.
    pub async fn sweep_due(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let due: Vec<Uuid> = {
            let store = self.store.read().await;
            store
                .events
                .values()
                .filter(|e| e.processing_status == ProcessingStatus::Retrying)
                .filter(|e| e.retry_after.map(|t| t <= now).unwrap_or(true))
                .map(|e| e.id)
                .collect()
        };

        for event_id in &due {
            if let Err(err) = self.process(*event_id, now).await {
                warn!(event_id = %event_id, error = %err, "retry sweep failed to process event");
            }
        }
        due
    }

    /// Returns a copy of the tracked event, if it belongs to the tenant.
    pub async fn event(&self, tenant_id: Uuid, event_id: Uuid) -> MaestroResult<WebhookEvent> {
        let store = self.store.read().await;
        store
            .events
            .get(&event_id)
            .filter(|e| e.tenant_id == tenant_id)
            .cloned()
            .ok_or_else(|| MaestroError::NotFound(format!("event {event_id}")))
    }

    /// Number of tracked events.
    pub async fn event_count(&self) -> usize {
        self.store.read().await.events.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` attempts, then succeeds.
    struct FlakyHandler {
        failures: u32,
        calls: AtomicU32,
    }

    impl FlakyHandler {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl EventHandler for FlakyHandler {
        async fn handle(&self, _event: &WebhookEvent) -> MaestroResult<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(MaestroError::Config("simulated handler failure".into()))
            } else {
                Ok(())
            }
        }
    }

    fn pipeline(max_attempts: u32) -> EventIngestionPipeline {
        EventIngestionPipeline::new(
            max_attempts,
            Duration::minutes(5),
            Arc::new(RateLimiter::new(1000, Duration::seconds(60))),
            Arc::new(NotificationSink::new()),
        )
    }

    fn inbound(external_id: &str) -> InboundEvent {
        InboundEvent {
            source: "github".into(),
            external_event_id: external_id.into(),
            event_type: "push".into(),
            payload: serde_json::json!({"ref": "main"}),
            headers: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_duplicate_ingest_is_noop() {
        let pipeline = pipeline(3);
        pipeline
            .register_handler("github", Arc::new(FlakyHandler::new(0)))
            .await;
        let tenant = Uuid::new_v4();
        let integration = Uuid::new_v4();
        let now = Utc::now();

        let first = pipeline
            .ingest(tenant, integration, inbound("evt-42"), now)
            .await
            .unwrap();
        let IngestOutcome::Accepted { event_id } = first else {
            panic!("expected acceptance");
        };

        let second = pipeline
            .ingest(tenant, integration, inbound("evt-42"), now)
            .await
            .unwrap();
        assert_eq!(second, IngestOutcome::Duplicate { event_id });
        assert_eq!(pipeline.event_count().await, 1);

        // Exactly one terminal record exists for evt-42.
        pipeline.process(event_id, now).await.unwrap();
        let event = pipeline.event(tenant, event_id).await.unwrap();
        assert_eq!(event.processing_status, ProcessingStatus::Processed);
    }

    #[tokio::test]
    async fn test_same_external_id_different_integration_accepted() {
        let pipeline = pipeline(3);
        let tenant = Uuid::new_v4();
        let now = Utc::now();

        let a = pipeline
            .ingest(tenant, Uuid::new_v4(), inbound("evt-1"), now)
            .await
            .unwrap();
        let b = pipeline
            .ingest(tenant, Uuid::new_v4(), inbound("evt-1"), now)
            .await
            .unwrap();
        assert!(matches!(a, IngestOutcome::Accepted { .. }));
        assert!(matches!(b, IngestOutcome::Accepted { .. }));
    }

    #[tokio::test]
    async fn test_retry_backoff_is_linear() {
        let pipeline = pipeline(3);
        pipeline
            .register_handler("github", Arc::new(FlakyHandler::new(2)))
            .await;
        let tenant = Uuid::new_v4();
        let now = Utc::now();

        let IngestOutcome::Accepted { event_id } = pipeline
            .ingest(tenant, Uuid::new_v4(), inbound("evt-1"), now)
            .await
            .unwrap()
        else {
            panic!("expected acceptance");
        };

        // First failure: retry after 1 x 5 minutes.
        let status = pipeline.process(event_id, now).await.unwrap();
        assert_eq!(status, ProcessingStatus::Retrying);
        let event = pipeline.event(tenant, event_id).await.unwrap();
        assert_eq!(event.retry_after, Some(now + Duration::minutes(5)));

        // Second failure: retry after 2 x 5 minutes.
        let later = now + Duration::minutes(5);
        let status = pipeline.process(event_id, later).await.unwrap();
        assert_eq!(status, ProcessingStatus::Retrying);
        let event = pipeline.event(tenant, event_id).await.unwrap();
        assert_eq!(event.retry_after, Some(later + Duration::minutes(10)));

        // Third attempt succeeds and clears the error detail.
        let status = pipeline
            .process(event_id, later + Duration::minutes(10))
            .await
            .unwrap();
        assert_eq!(status, ProcessingStatus::Processed);
        let event = pipeline.event(tenant, event_id).await.unwrap();
        assert!(event.error_details.is_none());
        assert!(event.retry_after.is_none());
    }

    #[tokio::test]
    async fn test_attempt_budget_exhaustion_is_terminal() {
        let pipeline = pipeline(2);
        pipeline
            .register_handler("github", Arc::new(FlakyHandler::new(u32::MAX)))
            .await;
        let tenant = Uuid::new_v4();
        let now = Utc::now();

        let IngestOutcome::Accepted { event_id } = pipeline
            .ingest(tenant, Uuid::new_v4(), inbound("evt-1"), now)
            .await
            .unwrap()
        else {
            panic!("expected acceptance");
        };

        assert_eq!(
            pipeline.process(event_id, now).await.unwrap(),
            ProcessingStatus::Retrying
        );
        assert_eq!(
            pipeline.process(event_id, now).await.unwrap(),
            ProcessingStatus::Failed
        );

        // Terminal: no further attempts are accepted.
        let err = pipeline.process(event_id, now).await.unwrap_err();
        assert!(matches!(err, MaestroError::InvalidTransition { .. }));
        let event = pipeline.event(tenant, event_id).await.unwrap();
        assert!(event.error_details.is_some());
        assert_eq!(event.processing_attempts, 2);
    }

    #[tokio::test]
    async fn test_missing_handler_counts_as_failure() {
        let pipeline = pipeline(1);
        let tenant = Uuid::new_v4();
        let now = Utc::now();

        let IngestOutcome::Accepted { event_id } = pipeline
            .ingest(tenant, Uuid::new_v4(), inbound("evt-1"), now)
            .await
            .unwrap()
        else {
            panic!("expected acceptance");
        };

        assert_eq!(
            pipeline.process(event_id, now).await.unwrap(),
            ProcessingStatus::Failed
        );
        let event = pipeline.event(tenant, event_id).await.unwrap();
        assert!(event
            .error_details
            .as_deref()
            .unwrap()
            .contains("no handler"));
    }

    #[tokio::test]
    async fn test_sweep_reprocesses_only_due_events() {
        let pipeline = pipeline(3);
        pipeline
            .register_handler("github", Arc::new(FlakyHandler::new(1)))
            .await;
        let tenant = Uuid::new_v4();
        let now = Utc::now();

        let IngestOutcome::Accepted { event_id } = pipeline
            .ingest(tenant, Uuid::new_v4(), inbound("evt-1"), now)
            .await
            .unwrap()
        else {
            panic!("expected acceptance");
        };
        pipeline.process(event_id, now).await.unwrap();

        // Backoff not yet elapsed: nothing due.
        assert!(pipeline.sweep_due(now + Duration::minutes(1)).await.is_empty());

        let due = pipeline.sweep_due(now + Duration::minutes(5)).await;
        assert_eq!(due, vec![event_id]);
        let event = pipeline.event(tenant, event_id).await.unwrap();
        assert_eq!(event.processing_status, ProcessingStatus::Processed);
    }

    #[tokio::test]
    async fn test_rate_limited_ingest_emits_notification() {
        let notifications = Arc::new(NotificationSink::new());
        let pipeline = EventIngestionPipeline::new(
            3,
            Duration::minutes(5),
            Arc::new(RateLimiter::new(1, Duration::seconds(60))),
            notifications.clone(),
        );
        let tenant = Uuid::new_v4();
        let integration = Uuid::new_v4();
        let now = Utc::now();

        pipeline
            .ingest(tenant, integration, inbound("evt-1"), now)
            .await
            .unwrap();
        let err = pipeline
            .ingest(tenant, integration, inbound("evt-2"), now)
            .await
            .unwrap_err();
        assert!(matches!(err, MaestroError::RateLimitExceeded { .. }));

        let drained = notifications.drain().await;
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].kind, NotificationKind::RateLimitBreached);
        // The rejected event was never recorded.
        assert_eq!(pipeline.event_count().await, 1);
    }
}
