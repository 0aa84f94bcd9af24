use chrono::{DateTime, Utc};
use maestro_core::{NotificationKind, NotificationRecord};
use tokio::sync::Mutex;
use tracing::debug;

/// Collects notification records for an external delivery service.
///
/// The core only produces records; delivery (email, Slack, webhook) is a
/// downstream concern that drains this sink.
#[derive(Default)]
pub struct NotificationSink {
    records: Mutex<Vec<NotificationRecord>>,
}

impl NotificationSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a record for the given trigger.
    pub async fn emit(
        &self,
        kind: NotificationKind,
        target_config: serde_json::Value,
        triggered_at: DateTime<Utc>,
    ) {
        debug!(?kind, "notification recorded");
        let mut records = self.records.lock().await;
        records.push(NotificationRecord {
            kind,
            target_config,
            triggered_at,
        });
    }

    /// Takes every pending record, leaving the sink empty.
    pub async fn drain(&self) -> Vec<NotificationRecord> {
        let mut records = self.records.lock().await;
        std::mem::take(&mut *records)
    }

    /// Number of records waiting to be drained.
    pub async fn pending_count(&self) -> usize {
        self.records.lock().await.len()
    }
}
