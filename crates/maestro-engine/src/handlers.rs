use crate::ingest::EventHandler;
use crate::tasks::TaskStore;
use async_trait::async_trait;
use maestro_core::{MaestroError, MaestroResult, Task, TaskPriority, WebhookEvent};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

/// Built-in handler for the `tasks` event source: creates a task in the
/// event's tenant from the event payload.
///
/// Expected payload:
///
/// ```json
/// { "title": "Fix the build", "priority": "high", "parentId": "…" }
/// ```
///
/// `priority` and `parentId` are optional.
pub struct TaskEventHandler {
    tasks: Arc<RwLock<TaskStore>>,
}

impl TaskEventHandler {
    /// Creates a handler writing into the given task store.
    pub fn new(tasks: Arc<RwLock<TaskStore>>) -> Self {
        Self { tasks }
    }
}

#[async_trait]
impl EventHandler for TaskEventHandler {
    async fn handle(&self, event: &WebhookEvent) -> MaestroResult<()> {
        let title = event
            .payload
            .get("title")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                MaestroError::Config("task event payload is missing 'title'".to_string())
            })?;

        let priority = match event.payload.get("priority") {
            Some(value) => serde_json::from_value::<TaskPriority>(value.clone())?,
            None => TaskPriority::default(),
        };

        let parent_id = event
            .payload
            .get("parentId")
            .and_then(|v| v.as_str())
            .map(|s| {
                Uuid::parse_str(s)
                    .map_err(|e| MaestroError::Config(format!("invalid parentId: {e}")))
            })
            .transpose()?;

        let mut task = Task::new(event.tenant_id, title).with_priority(priority);
        if let Some(parent_id) = parent_id {
            task = task.with_parent(parent_id);
        }

        let task_id = {
            let mut tasks = self.tasks.write().await;
            tasks.insert(task)?
        };
        info!(event_id = %event.id, task_id = %task_id, "task created from event");
        Ok(())
    }
}
