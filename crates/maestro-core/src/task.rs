use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a task in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Captured but not yet planned.
    Backlog,
    /// Planned and waiting to be picked up.
    Todo,
    /// Actively being worked on.
    InProgress,
    /// Work finished, awaiting review.
    InReview,
    /// Completed successfully.
    Done,
    /// Abandoned; excluded from progress accounting.
    Cancelled,
    /// Waiting on an unresolved dependency.
    Blocked,
}

impl TaskStatus {
    /// Whether no further transition is defined from this status.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Backlog => "backlog",
            TaskStatus::Todo => "todo",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::InReview => "in_review",
            TaskStatus::Done => "done",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Blocked => "blocked",
        };
        write!(f, "{s}")
    }
}

/// Priority of a task, used for ordering within agent queues.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    /// Can wait indefinitely.
    Low,
    /// Normal scheduling order.
    #[default]
    Medium,
    /// Scheduled ahead of normal work.
    High,
    /// Preempts everything else.
    Urgent,
}

/// A unit of work within a tenant's task hierarchy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier.
    pub id: Uuid,
    /// Owning tenant. Every operation takes the tenant explicitly; entities
    /// are invisible across tenants.
    pub tenant_id: Uuid,
    /// Direct parent in the hierarchy, if any.
    pub parent_id: Option<Uuid>,
    /// Human-readable title.
    pub title: String,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Scheduling priority.
    pub priority: TaskPriority,
    /// Completion percentage in `[0, 100]`. For parents this is rolled up
    /// from direct children on every child status change.
    pub progress_percentage: u8,
    /// UTC timestamp of creation.
    pub created_at: DateTime<Utc>,
    /// UTC timestamp of the last mutation.
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Creates a new backlog task for the given tenant.
    pub fn new(tenant_id: Uuid, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            parent_id: None,
            title: title.into(),
            status: TaskStatus::Backlog,
            priority: TaskPriority::default(),
            progress_percentage: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the parent task id.
    pub fn with_parent(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }
}

/// A materialized ancestor record: one row per (task, ancestor) pair.
///
/// `depth` is zero for the direct parent and grows by one per additional
/// hop toward the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AncestorRecord {
    /// The task whose chain this record belongs to.
    pub task_id: Uuid,
    /// One ancestor on the task's parent chain.
    pub ancestor_id: Uuid,
    /// Hop distance from the task: direct parent = 0.
    pub depth: u32,
}

/// Kind of a dependency edge between two tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// The dependent cannot start until the dependency completes.
    Blocks,
    /// Informational link with no scheduling effect.
    RelatesTo,
    /// The dependent duplicates the dependency.
    Duplicates,
}

/// A directed dependency edge: `dependent_id` depends on `dependency_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    /// The task that depends on the other.
    pub dependent_id: Uuid,
    /// The task being depended on.
    pub dependency_id: Uuid,
    /// Edge semantics.
    pub kind: DependencyKind,
    /// UTC timestamp of creation.
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_task_creation_defaults() {
        let tenant = Uuid::new_v4();
        let task = Task::new(tenant, "Ship the release");
        assert_eq!(task.status, TaskStatus::Backlog);
        assert_eq!(task.priority, TaskPriority::Medium);
        assert_eq!(task.progress_percentage, 0);
        assert!(task.parent_id.is_none());
        assert_eq!(task.tenant_id, tenant);
    }

    #[test]
    fn test_task_builders() {
        let parent = Uuid::new_v4();
        let task = Task::new(Uuid::new_v4(), "Child")
            .with_parent(parent)
            .with_priority(TaskPriority::Urgent);
        assert_eq!(task.parent_id, Some(parent));
        assert_eq!(task.priority, TaskPriority::Urgent);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Done.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
        assert!(!TaskStatus::Blocked.is_terminal());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::Urgent > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Medium);
        assert!(TaskPriority::Medium > TaskPriority::Low);
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
        let parsed: TaskStatus = serde_json::from_str("\"in_review\"").unwrap();
        assert_eq!(parsed, TaskStatus::InReview);
    }
}
