use chrono::{DateTime, Utc};
use maestro_core::{AncestorRecord, MaestroError, MaestroResult, Task, TaskStatus};
use std::collections::{HashMap, HashSet};
use tracing::error;
use uuid::Uuid;

/// Hard ceiling on ancestor-chain length. Exceeding it signals a corrupted
/// or cyclic parent chain that escaped validation.
pub const DEFAULT_MAX_DEPTH: u32 = 50;

/// Task store with a materialized ancestor closure.
///
/// Holds every task of every tenant plus one [`AncestorRecord`] per
/// (task, ancestor) pair. The store itself is not synchronized; the
/// composing engine wraps it in a lock and holds that lock across each
/// check-then-act method, which makes reparenting and the status hook
/// atomic with respect to concurrent callers.
pub struct TaskStore {
    max_depth: u32,
    tasks: HashMap<Uuid, Task>,
    ancestors: HashMap<Uuid, Vec<AncestorRecord>>,
}

impl TaskStore {
    /// Creates an empty store with the given depth ceiling.
    pub fn new(max_depth: u32) -> Self {
        Self {
            max_depth,
            tasks: HashMap::new(),
            ancestors: HashMap::new(),
        }
    }

    /// Inserts a task, materializing its ancestor chain.
    ///
    /// The parent, when set, must already exist and belong to the same
    /// tenant.
    pub fn insert(&mut self, task: Task) -> MaestroResult<Uuid> {
        if let Some(parent_id) = task.parent_id {
            let parent = self
                .tasks
                .get(&parent_id)
                .filter(|p| p.tenant_id == task.tenant_id)
                .ok_or_else(|| MaestroError::NotFound(format!("parent task {parent_id}")))?;

            // The new chain is the parent's chain plus one hop.
            if self.chain_len(parent.id) + 1 > self.max_depth {
                return Err(MaestroError::HierarchyTooDeep {
                    task_id: task.id,
                    depth: self.max_depth,
                });
            }
        }

        let id = task.id;
        self.tasks.insert(id, task);
        self.rebuild(id)?;
        Ok(id)
    }

    /// Returns the task if it exists and belongs to the tenant.
    pub fn get(&self, tenant_id: Uuid, task_id: Uuid) -> MaestroResult<&Task> {
        self.tasks
            .get(&task_id)
            .filter(|t| t.tenant_id == tenant_id)
            .ok_or_else(|| MaestroError::NotFound(format!("task {task_id}")))
    }

    /// Total number of tasks across all tenants.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the store holds no tasks.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Moves a task under a new parent (or to the root with `None`).
    ///
    /// Rejects self-parenting and any reparent that would revisit the task
    /// from the new parent's own ancestor chain. On success the
    /// materialized ancestor set is rebuilt for the task and, transitively,
    /// for every existing descendant. The operation is all-or-nothing: the
    /// depth ceiling is validated for the deepest affected descendant
    /// before anything is written.
    pub fn set_parent(
        &mut self,
        tenant_id: Uuid,
        task_id: Uuid,
        new_parent_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> MaestroResult<()> {
        self.get(tenant_id, task_id)?;

        if let Some(parent_id) = new_parent_id {
            if parent_id == task_id {
                return Err(MaestroError::CircularDependency {
                    dependent_id: task_id,
                    dependency_id: parent_id,
                });
            }
            self.get(tenant_id, parent_id)?;

            // Following the new parent's chain upward must not revisit the
            // task being moved.
            let mut current = Some(parent_id);
            let mut hops = 0u32;
            while let Some(ancestor_id) = current {
                if ancestor_id == task_id {
                    return Err(MaestroError::CircularDependency {
                        dependent_id: task_id,
                        dependency_id: parent_id,
                    });
                }
                if hops >= self.max_depth {
                    error!(
                        task_id = %task_id,
                        parent_id = %parent_id,
                        "ancestor walk exceeded depth ceiling; parent chain is corrupted"
                    );
                    return Err(MaestroError::HierarchyTooDeep {
                        task_id: parent_id,
                        depth: self.max_depth,
                    });
                }
                current = self.tasks.get(&ancestor_id).and_then(|t| t.parent_id);
                hops += 1;
            }

            // Validate the ceiling for the deepest descendant before any
            // write, so a failure never partially commits.
            let prefix_len = self.chain_len(parent_id) + 1;
            let deepest_below = self
                .descendants_of(task_id)
                .iter()
                .map(|(_, depth)| depth + 1)
                .max()
                .unwrap_or(0);
            if prefix_len + deepest_below > self.max_depth {
                return Err(MaestroError::HierarchyTooDeep {
                    task_id,
                    depth: self.max_depth,
                });
            }
        }

        let descendants: Vec<Uuid> = self
            .descendants_of(task_id)
            .into_iter()
            .map(|(id, _)| id)
            .collect();

        if let Some(task) = self.tasks.get_mut(&task_id) {
            task.parent_id = new_parent_id;
            task.updated_at = now;
        }

        self.rebuild(task_id)?;
        for descendant in descendants {
            self.rebuild(descendant)?;
        }
        Ok(())
    }

    /// Rebuilds the materialized ancestor set for one task by walking its
    /// parent-pointer chain upward, recording one `(task, ancestor, depth)`
    /// row per hop (direct parent = depth 0).
    pub fn rebuild(&mut self, task_id: Uuid) -> MaestroResult<()> {
        let records = self.walk_chain(task_id)?;
        self.ancestors.insert(task_id, records);
        Ok(())
    }

    fn walk_chain(&self, task_id: Uuid) -> MaestroResult<Vec<AncestorRecord>> {
        let mut records = Vec::new();
        let mut seen: HashSet<Uuid> = HashSet::new();
        let mut current = self.tasks.get(&task_id).and_then(|t| t.parent_id);
        let mut depth = 0u32;

        while let Some(ancestor_id) = current {
            if depth >= self.max_depth || !seen.insert(ancestor_id) {
                error!(
                    task_id = %task_id,
                    depth,
                    "ancestor walk exceeded depth ceiling; parent chain is corrupted"
                );
                return Err(MaestroError::HierarchyTooDeep {
                    task_id,
                    depth: self.max_depth,
                });
            }
            records.push(AncestorRecord {
                task_id,
                ancestor_id,
                depth,
            });
            current = self.tasks.get(&ancestor_id).and_then(|t| t.parent_id);
            depth += 1;
        }
        Ok(records)
    }

    /// Number of ancestors on the task's chain.
    fn chain_len(&self, task_id: Uuid) -> u32 {
        self.ancestors
            .get(&task_id)
            .map(|records| records.len() as u32)
            .unwrap_or(0)
    }

    /// The materialized ancestor records of a task, nearest first.
    pub fn ancestors_of(&self, task_id: Uuid) -> &[AncestorRecord] {
        self.ancestors
            .get(&task_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Every task whose ancestor chain passes through the given task,
    /// with its hop distance (direct child = 0).
    pub fn descendants_of(&self, task_id: Uuid) -> Vec<(Uuid, u32)> {
        self.ancestors
            .values()
            .flatten()
            .filter(|r| r.ancestor_id == task_id)
            .map(|r| (r.task_id, r.depth))
            .collect()
    }

    /// Transitions a task's status and runs the post-transition hook:
    /// the parent's progress is recomputed from its direct children.
    ///
    /// Returns the parent id whose progress was rolled up, if any.
    pub fn set_status(
        &mut self,
        tenant_id: Uuid,
        task_id: Uuid,
        status: TaskStatus,
        now: DateTime<Utc>,
    ) -> MaestroResult<Option<Uuid>> {
        let task = self
            .tasks
            .get_mut(&task_id)
            .filter(|t| t.tenant_id == tenant_id)
            .ok_or_else(|| MaestroError::NotFound(format!("task {task_id}")))?;

        if task.status.is_terminal() && status != task.status {
            return Err(MaestroError::InvalidTransition {
                from: task.status.to_string(),
                to: status.to_string(),
            });
        }

        task.status = status;
        task.updated_at = now;
        if status == TaskStatus::Done {
            task.progress_percentage = 100;
        }

        let parent_id = task.parent_id;
        if let Some(parent_id) = parent_id {
            self.roll_up_progress(parent_id, now);
        }
        Ok(parent_id)
    }

    /// Sets a task's progress percentage, clamped to 100.
    pub fn set_progress(
        &mut self,
        tenant_id: Uuid,
        task_id: Uuid,
        progress: u8,
        now: DateTime<Utc>,
    ) -> MaestroResult<()> {
        let task = self
            .tasks
            .get_mut(&task_id)
            .filter(|t| t.tenant_id == tenant_id)
            .ok_or_else(|| MaestroError::NotFound(format!("task {task_id}")))?;
        task.progress_percentage = progress.min(100);
        task.updated_at = now;
        Ok(())
    }

    /// Recomputes a parent's progress as the share of its direct children
    /// in `Done`, excluding cancelled children from the denominator.
    fn roll_up_progress(&mut self, parent_id: Uuid, now: DateTime<Utc>) {
        let (done, counted) = self
            .tasks
            .values()
            .filter(|t| t.parent_id == Some(parent_id))
            .filter(|t| t.status != TaskStatus::Cancelled)
            .fold((0u32, 0u32), |(done, counted), t| {
                let is_done = (t.status == TaskStatus::Done) as u32;
                (done + is_done, counted + 1)
            });

        if counted == 0 {
            return;
        }
        if let Some(parent) = self.tasks.get_mut(&parent_id) {
            parent.progress_percentage = ((done * 100) / counted) as u8;
            parent.updated_at = now;
        }
    }

    /// Removes a task, reattaching its direct children to the removed
    /// task's parent and rebuilding their chains.
    pub fn remove(
        &mut self,
        tenant_id: Uuid,
        task_id: Uuid,
        now: DateTime<Utc>,
    ) -> MaestroResult<Task> {
        self.get(tenant_id, task_id)?;

        let children: Vec<Uuid> = self
            .tasks
            .values()
            .filter(|t| t.parent_id == Some(task_id))
            .map(|t| t.id)
            .collect();

        let removed = self
            .tasks
            .remove(&task_id)
            .ok_or_else(|| MaestroError::NotFound(format!("task {task_id}")))?;
        self.ancestors.remove(&task_id);

        for child in children {
            if let Some(task) = self.tasks.get_mut(&child) {
                task.parent_id = removed.parent_id;
                task.updated_at = now;
            }
            let below: Vec<Uuid> = self
                .descendants_of(child)
                .into_iter()
                .map(|(id, _)| id)
                .collect();
            self.rebuild(child)?;
            for descendant in below {
                self.rebuild(descendant)?;
            }
        }
        Ok(removed)
    }
}

impl Default for TaskStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DEPTH)
    }
}
