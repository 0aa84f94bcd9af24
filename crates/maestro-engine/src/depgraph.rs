use chrono::{DateTime, Utc};
use maestro_core::{DependencyEdge, DependencyKind, MaestroError, MaestroResult};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::warn;
use uuid::Uuid;

/// Traversal ceiling for the cycle check. The BFS stops expanding past this
/// depth rather than failing; only hierarchy walks treat the ceiling as a
/// hard error.
pub const DEFAULT_TRAVERSAL_CEILING: u32 = 50;

/// Directed dependency edges between tasks with cycle prevention.
///
/// Edges are keyed by the dependent: `edges[x]` lists everything `x`
/// depends on. Like [`crate::tasks::TaskStore`], the graph is synchronized
/// by the composing engine, which holds one lock across each
/// check-then-insert call.
pub struct DependencyGraph {
    ceiling: u32,
    edges: HashMap<Uuid, Vec<DependencyEdge>>,
}

impl DependencyGraph {
    /// Creates an empty graph with the given traversal ceiling.
    pub fn new(ceiling: u32) -> Self {
        Self {
            ceiling,
            edges: HashMap::new(),
        }
    }

    /// Inserts the edge `dependent -> dependency` unless it would close a
    /// cycle.
    ///
    /// The check is a forward BFS from `dependency` over existing edges
    /// ("what does this depend on, transitively") with a visited set; if
    /// `dependent` appears in the reachable set, the new edge would close a
    /// cycle and nothing is persisted. Re-inserting an existing
    /// (dependent, dependency) pair is a no-op.
    pub fn add_dependency(
        &mut self,
        dependent_id: Uuid,
        dependency_id: Uuid,
        kind: DependencyKind,
        now: DateTime<Utc>,
    ) -> MaestroResult<()> {
        if dependent_id == dependency_id {
            return Err(MaestroError::CircularDependency {
                dependent_id,
                dependency_id,
            });
        }

        if self
            .dependencies_of(dependent_id)
            .iter()
            .any(|e| e.dependency_id == dependency_id)
        {
            return Ok(());
        }

        if self.reaches(dependency_id, dependent_id) {
            return Err(MaestroError::CircularDependency {
                dependent_id,
                dependency_id,
            });
        }

        self.edges.entry(dependent_id).or_default().push(DependencyEdge {
            dependent_id,
            dependency_id,
            kind,
            created_at: now,
        });
        Ok(())
    }

    /// Whether `target` is in the transitive dependency set of `from`.
    fn reaches(&self, from: Uuid, target: Uuid) -> bool {
        let mut visited: HashSet<Uuid> = HashSet::new();
        let mut frontier: VecDeque<(Uuid, u32)> = VecDeque::new();
        frontier.push_back((from, 0));
        visited.insert(from);

        while let Some((node, depth)) = frontier.pop_front() {
            if node == target {
                return true;
            }
            if depth >= self.ceiling {
                warn!(
                    node = %node,
                    ceiling = self.ceiling,
                    "dependency traversal hit depth ceiling; not expanding further"
                );
                continue;
            }
            for edge in self.dependencies_of(node) {
                if visited.insert(edge.dependency_id) {
                    frontier.push_back((edge.dependency_id, depth + 1));
                }
            }
        }
        false
    }

    /// Edges where the given task is the dependent.
    pub fn dependencies_of(&self, task_id: Uuid) -> &[DependencyEdge] {
        self.edges.get(&task_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Tasks that depend on the given task.
    pub fn dependents_of(&self, task_id: Uuid) -> Vec<Uuid> {
        self.edges
            .values()
            .flatten()
            .filter(|e| e.dependency_id == task_id)
            .map(|e| e.dependent_id)
            .collect()
    }

    /// Drops every edge touching the task, from either endpoint.
    pub fn remove_task(&mut self, task_id: Uuid) {
        self.edges.remove(&task_id);
        for edges in self.edges.values_mut() {
            edges.retain(|e| e.dependency_id != task_id);
        }
        self.edges.retain(|_, edges| !edges.is_empty());
    }

    /// Total number of edges.
    pub fn edge_count(&self) -> usize {
        self.edges.values().map(Vec::len).sum()
    }
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new(DEFAULT_TRAVERSAL_CEILING)
    }
}
