use chrono::{DateTime, Duration, Utc};
use maestro_core::{
    Agent, AgentTask, AgentTaskStatus, ExecutionOutcome, MaestroError, MaestroResult,
};
use std::collections::HashMap;
use tracing::{info, warn};
use uuid::Uuid;

/// What happened to an agent task that reported a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskDisposition {
    /// The task is queued again for another attempt.
    Requeued {
        /// The failure count so far.
        attempt: u32,
    },
    /// The retry budget is exhausted; the task failed terminally.
    Exhausted,
}

/// Assigns queued work to capacity-limited agents.
///
/// The capacity check and the enqueue are one method executed under the
/// composing engine's lock, so concurrent enqueue calls cannot overshoot
/// `max_concurrent_tasks`. The external execution engine is invoked by the
/// composer with no scheduler lock held; its result is fed back through
/// [`AgentScheduler::complete_task`] / [`AgentScheduler::fail_task`].
pub struct AgentScheduler {
    stats_window: Duration,
    agents: HashMap<Uuid, Agent>,
    tasks: HashMap<Uuid, AgentTask>,
}

impl AgentScheduler {
    /// Creates a scheduler that computes statistics over the given
    /// trailing window.
    pub fn new(stats_window: Duration) -> Self {
        Self {
            stats_window,
            agents: HashMap::new(),
            tasks: HashMap::new(),
        }
    }

    /// Registers an agent. `max_concurrent_tasks` must be positive.
    pub fn register_agent(&mut self, agent: Agent) -> MaestroResult<Uuid> {
        if agent.max_concurrent_tasks == 0 {
            return Err(MaestroError::Config(format!(
                "agent '{}' must allow at least one concurrent task",
                agent.agent_type
            )));
        }
        let id = agent.id;
        info!(agent_id = %id, agent_type = %agent.agent_type, "agent registered");
        self.agents.insert(id, agent);
        Ok(id)
    }

    /// Returns the agent if it exists and belongs to the tenant.
    pub fn agent(&self, tenant_id: Uuid, agent_id: Uuid) -> MaestroResult<&Agent> {
        self.agents
            .get(&agent_id)
            .filter(|a| a.tenant_id == tenant_id)
            .ok_or_else(|| MaestroError::NotFound(format!("agent {agent_id}")))
    }

    /// Activates or deactivates an agent.
    pub fn set_active(&mut self, tenant_id: Uuid, agent_id: Uuid, active: bool) -> MaestroResult<()> {
        let agent = self
            .agents
            .get_mut(&agent_id)
            .filter(|a| a.tenant_id == tenant_id)
            .ok_or_else(|| MaestroError::NotFound(format!("agent {agent_id}")))?;
        agent.active = active;
        Ok(())
    }

    /// Queued + running tasks currently counted against an agent.
    pub fn active_load(&self, agent_id: Uuid) -> usize {
        self.tasks
            .values()
            .filter(|t| t.agent_id == agent_id && t.counts_against_capacity())
            .count()
    }

    /// Accepts a task for an agent unless its capacity is exhausted.
    pub fn enqueue(
        &mut self,
        tenant_id: Uuid,
        task: AgentTask,
        now: DateTime<Utc>,
    ) -> MaestroResult<Uuid> {
        let agent = self
            .agents
            .get(&task.agent_id)
            .filter(|a| a.tenant_id == tenant_id)
            .ok_or_else(|| MaestroError::NotFound(format!("agent {}", task.agent_id)))?;

        let load = self.active_load(agent.id);
        if load >= agent.max_concurrent_tasks as usize {
            return Err(MaestroError::CapacityExceeded(format!(
                "agent {} at {load}/{} concurrent tasks",
                agent.id, agent.max_concurrent_tasks
            )));
        }

        let mut task = task;
        task.queued_at = now;
        let id = task.id;
        self.tasks.insert(id, task);
        Ok(id)
    }

    /// Picks the best matching agent for a request.
    ///
    /// Filters to active agents of the type that hold every required
    /// capability enabled and have spare capacity, then ranks by success
    /// rate descending with mean completion time ascending as the
    /// tie-break. Agents with no recorded completion time rank after
    /// measured ones among equal success rates.
    pub fn select_best_agent(
        &self,
        tenant_id: Uuid,
        task_type: &str,
        required_capabilities: &[String],
    ) -> MaestroResult<Uuid> {
        let mut candidates: Vec<&Agent> = self
            .agents
            .values()
            .filter(|a| a.tenant_id == tenant_id && a.active && a.agent_type == task_type)
            .filter(|a| required_capabilities.iter().all(|c| a.has_capability(c)))
            .filter(|a| self.active_load(a.id) < a.max_concurrent_tasks as usize)
            .collect();

        candidates.sort_by(|a, b| {
            b.success_rate
                .total_cmp(&a.success_rate)
                .then_with(|| {
                    let a_time = a.average_completion_secs.unwrap_or(i64::MAX);
                    let b_time = b.average_completion_secs.unwrap_or(i64::MAX);
                    a_time.cmp(&b_time)
                })
        });

        candidates
            .first()
            .map(|a| a.id)
            .ok_or_else(|| MaestroError::NoAgentAvailable {
                task_type: task_type.to_string(),
            })
    }

    /// Returns the task if it exists and its agent belongs to the tenant.
    pub fn task(&self, tenant_id: Uuid, task_id: Uuid) -> MaestroResult<&AgentTask> {
        self.tasks
            .get(&task_id)
            .filter(|t| {
                self.agents
                    .get(&t.agent_id)
                    .map(|a| a.tenant_id == tenant_id)
                    .unwrap_or(false)
            })
            .ok_or_else(|| MaestroError::NotFound(format!("agent task {task_id}")))
    }

    /// Moves a queued task to running.
    pub fn start_task(&mut self, task_id: Uuid, now: DateTime<Utc>) -> MaestroResult<()> {
        let task = self
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| MaestroError::NotFound(format!("agent task {task_id}")))?;
        if task.status != AgentTaskStatus::Queued {
            return Err(MaestroError::InvalidTransition {
                from: task.status.to_string(),
                to: AgentTaskStatus::Running.to_string(),
            });
        }
        task.status = AgentTaskStatus::Running;
        task.started_at = Some(now);
        Ok(())
    }

    /// Records a successful outcome and refreshes the agent's statistics.
    pub fn complete_task(
        &mut self,
        task_id: Uuid,
        outcome: ExecutionOutcome,
        now: DateTime<Utc>,
    ) -> MaestroResult<()> {
        let task = self
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| MaestroError::NotFound(format!("agent task {task_id}")))?;
        if task.status != AgentTaskStatus::Running {
            return Err(MaestroError::InvalidTransition {
                from: task.status.to_string(),
                to: AgentTaskStatus::Completed.to_string(),
            });
        }
        task.status = AgentTaskStatus::Completed;
        task.outcome = Some(outcome);
        task.error_details = None;
        if task.completed_at.is_none() {
            task.completed_at = Some(now);
        }
        let agent_id = task.agent_id;
        self.refresh_agent_stats(agent_id, now);
        Ok(())
    }

    /// Records a failure, incrementing the retry count atomically with the
    /// transition. Within budget the task re-queues; beyond it the task
    /// fails terminally and the agent's statistics are refreshed.
    pub fn fail_task(
        &mut self,
        task_id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> MaestroResult<TaskDisposition> {
        let task = self
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| MaestroError::NotFound(format!("agent task {task_id}")))?;
        if task.status != AgentTaskStatus::Running {
            return Err(MaestroError::InvalidTransition {
                from: task.status.to_string(),
                to: AgentTaskStatus::Failed.to_string(),
            });
        }

        task.retry_count += 1;
        task.error_details = Some(error.to_string());

        if task.retry_count <= task.max_retries {
            let attempt = task.retry_count;
            task.status = AgentTaskStatus::Queued;
            task.started_at = None;
            warn!(task_id = %task_id, attempt, "agent task failed, requeued");
            return Ok(TaskDisposition::Requeued { attempt });
        }

        task.status = AgentTaskStatus::Failed;
        if task.completed_at.is_none() {
            task.completed_at = Some(now);
        }
        let agent_id = task.agent_id;
        warn!(task_id = %task_id, agent_id = %agent_id, "agent task exhausted retries");
        self.refresh_agent_stats(agent_id, now);
        Ok(TaskDisposition::Exhausted)
    }

    /// Cancels a non-terminal task cooperatively; an in-flight result for
    /// it must be discarded by whoever holds it.
    pub fn cancel_task(&mut self, task_id: Uuid, now: DateTime<Utc>) -> MaestroResult<()> {
        let task = self
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| MaestroError::NotFound(format!("agent task {task_id}")))?;
        if task.status.is_terminal() {
            return Err(MaestroError::InvalidTransition {
                from: task.status.to_string(),
                to: AgentTaskStatus::Cancelled.to_string(),
            });
        }
        task.status = AgentTaskStatus::Cancelled;
        if task.completed_at.is_none() {
            task.completed_at = Some(now);
        }
        Ok(())
    }

    /// Watchdog transition: moves running tasks older than `max_age` to
    /// `timeout` and refreshes the affected agents' statistics.
    pub fn sweep_timeouts(&mut self, now: DateTime<Utc>, max_age: Duration) -> Vec<Uuid> {
        let mut timed_out = Vec::new();
        for task in self.tasks.values_mut() {
            if task.status != AgentTaskStatus::Running {
                continue;
            }
            let Some(started_at) = task.started_at else {
                continue;
            };
            if now - started_at < max_age {
                continue;
            }
            task.status = AgentTaskStatus::Timeout;
            if task.completed_at.is_none() {
                task.completed_at = Some(now);
            }
            warn!(task_id = %task.id, "agent task timed out");
            timed_out.push((task.id, task.agent_id));
        }
        let ids: Vec<Uuid> = timed_out.iter().map(|(id, _)| *id).collect();
        for (_, agent_id) in timed_out {
            self.refresh_agent_stats(agent_id, now);
        }
        ids
    }

    /// Recomputes an agent's trailing-window success rate and mean
    /// completion time, and stamps `last_used_at`.
    ///
    /// Cancellations count as neither success nor failure.
    fn refresh_agent_stats(&mut self, agent_id: Uuid, now: DateTime<Utc>) {
        let since = now - self.stats_window;
        let mut total = 0usize;
        let mut successes = 0usize;
        let mut durations: Vec<i64> = Vec::new();

        for task in self.tasks.values() {
            if task.agent_id != agent_id || !task.status.is_terminal() {
                continue;
            }
            if task.status == AgentTaskStatus::Cancelled {
                continue;
            }
            let Some(completed_at) = task.completed_at else {
                continue;
            };
            if completed_at < since {
                continue;
            }
            total += 1;
            if task.status == AgentTaskStatus::Completed {
                successes += 1;
                if let Some(duration) = task.duration_secs() {
                    durations.push(duration);
                }
            }
        }

        if let Some(agent) = self.agents.get_mut(&agent_id) {
            agent.success_rate = if total == 0 {
                0.0
            } else {
                successes as f64 / total as f64
            };
            agent.average_completion_secs = if durations.is_empty() {
                None
            } else {
                Some(durations.iter().sum::<i64>() / durations.len() as i64)
            };
            agent.last_used_at = Some(now);
        }
    }
}

impl Default for AgentScheduler {
    fn default() -> Self {
        Self::new(Duration::days(30))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use maestro_core::ExecutionRequest;
    use maestro_core::OutcomeStatus;

    fn request() -> ExecutionRequest {
        ExecutionRequest::new("code-review", "review the diff")
    }

    fn ok_outcome() -> ExecutionOutcome {
        ExecutionOutcome {
            status: OutcomeStatus::Completed,
            result: "looks good".into(),
            tokens_used: 100,
            cost_cents: 1,
        }
    }

    #[test]
    fn test_capacity_enforced_and_freed() {
        let tenant = Uuid::new_v4();
        let mut scheduler = AgentScheduler::default();
        let agent = scheduler
            .register_agent(Agent::new(tenant, "code-review", 2))
            .unwrap();
        let now = Utc::now();

        let first = scheduler
            .enqueue(tenant, AgentTask::new(agent, request(), now), now)
            .unwrap();
        scheduler
            .enqueue(tenant, AgentTask::new(agent, request(), now), now)
            .unwrap();

        // Third enqueue exceeds max_concurrent_tasks = 2.
        let err = scheduler
            .enqueue(tenant, AgentTask::new(agent, request(), now), now)
            .unwrap_err();
        assert!(matches!(err, MaestroError::CapacityExceeded(_)));

        // A terminal transition frees a slot.
        scheduler.start_task(first, now).unwrap();
        scheduler.complete_task(first, ok_outcome(), now).unwrap();
        scheduler
            .enqueue(tenant, AgentTask::new(agent, request(), now), now)
            .unwrap();
    }

    #[test]
    fn test_zero_capacity_rejected_at_registration() {
        let mut scheduler = AgentScheduler::default();
        let err = scheduler
            .register_agent(Agent::new(Uuid::new_v4(), "noop", 0))
            .unwrap_err();
        assert!(matches!(err, MaestroError::Config(_)));
    }

    #[test]
    fn test_selection_ranking() {
        let tenant = Uuid::new_v4();
        let mut scheduler = AgentScheduler::default();

        let mut slow = Agent::new(tenant, "code-review", 4).with_capability("rust");
        slow.success_rate = 0.9;
        slow.average_completion_secs = Some(300);
        let slow_id = scheduler.register_agent(slow).unwrap();

        let mut fast = Agent::new(tenant, "code-review", 4).with_capability("rust");
        fast.success_rate = 0.9;
        fast.average_completion_secs = Some(60);
        let fast_id = scheduler.register_agent(fast).unwrap();

        let mut unreliable = Agent::new(tenant, "code-review", 4).with_capability("rust");
        unreliable.success_rate = 0.5;
        unreliable.average_completion_secs = Some(10);
        scheduler.register_agent(unreliable).unwrap();

        // Equal success rate: faster mean completion wins the tie-break.
        let picked = scheduler
            .select_best_agent(tenant, "code-review", &["rust".into()])
            .unwrap();
        assert_eq!(picked, fast_id);

        // Fill the fast agent: selection falls to the next candidate.
        let now = Utc::now();
        for _ in 0..4 {
            scheduler
                .enqueue(tenant, AgentTask::new(fast_id, request(), now), now)
                .unwrap();
        }
        let picked = scheduler
            .select_best_agent(tenant, "code-review", &["rust".into()])
            .unwrap();
        assert_eq!(picked, slow_id);
    }

    #[test]
    fn test_selection_filters() {
        let tenant = Uuid::new_v4();
        let mut scheduler = AgentScheduler::default();

        let inactive_id = scheduler
            .register_agent(Agent::new(tenant, "code-review", 2).with_capability("rust"))
            .unwrap();
        scheduler.set_active(tenant, inactive_id, false).unwrap();

        scheduler
            .register_agent(Agent::new(tenant, "code-review", 2))
            .unwrap();
        scheduler
            .register_agent(Agent::new(tenant, "deploy", 2).with_capability("rust"))
            .unwrap();

        // Inactive, missing capability, and wrong type are all filtered out.
        let err = scheduler
            .select_best_agent(tenant, "code-review", &["rust".into()])
            .unwrap_err();
        assert!(matches!(err, MaestroError::NoAgentAvailable { .. }));
    }

    #[test]
    fn test_retry_budget() {
        let tenant = Uuid::new_v4();
        let mut scheduler = AgentScheduler::default();
        let agent = scheduler
            .register_agent(Agent::new(tenant, "code-review", 2))
            .unwrap();
        let now = Utc::now();

        let task = scheduler
            .enqueue(
                tenant,
                AgentTask::new(agent, request(), now).with_max_retries(1),
                now,
            )
            .unwrap();

        scheduler.start_task(task, now).unwrap();
        let disposition = scheduler.fail_task(task, "crash", now).unwrap();
        assert_eq!(disposition, TaskDisposition::Requeued { attempt: 1 });

        scheduler.start_task(task, now).unwrap();
        let disposition = scheduler.fail_task(task, "crash again", now).unwrap();
        assert_eq!(disposition, TaskDisposition::Exhausted);

        let stored = scheduler.task(tenant, task).unwrap();
        assert_eq!(stored.status, AgentTaskStatus::Failed);
        assert_eq!(stored.retry_count, 2);
    }

    #[test]
    fn test_completion_feedback_updates_stats() {
        let tenant = Uuid::new_v4();
        let mut scheduler = AgentScheduler::default();
        let agent = scheduler
            .register_agent(Agent::new(tenant, "code-review", 4))
            .unwrap();
        let start = Utc::now();

        let ok_task = scheduler
            .enqueue(tenant, AgentTask::new(agent, request(), start), start)
            .unwrap();
        scheduler.start_task(ok_task, start).unwrap();
        scheduler
            .complete_task(ok_task, ok_outcome(), start + Duration::seconds(30))
            .unwrap();

        let bad_task = scheduler
            .enqueue(
                tenant,
                AgentTask::new(agent, request(), start).with_max_retries(0),
                start,
            )
            .unwrap();
        scheduler.start_task(bad_task, start).unwrap();
        scheduler
            .fail_task(bad_task, "crash", start + Duration::seconds(10))
            .unwrap();

        let stored = scheduler.agent(tenant, agent).unwrap();
        assert!((stored.success_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(stored.average_completion_secs, Some(30));
        assert!(stored.last_used_at.is_some());
    }

    #[test]
    fn test_timeout_sweep() {
        let tenant = Uuid::new_v4();
        let mut scheduler = AgentScheduler::default();
        let agent = scheduler
            .register_agent(Agent::new(tenant, "code-review", 2))
            .unwrap();
        let start = Utc::now();

        let task = scheduler
            .enqueue(tenant, AgentTask::new(agent, request(), start), start)
            .unwrap();
        scheduler.start_task(task, start).unwrap();

        let swept =
            scheduler.sweep_timeouts(start + Duration::minutes(20), Duration::minutes(15));
        assert_eq!(swept, vec![task]);
        assert_eq!(
            scheduler.task(tenant, task).unwrap().status,
            AgentTaskStatus::Timeout
        );

        // The timed-out slot is free again.
        scheduler
            .enqueue(tenant, AgentTask::new(agent, request(), start), start)
            .unwrap();
    }

    #[test]
    fn test_cancelled_excluded_from_stats() {
        let tenant = Uuid::new_v4();
        let mut scheduler = AgentScheduler::default();
        let agent = scheduler
            .register_agent(Agent::new(tenant, "code-review", 4))
            .unwrap();
        let now = Utc::now();

        let cancelled = scheduler
            .enqueue(tenant, AgentTask::new(agent, request(), now), now)
            .unwrap();
        scheduler.cancel_task(cancelled, now).unwrap();

        let ok_task = scheduler
            .enqueue(tenant, AgentTask::new(agent, request(), now), now)
            .unwrap();
        scheduler.start_task(ok_task, now).unwrap();
        scheduler.complete_task(ok_task, ok_outcome(), now).unwrap();

        let stored = scheduler.agent(tenant, agent).unwrap();
        assert!((stored.success_rate - 1.0).abs() < f64::EPSILON);
    }
}
