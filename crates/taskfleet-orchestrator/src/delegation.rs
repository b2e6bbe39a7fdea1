use crate::scoring::ScoringEngine;
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use taskfleet_core::{
    Agent, AgentStatus, FleetConfig, FleetError, FleetResult, Repository, SelectionStrategy, Task,
    TaskStatus, Trend,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bonus for having completed a task with the identical skill requirements.
const AFFINITY_BONUS: f64 = 10.0;
/// Applied for an improving (+) or declining (-) score trend.
const TREND_ADJUSTMENT: f64 = 5.0;
/// Attempts against fresh state before a conflict is surfaced.
const CAS_ATTEMPTS: usize = 5;

/// The result of a successful hand-off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub task_id: Uuid,
    pub agent_id: Uuid,
    pub adjusted_score: f64,
}

/// Selects an agent for a ready task and performs the atomic hand-off.
///
/// Ownership transfer is the shared-mutable hot path: delegation, the
/// health monitor's reassign path, and human-initiated reassignment can
/// race on the same task, so every transfer is a compare-and-swap keyed on
/// the task's version. A conflict means another writer won; the loop
/// retries against fresh state.
pub struct DelegationEngine {
    repo: Arc<dyn Repository>,
    config: Arc<FleetConfig>,
    scoring: ScoringEngine,
}

impl DelegationEngine {
    pub fn new(repo: Arc<dyn Repository>, config: Arc<FleetConfig>) -> Self {
        let scoring = ScoringEngine::new(
            config.weights,
            config.benchmark_task_minutes,
            config.trend_window,
        );
        Self {
            repo,
            config,
            scoring,
        }
    }

    pub fn scoring(&self) -> &ScoringEngine {
        &self.scoring
    }

    /// Select the best eligible agent for a pending task and hand it off.
    ///
    /// Returns [`FleetError::NoEligibleAgent`] when nobody passes the
    /// candidate filter; the task stays pending and the caller retries on
    /// the next delegation pass.
    pub async fn delegate(&self, task_id: Uuid) -> FleetResult<Assignment> {
        for _ in 0..CAS_ATTEMPTS {
            let task = self.repo.task(task_id).await?;
            if task.status != TaskStatus::Pending {
                return Err(FleetError::AssignmentConflict(format!(
                    "task {task_id} is {}, not pending",
                    task.status
                )));
            }

            let candidates = self.eligible_candidates(&task).await?;
            if candidates.is_empty() {
                return Err(FleetError::NoEligibleAgent(format!(
                    "no candidate for task {task_id} (skills: {:?})",
                    task.skill_requirements
                )));
            }

            let ranked: Vec<(Agent, f64)> = candidates
                .into_iter()
                .map(|agent| {
                    let score = self.adjusted_score(&agent, &task);
                    (agent, score)
                })
                .collect();

            let chosen = match self.config.selection {
                SelectionStrategy::Deterministic => Self::pick_deterministic(&ranked),
                SelectionStrategy::Probabilistic => Self::pick_probabilistic(&ranked),
            };
            let Some((agent, adjusted)) = chosen else {
                return Err(FleetError::NoEligibleAgent(format!(
                    "ranking produced no candidate for task {task_id}"
                )));
            };

            match self.try_handoff(task, &agent).await {
                Ok(assignment) => {
                    info!(
                        task_id = %assignment.task_id,
                        agent_id = %assignment.agent_id,
                        score = adjusted,
                        "task delegated"
                    );
                    return Ok(Assignment {
                        adjusted_score: adjusted,
                        ..assignment
                    });
                }
                Err(FleetError::AssignmentConflict(reason)) => {
                    debug!(task_id = %task_id, %reason, "delegation conflict, retrying");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        Err(FleetError::AssignmentConflict(format!(
            "task {task_id} still contested after {CAS_ATTEMPTS} attempts"
        )))
    }

    /// Hand a pending task directly to a named agent, skipping ranking.
    /// Used by team handoffs; the same CAS rules apply.
    pub async fn assign_to(&self, task_id: Uuid, agent_id: Uuid) -> FleetResult<Assignment> {
        for _ in 0..CAS_ATTEMPTS {
            let task = self.repo.task(task_id).await?;
            if task.status != TaskStatus::Pending {
                return Err(FleetError::AssignmentConflict(format!(
                    "task {task_id} is {}, not pending",
                    task.status
                )));
            }
            let agent = self.repo.agent(agent_id).await?;
            if !agent.is_available() || !agent.has_capacity() {
                return Err(FleetError::NoEligibleAgent(format!(
                    "agent {agent_id} cannot take task {task_id}"
                )));
            }
            match self.try_handoff(task, &agent).await {
                Ok(assignment) => return Ok(assignment),
                Err(FleetError::AssignmentConflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(FleetError::AssignmentConflict(format!(
            "task {task_id} still contested after {CAS_ATTEMPTS} attempts"
        )))
    }

    /// Release a task from its current owner and requeue it as pending,
    /// spending one retry. The (max_retries + 1)-th attempt marks the task
    /// failed and returns [`FleetError::RetryExhausted`] instead.
    pub async fn reassign(&self, task_id: Uuid) -> FleetResult<Task> {
        for _ in 0..CAS_ATTEMPTS {
            let mut task = self.repo.task(task_id).await?;
            if task.status == TaskStatus::Completed {
                return Err(FleetError::Store(format!(
                    "task {task_id} already completed, nothing to reassign"
                )));
            }

            let released_agent = task.assigned_agent.take();
            task.retry_count += 1;

            if task.retry_count > task.max_retries {
                task.status = TaskStatus::Failed;
                task.error = Some(format!(
                    "retry budget exhausted after {} attempts",
                    task.max_retries
                ));
                task.completed_at = Some(Utc::now());
                task.touch();
                match self.repo.update_task(task).await {
                    Ok(failed) => {
                        if let Some(agent_id) = released_agent {
                            self.detach_task_from_agent(agent_id, task_id, true).await;
                        }
                        warn!(task_id = %task_id, "retry budget exhausted, task failed");
                        return Err(FleetError::RetryExhausted(format!(
                            "task {} failed after {} retries",
                            failed.id, failed.max_retries
                        )));
                    }
                    Err(FleetError::AssignmentConflict(_)) => continue,
                    Err(e) => return Err(e),
                }
            }

            task.status = TaskStatus::Pending;
            task.started_at = None;
            task.progress_percent = 0;
            task.touch();
            match self.repo.update_task(task).await {
                Ok(requeued) => {
                    if let Some(agent_id) = released_agent {
                        self.detach_task_from_agent(agent_id, task_id, true).await;
                    }
                    info!(
                        task_id = %task_id,
                        retry = requeued.retry_count,
                        "task released and requeued"
                    );
                    return Ok(requeued);
                }
                Err(FleetError::AssignmentConflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(FleetError::AssignmentConflict(format!(
            "task {task_id} still contested after {CAS_ATTEMPTS} attempts"
        )))
    }

    /// Candidate filter: available, skilled, permitted, with spare capacity.
    async fn eligible_candidates(&self, task: &Task) -> FleetResult<Vec<Agent>> {
        let agents = self.repo.active_agents().await?;
        Ok(agents
            .into_iter()
            .filter(|a| {
                a.is_available()
                    && a.has_capacity()
                    && a.has_skills(&task.skill_requirements)
                    && a.has_permissions(&task.required_permissions)
            })
            .collect())
    }

    /// Ranking: overall score, +10 affinity for identical prior work, a
    /// workload discount proportional to spare capacity, ±5 for trend.
    fn adjusted_score(&self, agent: &Agent, task: &Task) -> f64 {
        let score = self.scoring.compute(&agent.metrics);
        let mut adjusted = score.overall;
        if agent.metrics.completed_skill_keys.contains(&task.skill_key()) {
            adjusted += AFFINITY_BONUS;
        }
        adjusted *= 1.0 - agent.workload();
        match score.trend {
            Trend::Improving => adjusted += TREND_ADJUSTMENT,
            Trend::Declining => adjusted -= TREND_ADJUSTMENT,
            Trend::Stable => {}
        }
        adjusted
    }

    fn pick_deterministic(ranked: &[(Agent, f64)]) -> Option<(Agent, f64)> {
        ranked
            .iter()
            .max_by(|(a, sa), (b, sb)| {
                sa.partial_cmp(sb)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    // Ties break toward the earliest heartbeat, which is a
                    // total order, so selection stays reproducible.
                    .then_with(|| b.last_heartbeat.cmp(&a.last_heartbeat))
            })
            .map(|(a, s)| (a.clone(), *s))
    }

    fn pick_probabilistic(ranked: &[(Agent, f64)]) -> Option<(Agent, f64)> {
        // Shift weights to be strictly positive so zero-score agents keep
        // a sliver of probability.
        let weights: Vec<f64> = ranked.iter().map(|(_, s)| s.max(0.0) + 1.0).collect();
        let total: f64 = weights.iter().sum();
        if total <= 0.0 {
            return None;
        }
        let mut draw = rand::thread_rng().gen_range(0.0..total);
        for ((agent, score), weight) in ranked.iter().zip(&weights) {
            if draw < *weight {
                return Some((agent.clone(), *score));
            }
            draw -= weight;
        }
        ranked.last().map(|(a, s)| (a.clone(), *s))
    }

    /// The atomic hand-off: task `pending → assigned` keyed on the task's
    /// version, then the agent's current-task set. The task CAS is the
    /// linearization point; the agent append is commutative and retried
    /// independently.
    async fn try_handoff(&self, mut task: Task, agent: &Agent) -> FleetResult<Assignment> {
        let task_id = task.id;
        task.status = TaskStatus::Assigned;
        task.assigned_agent = Some(agent.id);
        task.touch();
        let stored = self.repo.update_task(task).await?;

        self.attach_task_to_agent(agent.id, task_id).await?;

        Ok(Assignment {
            task_id: stored.id,
            agent_id: agent.id,
            adjusted_score: 0.0,
        })
    }

    async fn attach_task_to_agent(&self, agent_id: Uuid, task_id: Uuid) -> FleetResult<()> {
        for _ in 0..CAS_ATTEMPTS {
            let mut agent = self.repo.agent(agent_id).await?;
            if !agent.current_tasks.contains(&task_id) {
                agent.current_tasks.push(task_id);
            }
            agent.status = AgentStatus::Working;
            match self.repo.update_agent(agent).await {
                Ok(_) => return Ok(()),
                Err(FleetError::AssignmentConflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(FleetError::AssignmentConflict(format!(
            "agent {agent_id} contested while attaching task {task_id}"
        )))
    }

    /// Remove a task from an agent's working set, optionally counting a
    /// reassignment against its reliability.
    pub async fn detach_task_from_agent(
        &self,
        agent_id: Uuid,
        task_id: Uuid,
        count_reassignment: bool,
    ) {
        for _ in 0..CAS_ATTEMPTS {
            let Ok(mut agent) = self.repo.agent(agent_id).await else {
                return;
            };
            agent.current_tasks.retain(|t| *t != task_id);
            if count_reassignment {
                agent.metrics.record_reassignment();
            }
            if agent.current_tasks.is_empty() && agent.status == AgentStatus::Working {
                agent.status = AgentStatus::Idle;
            }
            match self.repo.update_agent(agent).await {
                Ok(_) => return,
                Err(FleetError::AssignmentConflict(_)) => continue,
                Err(e) => {
                    warn!(agent_id = %agent_id, error = %e, "failed to detach task from agent");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Duration;
    use taskfleet_core::AgentMetrics;

    fn agent_with_score(name: &str, completed: u64, failed: u64) -> Agent {
        let mut agent = Agent::new(name, "worker");
        agent.metrics = AgentMetrics {
            tasks_completed: completed,
            tasks_failed: failed,
            total_completion_minutes: completed as f64 * 30.0,
            confidence: 50.0,
            ..AgentMetrics::default()
        };
        agent
    }

    #[test]
    fn test_deterministic_pick_highest_score() {
        let a = agent_with_score("a", 5, 5);
        let b = agent_with_score("b", 9, 1);
        let ranked = vec![(a, 50.0), (b.clone(), 90.0)];
        let (picked, score) = DelegationEngine::pick_deterministic(&ranked).unwrap();
        assert_eq!(picked.id, b.id);
        assert_eq!(score, 90.0);
    }

    #[test]
    fn test_deterministic_tie_breaks_on_earliest_heartbeat() {
        let mut older = agent_with_score("older", 5, 5);
        older.last_heartbeat = Utc::now() - Duration::minutes(10);
        let newer = agent_with_score("newer", 5, 5);
        let ranked = vec![(newer, 70.0), (older.clone(), 70.0)];
        let (picked, _) = DelegationEngine::pick_deterministic(&ranked).unwrap();
        assert_eq!(picked.id, older.id);
    }

    #[test]
    fn test_probabilistic_pick_returns_some() {
        let a = agent_with_score("a", 5, 5);
        let b = agent_with_score("b", 9, 1);
        let ranked = vec![(a, 0.0), (b, 90.0)];
        assert!(DelegationEngine::pick_probabilistic(&ranked).is_some());
    }
}
