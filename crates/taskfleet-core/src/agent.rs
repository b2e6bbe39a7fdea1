use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Lifecycle status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Working,
    /// Degraded: reachable but misbehaving. Not delegated to.
    Error,
    /// Taken out of rotation, manually or by the dispatcher.
    Disabled,
}

/// Direction of an agent's score over the two most recent windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Improving,
    #[default]
    Stable,
    Declining,
}

/// Derived 0–100 performance scores. Recomputed after every completion or
/// failure and on the periodic cadence; never persisted as ground truth.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct AgentScore {
    pub success: f64,
    pub speed: f64,
    pub reliability: f64,
    pub confidence: f64,
    pub overall: f64,
    pub trend: Trend,
}

/// How many recent task outcomes feed the error-rate check.
pub const RECENT_OUTCOME_WINDOW: usize = 10;

/// Rolling performance counters for one agent.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentMetrics {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_reassigned: u64,
    /// Times a human overrode this agent's work.
    pub overrides: u64,
    pub total_completion_minutes: f64,
    /// Self-reported confidence, 0–100. Updated via heartbeat.
    pub confidence: f64,
    /// Last ten task outcomes, newest last. `true` means success.
    #[serde(default)]
    pub recent_outcomes: Vec<bool>,
    /// Rolling overall-score samples for trend detection, newest last.
    #[serde(default)]
    pub score_history: Vec<f64>,
    /// Skill keys of tasks this agent has completed, for the affinity bonus.
    #[serde(default)]
    pub completed_skill_keys: BTreeSet<String>,
}

impl AgentMetrics {
    pub fn record_completion(&mut self, minutes: f64, skill_key: &str) {
        self.tasks_completed += 1;
        self.total_completion_minutes += minutes.max(0.0);
        self.push_outcome(true);
        if !skill_key.is_empty() {
            self.completed_skill_keys.insert(skill_key.to_string());
        }
    }

    pub fn record_failure(&mut self) {
        self.tasks_failed += 1;
        self.push_outcome(false);
    }

    pub fn record_reassignment(&mut self) {
        self.tasks_reassigned += 1;
    }

    fn push_outcome(&mut self, success: bool) {
        self.recent_outcomes.push(success);
        let overflow = self.recent_outcomes.len().saturating_sub(RECENT_OUTCOME_WINDOW);
        if overflow > 0 {
            self.recent_outcomes.drain(..overflow);
        }
    }

    /// Average completion time, `None` with no completed history.
    pub fn avg_completion_minutes(&self) -> Option<f64> {
        if self.tasks_completed == 0 {
            None
        } else {
            Some(self.total_completion_minutes / self.tasks_completed as f64)
        }
    }

    /// Fraction of failures among the last ten outcomes.
    pub fn recent_error_rate(&self) -> f64 {
        if self.recent_outcomes.is_empty() {
            return 0.0;
        }
        let errors = self.recent_outcomes.iter().filter(|ok| !**ok).count();
        errors as f64 / self.recent_outcomes.len() as f64
    }

    /// Append an overall-score sample, keeping at most `cap` entries.
    pub fn push_score_sample(&mut self, score: f64, cap: usize) {
        self.score_history.push(score);
        let overflow = self.score_history.len().saturating_sub(cap);
        if overflow > 0 {
            self.score_history.drain(..overflow);
        }
    }
}

/// Payload of an agent heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HeartbeatReport {
    /// Memory utilization of the agent's runtime, 0.0–1.0.
    pub memory_utilization: Option<f64>,
    /// Self-reported confidence, 0–100.
    pub confidence: Option<f64>,
}

/// An autonomous worker that executes tasks and accrues a score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub name: String,
    pub role: String,
    pub status: AgentStatus,
    #[serde(default)]
    pub skill_tags: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Concurrency limit: tasks this agent may hold at once.
    pub max_concurrent_tasks: usize,
    #[serde(default)]
    pub current_tasks: Vec<Uuid>,
    pub last_heartbeat: DateTime<Utc>,
    /// Latest reported memory utilization, 0.0–1.0.
    #[serde(default)]
    pub memory_utilization: f64,
    pub metrics: AgentMetrics,
    pub score: AgentScore,
    pub team_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    /// Optimistic-concurrency version, bumped by the store on every write.
    #[serde(default)]
    pub version: u64,
}

impl Agent {
    pub fn new(name: impl Into<String>, role: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            role: role.into(),
            status: AgentStatus::Idle,
            skill_tags: Vec::new(),
            permissions: Vec::new(),
            max_concurrent_tasks: 3,
            current_tasks: Vec::new(),
            last_heartbeat: now,
            memory_utilization: 0.0,
            metrics: AgentMetrics::default(),
            score: AgentScore::default(),
            team_id: None,
            created_at: now,
            version: 0,
        }
    }

    pub fn with_skills(mut self, skills: Vec<String>) -> Self {
        self.skill_tags = skills;
        self
    }

    pub fn with_permissions(mut self, permissions: Vec<String>) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrent_tasks = limit.max(1);
        self
    }

    pub fn with_team(mut self, team_id: Uuid) -> Self {
        self.team_id = Some(team_id);
        self
    }

    /// Eligible for new work: not disabled, not degraded.
    pub fn is_available(&self) -> bool {
        matches!(self.status, AgentStatus::Idle | AgentStatus::Working)
    }

    pub fn has_capacity(&self) -> bool {
        self.current_tasks.len() < self.max_concurrent_tasks
    }

    pub fn has_skills(&self, required: &[String]) -> bool {
        required.iter().all(|s| self.skill_tags.contains(s))
    }

    pub fn has_permissions(&self, required: &[String]) -> bool {
        required.iter().all(|p| self.permissions.contains(p))
    }

    /// Fraction of the concurrency limit currently in use.
    pub fn workload(&self) -> f64 {
        if self.max_concurrent_tasks == 0 {
            return 1.0;
        }
        self.current_tasks.len() as f64 / self.max_concurrent_tasks as f64
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_creation() {
        let agent = Agent::new("atlas", "researcher");
        assert_eq!(agent.status, AgentStatus::Idle);
        assert!(agent.is_available());
        assert!(agent.has_capacity());
        assert_eq!(agent.max_concurrent_tasks, 3);
    }

    #[test]
    fn test_skill_and_permission_checks() {
        let agent = Agent::new("atlas", "researcher")
            .with_skills(vec!["rust".to_string(), "sql".to_string()])
            .with_permissions(vec!["read".to_string()]);
        assert!(agent.has_skills(&["rust".to_string()]));
        assert!(!agent.has_skills(&["go".to_string()]));
        assert!(agent.has_permissions(&["read".to_string()]));
        assert!(!agent.has_permissions(&["write".to_string()]));
        // Empty requirements always pass.
        assert!(agent.has_skills(&[]));
    }

    #[test]
    fn test_capacity_and_workload() {
        let mut agent = Agent::new("atlas", "worker").with_concurrency(2);
        assert_eq!(agent.workload(), 0.0);
        agent.current_tasks.push(Uuid::new_v4());
        assert!(agent.has_capacity());
        assert_eq!(agent.workload(), 0.5);
        agent.current_tasks.push(Uuid::new_v4());
        assert!(!agent.has_capacity());
        assert_eq!(agent.workload(), 1.0);
    }

    #[test]
    fn test_disabled_agent_unavailable() {
        let mut agent = Agent::new("atlas", "worker");
        agent.status = AgentStatus::Disabled;
        assert!(!agent.is_available());
        agent.status = AgentStatus::Error;
        assert!(!agent.is_available());
    }

    #[test]
    fn test_recent_outcomes_window() {
        let mut metrics = AgentMetrics::default();
        for _ in 0..12 {
            metrics.record_completion(10.0, "rust");
        }
        metrics.record_failure();
        assert_eq!(metrics.recent_outcomes.len(), RECENT_OUTCOME_WINDOW);
        assert!((metrics.recent_error_rate() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_avg_completion_minutes() {
        let mut metrics = AgentMetrics::default();
        assert!(metrics.avg_completion_minutes().is_none());
        metrics.record_completion(10.0, "a");
        metrics.record_completion(20.0, "b");
        assert!((metrics.avg_completion_minutes().unwrap() - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_score_history_cap() {
        let mut metrics = AgentMetrics::default();
        for i in 0..20 {
            metrics.push_score_sample(i as f64, 14);
        }
        assert_eq!(metrics.score_history.len(), 14);
        assert_eq!(metrics.score_history[0], 6.0);
    }

    #[test]
    fn test_affinity_keys_recorded() {
        let mut metrics = AgentMetrics::default();
        metrics.record_completion(5.0, "rust+sql");
        metrics.record_completion(5.0, "");
        assert!(metrics.completed_skill_keys.contains("rust+sql"));
        assert_eq!(metrics.completed_skill_keys.len(), 1);
    }
}
