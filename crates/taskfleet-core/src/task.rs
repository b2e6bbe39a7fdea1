use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a task in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    InProgress,
    Blocked,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Active statuses are scanned by the health monitor.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Scheduling priority. Higher priorities are delegated first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Result reported back by the execution collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum TaskOutcome {
    Completed { output: String },
    Failed { error: String },
}

/// A unit of work with dependencies and a single current owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub project_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    /// Skill tags an agent must hold to be eligible.
    #[serde(default)]
    pub skill_requirements: Vec<String>,
    /// Permissions an agent must hold to be eligible.
    #[serde(default)]
    pub required_permissions: Vec<String>,
    /// Tasks that must complete before this one becomes ready.
    #[serde(default)]
    pub dependencies: Vec<Uuid>,
    pub assigned_agent: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Wall-clock runtime budget before the task is force-cancelled.
    pub timeout_minutes: i64,
    pub max_retries: u32,
    pub retry_count: u32,
    /// Delegation passes that found no eligible candidate.
    #[serde(default)]
    pub delegation_attempts: u32,
    #[serde(default)]
    pub progress_percent: u8,
    pub output: Option<String>,
    pub error: Option<String>,
    /// Optimistic-concurrency version, bumped by the store on every write.
    #[serde(default)]
    pub version: u64,
}

impl Task {
    pub fn new(project_id: Uuid, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            project_id,
            title: title.into(),
            description: None,
            status: TaskStatus::Pending,
            priority: TaskPriority::Normal,
            skill_requirements: Vec::new(),
            required_permissions: Vec::new(),
            dependencies: Vec::new(),
            assigned_agent: None,
            created_at: now,
            started_at: None,
            last_updated: now,
            completed_at: None,
            timeout_minutes: 30,
            max_retries: 3,
            retry_count: 0,
            delegation_attempts: 0,
            progress_percent: 0,
            output: None,
            error: None,
            version: 0,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<Uuid>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_skills(mut self, skills: Vec<String>) -> Self {
        self.skill_requirements = skills;
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, minutes: i64) -> Self {
        self.timeout_minutes = minutes;
        self
    }

    /// A task is ready when it is pending and every dependency has
    /// completed.
    pub fn is_ready(&self, completed_ids: &[Uuid]) -> bool {
        self.status == TaskStatus::Pending
            && self
                .dependencies
                .iter()
                .all(|dep| completed_ids.contains(dep))
    }

    /// Canonical key over the skill requirements, used for the affinity
    /// bonus: an agent that completed a task with the identical key ranks
    /// higher for this one.
    pub fn skill_key(&self) -> String {
        let mut skills = self.skill_requirements.clone();
        skills.sort();
        skills.join("+")
    }

    /// Touch the update timestamp. Every mutation path calls this so the
    /// stalled check measures real inactivity.
    pub fn touch(&mut self) {
        self.last_updated = Utc::now();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_task_creation() {
        let project = Uuid::new_v4();
        let task = Task::new(project, "Index the corpus");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.project_id, project);
        assert!(task.assigned_agent.is_none());
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.version, 0);
    }

    #[test]
    fn test_is_ready_no_deps() {
        let task = Task::new(Uuid::new_v4(), "Standalone");
        assert!(task.is_ready(&[]));
    }

    #[test]
    fn test_is_ready_with_deps() {
        let dep = Uuid::new_v4();
        let task = Task::new(Uuid::new_v4(), "Dependent").with_dependencies(vec![dep]);
        assert!(!task.is_ready(&[]));
        assert!(task.is_ready(&[dep]));
    }

    #[test]
    fn test_not_ready_when_assigned() {
        let mut task = Task::new(Uuid::new_v4(), "Taken");
        task.status = TaskStatus::Assigned;
        assert!(!task.is_ready(&[]));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(TaskStatus::Blocked.is_active());
    }

    #[test]
    fn test_skill_key_is_order_independent() {
        let a = Task::new(Uuid::new_v4(), "A")
            .with_skills(vec!["rust".to_string(), "sql".to_string()]);
        let b = Task::new(Uuid::new_v4(), "B")
            .with_skills(vec!["sql".to_string(), "rust".to_string()]);
        assert_eq!(a.skill_key(), b.skill_key());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Normal);
        assert!(TaskPriority::Normal > TaskPriority::Low);
    }

    #[test]
    fn test_outcome_serialization() {
        let outcome = TaskOutcome::Failed {
            error: "sandbox crashed".to_string(),
        };
        let json = serde_json::to_string(&outcome).unwrap();
        assert!(json.contains("failed"));
        let parsed: TaskOutcome = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, outcome);
    }
}
