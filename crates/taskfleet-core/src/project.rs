use crate::task::TaskPriority;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    Planning,
    Active,
    /// Suspended pending human input after a critical escalation.
    Paused,
    Completed,
    Cancelled,
}

/// Phase of the per-project orchestrator state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrchestratorPhase {
    Plan,
    Delegate,
    Monitor,
    Escalate,
    Reassign,
    Complete,
}

impl std::fmt::Display for OrchestratorPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrchestratorPhase::Plan => "plan",
            OrchestratorPhase::Delegate => "delegate",
            OrchestratorPhase::Monitor => "monitor",
            OrchestratorPhase::Escalate => "escalate",
            OrchestratorPhase::Reassign => "reassign",
            OrchestratorPhase::Complete => "complete",
        };
        write!(f, "{s}")
    }
}

/// One task in an incoming project request. Dependencies refer to other
/// specs by index within the same request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub skill_requirements: Vec<String>,
    #[serde(default)]
    pub required_permissions: Vec<String>,
    #[serde(default)]
    pub priority: TaskPriority,
    /// Overrides the configured default when set.
    #[serde(default)]
    pub timeout_minutes: Option<i64>,
    #[serde(default)]
    pub depends_on: Vec<usize>,
}

impl TaskSpec {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: None,
            skill_requirements: Vec::new(),
            required_permissions: Vec::new(),
            priority: TaskPriority::Normal,
            timeout_minutes: None,
            depends_on: Vec::new(),
        }
    }

    pub fn with_skills(mut self, skills: Vec<String>) -> Self {
        self.skill_requirements = skills;
        self
    }

    pub fn with_timeout(mut self, minutes: i64) -> Self {
        self.timeout_minutes = Some(minutes);
        self
    }

    pub fn depends_on(mut self, indices: Vec<usize>) -> Self {
        self.depends_on = indices;
        self
    }
}

/// An incoming request to orchestrate a body of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub initial_request: Option<String>,
    #[serde(default)]
    pub tech_stack: Vec<String>,
    pub tasks: Vec<TaskSpec>,
}

impl ProjectRequest {
    pub fn new(name: impl Into<String>, tasks: Vec<TaskSpec>) -> Self {
        Self {
            name: name.into(),
            description: None,
            initial_request: None,
            tech_stack: Vec::new(),
            tasks,
        }
    }
}

/// A top-level unit of orchestrated work containing a task graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub initial_request: Option<String>,
    #[serde(default)]
    pub tech_stack: Vec<String>,
    pub status: ProjectStatus,
    pub phase: OrchestratorPhase,
    #[serde(default)]
    pub task_ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Optimistic-concurrency version, bumped by the store on every write.
    #[serde(default)]
    pub version: u64,
}

impl Project {
    pub fn new(request: &ProjectRequest) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: request.name.clone(),
            description: request.description.clone(),
            initial_request: request.initial_request.clone(),
            tech_stack: request.tech_stack.clone(),
            status: ProjectStatus::Planning,
            phase: OrchestratorPhase::Plan,
            task_ids: Vec::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
            version: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            ProjectStatus::Completed | ProjectStatus::Cancelled
        )
    }
}

/// Summary record produced when a project completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSummary {
    pub project_id: Uuid,
    pub name: String,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub cancelled_tasks: usize,
    pub failed_tasks: usize,
    pub duration_minutes: f64,
    pub generated_at: DateTime<Utc>,
}
