use crate::agent::Agent;
use crate::escalation::Escalation;
use crate::project::Project;
use crate::task::Task;
use crate::team::{NegotiationMessage, Team};
use crate::FleetResult;
use async_trait::async_trait;
use uuid::Uuid;

/// Storage contract the scheduler runs against. The core never owns
/// durability; implementations live outside (tests and embedders get an
/// in-memory one from `taskfleet-backends`).
///
/// Versioned updates take the entity as read (its `version` field holding
/// the expected version), bump the version on success, and fail with
/// [`crate::FleetError::AssignmentConflict`] when another writer got there
/// first. Task ownership transfer rides entirely on `update_task`; there is
/// no global lock.
#[async_trait]
pub trait Repository: Send + Sync {
    // --- projects ---

    async fn insert_project(&self, project: Project) -> FleetResult<Project>;
    async fn project(&self, id: Uuid) -> FleetResult<Project>;
    async fn update_project(&self, project: Project) -> FleetResult<Project>;
    async fn projects(&self) -> FleetResult<Vec<Project>>;

    // --- tasks ---

    async fn insert_task(&self, task: Task) -> FleetResult<Task>;
    async fn task(&self, id: Uuid) -> FleetResult<Task>;
    /// Compare-and-swap update keyed on `task.version`.
    async fn update_task(&self, task: Task) -> FleetResult<Task>;
    async fn tasks_for_project(&self, project_id: Uuid) -> FleetResult<Vec<Task>>;
    /// All non-terminal tasks across every project, ordered by creation
    /// time so health scans and audit entries are stable.
    async fn active_tasks(&self) -> FleetResult<Vec<Task>>;

    // --- agents ---

    async fn insert_agent(&self, agent: Agent) -> FleetResult<Agent>;
    async fn agent(&self, id: Uuid) -> FleetResult<Agent>;
    /// Compare-and-swap update keyed on `agent.version`.
    async fn update_agent(&self, agent: Agent) -> FleetResult<Agent>;
    /// All non-disabled agents, ordered by creation time.
    async fn active_agents(&self) -> FleetResult<Vec<Agent>>;
    async fn agents(&self) -> FleetResult<Vec<Agent>>;

    // --- teams ---

    async fn insert_team(&self, team: Team) -> FleetResult<Team>;
    async fn team(&self, id: Uuid) -> FleetResult<Team>;
    /// Compare-and-swap update keyed on `team.version`.
    async fn update_team(&self, team: Team) -> FleetResult<Team>;
    async fn teams(&self) -> FleetResult<Vec<Team>>;

    // --- escalations ---

    /// Atomic upsert by trigger key. If an open escalation with the same
    /// key exists, its `last_seen_at` is refreshed and its severity raised
    /// to the max of old and new (never lowered); otherwise the candidate
    /// is inserted. Returns the stored record and whether it was newly
    /// opened.
    async fn upsert_escalation(&self, candidate: Escalation) -> FleetResult<(Escalation, bool)>;
    async fn escalation(&self, id: Uuid) -> FleetResult<Escalation>;
    async fn update_escalation(&self, escalation: Escalation) -> FleetResult<Escalation>;
    async fn open_escalation_by_key(&self, trigger_key: &str) -> FleetResult<Option<Escalation>>;
    async fn open_escalations(&self) -> FleetResult<Vec<Escalation>>;

    // --- negotiation log ---

    /// Append to a team's negotiation log. The log is append-only.
    async fn append_negotiation(&self, message: NegotiationMessage)
        -> FleetResult<NegotiationMessage>;
    /// A team's negotiation log in append order.
    async fn negotiation_log(&self, team_id: Uuid) -> FleetResult<Vec<NegotiationMessage>>;
}
