use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use taskfleet_core::{
    Agent, AgentStatus, Escalation, FleetError, FleetResult, NegotiationMessage, Project,
    Repository, Task, Team,
};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct StoreInner {
    projects: HashMap<Uuid, Project>,
    tasks: HashMap<Uuid, Task>,
    agents: HashMap<Uuid, Agent>,
    teams: HashMap<Uuid, Team>,
    escalations: HashMap<Uuid, Escalation>,
    negotiations: Vec<NegotiationMessage>,
}

/// In-memory repository used by tests and single-process embedders.
///
/// All operations take one lock, so the versioned updates and the
/// escalation upsert are atomic. Version checks mirror what a database
/// implementation would do with a conditional update.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<StoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(entity: &str, id: Uuid) -> FleetError {
    FleetError::NotFound(format!("{entity} {id}"))
}

fn version_conflict(entity: &str, id: Uuid, expected: u64, actual: u64) -> FleetError {
    FleetError::AssignmentConflict(format!(
        "{entity} {id}: expected version {expected}, found {actual}"
    ))
}

#[async_trait]
impl Repository for MemoryStore {
    async fn insert_project(&self, mut project: Project) -> FleetResult<Project> {
        let mut inner = self.inner.write().await;
        project.version = 1;
        inner.projects.insert(project.id, project.clone());
        Ok(project)
    }

    async fn project(&self, id: Uuid) -> FleetResult<Project> {
        let inner = self.inner.read().await;
        inner
            .projects
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("project", id))
    }

    async fn update_project(&self, mut project: Project) -> FleetResult<Project> {
        let mut inner = self.inner.write().await;
        let current = inner
            .projects
            .get(&project.id)
            .ok_or_else(|| not_found("project", project.id))?;
        if current.version != project.version {
            return Err(version_conflict(
                "project",
                project.id,
                project.version,
                current.version,
            ));
        }
        project.version += 1;
        project.updated_at = Utc::now();
        inner.projects.insert(project.id, project.clone());
        Ok(project)
    }

    async fn projects(&self) -> FleetResult<Vec<Project>> {
        let inner = self.inner.read().await;
        let mut projects: Vec<Project> = inner.projects.values().cloned().collect();
        projects.sort_by_key(|p| p.created_at);
        Ok(projects)
    }

    async fn insert_task(&self, mut task: Task) -> FleetResult<Task> {
        let mut inner = self.inner.write().await;
        task.version = 1;
        inner.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn task(&self, id: Uuid) -> FleetResult<Task> {
        let inner = self.inner.read().await;
        inner
            .tasks
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("task", id))
    }

    async fn update_task(&self, mut task: Task) -> FleetResult<Task> {
        let mut inner = self.inner.write().await;
        let current = inner
            .tasks
            .get(&task.id)
            .ok_or_else(|| not_found("task", task.id))?;
        if current.version != task.version {
            return Err(version_conflict(
                "task",
                task.id,
                task.version,
                current.version,
            ));
        }
        task.version += 1;
        inner.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn tasks_for_project(&self, project_id: Uuid) -> FleetResult<Vec<Task>> {
        let inner = self.inner.read().await;
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| t.project_id == project_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    async fn active_tasks(&self) -> FleetResult<Vec<Task>> {
        let inner = self.inner.read().await;
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| t.status.is_active())
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    async fn insert_agent(&self, mut agent: Agent) -> FleetResult<Agent> {
        let mut inner = self.inner.write().await;
        agent.version = 1;
        inner.agents.insert(agent.id, agent.clone());
        Ok(agent)
    }

    async fn agent(&self, id: Uuid) -> FleetResult<Agent> {
        let inner = self.inner.read().await;
        inner
            .agents
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("agent", id))
    }

    async fn update_agent(&self, mut agent: Agent) -> FleetResult<Agent> {
        let mut inner = self.inner.write().await;
        let current = inner
            .agents
            .get(&agent.id)
            .ok_or_else(|| not_found("agent", agent.id))?;
        if current.version != agent.version {
            return Err(version_conflict(
                "agent",
                agent.id,
                agent.version,
                current.version,
            ));
        }
        agent.version += 1;
        inner.agents.insert(agent.id, agent.clone());
        Ok(agent)
    }

    async fn active_agents(&self) -> FleetResult<Vec<Agent>> {
        let inner = self.inner.read().await;
        let mut agents: Vec<Agent> = inner
            .agents
            .values()
            .filter(|a| a.status != AgentStatus::Disabled)
            .cloned()
            .collect();
        agents.sort_by_key(|a| a.created_at);
        Ok(agents)
    }

    async fn agents(&self) -> FleetResult<Vec<Agent>> {
        let inner = self.inner.read().await;
        let mut agents: Vec<Agent> = inner.agents.values().cloned().collect();
        agents.sort_by_key(|a| a.created_at);
        Ok(agents)
    }

    async fn insert_team(&self, mut team: Team) -> FleetResult<Team> {
        let mut inner = self.inner.write().await;
        team.version = 1;
        inner.teams.insert(team.id, team.clone());
        Ok(team)
    }

    async fn team(&self, id: Uuid) -> FleetResult<Team> {
        let inner = self.inner.read().await;
        inner
            .teams
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("team", id))
    }

    async fn update_team(&self, mut team: Team) -> FleetResult<Team> {
        let mut inner = self.inner.write().await;
        let current = inner
            .teams
            .get(&team.id)
            .ok_or_else(|| not_found("team", team.id))?;
        if current.version != team.version {
            return Err(version_conflict(
                "team",
                team.id,
                team.version,
                current.version,
            ));
        }
        team.version += 1;
        inner.teams.insert(team.id, team.clone());
        Ok(team)
    }

    async fn teams(&self) -> FleetResult<Vec<Team>> {
        let inner = self.inner.read().await;
        let mut teams: Vec<Team> = inner.teams.values().cloned().collect();
        teams.sort_by_key(|t| t.created_at);
        Ok(teams)
    }

    async fn upsert_escalation(&self, mut candidate: Escalation) -> FleetResult<(Escalation, bool)> {
        let mut inner = self.inner.write().await;
        let existing = inner
            .escalations
            .values()
            .find(|e| e.trigger_key == candidate.trigger_key && e.is_open())
            .cloned();
        match existing {
            Some(mut open) => {
                open.last_seen_at = Utc::now();
                // Severity is raised, never lowered, on refresh.
                open.severity = open.severity.max(candidate.severity);
                open.version += 1;
                inner.escalations.insert(open.id, open.clone());
                Ok((open, false))
            }
            None => {
                candidate.version = 1;
                inner.escalations.insert(candidate.id, candidate.clone());
                Ok((candidate, true))
            }
        }
    }

    async fn escalation(&self, id: Uuid) -> FleetResult<Escalation> {
        let inner = self.inner.read().await;
        inner
            .escalations
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("escalation", id))
    }

    async fn update_escalation(&self, mut escalation: Escalation) -> FleetResult<Escalation> {
        let mut inner = self.inner.write().await;
        if !inner.escalations.contains_key(&escalation.id) {
            return Err(not_found("escalation", escalation.id));
        }
        escalation.version += 1;
        inner.escalations.insert(escalation.id, escalation.clone());
        Ok(escalation)
    }

    async fn open_escalation_by_key(&self, trigger_key: &str) -> FleetResult<Option<Escalation>> {
        let inner = self.inner.read().await;
        Ok(inner
            .escalations
            .values()
            .find(|e| e.trigger_key == trigger_key && e.is_open())
            .cloned())
    }

    async fn open_escalations(&self) -> FleetResult<Vec<Escalation>> {
        let inner = self.inner.read().await;
        let mut open: Vec<Escalation> = inner
            .escalations
            .values()
            .filter(|e| e.is_open())
            .cloned()
            .collect();
        open.sort_by_key(|e| e.created_at);
        Ok(open)
    }

    async fn append_negotiation(
        &self,
        message: NegotiationMessage,
    ) -> FleetResult<NegotiationMessage> {
        let mut inner = self.inner.write().await;
        inner.negotiations.push(message.clone());
        Ok(message)
    }

    async fn negotiation_log(&self, team_id: Uuid) -> FleetResult<Vec<NegotiationMessage>> {
        let inner = self.inner.read().await;
        Ok(inner
            .negotiations
            .iter()
            .filter(|m| m.team_id == team_id)
            .cloned()
            .collect())
    }
}
