use crate::delegation::DelegationEngine;
use crate::dispatch::{ActionDispatcher, ExecutionTracker};
use crate::escalation::EscalationManager;
use crate::health::{HealthMonitor, HealthReport};
use crate::orchestrator::{DelegationReport, Orchestrator};
use crate::team::{NegotiationOutcome, TeamCoordinator};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use taskfleet_core::{
    Agent, AgentStatus, AuditEvent, AuditSink, Escalation, EscalationKind, ExecutionBackend,
    FleetConfig, FleetError, FleetResult, Handoff, HandoffPayload, HeartbeatReport,
    NegotiationMessage, Notifier, Project, ProjectRequest, ProjectStatus, Repository, SignalSource,
    Task, TaskOutcome, TaskStatus, Team, VoteChoice,
};
use tracing::{info, warn};
use uuid::Uuid;

/// Point-in-time counts across the fleet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetStatus {
    pub timestamp: DateTime<Utc>,
    pub tasks_by_status: HashMap<String, usize>,
    pub active_tasks: usize,
    pub agents_by_status: HashMap<String, usize>,
    pub working_agents: usize,
    pub active_agents: usize,
    pub open_escalations: usize,
}

/// One entry in the summary's top-performer ranking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopPerformer {
    pub name: String,
    pub role: String,
    pub score: f64,
    pub tasks_completed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSummary {
    pub total: usize,
    pub top_performers: Vec<TopPerformer>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskTotals {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub success_rate: f64,
}

/// The periodic fleet performance summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetSummary {
    pub generated_at: DateTime<Utc>,
    pub agents: AgentSummary,
    pub tasks: TaskTotals,
}

/// The facade external layers call into. Owns every engine and wires the
/// collaborators through them; one instance serves any number of projects.
pub struct FleetService {
    config: Arc<FleetConfig>,
    repo: Arc<dyn Repository>,
    executor: Arc<dyn ExecutionBackend>,
    audit: Arc<dyn AuditSink>,
    delegation: Arc<DelegationEngine>,
    escalations: Arc<EscalationManager>,
    orchestrator: Orchestrator,
    monitor: HealthMonitor,
    dispatcher: ActionDispatcher,
    teams: TeamCoordinator,
    tracker: Arc<ExecutionTracker>,
}

impl FleetService {
    /// Build a service over the given collaborators. Validates the
    /// configuration; an invalid weight vector fails here, before any
    /// component sees it.
    pub fn new(
        config: FleetConfig,
        repo: Arc<dyn Repository>,
        executor: Arc<dyn ExecutionBackend>,
        notifier: Arc<dyn Notifier>,
        audit: Arc<dyn AuditSink>,
    ) -> FleetResult<Self> {
        Self::with_signal_sources(config, repo, executor, notifier, audit, Vec::new())
    }

    /// Like [`FleetService::new`], with external signal sources for the
    /// health monitor. The source list is explicit; nothing registers
    /// itself as a side effect.
    pub fn with_signal_sources(
        config: FleetConfig,
        repo: Arc<dyn Repository>,
        executor: Arc<dyn ExecutionBackend>,
        notifier: Arc<dyn Notifier>,
        audit: Arc<dyn AuditSink>,
        sources: Vec<Arc<dyn SignalSource>>,
    ) -> FleetResult<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let delegation = Arc::new(DelegationEngine::new(Arc::clone(&repo), Arc::clone(&config)));
        let escalations = Arc::new(EscalationManager::new(
            Arc::clone(&repo),
            Arc::clone(&config),
            Arc::clone(&notifier),
            Arc::clone(&audit),
        ));
        let tracker = Arc::new(ExecutionTracker::new());

        let orchestrator = Orchestrator::new(
            Arc::clone(&repo),
            Arc::clone(&config),
            Arc::clone(&delegation),
            Arc::clone(&escalations),
            Arc::clone(&audit),
        );
        let monitor = HealthMonitor::new(Arc::clone(&repo), Arc::clone(&config), sources);
        let dispatcher = ActionDispatcher::new(
            Arc::clone(&repo),
            Arc::clone(&delegation),
            Arc::clone(&escalations),
            Arc::clone(&executor),
            Arc::clone(&tracker),
            Arc::clone(&notifier),
            Arc::clone(&audit),
        );
        let teams = TeamCoordinator::new(
            Arc::clone(&repo),
            Arc::clone(&config),
            Arc::clone(&delegation),
            Arc::clone(&escalations),
            Arc::clone(&notifier),
            Arc::clone(&audit),
        );

        Ok(Self {
            config,
            repo,
            executor,
            audit,
            delegation,
            escalations,
            orchestrator,
            monitor,
            dispatcher,
            teams,
            tracker,
        })
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn teams(&self) -> &TeamCoordinator {
        &self.teams
    }

    pub fn escalations(&self) -> &EscalationManager {
        &self.escalations
    }

    // --- registration ---

    pub async fn register_agent(&self, agent: Agent) -> FleetResult<Agent> {
        let agent = self.repo.insert_agent(agent).await?;
        info!(agent_id = %agent.id, name = %agent.name, "agent registered");
        Ok(agent)
    }

    pub async fn register_team(&self, team: Team) -> FleetResult<Team> {
        let team = self.repo.insert_team(team).await?;
        info!(team_id = %team.id, name = %team.name, "team registered");
        Ok(team)
    }

    // --- project lifecycle ---

    /// Create a project: PLAN the task graph, then run the first DELEGATE
    /// pass and launch whatever got assigned.
    pub async fn create_project(&self, request: ProjectRequest) -> FleetResult<Project> {
        let project = self.orchestrator.plan(&request).await?;
        self.run_delegate_pass(project.id).await?;
        self.repo.project(project.id).await
    }

    /// Re-run DELEGATE for a project, e.g. after new agents joined.
    pub async fn delegate_project(&self, project_id: Uuid) -> FleetResult<DelegationReport> {
        self.run_delegate_pass(project_id).await
    }

    /// Human-initiated reassignment of one task.
    pub async fn reassign_task(&self, task_id: Uuid) -> FleetResult<Task> {
        let task = self.repo.task(task_id).await?;
        let requeued = self.orchestrator.reassign(task.project_id, task_id).await?;
        self.launch_assigned(task.project_id).await;
        Ok(requeued)
    }

    /// Progress report from the execution collaborator. Reports against a
    /// terminal task are discarded: late output from a cancelled execution
    /// must not resurrect it.
    pub async fn report_task_progress(
        &self,
        task_id: Uuid,
        percent: u8,
        message: &str,
    ) -> FleetResult<()> {
        for _ in 0..5 {
            let mut task = self.repo.task(task_id).await?;
            if task.status.is_terminal() {
                info!(task_id = %task_id, "progress report for terminal task discarded");
                return Ok(());
            }
            task.progress_percent = percent.min(100);
            if task.status == TaskStatus::Assigned {
                task.status = TaskStatus::InProgress;
                task.started_at.get_or_insert_with(Utc::now);
            }
            task.touch();
            match self.repo.update_task(task).await {
                Ok(_) => {
                    self.record_audit(
                        "task_progress",
                        task_id,
                        serde_json::json!({"percent": percent, "message": message}),
                    )
                    .await;
                    return Ok(());
                }
                Err(FleetError::AssignmentConflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(FleetError::AssignmentConflict(format!(
            "task {task_id} contested while recording progress"
        )))
    }

    /// Terminal result from the execution collaborator.
    ///
    /// Completion updates the agent's metrics and score, unlocks
    /// dependents with a fresh DELEGATE pass, and closes the project once
    /// everything is terminal. Failure spends a retry through REASSIGN.
    /// Results for already-terminal tasks are discarded.
    pub async fn report_task_result(&self, task_id: Uuid, outcome: TaskOutcome) -> FleetResult<()> {
        let task = self.repo.task(task_id).await?;
        if task.status.is_terminal() {
            info!(task_id = %task_id, "result for terminal task discarded");
            return Ok(());
        }
        self.tracker.take(task_id).await;

        match outcome {
            TaskOutcome::Completed { output } => {
                let completed = self.mark_task_completed(task_id, &output).await?;
                if let Some(agent_id) = completed.assigned_agent {
                    self.credit_completion(agent_id, &completed).await;
                }
                self.record_audit(
                    "task_completed",
                    task_id,
                    serde_json::json!({"project_id": completed.project_id}),
                )
                .await;

                // Dependents may have become ready.
                self.run_delegate_pass(completed.project_id).await?;
                self.orchestrator.try_complete(completed.project_id).await?;
            }
            TaskOutcome::Failed { error } => {
                warn!(task_id = %task_id, %error, "task execution failed");
                if let Some(agent_id) = task.assigned_agent {
                    self.debit_failure(agent_id).await;
                }
                self.record_audit(
                    "task_failed",
                    task_id,
                    serde_json::json!({"error": error}),
                )
                .await;

                // A failure spends a retry; exhaustion escalates inside.
                match self.orchestrator.reassign(task.project_id, task_id).await {
                    Ok(_) => self.launch_assigned(task.project_id).await,
                    Err(FleetError::RetryExhausted(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    /// Heartbeat from an agent. A degraded agent that resumes heartbeating
    /// comes back into rotation, and its silent-agent escalation closes.
    pub async fn agent_heartbeat(
        &self,
        agent_id: Uuid,
        report: HeartbeatReport,
    ) -> FleetResult<()> {
        for _ in 0..5 {
            let mut agent = self.repo.agent(agent_id).await?;
            agent.last_heartbeat = Utc::now();
            if let Some(memory) = report.memory_utilization {
                agent.memory_utilization = memory.clamp(0.0, 1.0);
            }
            if let Some(confidence) = report.confidence {
                agent.metrics.confidence = confidence.clamp(0.0, 100.0);
            }
            let recovered = agent.status == AgentStatus::Error;
            if recovered {
                agent.status = if agent.current_tasks.is_empty() {
                    AgentStatus::Idle
                } else {
                    AgentStatus::Working
                };
            }
            agent.score = self.delegation.scoring().compute(&agent.metrics);
            match self.repo.update_agent(agent).await {
                Ok(_) => {
                    if recovered {
                        info!(agent_id = %agent_id, "agent recovered after heartbeat");
                        self.escalations
                            .auto_resolve_key(
                                &format!("{}:{agent_id}", EscalationKind::AgentSilent),
                                "agent resumed heartbeating",
                            )
                            .await?;
                    }
                    return Ok(());
                }
                Err(FleetError::AssignmentConflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(FleetError::AssignmentConflict(format!(
            "agent {agent_id} contested while recording heartbeat"
        )))
    }

    // --- health ---

    /// One full health cycle: scan, dispatch in stable order, expire stale
    /// negotiations, sweep cleared escalations. Safe to call from an
    /// external timer or from [`crate::scheduler::HeartbeatScheduler`].
    pub async fn run_health_cycle(&self) -> HealthReport {
        let report = self.monitor.run_cycle().await;
        self.dispatcher.dispatch(&report.events).await;

        // Dispatch may have requeued and re-delegated tasks; get their
        // executions going.
        match self.repo.projects().await {
            Ok(projects) => {
                for project in projects {
                    if !project.is_terminal() {
                        self.launch_assigned(project.id).await;
                    }
                }
            }
            Err(e) => warn!(error = %e, "failed to list projects for launch"),
        }

        if let Err(e) = self.teams.expire_stale_negotiations().await {
            warn!(error = %e, "negotiation expiry failed");
        }
        if let Err(e) = self.escalations.sweep_cleared(&report.events).await {
            warn!(error = %e, "escalation sweep failed");
        }

        self.record_audit(
            "health_cycle",
            Uuid::nil(),
            serde_json::json!({
                "events": report.events.len(),
                "partial_failures": report.partial_failures,
                "duration_ms": report.duration_ms,
            }),
        )
        .await;
        report
    }

    // --- negotiation & teams ---

    pub async fn propose(
        &self,
        team_id: Uuid,
        proposer: Uuid,
        payload: serde_json::Value,
    ) -> FleetResult<NegotiationMessage> {
        self.teams.propose(team_id, proposer, payload).await
    }

    pub async fn vote(
        &self,
        team_id: Uuid,
        proposal_id: Uuid,
        voter: Uuid,
        choice: VoteChoice,
    ) -> FleetResult<NegotiationOutcome> {
        self.teams.vote(team_id, proposal_id, voter, choice).await
    }

    pub async fn counter(
        &self,
        team_id: Uuid,
        proposal_id: Uuid,
        member: Uuid,
        payload: serde_json::Value,
    ) -> FleetResult<NegotiationMessage> {
        self.teams.counter(team_id, proposal_id, member, payload).await
    }

    pub async fn confirm(
        &self,
        team_id: Uuid,
        proposal_id: Uuid,
        leader: Uuid,
        approve: bool,
    ) -> FleetResult<NegotiationOutcome> {
        self.teams.confirm(team_id, proposal_id, leader, approve).await
    }

    pub async fn request_crosstalk(&self, from_team: Uuid, to_team: Uuid) -> FleetResult<()> {
        self.teams.request_crosstalk(from_team, to_team).await
    }

    pub async fn request_handoff(
        &self,
        from_team: Uuid,
        to_team: Uuid,
        payload: HandoffPayload,
    ) -> FleetResult<Handoff> {
        self.teams.request_handoff(from_team, to_team, payload).await
    }

    pub async fn acknowledge_handoff(&self, handoff_id: Uuid) -> FleetResult<Handoff> {
        self.teams.acknowledge_handoff(handoff_id).await
    }

    // --- escalations ---

    /// Raise a project-level escalation through the orchestrator. A
    /// critical severity suspends the project pending human input.
    pub async fn escalate_project(
        &self,
        project_id: Uuid,
        kind: EscalationKind,
        severity: taskfleet_core::Severity,
        description: &str,
    ) -> FleetResult<()> {
        self.orchestrator
            .escalate(project_id, kind, severity, description)
            .await
    }

    /// Human resolution. Resolving the escalation that paused a project
    /// resumes it.
    pub async fn resolve_escalation(
        &self,
        escalation_id: Uuid,
        resolution: &str,
    ) -> FleetResult<Escalation> {
        let resolved = self.escalations.resolve(escalation_id, resolution).await?;
        if let Ok(mut project) = self.repo.project(resolved.subject_id).await {
            if project.status == ProjectStatus::Paused {
                project.status = ProjectStatus::Active;
                self.repo.update_project(project).await?;
                info!(project_id = %resolved.subject_id, "project resumed after resolution");
            }
        }
        Ok(resolved)
    }

    pub async fn open_escalations(&self) -> FleetResult<Vec<Escalation>> {
        self.repo.open_escalations().await
    }

    // --- reporting ---

    /// Point-in-time counts of tasks, agents, and open escalations.
    pub async fn fleet_status(&self) -> FleetResult<FleetStatus> {
        let mut tasks_by_status: HashMap<String, usize> = HashMap::new();
        let mut active_tasks = 0;
        for project in self.repo.projects().await? {
            for task in self.repo.tasks_for_project(project.id).await? {
                *tasks_by_status.entry(task.status.to_string()).or_default() += 1;
                if task.status.is_active() {
                    active_tasks += 1;
                }
            }
        }

        let mut agents_by_status: HashMap<String, usize> = HashMap::new();
        let mut working_agents = 0;
        let agents = self.repo.active_agents().await?;
        for agent in &agents {
            let key = match agent.status {
                AgentStatus::Idle => "idle",
                AgentStatus::Working => "working",
                AgentStatus::Error => "error",
                AgentStatus::Disabled => "disabled",
            };
            *agents_by_status.entry(key.to_string()).or_default() += 1;
            if agent.status == AgentStatus::Working {
                working_agents += 1;
            }
        }

        Ok(FleetStatus {
            timestamp: Utc::now(),
            tasks_by_status,
            active_tasks,
            agents_by_status,
            working_agents,
            active_agents: agents.len(),
            open_escalations: self.repo.open_escalations().await?.len(),
        })
    }

    /// The periodic performance summary: top performers by score and
    /// overall task totals.
    pub async fn fleet_summary(&self) -> FleetResult<FleetSummary> {
        let mut agents = self.repo.active_agents().await?;
        agents.sort_by(|a, b| {
            b.score
                .overall
                .partial_cmp(&a.score.overall)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let top_performers: Vec<TopPerformer> = agents
            .iter()
            .take(5)
            .map(|a| TopPerformer {
                name: a.name.clone(),
                role: a.role.clone(),
                score: a.score.overall,
                tasks_completed: a.metrics.tasks_completed,
            })
            .collect();

        let mut total = 0;
        let mut completed = 0;
        let mut failed = 0;
        for project in self.repo.projects().await? {
            for task in self.repo.tasks_for_project(project.id).await? {
                total += 1;
                match task.status {
                    TaskStatus::Completed => completed += 1,
                    TaskStatus::Failed => failed += 1,
                    _ => {}
                }
            }
        }
        let graded = completed + failed;
        let success_rate = if graded == 0 {
            0.0
        } else {
            (completed as f64 / graded as f64 * 100.0 * 10.0).round() / 10.0
        };

        let summary = FleetSummary {
            generated_at: Utc::now(),
            agents: AgentSummary {
                total: agents.len(),
                top_performers,
            },
            tasks: TaskTotals {
                total,
                completed,
                failed,
                success_rate,
            },
        };
        self.record_audit(
            "fleet_summary",
            Uuid::nil(),
            serde_json::to_value(&summary).unwrap_or_default(),
        )
        .await;
        Ok(summary)
    }

    // --- internals ---

    /// One DELEGATE pass plus execution launch for whatever was assigned.
    async fn run_delegate_pass(&self, project_id: Uuid) -> FleetResult<DelegationReport> {
        let report = self.orchestrator.delegate(project_id).await?;
        for task_id in &report.assigned {
            // Delegation succeeded, so any unassignable-task record closes.
            self.escalations
                .auto_resolve_key(
                    &format!("{}:{task_id}", EscalationKind::UnassignableTask),
                    "task assigned",
                )
                .await?;
        }
        self.launch_assigned(project_id).await;
        Ok(report)
    }

    /// Start execution for every assigned-but-not-started task of a
    /// project. A launch failure leaves the task assigned; the stalled
    /// check picks it up if the backend stays down.
    async fn launch_assigned(&self, project_id: Uuid) {
        let tasks = match self.repo.tasks_for_project(project_id).await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(project_id = %project_id, error = %e, "failed to list tasks for launch");
                return;
            }
        };
        for task in tasks {
            if task.status != TaskStatus::Assigned {
                continue;
            }
            match self.executor.start(&task).await {
                Ok(handle) => {
                    self.tracker.track(handle).await;
                    if let Err(e) = self.mark_task_started(task.id).await {
                        warn!(task_id = %task.id, error = %e, "failed to mark task started");
                    }
                }
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "execution launch failed");
                    self.record_audit(
                        "execution_launch_failed",
                        task.id,
                        serde_json::json!({"error": e.to_string()}),
                    )
                    .await;
                }
            }
        }
    }

    async fn mark_task_started(&self, task_id: Uuid) -> FleetResult<()> {
        for _ in 0..5 {
            let mut task = self.repo.task(task_id).await?;
            if task.status != TaskStatus::Assigned {
                return Ok(());
            }
            task.status = TaskStatus::InProgress;
            task.started_at = Some(Utc::now());
            task.touch();
            match self.repo.update_task(task).await {
                Ok(_) => return Ok(()),
                Err(FleetError::AssignmentConflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(FleetError::AssignmentConflict(format!(
            "task {task_id} contested while starting"
        )))
    }

    async fn mark_task_completed(&self, task_id: Uuid, output: &str) -> FleetResult<Task> {
        for _ in 0..5 {
            let mut task = self.repo.task(task_id).await?;
            if task.status.is_terminal() {
                return Ok(task);
            }
            task.status = TaskStatus::Completed;
            task.output = Some(output.to_string());
            task.progress_percent = 100;
            task.completed_at = Some(Utc::now());
            task.touch();
            match self.repo.update_task(task).await {
                Ok(stored) => return Ok(stored),
                Err(FleetError::AssignmentConflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(FleetError::AssignmentConflict(format!(
            "task {task_id} contested while completing"
        )))
    }

    /// Record a completion against the agent: metrics, score, trend sample.
    async fn credit_completion(&self, agent_id: Uuid, task: &Task) {
        let minutes = task
            .started_at
            .map(|s| (Utc::now() - s).num_seconds() as f64 / 60.0)
            .unwrap_or(0.0);
        let skill_key = task.skill_key();
        for _ in 0..5 {
            let Ok(mut agent) = self.repo.agent(agent_id).await else {
                return;
            };
            agent.current_tasks.retain(|t| *t != task.id);
            agent.metrics.record_completion(minutes, &skill_key);
            let score = self.delegation.scoring().compute(&agent.metrics);
            agent
                .metrics
                .push_score_sample(score.overall, self.config.trend_window * 2);
            agent.score = self.delegation.scoring().compute(&agent.metrics);
            if agent.current_tasks.is_empty() && agent.status == AgentStatus::Working {
                agent.status = AgentStatus::Idle;
            }
            match self.repo.update_agent(agent).await {
                Ok(_) => return,
                Err(FleetError::AssignmentConflict(_)) => continue,
                Err(e) => {
                    warn!(agent_id = %agent_id, error = %e, "failed to credit completion");
                    return;
                }
            }
        }
    }

    async fn debit_failure(&self, agent_id: Uuid) {
        for _ in 0..5 {
            let Ok(mut agent) = self.repo.agent(agent_id).await else {
                return;
            };
            agent.metrics.record_failure();
            let score = self.delegation.scoring().compute(&agent.metrics);
            agent
                .metrics
                .push_score_sample(score.overall, self.config.trend_window * 2);
            agent.score = self.delegation.scoring().compute(&agent.metrics);
            match self.repo.update_agent(agent).await {
                Ok(_) => return,
                Err(FleetError::AssignmentConflict(_)) => continue,
                Err(e) => {
                    warn!(agent_id = %agent_id, error = %e, "failed to debit failure");
                    return;
                }
            }
        }
    }

    async fn record_audit(&self, action: &str, subject: Uuid, details: serde_json::Value) {
        let event = AuditEvent::new(action, Some(subject), details);
        if let Err(e) = self.audit.record(event).await {
            warn!(error = %e, "audit write failed");
        }
    }
}
