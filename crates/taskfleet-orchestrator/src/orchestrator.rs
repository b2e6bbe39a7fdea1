use crate::delegation::DelegationEngine;
use crate::escalation::EscalationManager;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use taskfleet_core::{
    AuditEvent, AuditSink, EscalationKind, FleetConfig, FleetError, FleetResult,
    OrchestratorPhase, Project, ProjectRequest, ProjectStatus, ProjectSummary, Repository,
    Severity, Task, TaskStatus,
};
use tracing::{info, warn};
use uuid::Uuid;

/// What one delegation pass achieved.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DelegationReport {
    pub assigned: Vec<Uuid>,
    /// Ready tasks that found no candidate this pass.
    pub unassignable: Vec<Uuid>,
}

/// The per-project state machine: PLAN → DELEGATE → MONITOR →
/// (ESCALATE | REASSIGN) → COMPLETE.
///
/// Instances are cheap and stateless between calls; the authoritative
/// phase lives on the stored [`Project`], so any number of projects
/// advance independently with no global lock. MONITOR is passive — the
/// orchestrator only moves when the dispatcher or the service calls back
/// into it.
pub struct Orchestrator {
    repo: Arc<dyn Repository>,
    config: Arc<FleetConfig>,
    delegation: Arc<DelegationEngine>,
    escalations: Arc<EscalationManager>,
    audit: Arc<dyn AuditSink>,
}

impl Orchestrator {
    pub fn new(
        repo: Arc<dyn Repository>,
        config: Arc<FleetConfig>,
        delegation: Arc<DelegationEngine>,
        escalations: Arc<EscalationManager>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            repo,
            config,
            delegation,
            escalations,
            audit,
        }
    }

    /// PLAN: decompose a request into the task graph.
    ///
    /// Fails with [`FleetError::Decomposition`] when the graph would be
    /// empty or cyclic; on success the project moves to DELEGATE.
    pub async fn plan(&self, request: &ProjectRequest) -> FleetResult<Project> {
        if request.tasks.is_empty() {
            return Err(FleetError::Decomposition(format!(
                "project '{}' decomposed into zero tasks",
                request.name
            )));
        }
        if let Some(bad) = request
            .tasks
            .iter()
            .flat_map(|t| &t.depends_on)
            .find(|i| **i >= request.tasks.len())
        {
            return Err(FleetError::Decomposition(format!(
                "dependency index {bad} out of range for {} tasks",
                request.tasks.len()
            )));
        }
        if Self::has_cycle(request) {
            return Err(FleetError::Decomposition(format!(
                "project '{}' has a cyclic task graph",
                request.name
            )));
        }

        let mut project = self.repo.insert_project(Project::new(request)).await?;

        // Materialize tasks, mapping index dependencies to real ids.
        let mut tasks: Vec<Task> = Vec::with_capacity(request.tasks.len());
        for spec in &request.tasks {
            let mut task = Task::new(project.id, spec.title.clone())
                .with_priority(spec.priority)
                .with_skills(spec.skill_requirements.clone())
                .with_timeout(
                    spec.timeout_minutes
                        .unwrap_or(self.config.task_timeout_minutes),
                );
            task.description = spec.description.clone();
            task.required_permissions = spec.required_permissions.clone();
            task.max_retries = self.config.max_retries;
            tasks.push(task);
        }
        let ids: Vec<Uuid> = tasks.iter().map(|t| t.id).collect();
        for (task, spec) in tasks.iter_mut().zip(&request.tasks) {
            task.dependencies = spec.depends_on.iter().map(|i| ids[*i]).collect();
        }
        for task in tasks {
            self.repo.insert_task(task).await?;
        }

        project.task_ids = ids;
        project.status = ProjectStatus::Active;
        project.phase = OrchestratorPhase::Delegate;
        let project = self.repo.update_project(project).await?;

        info!(
            project_id = %project.id,
            tasks = project.task_ids.len(),
            "project planned"
        );
        self.record_audit(
            "project_planned",
            project.id,
            serde_json::json!({"tasks": project.task_ids.len()}),
        )
        .await;

        Ok(project)
    }

    /// DELEGATE: hand every ready task to an agent.
    ///
    /// A task with no eligible candidate stays pending for the next pass;
    /// past the configured pass budget it raises an `unassignable_task`
    /// escalation. Moves to MONITOR once nothing more is immediately
    /// delegable.
    pub async fn delegate(&self, project_id: Uuid) -> FleetResult<DelegationReport> {
        self.set_phase(project_id, OrchestratorPhase::Delegate).await?;

        let mut report = DelegationReport::default();
        loop {
            let tasks = self.repo.tasks_for_project(project_id).await?;
            let completed: Vec<Uuid> = tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Completed)
                .map(|t| t.id)
                .collect();
            // Highest priority first; FIFO within a priority level.
            let mut ready: Vec<&Task> = tasks.iter().filter(|t| t.is_ready(&completed)).collect();
            ready.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));
            let ready: Vec<Uuid> = ready
                .iter()
                .filter(|t| !report.unassignable.contains(&t.id))
                .map(|t| t.id)
                .collect();

            if ready.is_empty() {
                break;
            }

            let mut progressed = false;
            for task_id in ready {
                match self.delegation.delegate(task_id).await {
                    Ok(assignment) => {
                        progressed = true;
                        report.assigned.push(assignment.task_id);
                    }
                    Err(FleetError::NoEligibleAgent(reason)) => {
                        report.unassignable.push(task_id);
                        self.note_unassignable(task_id, &reason).await?;
                    }
                    Err(FleetError::AssignmentConflict(reason)) => {
                        // Another delegator won this task; not ours anymore.
                        info!(task_id = %task_id, %reason, "task taken by a concurrent pass");
                    }
                    Err(e) => return Err(e),
                }
            }
            if !progressed {
                break;
            }
        }

        self.set_phase(project_id, OrchestratorPhase::Monitor).await?;
        info!(
            project_id = %project_id,
            assigned = report.assigned.len(),
            unassignable = report.unassignable.len(),
            "delegation pass complete"
        );
        Ok(report)
    }

    /// REASSIGN: release the task's owner and requeue it, then run a
    /// delegation pass for that task alone. Retry exhaustion raises an
    /// escalation and leaves the task failed.
    pub async fn reassign(&self, project_id: Uuid, task_id: Uuid) -> FleetResult<Task> {
        self.set_phase(project_id, OrchestratorPhase::Reassign).await?;

        let requeued = match self.delegation.reassign(task_id).await {
            Ok(task) => task,
            Err(FleetError::RetryExhausted(reason)) => {
                self.escalations
                    .raise(
                        EscalationKind::RetryExhausted,
                        task_id,
                        Severity::Critical,
                        reason.clone(),
                        Some("task failed permanently; needs human triage".into()),
                    )
                    .await?;
                self.set_phase(project_id, OrchestratorPhase::Monitor).await?;
                return Err(FleetError::RetryExhausted(reason));
            }
            Err(e) => {
                self.set_phase(project_id, OrchestratorPhase::Monitor).await?;
                return Err(e);
            }
        };

        // Back to DELEGATE for this task only; other tasks are untouched.
        self.set_phase(project_id, OrchestratorPhase::Delegate).await?;
        match self.delegation.delegate(task_id).await {
            Ok(_) => {}
            Err(FleetError::NoEligibleAgent(reason)) => {
                self.note_unassignable(task_id, &reason).await?;
            }
            Err(e) => warn!(task_id = %task_id, error = %e, "post-reassign delegation failed"),
        }
        self.set_phase(project_id, OrchestratorPhase::Monitor).await?;

        self.record_audit(
            "task_reassigned",
            task_id,
            serde_json::json!({"retry_count": requeued.retry_count}),
        )
        .await;
        Ok(requeued)
    }

    /// ESCALATE: raise or refresh an escalation for this project. A
    /// critical severity suspends the project pending human input; the
    /// phase stays MONITOR either way.
    pub async fn escalate(
        &self,
        project_id: Uuid,
        kind: EscalationKind,
        severity: Severity,
        description: &str,
    ) -> FleetResult<()> {
        self.set_phase(project_id, OrchestratorPhase::Escalate).await?;
        self.escalations
            .raise(kind, project_id, severity, description.to_string(), None)
            .await?;

        if severity == Severity::Critical {
            let mut project = self.repo.project(project_id).await?;
            if project.status == ProjectStatus::Active {
                project.status = ProjectStatus::Paused;
                self.repo.update_project(project).await?;
                warn!(project_id = %project_id, "project paused pending human input");
            }
        }
        self.set_phase(project_id, OrchestratorPhase::Monitor).await?;
        Ok(())
    }

    /// COMPLETE: if every task is completed or cancelled, produce the
    /// summary record and close the project. Returns `None` while work is
    /// still open (or a failure keeps the project in MONITOR).
    pub async fn try_complete(&self, project_id: Uuid) -> FleetResult<Option<ProjectSummary>> {
        let project = self.repo.project(project_id).await?;
        if project.is_terminal() {
            return Ok(None);
        }
        let tasks = self.repo.tasks_for_project(project_id).await?;
        if tasks.is_empty() || tasks.iter().any(|t| !t.status.is_terminal()) {
            return Ok(None);
        }

        let failed = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .count();
        if failed > 0 {
            // Failed work keeps the project open for human triage; the
            // retry-exhausted escalations are already on file.
            return Ok(None);
        }

        let completed = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count();
        let cancelled = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Cancelled)
            .count();

        let mut project = project;
        project.status = ProjectStatus::Completed;
        project.phase = OrchestratorPhase::Complete;
        project.completed_at = Some(Utc::now());
        let project = self.repo.update_project(project).await?;

        let summary = ProjectSummary {
            project_id: project.id,
            name: project.name.clone(),
            total_tasks: tasks.len(),
            completed_tasks: completed,
            cancelled_tasks: cancelled,
            failed_tasks: failed,
            duration_minutes: (Utc::now() - project.created_at).num_seconds() as f64 / 60.0,
            generated_at: Utc::now(),
        };

        info!(
            project_id = %project.id,
            completed,
            cancelled,
            "project complete"
        );
        self.record_audit(
            "project_completed",
            project.id,
            serde_json::to_value(&summary).unwrap_or_default(),
        )
        .await;

        Ok(Some(summary))
    }

    /// Escalate a task that has sat unassignable past the pass budget.
    async fn note_unassignable(&self, task_id: Uuid, reason: &str) -> FleetResult<()> {
        for _ in 0..5 {
            let mut task = self.repo.task(task_id).await?;
            task.delegation_attempts += 1;
            let attempts = task.delegation_attempts;
            match self.repo.update_task(task).await {
                Ok(_) => {
                    if attempts > self.config.max_delegation_passes {
                        self.escalations
                            .raise(
                                EscalationKind::UnassignableTask,
                                task_id,
                                Severity::Warning,
                                format!("no eligible agent after {attempts} passes: {reason}"),
                                Some("add capacity or adjust the task's requirements".into()),
                            )
                            .await?;
                    }
                    return Ok(());
                }
                Err(FleetError::AssignmentConflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn set_phase(&self, project_id: Uuid, phase: OrchestratorPhase) -> FleetResult<()> {
        for _ in 0..5 {
            let mut project = self.repo.project(project_id).await?;
            if project.is_terminal() || project.phase == phase {
                return Ok(());
            }
            project.phase = phase;
            match self.repo.update_project(project).await {
                Ok(_) => return Ok(()),
                Err(FleetError::AssignmentConflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn has_cycle(request: &ProjectRequest) -> bool {
        // Index-based DFS with white/grey/black coloring.
        fn visit(specs: &[taskfleet_core::TaskSpec], node: usize, state: &mut [u8]) -> bool {
            match state[node] {
                1 => return true,
                2 => return false,
                _ => {}
            }
            state[node] = 1;
            for &dep in &specs[node].depends_on {
                if dep < specs.len() && visit(specs, dep, state) {
                    return true;
                }
            }
            state[node] = 2;
            false
        }

        let mut state = vec![0u8; request.tasks.len()];
        (0..request.tasks.len()).any(|i| visit(&request.tasks, i, &mut state))
    }

    async fn record_audit(&self, action: &str, subject: Uuid, details: serde_json::Value) {
        let event = AuditEvent::new(action, Some(subject), details);
        if let Err(e) = self.audit.record(event).await {
            warn!(error = %e, "audit write failed");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use taskfleet_core::TaskSpec;

    fn request_with_deps(deps: Vec<Vec<usize>>) -> ProjectRequest {
        let tasks = deps
            .into_iter()
            .enumerate()
            .map(|(i, d)| TaskSpec::new(format!("task-{i}")).depends_on(d))
            .collect();
        ProjectRequest::new("p", tasks)
    }

    #[test]
    fn test_acyclic_chain_accepted() {
        let request = request_with_deps(vec![vec![], vec![0], vec![1]]);
        assert!(!Orchestrator::has_cycle(&request));
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let request = request_with_deps(vec![vec![0]]);
        assert!(Orchestrator::has_cycle(&request));
    }

    #[test]
    fn test_two_node_cycle_detected() {
        let request = request_with_deps(vec![vec![1], vec![0]]);
        assert!(Orchestrator::has_cycle(&request));
    }

    #[test]
    fn test_transitive_cycle_detected() {
        let request = request_with_deps(vec![vec![2], vec![0], vec![1]]);
        assert!(Orchestrator::has_cycle(&request));
    }

    #[test]
    fn test_diamond_is_acyclic() {
        let request = request_with_deps(vec![vec![], vec![0], vec![0], vec![1, 2]]);
        assert!(!Orchestrator::has_cycle(&request));
    }
}
