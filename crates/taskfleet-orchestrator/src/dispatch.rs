use crate::delegation::DelegationEngine;
use crate::escalation::EscalationManager;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use taskfleet_core::{
    AgentStatus, AuditEvent, AuditSink, EscalationKind, ExecutionBackend, ExecutionHandle,
    FleetError, FleetResult, HealthEvent, HealthEventKind, Notification, Notifier, Repository,
    Severity, TaskStatus,
};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

/// Tracks handles of in-flight executions so a timeout can cancel them.
/// Handles are transient scheduler state, never persisted.
#[derive(Default)]
pub struct ExecutionTracker {
    handles: RwLock<HashMap<Uuid, ExecutionHandle>>,
}

impl ExecutionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn track(&self, handle: ExecutionHandle) {
        self.handles.write().await.insert(handle.task_id, handle);
    }

    pub async fn take(&self, task_id: Uuid) -> Option<ExecutionHandle> {
        self.handles.write().await.remove(&task_id)
    }
}

/// What the dispatcher did with one event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchOutcome {
    pub event_kind: HealthEventKind,
    pub subject_id: Uuid,
    /// Actions applied, in order.
    pub actions: Vec<String>,
    /// True when an open escalation already existed and only its last-seen
    /// time was refreshed (no side effects re-fired).
    pub refreshed: bool,
}

/// Maps each health event to its side effects and executes them exactly
/// once per occurrence.
///
/// Idempotence rides on the escalation record: while an escalation for the
/// same (kind, subject) stays open, a re-detected event refreshes it
/// instead of re-firing the handler. Only the persistence checks (disable
/// a still-silent agent, hand a still-stalled task to a human) run on the
/// refresh path. Notification and audit failures are logged and never roll
/// back state already applied.
pub struct ActionDispatcher {
    repo: Arc<dyn Repository>,
    delegation: Arc<DelegationEngine>,
    escalations: Arc<EscalationManager>,
    executor: Arc<dyn ExecutionBackend>,
    tracker: Arc<ExecutionTracker>,
    notifier: Arc<dyn Notifier>,
    audit: Arc<dyn AuditSink>,
}

impl ActionDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: Arc<dyn Repository>,
        delegation: Arc<DelegationEngine>,
        escalations: Arc<EscalationManager>,
        executor: Arc<dyn ExecutionBackend>,
        tracker: Arc<ExecutionTracker>,
        notifier: Arc<dyn Notifier>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            repo,
            delegation,
            escalations,
            executor,
            tracker,
            notifier,
            audit,
        }
    }

    /// Dispatch a merged, ordered batch of events from one health cycle.
    pub async fn dispatch(&self, events: &[HealthEvent]) -> Vec<DispatchOutcome> {
        let mut outcomes = Vec::with_capacity(events.len());
        for event in events {
            let outcome = self.dispatch_one(event).await;
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn dispatch_one(&self, event: &HealthEvent) -> DispatchOutcome {
        // Idempotence gate: an open escalation for this trigger key means
        // the side effects already fired. Refresh, run persistence checks,
        // done.
        match self.escalations.open_by_key(&event.trigger_key()).await {
            Ok(Some(open)) => {
                let persistent = self.escalations.is_persistent(&open);
                let mut actions = vec!["escalation_refreshed".to_string()];
                if let Err(e) = self.refresh_escalation(event).await {
                    warn!(error = %e, "escalation refresh failed");
                }
                if persistent {
                    actions.extend(self.second_stage(event).await);
                }
                self.write_audit(event, &actions, true).await;
                return DispatchOutcome {
                    event_kind: event.kind,
                    subject_id: event.subject_id,
                    actions,
                    refreshed: true,
                };
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "escalation lookup failed, handling event anyway");
            }
        }

        let actions = self.first_stage(event).await;
        self.notify_event(event).await;
        self.write_audit(event, &actions, false).await;

        DispatchOutcome {
            event_kind: event.kind,
            subject_id: event.subject_id,
            actions,
            refreshed: false,
        }
    }

    /// Handler table for a first occurrence. Exhaustive over the closed
    /// event-kind enum.
    async fn first_stage(&self, event: &HealthEvent) -> Vec<String> {
        let mut actions = Vec::new();
        match event.kind {
            HealthEventKind::TaskStalled => {
                // Notify now, escalate; persistence is judged on the next
                // cycles through the open record.
                self.open_escalation(
                    event,
                    EscalationKind::TaskStalled,
                    "check the assigned agent or reassign the task",
                    &mut actions,
                )
                .await;
            }
            HealthEventKind::TaskLongRunning => {
                // Informational only; no escalation record, no remediation.
                actions.push("logged".to_string());
            }
            HealthEventKind::TaskTimeout => {
                actions.extend(self.handle_task_timeout(event).await);
            }
            HealthEventKind::AgentSilent => {
                actions.extend(self.handle_agent_silent(event).await);
            }
            HealthEventKind::AgentHighErrors => {
                actions.extend(self.handle_agent_high_errors(event).await);
            }
            HealthEventKind::AgentMemoryPressure => {
                actions.push("logged".to_string());
            }
            HealthEventKind::ExternalSignal => {
                if event.severity >= Severity::Warning {
                    self.open_escalation(
                        event,
                        EscalationKind::ExternalSignal,
                        "inspect the external signal source",
                        &mut actions,
                    )
                    .await;
                } else {
                    actions.push("logged".to_string());
                }
            }
        }
        actions
    }

    /// Second-stage actions for conditions that survived a full cycle with
    /// an open escalation.
    async fn second_stage(&self, event: &HealthEvent) -> Vec<String> {
        let mut actions = Vec::new();
        match event.kind {
            HealthEventKind::TaskStalled => {
                // Still stalled one cycle later: hand to a human.
                if let Err(e) = self.hand_to_human(event).await {
                    warn!(error = %e, "failed to mark stalled escalation for human");
                } else {
                    actions.push("awaiting_human".to_string());
                }
            }
            HealthEventKind::AgentSilent => {
                // Still silent: take the agent out of rotation.
                match self.set_agent_status(event.subject_id, AgentStatus::Disabled).await {
                    Ok(()) => {
                        info!(agent_id = %event.subject_id, "persistently silent agent disabled");
                        actions.push("agent_disabled".to_string());
                    }
                    Err(e) => warn!(error = %e, "failed to disable silent agent"),
                }
                if let Err(e) = self.hand_to_human(event).await {
                    warn!(error = %e, "failed to mark silent-agent escalation for human");
                }
            }
            HealthEventKind::AgentHighErrors => {
                match self.set_agent_status(event.subject_id, AgentStatus::Disabled).await {
                    Ok(()) => {
                        info!(agent_id = %event.subject_id, "persistently erroring agent disabled");
                        actions.push("agent_disabled".to_string());
                    }
                    Err(e) => warn!(error = %e, "failed to disable erroring agent"),
                }
            }
            // Timeouts re-fire through fresh escalations after resolution;
            // the info kinds never escalate at all.
            HealthEventKind::TaskTimeout
            | HealthEventKind::TaskLongRunning
            | HealthEventKind::AgentMemoryPressure
            | HealthEventKind::ExternalSignal => {}
        }
        actions
    }

    /// timeout → cancel + reassign + notify, plus a critical escalation.
    async fn handle_task_timeout(&self, event: &HealthEvent) -> Vec<String> {
        let mut actions = Vec::new();
        let task_id = event.subject_id;

        // Best-effort cancellation of the in-flight execution. The task is
        // cancelled regardless of whether the sandbox acknowledges.
        if let Some(handle) = self.tracker.take(task_id).await {
            match self.executor.cancel(&handle).await {
                Ok(()) => actions.push("execution_cancelled".to_string()),
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "execution cancel failed, proceeding");
                    actions.push("execution_cancel_attempted".to_string());
                }
            }
        }

        if let Err(e) = self.mark_task_cancelled(task_id).await {
            warn!(task_id = %task_id, error = %e, "failed to mark task cancelled");
        } else {
            actions.push("task_cancelled".to_string());
        }

        if let Err(e) = self
            .escalations
            .raise(
                EscalationKind::TaskTimeout,
                task_id,
                Severity::Critical,
                event.detail.clone(),
                Some("task was cancelled and requeued; investigate if it times out again".into()),
            )
            .await
        {
            warn!(error = %e, "failed to raise timeout escalation");
            return actions;
        }
        actions.push("escalation_opened".to_string());

        match self.delegation.reassign(task_id).await {
            Ok(_) => {
                actions.push("task_requeued".to_string());
                // Back to DELEGATE for this task only. No candidate is
                // fine; the next pass retries.
                match self.delegation.delegate(task_id).await {
                    Ok(_) => actions.push("task_redelegated".to_string()),
                    Err(FleetError::NoEligibleAgent(_)) => {}
                    Err(e) => {
                        warn!(task_id = %task_id, error = %e, "post-timeout delegation failed");
                    }
                }
                // The cause is gone: the record closes so a future timeout
                // opens a fresh one.
                if let Err(e) = self
                    .escalations
                    .auto_resolve_key(
                        &format!("{}:{task_id}", EscalationKind::TaskTimeout),
                        "task requeued after timeout",
                    )
                    .await
                {
                    warn!(error = %e, "failed to auto-resolve timeout escalation");
                }
            }
            Err(FleetError::RetryExhausted(reason)) => {
                warn!(task_id = %task_id, %reason, "timeout reassignment exhausted retries");
                actions.push("retry_exhausted".to_string());
                if let Err(e) = self
                    .escalations
                    .raise(
                        EscalationKind::RetryExhausted,
                        task_id,
                        Severity::Critical,
                        reason,
                        Some("task failed permanently; needs human triage".into()),
                    )
                    .await
                {
                    warn!(error = %e, "failed to raise retry-exhausted escalation");
                }
            }
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "timeout reassignment failed");
            }
        }

        actions
    }

    /// silent agent → attempt restart + reassign its tasks + mark degraded
    /// + alert.
    async fn handle_agent_silent(&self, event: &HealthEvent) -> Vec<String> {
        let mut actions = Vec::new();
        let agent_id = event.subject_id;

        // Restart is delegated to the notification channel; the scheduler
        // itself cannot reach into the agent's runtime.
        let restart = Notification::new(
            "agent restart requested",
            format!("agent {agent_id} is silent; runtime restart requested"),
            Severity::Warning,
        );
        if let Err(e) = self.notifier.notify(&[agent_id], &restart).await {
            warn!(error = %e, "restart notification failed");
        }
        actions.push("restart_requested".to_string());

        // Reassign everything the silent agent holds, task by task.
        match self.repo.agent(agent_id).await {
            Ok(agent) => {
                for task_id in agent.current_tasks.clone() {
                    match self.delegation.reassign(task_id).await {
                        Ok(_) => actions.push(format!("task_requeued:{task_id}")),
                        Err(FleetError::RetryExhausted(_)) => {
                            actions.push(format!("retry_exhausted:{task_id}"));
                        }
                        Err(e) => {
                            warn!(task_id = %task_id, error = %e, "silent-agent reassign failed");
                        }
                    }
                }
            }
            Err(e) => warn!(agent_id = %agent_id, error = %e, "silent agent not found"),
        }

        match self.set_agent_status(agent_id, AgentStatus::Error).await {
            Ok(()) => actions.push("agent_degraded".to_string()),
            Err(e) => warn!(error = %e, "failed to degrade silent agent"),
        }

        self.open_escalation(
            event,
            EscalationKind::AgentSilent,
            "restart the agent runtime or disable the agent",
            &mut actions,
        )
        .await;

        actions
    }

    /// high errors → reduce assignments + flag for reflection.
    async fn handle_agent_high_errors(&self, event: &HealthEvent) -> Vec<String> {
        let mut actions = Vec::new();
        let agent_id = event.subject_id;

        match self.repo.agent(agent_id).await {
            Ok(mut agent) => {
                // Shrink the concurrency limit once per escalation episode.
                agent.max_concurrent_tasks = agent.max_concurrent_tasks.saturating_sub(1).max(1);
                match self.repo.update_agent(agent).await {
                    Ok(_) => actions.push("assignments_reduced".to_string()),
                    Err(e) => warn!(error = %e, "failed to reduce agent assignments"),
                }
            }
            Err(e) => warn!(agent_id = %agent_id, error = %e, "erroring agent not found"),
        }

        let reflection = Notification::new(
            "agent flagged for reflection",
            event.detail.clone(),
            Severity::Warning,
        );
        if let Err(e) = self.notifier.notify(&[agent_id], &reflection).await {
            warn!(error = %e, "reflection notification failed");
        }
        actions.push("flagged_for_reflection".to_string());

        self.open_escalation(
            event,
            EscalationKind::AgentHighErrors,
            "review the agent's recent failures",
            &mut actions,
        )
        .await;

        actions
    }

    async fn open_escalation(
        &self,
        event: &HealthEvent,
        kind: EscalationKind,
        suggested: &str,
        actions: &mut Vec<String>,
    ) {
        match self
            .escalations
            .raise(
                kind,
                event.subject_id,
                event.severity,
                event.detail.clone(),
                Some(suggested.to_string()),
            )
            .await
        {
            Ok(_) => actions.push("escalation_opened".to_string()),
            Err(e) => warn!(error = %e, "failed to open escalation"),
        }
    }

    async fn refresh_escalation(&self, event: &HealthEvent) -> FleetResult<()> {
        let kind = match event.kind {
            HealthEventKind::TaskStalled => EscalationKind::TaskStalled,
            HealthEventKind::TaskTimeout => EscalationKind::TaskTimeout,
            HealthEventKind::AgentSilent => EscalationKind::AgentSilent,
            HealthEventKind::AgentHighErrors => EscalationKind::AgentHighErrors,
            HealthEventKind::TaskLongRunning
            | HealthEventKind::AgentMemoryPressure
            | HealthEventKind::ExternalSignal => EscalationKind::ExternalSignal,
        };
        self.escalations
            .raise(
                kind,
                event.subject_id,
                event.severity,
                event.detail.clone(),
                None,
            )
            .await?;
        Ok(())
    }

    async fn hand_to_human(&self, event: &HealthEvent) -> FleetResult<()> {
        if let Some(mut open) = self.escalations.open_by_key(&event.trigger_key()).await? {
            if open.status == taskfleet_core::EscalationStatus::Open {
                open.status = taskfleet_core::EscalationStatus::AwaitingHuman;
                self.repo.update_escalation(open).await?;
            }
        }
        Ok(())
    }

    async fn mark_task_cancelled(&self, task_id: Uuid) -> FleetResult<()> {
        for _ in 0..5 {
            let mut task = self.repo.task(task_id).await?;
            if task.status.is_terminal() {
                return Ok(());
            }
            let owner = task.assigned_agent;
            task.status = TaskStatus::Cancelled;
            task.completed_at = Some(chrono::Utc::now());
            task.touch();
            match self.repo.update_task(task).await {
                Ok(_) => {
                    if let Some(agent_id) = owner {
                        self.delegation
                            .detach_task_from_agent(agent_id, task_id, false)
                            .await;
                    }
                    return Ok(());
                }
                Err(FleetError::AssignmentConflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(FleetError::AssignmentConflict(format!(
            "task {task_id} contested while cancelling"
        )))
    }

    async fn set_agent_status(&self, agent_id: Uuid, status: AgentStatus) -> FleetResult<()> {
        for _ in 0..5 {
            let mut agent = self.repo.agent(agent_id).await?;
            agent.status = status;
            match self.repo.update_agent(agent).await {
                Ok(_) => return Ok(()),
                Err(FleetError::AssignmentConflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(FleetError::AssignmentConflict(format!(
            "agent {agent_id} contested while updating status"
        )))
    }

    async fn notify_event(&self, event: &HealthEvent) {
        let notification = Notification::new(
            event.kind.to_string(),
            event.detail.clone(),
            event.severity,
        );
        if let Err(e) = self.notifier.notify(&[], &notification).await {
            warn!(kind = %event.kind, error = %e, "event notification failed");
        }
    }

    async fn write_audit(&self, event: &HealthEvent, actions: &[String], refreshed: bool) {
        let audit = AuditEvent::new(
            "health_event_dispatched",
            Some(event.subject_id),
            serde_json::json!({
                "kind": event.kind.to_string(),
                "severity": event.severity.to_string(),
                "detail": event.detail,
                "actions": actions,
                "refreshed": refreshed,
            }),
        );
        if let Err(e) = self.audit.record(audit).await {
            warn!(error = %e, "audit write failed");
        }
    }
}
