use chrono::{Duration, Utc};
use std::sync::Arc;
use taskfleet_core::{
    AuditEvent, AuditSink, Escalation, EscalationKind, EscalationStatus, FleetConfig, FleetResult,
    HealthEvent, Notification, Notifier, Repository, Severity,
};
use tracing::{info, warn};
use uuid::Uuid;

/// Tracks unresolved issues, deduplicated by trigger key.
///
/// One open escalation per (kind, subject) at a time: re-detection
/// refreshes the record instead of duplicating it, and a fresh occurrence
/// after resolution opens a new one. Anything the scheduler cannot
/// self-resolve goes through here.
pub struct EscalationManager {
    repo: Arc<dyn Repository>,
    config: Arc<FleetConfig>,
    notifier: Arc<dyn Notifier>,
    audit: Arc<dyn AuditSink>,
}

impl EscalationManager {
    pub fn new(
        repo: Arc<dyn Repository>,
        config: Arc<FleetConfig>,
        notifier: Arc<dyn Notifier>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            repo,
            config,
            notifier,
            audit,
        }
    }

    /// Open a new escalation or refresh the existing open one for the same
    /// trigger key. Returns the stored record and whether it was newly
    /// opened.
    pub async fn raise(
        &self,
        kind: EscalationKind,
        subject_id: Uuid,
        severity: Severity,
        description: impl Into<String>,
        suggested_action: Option<String>,
    ) -> FleetResult<(Escalation, bool)> {
        let mut candidate = Escalation::new(kind, subject_id, severity, description);
        candidate.suggested_action = suggested_action;
        // Human-only kinds go straight to the hand-off queue.
        if !kind.auto_resolvable() {
            candidate.status = EscalationStatus::AwaitingHuman;
        }
        let (stored, opened) = self.repo.upsert_escalation(candidate).await?;

        if opened {
            info!(
                escalation_id = %stored.id,
                kind = %stored.kind,
                severity = %stored.severity,
                "escalation opened"
            );
            self.record_audit(
                "escalation_opened",
                stored.subject_id,
                serde_json::json!({
                    "kind": stored.kind.to_string(),
                    "severity": stored.severity.to_string(),
                    "description": stored.description,
                }),
            )
            .await;
            let notification = Notification::new(
                format!("escalation: {}", stored.kind),
                stored.description.clone(),
                stored.severity,
            );
            if let Err(e) = self.notifier.notify(&[], &notification).await {
                warn!(error = %e, "escalation notification failed");
            }
        }

        Ok((stored, opened))
    }

    /// The open escalation for a trigger key, if any.
    pub async fn open_by_key(&self, trigger_key: &str) -> FleetResult<Option<Escalation>> {
        self.repo.open_escalation_by_key(trigger_key).await
    }

    /// Whether an open escalation has survived at least one full health
    /// cycle since it was opened. Drives the second-stage actions
    /// (disable a persistently silent agent, hand a persistent stall to a
    /// human).
    pub fn is_persistent(&self, escalation: &Escalation) -> bool {
        let cycle = Duration::minutes(self.config.heartbeat_interval_minutes);
        Utc::now() - escalation.created_at > cycle
    }

    /// Human resolution via the exposed interface.
    pub async fn resolve(&self, escalation_id: Uuid, resolution: &str) -> FleetResult<Escalation> {
        let mut escalation = self.repo.escalation(escalation_id).await?;
        escalation.status = EscalationStatus::Resolved;
        escalation.resolved_at = Some(Utc::now());
        escalation.resolution = Some(resolution.to_string());
        let stored = self.repo.update_escalation(escalation).await?;
        info!(escalation_id = %escalation_id, "escalation resolved");
        self.record_audit(
            "escalation_resolved",
            stored.subject_id,
            serde_json::json!({"resolution": resolution}),
        )
        .await;
        Ok(stored)
    }

    /// Auto-resolve the open escalation for a trigger key, if one exists.
    /// Used when the scheduler itself removed the cause (e.g. a timed-out
    /// task was successfully requeued).
    pub async fn auto_resolve_key(&self, trigger_key: &str, note: &str) -> FleetResult<()> {
        if let Some(mut open) = self.repo.open_escalation_by_key(trigger_key).await? {
            open.status = EscalationStatus::AutoResolved;
            open.resolved_at = Some(Utc::now());
            open.resolution = Some(note.to_string());
            let stored = self.repo.update_escalation(open).await?;
            info!(escalation_id = %stored.id, key = trigger_key, "escalation auto-resolved");
            self.record_audit(
                "escalation_auto_resolved",
                stored.subject_id,
                serde_json::json!({"note": note}),
            )
            .await;
        }
        Ok(())
    }

    /// After a health cycle, auto-resolve open auto-resolvable escalations
    /// whose condition did not reappear in this cycle's events.
    pub async fn sweep_cleared(&self, current_events: &[HealthEvent]) -> FleetResult<usize> {
        let seen: Vec<String> = current_events.iter().map(|e| e.trigger_key()).collect();
        let mut cleared = 0;
        for escalation in self.repo.open_escalations().await? {
            if escalation.status != EscalationStatus::Open {
                continue;
            }
            // Only health-originated kinds clear by absence from a cycle;
            // unassignable tasks resolve when delegation later succeeds.
            let health_originated = matches!(
                escalation.kind,
                EscalationKind::TaskStalled
                    | EscalationKind::TaskTimeout
                    | EscalationKind::AgentSilent
                    | EscalationKind::AgentHighErrors
            );
            if !health_originated || !escalation.kind.auto_resolvable() {
                continue;
            }
            if seen.contains(&escalation.trigger_key) {
                continue;
            }
            self.auto_resolve_key(&escalation.trigger_key, "condition cleared")
                .await?;
            cleared += 1;
        }
        Ok(cleared)
    }

    async fn record_audit(&self, action: &str, subject: Uuid, details: serde_json::Value) {
        let event = AuditEvent::new(action, Some(subject), details);
        if let Err(e) = self.audit.record(event).await {
            warn!(error = %e, "audit write failed");
        }
    }
}
