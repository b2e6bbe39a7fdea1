use crate::event::Severity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Closed set of escalation triggers. Health-event kinds map into this;
/// the scheduler's own failure modes (retry exhaustion, unassignable
/// tasks, negotiation timeouts) raise their kinds directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationKind {
    TaskStalled,
    TaskTimeout,
    AgentSilent,
    AgentHighErrors,
    UnassignableTask,
    RetryExhausted,
    NegotiationTimeout,
    ExternalSignal,
}

impl EscalationKind {
    /// Whether the dispatcher may auto-resolve this kind once the
    /// triggering condition clears. The rest waits for a human.
    pub fn auto_resolvable(&self) -> bool {
        matches!(
            self,
            EscalationKind::TaskStalled
                | EscalationKind::TaskTimeout
                | EscalationKind::AgentSilent
                | EscalationKind::AgentHighErrors
                | EscalationKind::UnassignableTask
        )
    }
}

impl std::fmt::Display for EscalationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EscalationKind::TaskStalled => "task_stalled",
            EscalationKind::TaskTimeout => "task_timeout",
            EscalationKind::AgentSilent => "agent_silent",
            EscalationKind::AgentHighErrors => "agent_high_errors",
            EscalationKind::UnassignableTask => "unassignable_task",
            EscalationKind::RetryExhausted => "retry_exhausted",
            EscalationKind::NegotiationTimeout => "negotiation_timeout",
            EscalationKind::ExternalSignal => "external_signal",
        };
        write!(f, "{s}")
    }
}

/// Status of an escalation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationStatus {
    Open,
    AutoResolved,
    AwaitingHuman,
    Resolved,
}

impl EscalationStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, EscalationStatus::Open | EscalationStatus::AwaitingHuman)
    }
}

/// A deduplicated record of an unresolved problem. At most one open
/// escalation per trigger key; re-detection refreshes the existing record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escalation {
    pub id: Uuid,
    pub trigger_key: String,
    pub kind: EscalationKind,
    pub severity: Severity,
    pub status: EscalationStatus,
    pub subject_id: Uuid,
    /// Human-actionable description: trigger, affected entity, context.
    pub description: String,
    pub suggested_action: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Refreshed whenever the same condition is re-detected while open.
    pub last_seen_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution: Option<String>,
    #[serde(default)]
    pub version: u64,
}

impl Escalation {
    pub fn new(
        kind: EscalationKind,
        subject_id: Uuid,
        severity: Severity,
        description: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            trigger_key: format!("{kind}:{subject_id}"),
            kind,
            severity,
            status: EscalationStatus::Open,
            subject_id,
            description: description.into(),
            suggested_action: None,
            created_at: now,
            last_seen_at: now,
            resolved_at: None,
            resolution: None,
            version: 0,
        }
    }

    pub fn with_suggested_action(mut self, action: impl Into<String>) -> Self {
        self.suggested_action = Some(action.into());
        self
    }

    pub fn is_open(&self) -> bool {
        self.status.is_open()
    }
}
