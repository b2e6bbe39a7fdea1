use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a health event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubjectKind {
    Task,
    Agent,
    External,
}

/// Severity of a health event or escalation. Ordered: critical ranks
/// highest, so severity-max merges are a plain `max`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

/// Closed set of conditions the health monitor can detect. The dispatcher
/// matches on this exhaustively; adding a kind without a handler is a
/// compile error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthEventKind {
    TaskStalled,
    TaskLongRunning,
    TaskTimeout,
    AgentSilent,
    AgentHighErrors,
    AgentMemoryPressure,
    ExternalSignal,
}

impl std::fmt::Display for HealthEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HealthEventKind::TaskStalled => "task_stalled",
            HealthEventKind::TaskLongRunning => "task_long_running",
            HealthEventKind::TaskTimeout => "task_timeout",
            HealthEventKind::AgentSilent => "agent_silent",
            HealthEventKind::AgentHighErrors => "agent_high_errors",
            HealthEventKind::AgentMemoryPressure => "agent_memory_pressure",
            HealthEventKind::ExternalSignal => "external_signal",
        };
        write!(f, "{s}")
    }
}

/// A transient condition detected during one health cycle. Produced by the
/// monitor, consumed by the dispatcher, persisted only in the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthEvent {
    pub subject: SubjectKind,
    pub subject_id: Uuid,
    pub kind: HealthEventKind,
    pub severity: Severity,
    pub detected_at: DateTime<Utc>,
    pub detail: String,
}

impl HealthEvent {
    pub fn new(
        subject: SubjectKind,
        subject_id: Uuid,
        kind: HealthEventKind,
        severity: Severity,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            subject,
            subject_id,
            kind,
            severity,
            detected_at: Utc::now(),
            detail: detail.into(),
        }
    }

    /// Deduplication key: one open escalation per (kind, subject) at a time.
    pub fn trigger_key(&self) -> String {
        format!("{}:{}", self.kind, self.subject_id)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
        assert_eq!(Severity::Warning.max(Severity::Critical), Severity::Critical);
    }

    #[test]
    fn test_trigger_key_format() {
        let id = Uuid::new_v4();
        let event = HealthEvent::new(
            SubjectKind::Task,
            id,
            HealthEventKind::TaskStalled,
            Severity::Warning,
            "no update for 45 minutes",
        );
        assert_eq!(event.trigger_key(), format!("task_stalled:{id}"));
    }

    #[test]
    fn test_same_subject_different_kinds_differ() {
        let id = Uuid::new_v4();
        let stalled = HealthEvent::new(
            SubjectKind::Task,
            id,
            HealthEventKind::TaskStalled,
            Severity::Warning,
            "",
        );
        let timeout = HealthEvent::new(
            SubjectKind::Task,
            id,
            HealthEventKind::TaskTimeout,
            Severity::Critical,
            "",
        );
        assert_ne!(stalled.trigger_key(), timeout.trigger_key());
    }

    #[test]
    fn test_kind_serialization() {
        let json = serde_json::to_string(&HealthEventKind::AgentHighErrors).unwrap();
        assert_eq!(json, "\"agent_high_errors\"");
    }
}
