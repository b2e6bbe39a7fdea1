use crate::event::{HealthEvent, Severity};
use crate::task::Task;
use crate::FleetResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Handle to an in-flight execution, returned by the execution
/// collaborator and used for best-effort cancellation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionHandle {
    pub id: Uuid,
    pub task_id: Uuid,
}

/// The execution collaborator. Runs a task inside an isolated runtime and
/// reports progress/results back asynchronously through the service
/// interface; the scheduler never blocks on it.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Start executing a task. Returns a handle usable for cancellation.
    async fn start(&self, task: &Task) -> FleetResult<ExecutionHandle>;

    /// Best-effort cancellation. The scheduler marks the task cancelled
    /// whether or not the execution acknowledges.
    async fn cancel(&self, handle: &ExecutionHandle) -> FleetResult<()>;
}

/// A notification delivered through the external notification collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub subject: String,
    pub message: String,
    pub severity: Severity,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(subject: impl Into<String>, message: impl Into<String>, severity: Severity) -> Self {
        Self {
            subject: subject.into(),
            message: message.into(),
            severity,
            created_at: Utc::now(),
        }
    }
}

/// The notification collaborator. Delivery failures are logged by callers
/// and never roll back scheduler state.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, recipients: &[Uuid], notification: &Notification) -> FleetResult<()>;
}

/// One entry for the audit log sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    /// Action name, e.g. `task_assigned`, `health_cycle`, `handoff_ack`.
    pub action: String,
    pub subject_id: Option<Uuid>,
    pub details: serde_json::Value,
}

impl AuditEvent {
    pub fn new(action: impl Into<String>, subject_id: Option<Uuid>, details: serde_json::Value) -> Self {
        Self {
            timestamp: Utc::now(),
            action: action.into(),
            subject_id,
            details,
        }
    }
}

/// The audit log collaborator. Write failures are logged by callers and
/// never roll back scheduler state.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent) -> FleetResult<()>;
}

/// An optional external signal source scanned during each health cycle
/// alongside the task and agent scans. Sources are registered explicitly
/// through the monitor constructor; a failing source contributes a partial
/// failure, never aborts the cycle.
#[async_trait]
pub trait SignalSource: Send + Sync {
    fn name(&self) -> &str;

    async fn scan(&self) -> FleetResult<Vec<HealthEvent>>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_carries_severity() {
        let n = Notification::new("task stalled", "no update for 45m", Severity::Warning);
        assert_eq!(n.severity, Severity::Warning);
    }

    #[test]
    fn test_audit_event_serializes() {
        let event = AuditEvent::new(
            "task_assigned",
            Some(Uuid::new_v4()),
            serde_json::json!({"agent": "atlas"}),
        );
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("task_assigned"));
    }
}
