use async_trait::async_trait;
use std::path::PathBuf;
use taskfleet_core::{AuditEvent, AuditSink, FleetResult};
use tokio::sync::{mpsc, RwLock};
use tracing::info;

/// Append-only audit sink that writes one JSON line per event.
///
/// `record` never blocks on disk: entries flow through an unbounded channel
/// to a background writer task.
pub struct JsonlAuditLog {
    tx: mpsc::UnboundedSender<AuditEvent>,
}

impl JsonlAuditLog {
    /// Create a new log. Spawns the background writer.
    pub fn new(log_dir: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<AuditEvent>();

        tokio::spawn(async move {
            let _ = tokio::fs::create_dir_all(&log_dir).await;
            let log_file = log_dir.join("audit.jsonl");

            while let Some(event) = rx.recv().await {
                if let Ok(line) = serde_json::to_string(&event) {
                    use tokio::io::AsyncWriteExt;
                    if let Ok(mut file) = tokio::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&log_file)
                        .await
                    {
                        let line = format!("{line}\n");
                        let _ = file.write_all(line.as_bytes()).await;
                    }
                }
            }
        });

        Self { tx }
    }
}

#[async_trait]
impl AuditSink for JsonlAuditLog {
    async fn record(&self, event: AuditEvent) -> FleetResult<()> {
        info!(action = %event.action, subject = ?event.subject_id, "audit");
        let _ = self.tx.send(event);
        Ok(())
    }
}

/// Audit sink that keeps events in memory, for test assertions on ordering
/// and content.
#[derive(Default)]
pub struct MemoryAuditLog {
    events: RwLock<Vec<AuditEvent>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.read().await.clone()
    }

    pub async fn actions(&self) -> Vec<String> {
        self.events
            .read()
            .await
            .iter()
            .map(|e| e.action.clone())
            .collect()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditLog {
    async fn record(&self, event: AuditEvent) -> FleetResult<()> {
        self.events.write().await.push(event);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_log_preserves_order() {
        let log = MemoryAuditLog::new();
        log.record(AuditEvent::new("first", None, serde_json::json!({})))
            .await
            .unwrap();
        log.record(AuditEvent::new("second", None, serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(log.actions().await, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_jsonl_log_writes_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let log = JsonlAuditLog::new(tmp.path().to_path_buf());
        log.record(AuditEvent::new(
            "task_assigned",
            None,
            serde_json::json!({"agent": "atlas"}),
        ))
        .await
        .unwrap();

        // Give the background writer a moment.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let contents = tokio::fs::read_to_string(tmp.path().join("audit.jsonl"))
            .await
            .unwrap();
        assert!(contents.contains("task_assigned"));
    }
}
