use async_trait::async_trait;
use taskfleet_core::{FleetResult, Notification, Notifier};
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

/// Notifier that logs through `tracing`. The default when no concrete
/// delivery channel is wired in.
#[derive(Default)]
pub struct TracingNotifier;

impl TracingNotifier {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, recipients: &[Uuid], notification: &Notification) -> FleetResult<()> {
        info!(
            recipients = recipients.len(),
            severity = %notification.severity,
            subject = %notification.subject,
            "notify"
        );
        Ok(())
    }
}

/// Notifier that captures everything sent, for test assertions.
#[derive(Default)]
pub struct MemoryNotifier {
    sent: RwLock<Vec<(Vec<Uuid>, Notification)>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<(Vec<Uuid>, Notification)> {
        self.sent.read().await.clone()
    }

    pub async fn subjects(&self) -> Vec<String> {
        self.sent
            .read()
            .await
            .iter()
            .map(|(_, n)| n.subject.clone())
            .collect()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn notify(&self, recipients: &[Uuid], notification: &Notification) -> FleetResult<()> {
        self.sent
            .write()
            .await
            .push((recipients.to_vec(), notification.clone()));
        Ok(())
    }
}
