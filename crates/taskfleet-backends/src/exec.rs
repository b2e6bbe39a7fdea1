use async_trait::async_trait;
use taskfleet_core::{ExecutionBackend, ExecutionHandle, FleetError, FleetResult, Task};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Execution backend that records every start and cancel, for tests.
///
/// Real execution happens in an external sandbox; the scheduler only ever
/// needs the handle and a best-effort cancel, which this mirrors.
#[derive(Default)]
pub struct MockExecutor {
    started: RwLock<Vec<ExecutionHandle>>,
    cancelled: RwLock<Vec<ExecutionHandle>>,
    /// When set, `start` fails. Lets tests exercise the launch-failure path.
    fail_starts: RwLock<bool>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_starts(&self, fail: bool) {
        *self.fail_starts.write().await = fail;
    }

    pub async fn started(&self) -> Vec<ExecutionHandle> {
        self.started.read().await.clone()
    }

    pub async fn cancelled(&self) -> Vec<ExecutionHandle> {
        self.cancelled.read().await.clone()
    }

    pub async fn started_count(&self) -> usize {
        self.started.read().await.len()
    }

    pub async fn was_cancelled(&self, task_id: Uuid) -> bool {
        self.cancelled
            .read()
            .await
            .iter()
            .any(|h| h.task_id == task_id)
    }
}

#[async_trait]
impl ExecutionBackend for MockExecutor {
    async fn start(&self, task: &Task) -> FleetResult<ExecutionHandle> {
        if *self.fail_starts.read().await {
            return Err(FleetError::Execution(format!(
                "sandbox unavailable for task {}",
                task.id
            )));
        }
        let handle = ExecutionHandle {
            id: Uuid::new_v4(),
            task_id: task.id,
        };
        self.started.write().await.push(handle.clone());
        Ok(handle)
    }

    async fn cancel(&self, handle: &ExecutionHandle) -> FleetResult<()> {
        self.cancelled.write().await.push(handle.clone());
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_start_and_cancel_recorded() {
        let exec = MockExecutor::new();
        let task = Task::new(Uuid::new_v4(), "t");
        let handle = exec.start(&task).await.unwrap();
        assert_eq!(exec.started_count().await, 1);

        exec.cancel(&handle).await.unwrap();
        assert!(exec.was_cancelled(task.id).await);
    }

    #[tokio::test]
    async fn test_forced_start_failure() {
        let exec = MockExecutor::new();
        exec.set_fail_starts(true).await;
        let task = Task::new(Uuid::new_v4(), "t");
        assert!(exec.start(&task).await.is_err());
    }
}
