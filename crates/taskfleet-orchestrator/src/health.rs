use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use taskfleet_core::{
    FleetConfig, FleetError, FleetResult, HealthEvent, HealthEventKind, Repository, Severity,
    SignalSource, SubjectKind,
};
use tracing::{error, info};

/// Outcome of one health cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub events: Vec<HealthEvent>,
    /// Scans that failed or missed the cycle deadline. The cycle proceeds
    /// with whatever the other scans produced.
    pub partial_failures: Vec<String>,
}

impl HealthReport {
    pub fn events_of_kind(&self, kind: HealthEventKind) -> Vec<&HealthEvent> {
        self.events.iter().filter(|e| e.kind == kind).collect()
    }
}

/// Scans active tasks, active agents, and registered external sources on a
/// fixed cadence, producing the events the dispatcher acts on.
///
/// The three scans run concurrently under a hard per-cycle deadline; a
/// failure in one never blocks the others. Results merge in a stable order
/// (task events, then agent events, then external events) so a cascading
/// reassignment always trails its triggering timeout in the audit log.
pub struct HealthMonitor {
    repo: Arc<dyn Repository>,
    config: Arc<FleetConfig>,
    sources: Vec<Arc<dyn SignalSource>>,
}

impl HealthMonitor {
    /// Sources are handed over explicitly at construction; there is no
    /// ambient registry.
    pub fn new(
        repo: Arc<dyn Repository>,
        config: Arc<FleetConfig>,
        sources: Vec<Arc<dyn SignalSource>>,
    ) -> Self {
        Self {
            repo,
            config,
            sources,
        }
    }

    /// Run one full cycle.
    pub async fn run_cycle(&self) -> HealthReport {
        let started_at = Utc::now();
        let clock = Instant::now();
        let deadline = std::time::Duration::from_secs(self.config.health_cycle_deadline_seconds);

        let (tasks, agents, external) = tokio::join!(
            tokio::time::timeout(deadline, self.scan_tasks()),
            tokio::time::timeout(deadline, self.scan_agents()),
            tokio::time::timeout(deadline, self.scan_external()),
        );

        let mut events = Vec::new();
        let mut partial_failures = Vec::new();

        for (name, outcome) in [("task", tasks), ("agent", agents), ("external", external)] {
            match outcome {
                Ok(Ok(mut scan_events)) => events.append(&mut scan_events),
                Ok(Err(e)) => {
                    let failure = FleetError::ScanFailure(format!("{name} scan failed: {e}"));
                    error!(scan = name, error = %e, "health scan failed");
                    partial_failures.push(failure.to_string());
                }
                Err(_) => {
                    let failure =
                        FleetError::ScanFailure(format!("{name} scan missed the cycle deadline"));
                    error!(scan = name, "health scan missed deadline");
                    partial_failures.push(failure.to_string());
                }
            }
        }

        let duration_ms = clock.elapsed().as_millis() as u64;
        info!(
            events = events.len(),
            failures = partial_failures.len(),
            duration_ms,
            "health cycle complete"
        );

        HealthReport {
            started_at,
            duration_ms,
            events,
            partial_failures,
        }
    }

    /// Per active task: stalled, long-running, timed out.
    async fn scan_tasks(&self) -> FleetResult<Vec<HealthEvent>> {
        let now = Utc::now();
        let stalled_after = Duration::minutes(self.config.task_stalled_after_minutes);
        let long_running_after = Duration::minutes(self.config.task_long_running_after_minutes);

        let tasks = self.repo.active_tasks().await?;
        let mut events = Vec::new();

        for task in &tasks {
            let since_update = now - task.last_updated;
            if since_update > stalled_after {
                events.push(HealthEvent::new(
                    SubjectKind::Task,
                    task.id,
                    HealthEventKind::TaskStalled,
                    Severity::Warning,
                    format!(
                        "task '{}' has had no update for {} minutes",
                        task.title,
                        since_update.num_minutes()
                    ),
                ));
            }

            if let Some(started_at) = task.started_at {
                let running_for = now - started_at;
                if running_for > Duration::minutes(task.timeout_minutes) {
                    events.push(HealthEvent::new(
                        SubjectKind::Task,
                        task.id,
                        HealthEventKind::TaskTimeout,
                        Severity::Critical,
                        format!(
                            "task '{}' exceeded its {} minute budget ({} minutes elapsed)",
                            task.title,
                            task.timeout_minutes,
                            running_for.num_minutes()
                        ),
                    ));
                } else if running_for > long_running_after {
                    events.push(HealthEvent::new(
                        SubjectKind::Task,
                        task.id,
                        HealthEventKind::TaskLongRunning,
                        Severity::Info,
                        format!(
                            "task '{}' has been running for {} minutes",
                            task.title,
                            running_for.num_minutes()
                        ),
                    ));
                }
            }
        }

        Ok(events)
    }

    /// Per active agent: silent, high recent error rate, memory pressure.
    async fn scan_agents(&self) -> FleetResult<Vec<HealthEvent>> {
        let now = Utc::now();
        let silent_after = Duration::minutes(self.config.agent_silent_after_minutes);

        let agents = self.repo.active_agents().await?;
        let mut events = Vec::new();

        for agent in &agents {
            let since_heartbeat = now - agent.last_heartbeat;
            if since_heartbeat > silent_after {
                events.push(HealthEvent::new(
                    SubjectKind::Agent,
                    agent.id,
                    HealthEventKind::AgentSilent,
                    Severity::Warning,
                    format!(
                        "agent '{}' has not sent a heartbeat for {} minutes",
                        agent.name,
                        since_heartbeat.num_minutes()
                    ),
                ));
            }

            let error_rate = agent.metrics.recent_error_rate();
            if !agent.metrics.recent_outcomes.is_empty()
                && error_rate > self.config.agent_high_error_rate
            {
                events.push(HealthEvent::new(
                    SubjectKind::Agent,
                    agent.id,
                    HealthEventKind::AgentHighErrors,
                    Severity::Warning,
                    format!(
                        "agent '{}' failed {:.0}% of its recent tasks",
                        agent.name,
                        error_rate * 100.0
                    ),
                ));
            }

            if agent.memory_utilization > 0.9 {
                events.push(HealthEvent::new(
                    SubjectKind::Agent,
                    agent.id,
                    HealthEventKind::AgentMemoryPressure,
                    Severity::Info,
                    format!(
                        "agent '{}' reports {:.0}% memory utilization",
                        agent.name,
                        agent.memory_utilization * 100.0
                    ),
                ));
            }
        }

        Ok(events)
    }

    /// Registered external sources, each isolated: one failing source is
    /// logged and skipped, the rest still contribute.
    async fn scan_external(&self) -> FleetResult<Vec<HealthEvent>> {
        let mut events = Vec::new();
        for source in &self.sources {
            match source.scan().await {
                Ok(mut source_events) => events.append(&mut source_events),
                Err(e) => {
                    error!(source = source.name(), error = %e, "signal source failed");
                }
            }
        }
        Ok(events)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use taskfleet_backends::MemoryStore;
    use taskfleet_core::{Agent, Task, TaskStatus};
    use uuid::Uuid;

    async fn store_with(tasks: Vec<Task>, agents: Vec<Agent>) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for task in tasks {
            store.insert_task(task).await.unwrap();
        }
        for agent in agents {
            store.insert_agent(agent).await.unwrap();
        }
        store
    }

    async fn monitor_over(tasks: Vec<Task>, agents: Vec<Agent>) -> HealthMonitor {
        HealthMonitor::new(
            store_with(tasks, agents).await,
            Arc::new(FleetConfig::default()),
            Vec::new(),
        )
    }

    fn stalled_task() -> Task {
        let mut task = Task::new(Uuid::new_v4(), "stalled");
        task.status = TaskStatus::InProgress;
        task.last_updated = Utc::now() - Duration::minutes(45);
        task
    }

    #[tokio::test]
    async fn test_stalled_task_detected() {
        let report = monitor_over(vec![stalled_task()], vec![]).await.run_cycle().await;
        let stalled = report.events_of_kind(HealthEventKind::TaskStalled);
        assert_eq!(stalled.len(), 1);
        assert_eq!(stalled[0].severity, Severity::Warning);
    }

    #[tokio::test]
    async fn test_fresh_task_produces_nothing() {
        let mut task = Task::new(Uuid::new_v4(), "fresh");
        task.status = TaskStatus::InProgress;
        let report = monitor_over(vec![task], vec![]).await.run_cycle().await;
        assert!(report.events.is_empty());
        assert!(report.partial_failures.is_empty());
    }

    #[tokio::test]
    async fn test_terminal_task_not_scanned() {
        let mut task = stalled_task();
        task.status = TaskStatus::Completed;
        let report = monitor_over(vec![task], vec![]).await.run_cycle().await;
        assert!(report.events.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_beats_long_running() {
        let mut task = Task::new(Uuid::new_v4(), "overdue").with_timeout(30);
        task.status = TaskStatus::InProgress;
        task.started_at = Some(Utc::now() - Duration::minutes(31));
        task.last_updated = Utc::now();
        let report = monitor_over(vec![task], vec![]).await.run_cycle().await;
        assert_eq!(report.events_of_kind(HealthEventKind::TaskTimeout).len(), 1);
        assert!(report
            .events_of_kind(HealthEventKind::TaskLongRunning)
            .is_empty());
    }

    #[tokio::test]
    async fn test_long_running_info_event() {
        let mut task = Task::new(Uuid::new_v4(), "marathon").with_timeout(600);
        task.status = TaskStatus::InProgress;
        task.started_at = Some(Utc::now() - Duration::minutes(150));
        task.last_updated = Utc::now();
        let report = monitor_over(vec![task], vec![]).await.run_cycle().await;
        let long_running = report.events_of_kind(HealthEventKind::TaskLongRunning);
        assert_eq!(long_running.len(), 1);
        assert_eq!(long_running[0].severity, Severity::Info);
    }

    #[tokio::test]
    async fn test_silent_agent_detected() {
        let mut agent = Agent::new("mute", "worker");
        agent.last_heartbeat = Utc::now() - Duration::minutes(16);
        let report = monitor_over(vec![], vec![agent]).await.run_cycle().await;
        assert_eq!(report.events_of_kind(HealthEventKind::AgentSilent).len(), 1);
    }

    #[tokio::test]
    async fn test_high_error_rate_detected() {
        let mut agent = Agent::new("flaky", "worker");
        for _ in 0..6 {
            agent.metrics.record_completion(10.0, "");
        }
        for _ in 0..4 {
            agent.metrics.record_failure();
        }
        let report = monitor_over(vec![], vec![agent]).await.run_cycle().await;
        assert_eq!(
            report.events_of_kind(HealthEventKind::AgentHighErrors).len(),
            1
        );
    }

    #[tokio::test]
    async fn test_memory_pressure_detected() {
        let mut agent = Agent::new("hungry", "worker");
        agent.memory_utilization = 0.95;
        let report = monitor_over(vec![], vec![agent]).await.run_cycle().await;
        let pressure = report.events_of_kind(HealthEventKind::AgentMemoryPressure);
        assert_eq!(pressure.len(), 1);
        assert_eq!(pressure[0].severity, Severity::Info);
    }

    #[tokio::test]
    async fn test_merge_order_tasks_before_agents() {
        let mut agent = Agent::new("mute", "worker");
        agent.last_heartbeat = Utc::now() - Duration::minutes(20);
        let report = monitor_over(vec![stalled_task()], vec![agent])
            .await
            .run_cycle()
            .await;
        assert_eq!(report.events.len(), 2);
        assert_eq!(report.events[0].kind, HealthEventKind::TaskStalled);
        assert_eq!(report.events[1].kind, HealthEventKind::AgentSilent);
    }

    struct FailingSource;

    #[async_trait]
    impl SignalSource for FailingSource {
        fn name(&self) -> &str {
            "broken"
        }
        async fn scan(&self) -> FleetResult<Vec<HealthEvent>> {
            Err(FleetError::ScanFailure("unreachable".to_string()))
        }
    }

    struct StaticSource;

    #[async_trait]
    impl SignalSource for StaticSource {
        fn name(&self) -> &str {
            "static"
        }
        async fn scan(&self) -> FleetResult<Vec<HealthEvent>> {
            Ok(vec![HealthEvent::new(
                SubjectKind::External,
                Uuid::new_v4(),
                HealthEventKind::ExternalSignal,
                Severity::Info,
                "queue depth nominal",
            )])
        }
    }

    #[tokio::test]
    async fn test_failing_source_does_not_block_others() {
        let monitor = HealthMonitor::new(
            store_with(vec![], vec![]).await,
            Arc::new(FleetConfig::default()),
            vec![Arc::new(FailingSource), Arc::new(StaticSource)],
        );
        let report = monitor.run_cycle().await;
        assert_eq!(
            report.events_of_kind(HealthEventKind::ExternalSignal).len(),
            1
        );
    }
}
