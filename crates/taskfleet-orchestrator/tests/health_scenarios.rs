//! Health cycle scenarios: timeouts, stalls, silent agents, retry budgets,
//! and escalation deduplication, driven end to end through the service.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use chrono::{Duration, Utc};
use std::sync::Arc;
use taskfleet_backends::{MemoryAuditLog, MemoryNotifier, MemoryStore, MockExecutor};
use taskfleet_core::{
    Agent, AgentStatus, EscalationKind, EscalationStatus, FleetConfig, FleetError,
    HeartbeatReport, ProjectRequest, ProjectStatus, Repository, Severity, TaskSpec, TaskStatus,
};
use taskfleet_orchestrator::FleetService;
use uuid::Uuid;

struct Harness {
    service: FleetService,
    store: Arc<MemoryStore>,
    executor: Arc<MockExecutor>,
    notifier: Arc<MemoryNotifier>,
    audit: Arc<MemoryAuditLog>,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let executor = Arc::new(MockExecutor::new());
    let notifier = Arc::new(MemoryNotifier::new());
    let audit = Arc::new(MemoryAuditLog::new());
    let service = FleetService::new(
        FleetConfig::default(),
        Arc::clone(&store) as Arc<dyn Repository>,
        executor.clone(),
        notifier.clone(),
        audit.clone(),
    )
    .unwrap();
    Harness {
        service,
        store,
        executor,
        notifier,
        audit,
    }
}

fn rust_agent(name: &str) -> Agent {
    Agent::new(name, "worker").with_skills(vec!["rust".to_string()])
}

/// Create a one-task project and return (project_id, task_id).
async fn running_task(h: &Harness, timeout_minutes: i64) -> (Uuid, Uuid) {
    let project = h
        .service
        .create_project(ProjectRequest::new(
            "p",
            vec![TaskSpec::new("work")
                .with_skills(vec!["rust".to_string()])
                .with_timeout(timeout_minutes)],
        ))
        .await
        .unwrap();
    let task = &h.store.tasks_for_project(project.id).await.unwrap()[0];
    assert_eq!(task.status, TaskStatus::InProgress);
    (project.id, task.id)
}

async fn backdate_started(h: &Harness, task_id: Uuid, minutes: i64) {
    let mut task = h.store.task(task_id).await.unwrap();
    task.started_at = Some(Utc::now() - Duration::minutes(minutes));
    task.last_updated = Utc::now();
    h.store.update_task(task).await.unwrap();
}

async fn backdate_last_updated(h: &Harness, task_id: Uuid, minutes: i64) {
    let mut task = h.store.task(task_id).await.unwrap();
    task.last_updated = Utc::now() - Duration::minutes(minutes);
    h.store.update_task(task).await.unwrap();
}

async fn backdate_heartbeat(h: &Harness, agent_id: Uuid, minutes: i64) {
    let mut agent = h.store.agent(agent_id).await.unwrap();
    agent.last_heartbeat = Utc::now() - Duration::minutes(minutes);
    h.store.update_agent(agent).await.unwrap();
}

/// Age the open escalation for a key so the next cycle sees it as
/// persistent.
async fn age_escalation(h: &Harness, trigger_key: &str, minutes: i64) {
    let mut esc = h
        .store
        .open_escalation_by_key(trigger_key)
        .await
        .unwrap()
        .unwrap();
    esc.created_at = Utc::now() - Duration::minutes(minutes);
    h.store.update_escalation(esc).await.unwrap();
}

// ---------------------------------------------------------------------------
// Scenario: task times out, execution is cancelled, task requeued once.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_timeout_cancels_and_requeues_with_one_retry() {
    let h = harness();
    let agent = h.service.register_agent(rust_agent("atlas")).await.unwrap();
    let (_, task_id) = running_task(&h, 30).await;

    // Take the only agent out of rotation so the requeued task stays
    // pending, making the end state of the scenario observable.
    let mut stored = h.store.agent(agent.id).await.unwrap();
    stored.status = AgentStatus::Disabled;
    h.store.update_agent(stored).await.unwrap();

    // 31 minutes with no progress against a 30 minute budget.
    backdate_started(&h, task_id, 31).await;

    let report = h.service.run_health_cycle().await;
    assert_eq!(
        report
            .events_of_kind(taskfleet_core::HealthEventKind::TaskTimeout)
            .len(),
        1
    );

    // Execution cancelled, task back to pending with one retry spent.
    assert!(h.executor.was_cancelled(task_id).await);
    let task = h.store.task(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.retry_count, 1);
    assert!(task.started_at.is_none());

    // The timeout record closed when the requeue succeeded, so a future
    // timeout opens a fresh one.
    let key = format!("{}:{task_id}", EscalationKind::TaskTimeout);
    assert!(h.store.open_escalation_by_key(&key).await.unwrap().is_none());

    let subjects = h.notifier.subjects().await;
    assert!(subjects.iter().any(|s| s.contains("task_timeout")));
}

#[tokio::test]
async fn test_timeout_redelegates_when_capacity_exists() {
    let h = harness();
    h.service.register_agent(rust_agent("atlas")).await.unwrap();
    let (_, task_id) = running_task(&h, 30).await;
    backdate_started(&h, task_id, 31).await;

    h.service.run_health_cycle().await;

    let task = h.store.task(task_id).await.unwrap();
    assert_eq!(task.retry_count, 1);
    // Capacity was available, so the task went straight back out and the
    // cycle relaunched it with a fresh clock.
    assert_eq!(task.status, TaskStatus::InProgress);
    assert!(task.started_at.unwrap() > Utc::now() - Duration::minutes(1));
}

// ---------------------------------------------------------------------------
// Scenario: stalled task — dedup while open, human hand-off if persistent.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_stalled_escalation_not_duplicated_across_cycles() {
    let h = harness();
    h.service.register_agent(rust_agent("atlas")).await.unwrap();
    let (_, task_id) = running_task(&h, 600).await;
    backdate_last_updated(&h, task_id, 45).await;

    h.service.run_health_cycle().await;
    backdate_last_updated(&h, task_id, 46).await;
    h.service.run_health_cycle().await;

    let open = h.store.open_escalations().await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].kind, EscalationKind::TaskStalled);

    // Side effects fired once: one stalled notification, not two.
    let stalled_notes = h
        .notifier
        .subjects()
        .await
        .iter()
        .filter(|s| *s == "task_stalled")
        .count();
    assert_eq!(stalled_notes, 1);
}

#[tokio::test]
async fn test_persistent_stall_goes_to_human() {
    let h = harness();
    h.service.register_agent(rust_agent("atlas")).await.unwrap();
    let (_, task_id) = running_task(&h, 600).await;
    backdate_last_updated(&h, task_id, 45).await;

    h.service.run_health_cycle().await;
    let key = format!("{}:{task_id}", EscalationKind::TaskStalled);
    age_escalation(&h, &key, 10).await;
    backdate_last_updated(&h, task_id, 46).await;

    h.service.run_health_cycle().await;
    let esc = h.store.open_escalation_by_key(&key).await.unwrap().unwrap();
    assert_eq!(esc.status, EscalationStatus::AwaitingHuman);
}

#[tokio::test]
async fn test_cleared_stall_auto_resolves() {
    let h = harness();
    h.service.register_agent(rust_agent("atlas")).await.unwrap();
    let (_, task_id) = running_task(&h, 600).await;
    backdate_last_updated(&h, task_id, 45).await;

    h.service.run_health_cycle().await;
    assert_eq!(h.store.open_escalations().await.unwrap().len(), 1);

    // Progress arrives; the next cycle sees no stall and closes the record.
    h.service
        .report_task_progress(task_id, 50, "back on track")
        .await
        .unwrap();
    h.service.run_health_cycle().await;
    assert!(h.store.open_escalations().await.unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Scenario: silent agent — restart, reassign, degrade, disable on repeat.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_silent_agent_degraded_and_tasks_requeued() {
    let h = harness();
    let agent = h.service.register_agent(rust_agent("mute")).await.unwrap();
    let (_, task_id) = running_task(&h, 600).await;
    backdate_heartbeat(&h, agent.id, 16).await;

    h.service.run_health_cycle().await;

    let stored = h.store.agent(agent.id).await.unwrap();
    assert_eq!(stored.status, AgentStatus::Error);
    assert!(stored.current_tasks.is_empty());

    let task = h.store.task(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.retry_count, 1);

    let subjects = h.notifier.subjects().await;
    assert!(subjects.iter().any(|s| s.contains("restart requested")));
}

#[tokio::test]
async fn test_silence_past_second_cycle_disables_agent() {
    let h = harness();
    let agent = h.service.register_agent(rust_agent("mute")).await.unwrap();
    backdate_heartbeat(&h, agent.id, 16).await;

    h.service.run_health_cycle().await;
    let key = format!("{}:{}", EscalationKind::AgentSilent, agent.id);
    age_escalation(&h, &key, 10).await;
    backdate_heartbeat(&h, agent.id, 20).await;

    h.service.run_health_cycle().await;
    let stored = h.store.agent(agent.id).await.unwrap();
    assert_eq!(stored.status, AgentStatus::Disabled);
}

#[tokio::test]
async fn test_heartbeat_recovers_degraded_agent() {
    let h = harness();
    let agent = h.service.register_agent(rust_agent("mute")).await.unwrap();
    backdate_heartbeat(&h, agent.id, 16).await;
    h.service.run_health_cycle().await;
    assert_eq!(
        h.store.agent(agent.id).await.unwrap().status,
        AgentStatus::Error
    );

    h.service
        .agent_heartbeat(
            agent.id,
            HeartbeatReport {
                memory_utilization: Some(0.4),
                confidence: Some(80.0),
            },
        )
        .await
        .unwrap();

    let stored = h.store.agent(agent.id).await.unwrap();
    assert_eq!(stored.status, AgentStatus::Idle);
    assert_eq!(stored.memory_utilization, 0.4);
    let key = format!("{}:{}", EscalationKind::AgentSilent, agent.id);
    assert!(h.store.open_escalation_by_key(&key).await.unwrap().is_none());
}

// ---------------------------------------------------------------------------
// Scenario: high error rate — reduced assignments, disable on repeat.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_high_error_rate_reduces_assignments() {
    let h = harness();
    let mut flaky = rust_agent("flaky").with_concurrency(3);
    for _ in 0..6 {
        flaky.metrics.record_completion(10.0, "");
    }
    for _ in 0..4 {
        flaky.metrics.record_failure();
    }
    let agent = h.service.register_agent(flaky).await.unwrap();

    h.service.run_health_cycle().await;

    let stored = h.store.agent(agent.id).await.unwrap();
    assert_eq!(stored.max_concurrent_tasks, 2);
    let subjects = h.notifier.subjects().await;
    assert!(subjects.iter().any(|s| s.contains("reflection")));

    // Still failing a cycle later: out of rotation.
    let key = format!("{}:{}", EscalationKind::AgentHighErrors, agent.id);
    age_escalation(&h, &key, 10).await;
    h.service.run_health_cycle().await;
    assert_eq!(
        h.store.agent(agent.id).await.unwrap().status,
        AgentStatus::Disabled
    );
}

// ---------------------------------------------------------------------------
// Scenario: retry budget.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_reassignment_never_exceeds_max_retries() {
    let h = harness();
    h.service.register_agent(rust_agent("atlas")).await.unwrap();
    let (_, task_id) = running_task(&h, 600).await;

    // max_retries defaults to 3: three reassignments succeed.
    for expected in 1..=3 {
        let task = h.service.reassign_task(task_id).await.unwrap();
        assert_eq!(task.retry_count, expected);
    }

    // The fourth attempt fails the task instead of reassigning again.
    let err = h.service.reassign_task(task_id).await.unwrap_err();
    assert!(matches!(err, FleetError::RetryExhausted(_)));

    let task = h.store.task(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 4);

    let key = format!("{}:{task_id}", EscalationKind::RetryExhausted);
    let esc = h.store.open_escalation_by_key(&key).await.unwrap().unwrap();
    assert_eq!(esc.status, EscalationStatus::AwaitingHuman);
}

#[tokio::test]
async fn test_failed_task_keeps_project_open() {
    let h = harness();
    h.service.register_agent(rust_agent("atlas")).await.unwrap();
    let (project_id, task_id) = running_task(&h, 600).await;

    for _ in 0..3 {
        h.service.reassign_task(task_id).await.unwrap();
    }
    let _ = h.service.reassign_task(task_id).await;

    let project = h.store.project(project_id).await.unwrap();
    assert_ne!(project.status, ProjectStatus::Completed);
}

// ---------------------------------------------------------------------------
// Scenario: critical escalation pauses the project; resolution resumes it.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_critical_escalation_pauses_and_resolution_resumes() {
    let h = harness();
    h.service.register_agent(rust_agent("atlas")).await.unwrap();
    let (project_id, _) = running_task(&h, 600).await;

    h.service
        .escalate_project(
            project_id,
            EscalationKind::ExternalSignal,
            Severity::Critical,
            "execution sandbox pool is unreachable",
        )
        .await
        .unwrap();

    let project = h.store.project(project_id).await.unwrap();
    assert_eq!(project.status, ProjectStatus::Paused);

    let esc = &h.store.open_escalations().await.unwrap()[0];
    let resolved = h
        .service
        .resolve_escalation(esc.id, "pool restarted")
        .await
        .unwrap();
    assert_eq!(resolved.status, EscalationStatus::Resolved);

    let project = h.store.project(project_id).await.unwrap();
    assert_eq!(project.status, ProjectStatus::Active);
}

// ---------------------------------------------------------------------------
// Audit ordering: the cancel precedes the requeue in the log.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_audit_order_timeout_before_reassignment_effects() {
    let h = harness();
    h.service.register_agent(rust_agent("atlas")).await.unwrap();
    let (_, task_id) = running_task(&h, 30).await;
    backdate_started(&h, task_id, 31).await;

    h.service.run_health_cycle().await;

    let events = h.audit.events().await;
    let dispatch_pos = events
        .iter()
        .position(|e| e.action == "health_event_dispatched")
        .unwrap();
    let detail = &events[dispatch_pos].details;
    let actions: Vec<String> = detail["actions"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    let cancelled = actions.iter().position(|a| a == "task_cancelled").unwrap();
    let requeued = actions.iter().position(|a| a == "task_requeued").unwrap();
    assert!(cancelled < requeued);
}
