//! Core types and error definitions for the Taskfleet orchestration engine.
//!
//! This crate provides the foundational pieces shared across all Taskfleet
//! crates: the error taxonomy, the validated configuration surface, the
//! domain model (projects, tasks, agents, teams, escalations), and the
//! abstract contracts for the external collaborators the scheduler talks to.
//!
//! # Main types
//!
//! - [`FleetError`] — Unified error enum for all Taskfleet subsystems.
//! - [`FleetResult`] — Convenience alias for `Result<T, FleetError>`.
//! - [`FleetConfig`] — Configuration constructed once at startup and passed
//!   by reference into every component.
//! - [`Project`] / [`Task`] / [`Agent`] / [`Team`] — The orchestrated entities.
//! - [`Repository`] — Storage contract with optimistic-version updates.

/// Agent entity, rolling metrics, and derived performance score.
pub mod agent;
/// Collaborator contracts: execution, notification, audit, external signals.
pub mod collaborators;
/// Configuration surface with load-time validation.
pub mod config;
/// Escalation records deduplicated by trigger key.
pub mod escalation;
/// Health events produced by the monitor and consumed by the dispatcher.
pub mod event;
/// Project entity and orchestrator phase.
pub mod project;
/// Storage contract (CRUD + compare-and-swap updates).
pub mod repository;
/// Task entity and dependency helpers.
pub mod task;
/// Team entity, link permissions, and negotiation messages.
pub mod team;

pub use agent::{Agent, AgentMetrics, AgentScore, AgentStatus, HeartbeatReport, Trend};
pub use collaborators::{
    AuditEvent, AuditSink, ExecutionBackend, ExecutionHandle, Notification, Notifier, SignalSource,
};
pub use config::{FleetConfig, ScoreWeights, SelectionStrategy};
pub use escalation::{Escalation, EscalationKind, EscalationStatus};
pub use event::{HealthEvent, HealthEventKind, Severity, SubjectKind};
pub use project::{
    OrchestratorPhase, Project, ProjectRequest, ProjectStatus, ProjectSummary, TaskSpec,
};
pub use repository::Repository;
pub use task::{Task, TaskOutcome, TaskPriority, TaskStatus};
pub use team::{
    Handoff, HandoffPayload, HandoffStatus, LinkMode, NegotiationKind, NegotiationMessage, Team,
    TeamLink, TeamState, VoteChoice,
};

// --- Error types ---

/// Top-level error type for the Taskfleet scheduler.
///
/// Recoverable variants ([`FleetError::NoEligibleAgent`],
/// [`FleetError::AssignmentConflict`]) are retried by their callers;
/// everything that cannot self-resolve inside the scheduler is surfaced as
/// an escalation instead of an error.
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    /// Task decomposition produced an empty or cyclic graph. Fatal to PLAN.
    #[error("Decomposition error: {0}")]
    Decomposition(String),

    /// No agent passed the candidate filter for a task. The task stays
    /// pending and is retried on the next delegation pass.
    #[error("No eligible agent: {0}")]
    NoEligibleAgent(String),

    /// An optimistic-version check failed because another writer got there
    /// first. Retried immediately against fresh state.
    #[error("Concurrent assignment conflict: {0}")]
    AssignmentConflict(String),

    /// A task exhausted its retry budget. Raises an escalation and marks
    /// the task failed.
    #[error("Retry budget exhausted: {0}")]
    RetryExhausted(String),

    /// A negotiation deadline elapsed without quorum. The team is marked
    /// escalated.
    #[error("Negotiation timeout: {0}")]
    NegotiationTimeout(String),

    /// An invalid negotiation action (wrong voter, no open proposal, ...).
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    /// A cross-team action without a permission record for that mode.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// A cross-team action exceeded the pair rate limit.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// One of the health scans failed; the cycle continues with the others.
    #[error("Health scan failure: {0}")]
    ScanFailure(String),

    /// Invalid configuration, including a weight vector that does not sum
    /// to 1.0. Fatal at load time.
    #[error("Config error: {0}")]
    Config(String),

    /// A requested entity does not exist in the store.
    #[error("Not found: {0}")]
    NotFound(String),

    /// An error from the storage collaborator.
    #[error("Store error: {0}")]
    Store(String),

    /// An error from the execution collaborator.
    #[error("Execution error: {0}")]
    Execution(String),

    /// An error from the notification collaborator.
    #[error("Notification error: {0}")]
    Notification(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`FleetError`].
pub type FleetResult<T> = Result<T, FleetError>;
