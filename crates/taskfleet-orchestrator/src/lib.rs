//! Task orchestration and fleet coordination for Taskfleet.
//!
//! Implements the scheduler core of a multi-agent work-execution platform:
//! projects decompose into task graphs, a scoring model ranks agents for
//! each ready task, a health cycle watches every active task and agent,
//! and failures resolve through reassignment, escalation, or team-level
//! negotiation. Storage, execution, and notification stay behind the
//! collaborator contracts in `taskfleet-core`.
//!
//! # Main types
//!
//! - [`FleetService`] — The facade external layers call into.
//! - [`Orchestrator`] — Per-project PLAN → DELEGATE → MONITOR →
//!   (ESCALATE | REASSIGN) → COMPLETE state machine.
//! - [`ScoringEngine`] — Pure scoring over rolling agent metrics.
//! - [`DelegationEngine`] — Candidate ranking and the compare-and-swap
//!   task hand-off.
//! - [`HealthMonitor`] / [`ActionDispatcher`] — The heartbeat cycle and
//!   its event handlers.
//! - [`TeamCoordinator`] — Negotiation, crosstalk, and work handoffs.
//! - [`EscalationManager`] — Deduplicated tracking of unresolved issues.
//! - [`HeartbeatScheduler`] — Background cadence driver.

/// Agent selection and the atomic task hand-off.
pub mod delegation;
/// Health-event handlers with exactly-once side effects.
pub mod dispatch;
/// Deduplicated escalation tracking and resolution.
pub mod escalation;
/// The periodic task/agent/external health scans.
pub mod health;
/// The per-project orchestration state machine.
pub mod orchestrator;
/// Token-bucket limits for cross-team interaction pairs.
pub mod rate_limit;
/// Background heartbeat and summary scheduling.
pub mod scheduler;
/// Performance scoring over rolling metrics.
pub mod scoring;
/// The top-level service facade.
pub mod service;
/// Team state machine and the negotiation protocol.
pub mod team;

pub use delegation::{Assignment, DelegationEngine};
pub use dispatch::{ActionDispatcher, DispatchOutcome, ExecutionTracker};
pub use escalation::EscalationManager;
pub use health::{HealthMonitor, HealthReport};
pub use orchestrator::{DelegationReport, Orchestrator};
pub use rate_limit::PairRateLimiter;
pub use scheduler::HeartbeatScheduler;
pub use scoring::ScoringEngine;
pub use service::{FleetService, FleetStatus, FleetSummary, TopPerformer};
pub use team::{NegotiationOutcome, TeamCoordinator};
