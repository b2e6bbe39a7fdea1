//! In-process implementations of the Taskfleet collaborator contracts.
//!
//! These back the integration tests and give embedders working defaults:
//! the scheduler itself only ever sees the traits from `taskfleet-core`.
//!
//! # Main types
//!
//! - [`MemoryStore`] — In-memory [`taskfleet_core::Repository`] with
//!   optimistic-version updates and atomic escalation upsert.
//! - [`JsonlAuditLog`] — Append-only JSONL audit sink.
//! - [`MemoryAuditLog`] / [`MemoryNotifier`] — Capturing sinks for tests.
//! - [`TracingNotifier`] — Notification sink that logs through `tracing`.
//! - [`MockExecutor`] — Execution backend that records starts and cancels.

/// JSONL and in-memory audit sinks.
pub mod audit;
/// Mock execution backend.
pub mod exec;
/// In-memory repository with optimistic concurrency.
pub mod memory;
/// Tracing-based and in-memory notifiers.
pub mod notify;

pub use audit::{JsonlAuditLog, MemoryAuditLog};
pub use exec::MockExecutor;
pub use memory::MemoryStore;
pub use notify::{MemoryNotifier, TracingNotifier};
