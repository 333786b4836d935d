//! Core types and error definitions for Taskweave.
//!
//! This crate provides the foundational types shared across all Taskweave
//! crates: the error taxonomy, configuration, tracing setup, the [`Task`]
//! entity with its status state machine, and the feedback/notice records
//! exchanged between components.
//!
//! # Main types
//!
//! - [`TaskweaveError`] — Unified error enum for all Taskweave subsystems.
//! - [`TaskweaveResult`] — Convenience alias for `Result<T, TaskweaveError>`.
//! - [`Task`] / [`TaskStatus`] / [`TaskType`] — The unit of work and its legal transitions.
//! - [`FeedbackEvent`] — A worker's report of a non-fatal blocking condition.
//! - [`Notice`] — An entry in the append-only inter-component log.
//! - [`TaskweaveConfig`] — TOML-backed configuration.

/// TOML configuration.
pub mod config;
/// Error taxonomy.
pub mod error;
/// Feedback event types.
pub mod feedback;
/// Inter-component notices.
pub mod notice;
/// Task entity and state machine.
pub mod task;
/// Tracing subscriber setup.
pub mod telemetry;

pub use config::{
    BackendsConfig, CompletionPolicy, DispatcherConfig, FeedbackConfig, ManagerConfig, RoleConfig,
    TaskweaveConfig,
};
pub use error::{TaskweaveError, TaskweaveResult};
pub use feedback::{FeedbackEvent, FeedbackType, Severity};
pub use notice::Notice;
pub use task::{ReviewRecord, ReviewStatus, Task, TaskId, TaskStatus, TaskType};
pub use telemetry::{init_tracing, LogFormat};
