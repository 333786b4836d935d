//! Task orchestration for Taskweave.
//!
//! Implements the manager-workers pattern: a request is decomposed into a
//! plan of dependent tasks, each task is validated before it starts and
//! before it finishes, executed by a specialized worker on a shared backend
//! instance, and rolled up into its parent once every subtask is done.
//!
//! # Main types
//!
//! - [`TaskQueue`] — Persistent task lifecycle with dependency unblocking and parent roll-up.
//! - [`Manager`] — Planner/executor walking a plan through the worker registry.
//! - [`Coordinator`] — Fire-and-forget dispatcher with a global concurrency cap.
//! - [`FeedbackChannel`] — Bounded channel routing worker feedback to handlers.
//! - [`WorkerRegistry`] / [`WorkerPool`] — Worker lookup and load-aware selection.
//! - [`WorkerMonitor`] — Per-worker activity and metrics.
//! - [`Runtime`] — Wires every component from a [`taskweave_core::TaskweaveConfig`].

/// Background dispatcher for delegated requests.
pub mod coordinator;
/// Worker feedback channel and handlers.
pub mod feedback;
/// Planner/executor.
pub mod manager;
/// Worker activity and metrics.
pub mod monitor;
/// Request decomposition.
pub mod planner;
/// Component wiring and process-wide handle.
pub mod runtime;
/// Persistent task queue.
pub mod task_queue;
/// Readiness and completion gates.
pub mod validation;
/// Worker trait, registry and pool.
pub mod worker;

pub use coordinator::{Coordinator, DelegationState, DelegationStatus};
pub use feedback::{FeedbackChannel, FeedbackHandler};
pub use manager::{BlockingHandler, Escalation, LogEscalation, Manager, Plan, PlanOutcome};
pub use monitor::{WorkerActivity, WorkerMetrics, WorkerMonitor, WorkerState};
pub use planner::{DecompositionStrategy, HeuristicDecomposer, PlanDraft, SubtaskDraft};
pub use runtime::{global, install_global, Runtime};
pub use task_queue::{QueueStats, TaskQueue, ROLL_UP_ASSIGNEE};
pub use validation::{
    completion_issues, readiness_issues, validate_completion, validate_readiness,
};
pub use worker::{
    role_for_type, ExecutionContext, PoolSlot, UpstreamResult, Worker, WorkerOutput,
    WorkerPool, WorkerRegistry,
};
