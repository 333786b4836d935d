//! Relational persistence for Taskweave.
//!
//! Tasks, the append-only notice log and feedback events live in one SQLite
//! database. Callers depend on the [`TaskStore`], [`NoticeLog`] and
//! [`FeedbackStore`] traits; [`SqliteStore`] implements all three.

/// SQLite implementation.
pub mod sqlite;
/// Storage traits and query types.
pub mod store;

pub use sqlite::{task_key, SqliteStore};
pub use store::{FeedbackStats, FeedbackStore, NoticeLog, TaskFilter, TaskStore};
