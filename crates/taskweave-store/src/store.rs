use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use taskweave_core::{FeedbackEvent, Notice, Task, TaskId, TaskStatus, TaskType, TaskweaveResult};

/// Criteria for [`TaskStore::list`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    /// Only tasks in this status.
    pub status: Option<TaskStatus>,
    /// Only tasks assigned to this worker.
    pub assignee: Option<String>,
    /// Only tasks of this type.
    pub task_type: Option<TaskType>,
    /// Only direct children of this task.
    pub parent_id: Option<TaskId>,
    /// At most this many rows.
    pub limit: Option<usize>,
}

impl TaskFilter {
    /// Tasks in `status`.
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Direct children of `parent_id`.
    pub fn children_of(parent_id: TaskId) -> Self {
        Self {
            parent_id: Some(parent_id),
            ..Self::default()
        }
    }

    /// Narrow to one assignee.
    pub fn with_assignee(mut self, assignee: impl Into<String>) -> Self {
        self.assignee = Some(assignee.into());
        self
    }

    /// Narrow to one task type.
    pub fn with_type(mut self, task_type: TaskType) -> Self {
        self.task_type = Some(task_type);
        self
    }

    /// Cap the number of rows.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Durable task storage.
///
/// Every mutation is a whole-record write; callers that read-modify-write the
/// same task concurrently must serialize among themselves.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new task and return it with its id and key filled in.
    async fn insert(&self, task: &Task) -> TaskweaveResult<Task>;
    /// Task by row id.
    async fn get(&self, id: TaskId) -> TaskweaveResult<Option<Task>>;
    /// Task by `TASK-nnnn` key.
    async fn get_by_key(&self, key: &str) -> TaskweaveResult<Option<Task>>;
    /// Overwrite every mutable column. The key is never rewritten.
    async fn update(&self, task: &Task) -> TaskweaveResult<()>;
    /// Record that `blocked_key` waits on `key`, touching only the `blocks`
    /// list of the stored record. Appending an existing entry does nothing.
    async fn append_blocked(&self, key: &str, blocked_key: &str) -> TaskweaveResult<()>;
    /// Returns whether a row was removed.
    async fn delete(&self, id: TaskId) -> TaskweaveResult<bool>;
    /// Matching tasks ordered by priority (highest first), then creation.
    async fn list(&self, filter: &TaskFilter) -> TaskweaveResult<Vec<Task>>;
    /// Tasks whose dependency list contains `key`.
    async fn dependents_of(&self, key: &str) -> TaskweaveResult<Vec<Task>>;
}

/// Append-only log of notices exchanged between components.
#[async_trait]
pub trait NoticeLog: Send + Sync {
    /// Append a notice and return its row id.
    async fn append(&self, notice: &Notice) -> TaskweaveResult<i64>;
    /// Newest first. With a recipient, returns notices addressed to it plus broadcasts.
    async fn notices(&self, recipient: Option<&str>, limit: usize) -> TaskweaveResult<Vec<Notice>>;
    /// Every notice that references `key`, oldest first.
    async fn notices_about(&self, key: &str) -> TaskweaveResult<Vec<Notice>>;
}

/// Durable record of feedback events.
#[async_trait]
pub trait FeedbackStore: Send + Sync {
    /// Insert or overwrite the event with the same id.
    async fn record(&self, event: &FeedbackEvent) -> TaskweaveResult<()>;
    /// Events for one task, oldest first.
    async fn events_for_task(&self, task_id: TaskId) -> TaskweaveResult<Vec<FeedbackEvent>>;
    /// Oldest unprocessed events first, at most `limit`.
    async fn unprocessed(&self, limit: usize) -> TaskweaveResult<Vec<FeedbackEvent>>;
    /// Aggregates over all events; mean latency only over events created within `window`.
    async fn stats(&self, window: Duration) -> TaskweaveResult<FeedbackStats>;
}

/// Aggregate view of the feedback table.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeedbackStats {
    /// Events recorded.
    pub total: usize,
    /// Events no handler pass has finished.
    pub unprocessed: usize,
    /// Counts keyed by feedback type.
    pub by_type: BTreeMap<String, usize>,
    /// Counts keyed by severity.
    pub by_severity: BTreeMap<String, usize>,
    /// Mean of `processed_at - created_at` in milliseconds, `None` if nothing
    /// in the window was processed.
    pub mean_latency_ms: Option<f64>,
}
