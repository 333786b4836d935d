use crate::error::{TaskweaveError, TaskweaveResult};
use crate::task::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Kind of condition a worker reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackType {
    /// The worker needs output from a task that has not produced it yet.
    DependencyNeeded,
    /// The instructions admit more than one reading.
    AmbiguousInstructions,
    /// The same step keeps failing.
    RepeatedFailure,
    /// A backend or external resource is unreachable.
    ResourceUnavailable,
    /// A side-effecting operation returned an error.
    ToolFailure,
    /// Anything the other kinds do not cover.
    Other,
}

impl FeedbackType {
    /// Every feedback type.
    pub const ALL: [FeedbackType; 6] = [
        FeedbackType::DependencyNeeded,
        FeedbackType::AmbiguousInstructions,
        FeedbackType::RepeatedFailure,
        FeedbackType::ResourceUnavailable,
        FeedbackType::ToolFailure,
        FeedbackType::Other,
    ];

    /// Stable snake_case name, as stored and serialized.
    pub fn as_str(self) -> &'static str {
        match self {
            FeedbackType::DependencyNeeded => "dependency_needed",
            FeedbackType::AmbiguousInstructions => "ambiguous_instructions",
            FeedbackType::RepeatedFailure => "repeated_failure",
            FeedbackType::ResourceUnavailable => "resource_unavailable",
            FeedbackType::ToolFailure => "tool_failure",
            FeedbackType::Other => "other",
        }
    }
}

impl fmt::Display for FeedbackType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeedbackType {
    type Err = TaskweaveError;

    fn from_str(s: &str) -> TaskweaveResult<Self> {
        FeedbackType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| TaskweaveError::Storage(format!("unknown feedback type '{s}'")))
    }
}

/// How urgently a feedback event needs attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational, nothing is stuck.
    Info,
    /// Progress is impaired.
    Warning,
    /// The task cannot proceed.
    Critical,
}

impl Severity {
    /// Lowercase name, as stored and serialized.
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = TaskweaveError;

    fn from_str(s: &str) -> TaskweaveResult<Self> {
        match s {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "critical" => Ok(Severity::Critical),
            other => Err(TaskweaveError::Storage(format!("unknown severity '{other}'"))),
        }
    }
}

/// A typed message from a worker reporting a non-fatal blocking condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackEvent {
    /// Unique event id.
    pub id: Uuid,
    /// Task the condition affects.
    pub task_id: TaskId,
    /// Name of the emitting worker.
    pub worker: String,
    /// What kind of condition was hit.
    pub event_type: FeedbackType,
    /// How urgent it is.
    pub severity: Severity,
    /// Human-readable description.
    pub message: String,
    /// Structured details supplied by the worker.
    #[serde(default)]
    pub context: serde_json::Value,
    /// What the worker thinks would unblock it.
    pub suggested_remedy: Option<String>,
    /// When the worker published it.
    pub created_at: DateTime<Utc>,
    /// Set once every registered handler has run.
    pub processed: bool,
    /// When processing finished.
    pub processed_at: Option<DateTime<Utc>>,
    /// Errors returned by handlers, joined.
    pub processing_error: Option<String>,
}

impl FeedbackEvent {
    /// An unprocessed event stamped now.
    pub fn new(
        task_id: TaskId,
        worker: impl Into<String>,
        event_type: FeedbackType,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            worker: worker.into(),
            event_type,
            severity,
            message: message.into(),
            context: serde_json::Value::Null,
            suggested_remedy: None,
            created_at: Utc::now(),
            processed: false,
            processed_at: None,
            processing_error: None,
        }
    }

    /// Attach structured context.
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    /// Attach a suggested remedy.
    pub fn with_remedy(mut self, remedy: impl Into<String>) -> Self {
        self.suggested_remedy = Some(remedy.into());
        self
    }
}
