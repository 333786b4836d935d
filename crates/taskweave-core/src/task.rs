use crate::error::{TaskweaveError, TaskweaveResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Numeric row id of a task.
pub type TaskId = i64;

/// Metadata key holding the reason a task was blocked.
pub const META_BLOCK_REASON: &str = "block_reason";
/// Metadata key holding the accumulated error history (JSON array of strings).
pub const META_ERROR_HISTORY: &str = "error_history";
/// Metadata key holding files a worker reported as created.
pub const META_CREATED_FILES: &str = "created_files";
/// Metadata key holding errors a worker reported while producing its result.
pub const META_ERRORS: &str = "errors";
/// Input key holding the working path extracted from a request.
pub const INPUT_WORKING_PATH: &str = "working_path";

/// Status of a task. `Blocked` is orthogonal to the main
/// new → ready → assigned → in_progress → (in_review) → done/failed path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, readiness not yet validated.
    New,
    /// Readiness holds and no dependency is outstanding.
    Ready,
    /// Claimed by a worker that has not started.
    Assigned,
    /// Being worked on.
    InProgress,
    /// Awaiting a reviewer's decision.
    InReview,
    /// Completed with its criteria met. Terminal.
    Done,
    /// Gave up. Only a retry leaves this state.
    Failed,
    /// Parked until a dependency resolves or a condition clears.
    Blocked,
}

impl TaskStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [TaskStatus; 8] = [
        TaskStatus::New,
        TaskStatus::Ready,
        TaskStatus::Assigned,
        TaskStatus::InProgress,
        TaskStatus::InReview,
        TaskStatus::Done,
        TaskStatus::Failed,
        TaskStatus::Blocked,
    ];

    /// Statuses reachable from `self` in one step.
    pub fn allowed_transitions(self) -> &'static [TaskStatus] {
        use TaskStatus::*;
        match self {
            New => &[Ready, Blocked],
            Ready => &[Assigned, Blocked],
            Assigned => &[InProgress, Ready, Blocked],
            InProgress => &[InReview, Blocked, Failed, Done],
            InReview => &[Done, InProgress, Failed],
            Blocked => &[Ready, Assigned, InProgress, Failed],
            Done => &[],
            Failed => &[Ready],
        }
    }

    /// Whether `self → to` is a legal transition.
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        self.allowed_transitions().contains(&to)
    }

    /// Fail with [`TaskweaveError::InvalidTransition`] unless `self → to` is legal.
    pub fn ensure_transition(self, to: TaskStatus) -> TaskweaveResult<()> {
        if self.can_transition_to(to) {
            Ok(())
        } else {
            Err(TaskweaveError::InvalidTransition {
                from: self.to_string(),
                to: to.to_string(),
            })
        }
    }

    /// `Done` is the only terminal-success status.
    pub fn is_terminal_success(self) -> bool {
        self == TaskStatus::Done
    }

    /// Terminal for scheduling purposes: `Done` never moves again and
    /// `Failed` only moves through an explicit retry.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }

    /// Stable lowercase name used for storage and display.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::New => "new",
            TaskStatus::Ready => "ready",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::InReview => "in_review",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Blocked => "blocked",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = TaskweaveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| TaskweaveError::Storage(format!("unknown task status '{s}'")))
    }
}

/// Kind of work a task represents. Closed set; routing to a worker role is
/// derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    /// Produce code or other content.
    Generation,
    /// Write or run tests against existing work.
    Validation,
    /// Inspect artifacts and decide on approval.
    Review,
    /// Gather information.
    Research,
    /// Examine an existing subject and report.
    Analysis,
    /// Anything else, including plan roots.
    General,
}

impl TaskType {
    /// Every task type.
    pub const ALL: [TaskType; 6] = [
        TaskType::Generation,
        TaskType::Validation,
        TaskType::Review,
        TaskType::Research,
        TaskType::Analysis,
        TaskType::General,
    ];

    /// Stable lowercase name used for storage and display.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::Generation => "generation",
            TaskType::Validation => "validation",
            TaskType::Review => "review",
            TaskType::Research => "research",
            TaskType::Analysis => "analysis",
            TaskType::General => "general",
        }
    }

    /// Readiness criteria a freshly created task of this type starts with.
    pub fn default_readiness_criteria(self) -> Vec<String> {
        let criteria: &[&str] = match self {
            TaskType::Generation => &["requirements are understood", "target location is known"],
            TaskType::Validation => &["code under test exists", "expected behavior is known"],
            TaskType::Review => &["artifacts to review are available"],
            TaskType::Research => &["research question is defined"],
            TaskType::Analysis => &["subject of analysis is available"],
            TaskType::General => &["task is described"],
        };
        criteria.iter().map(|c| (*c).to_string()).collect()
    }

    /// Completion criteria a freshly created task of this type starts with.
    pub fn default_completion_criteria(self) -> Vec<String> {
        let criteria: &[&str] = match self {
            TaskType::Generation => &["code is written", "code builds without errors"],
            TaskType::Validation => &["tests are written", "tests pass"],
            TaskType::Review => &["review comments recorded", "approval decision made"],
            TaskType::Research => &["findings are documented"],
            TaskType::Analysis => &["analysis report is produced"],
            TaskType::General => &["deliverable is produced"],
        };
        criteria.iter().map(|c| (*c).to_string()).collect()
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = TaskweaveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| TaskweaveError::validation(format!("unknown task type '{s}'")))
    }
}

/// Outcome of a review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    /// No decision yet.
    Pending,
    /// Accepted as is.
    Approved,
    /// Sent back for rework.
    ChangesRequested,
}

/// Review sub-record attached to a task once review is requested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRecord {
    /// Who was asked to review.
    pub reviewer: String,
    /// Current decision.
    pub status: ReviewStatus,
    /// Reviewer comments in the order given.
    #[serde(default)]
    pub comments: Vec<String>,
}

/// A unit of work tracked through [`TaskStatus`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Row id, assigned by the store on insert (0 before that).
    pub id: TaskId,
    /// Sequential key (`TASK-0001`), assigned once on insert and never changed.
    pub key: String,
    /// Task this one was decomposed from.
    pub parent_id: Option<TaskId>,
    /// Short summary.
    pub title: String,
    /// What has to be done.
    pub description: String,
    /// Kind of work, which selects the worker role.
    pub task_type: TaskType,
    /// Worker currently responsible for the task.
    pub assignee: Option<String>,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// Higher runs first.
    pub priority: i32,
    /// Conditions checked before the task may become ready.
    pub readiness_criteria: Vec<String>,
    /// Set when readiness validation passed.
    pub readiness_criteria_met: bool,
    /// Conditions checked before the task may be marked done.
    pub completion_criteria: Vec<String>,
    /// Set together with the `done` status.
    pub completion_criteria_met: bool,
    /// Keys of tasks that must reach `done` first.
    pub dependencies: Vec<String>,
    /// Keys of tasks waiting on this one. Advisory only.
    pub blocks: Vec<String>,
    /// Structured input such as the working path or upstream keys.
    #[serde(default)]
    pub input: HashMap<String, serde_json::Value>,
    /// Worker output recorded on completion.
    pub result: Option<String>,
    /// Free-form annotations: block reason, error history, created files.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Ids of artifacts the task produced.
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// Review sub-record, once a review was requested.
    pub review: Option<ReviewRecord>,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// Last assignment.
    pub assigned_at: Option<DateTime<Utc>>,
    /// First transition to `in_progress`.
    pub started_at: Option<DateTime<Utc>>,
    /// Set on `done` or `failed`.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// A new, unsaved task with the default criteria for its type.
    pub fn new(title: impl Into<String>, description: impl Into<String>, task_type: TaskType) -> Self {
        Self {
            id: 0,
            key: String::new(),
            parent_id: None,
            title: title.into(),
            description: description.into(),
            task_type,
            assignee: None,
            status: TaskStatus::New,
            priority: 0,
            readiness_criteria: task_type.default_readiness_criteria(),
            readiness_criteria_met: false,
            completion_criteria: task_type.default_completion_criteria(),
            completion_criteria_met: false,
            dependencies: Vec::new(),
            blocks: Vec::new(),
            input: HashMap::new(),
            result: None,
            metadata: HashMap::new(),
            artifacts: Vec::new(),
            review: None,
            created_at: Utc::now(),
            assigned_at: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Attach to a parent task.
    pub fn with_parent(mut self, parent_id: TaskId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    /// Replace the dependency list with `keys`.
    pub fn with_dependencies(mut self, keys: Vec<String>) -> Self {
        self.dependencies = keys;
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set one input entry.
    pub fn with_input(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.input.insert(key.into(), value);
        self
    }

    /// Move to `to`, enforcing the state machine. The task is untouched on error.
    pub fn transition_to(&mut self, to: TaskStatus) -> TaskweaveResult<()> {
        self.status.ensure_transition(to)?;
        self.status = to;
        Ok(())
    }

    /// Reason recorded by the last block, if any.
    pub fn block_reason(&self) -> Option<&str> {
        self.metadata.get(META_BLOCK_REASON).and_then(|v| v.as_str())
    }

    /// Errors accumulated across failed attempts.
    pub fn error_history(&self) -> Vec<String> {
        string_list(self.metadata.get(META_ERROR_HISTORY))
    }

    /// Files a worker reported as created, read from metadata.
    pub fn created_files(&self) -> Vec<String> {
        string_list(self.metadata.get(META_CREATED_FILES))
    }

    /// Errors a worker reported alongside its result, read from metadata.
    pub fn reported_errors(&self) -> Vec<String> {
        string_list(self.metadata.get(META_ERRORS))
    }

    /// Working path injected by the planner, if any.
    pub fn working_path(&self) -> Option<&str> {
        self.input.get(INPUT_WORKING_PATH).and_then(|v| v.as_str())
    }

    /// Whether a non-blank result is recorded.
    pub fn has_result(&self) -> bool {
        self.result.as_deref().is_some_and(|r| !r.trim().is_empty())
    }
}

fn string_list(value: Option<&serde_json::Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_task_creation_defaults() {
        let task = Task::new("Implement auth", "JWT login flow", TaskType::Generation);
        assert_eq!(task.status, TaskStatus::New);
        assert!(task.key.is_empty());
        assert!(!task.readiness_criteria.is_empty());
        assert!(!task.completion_criteria.is_empty());
        assert!(!task.readiness_criteria_met);
        assert!(!task.completion_criteria_met);
    }

    #[test]
    fn test_legal_main_path() {
        let mut task = Task::new("t", "d", TaskType::General);
        for next in [
            TaskStatus::Ready,
            TaskStatus::Assigned,
            TaskStatus::InProgress,
            TaskStatus::InReview,
            TaskStatus::Done,
        ] {
            task.transition_to(next).unwrap();
        }
        assert_eq!(task.status, TaskStatus::Done);
    }

    #[test]
    fn test_done_is_terminal() {
        for to in TaskStatus::ALL {
            assert!(!TaskStatus::Done.can_transition_to(to));
        }
    }

    #[test]
    fn test_illegal_transition_leaves_task_unchanged() {
        let mut task = Task::new("t", "d", TaskType::General);
        let err = task.transition_to(TaskStatus::Done).unwrap_err();
        assert!(err.to_string().contains("'new'"));
        assert!(err.to_string().contains("'done'"));
        assert_eq!(task.status, TaskStatus::New);
    }

    #[test]
    fn test_blocked_exits() {
        assert!(TaskStatus::Blocked.can_transition_to(TaskStatus::Ready));
        assert!(TaskStatus::Blocked.can_transition_to(TaskStatus::InProgress));
        assert!(!TaskStatus::Blocked.can_transition_to(TaskStatus::Done));
        assert!(TaskStatus::Failed.can_transition_to(TaskStatus::Ready));
        assert!(!TaskStatus::InReview.can_transition_to(TaskStatus::Blocked));
    }

    #[test]
    fn test_status_string_roundtrip() {
        for status in TaskStatus::ALL {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("archived".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_unknown_task_type_rejected() {
        assert_eq!("review".parse::<TaskType>().unwrap(), TaskType::Review);
        assert!("deploy".parse::<TaskType>().is_err());
    }

    #[test]
    fn test_metadata_accessors() {
        let mut task = Task::new("t", "d", TaskType::Validation);
        task.metadata.insert(
            META_ERROR_HISTORY.to_string(),
            serde_json::json!(["boom", "boom again"]),
        );
        task.metadata
            .insert(META_BLOCK_REASON.to_string(), serde_json::json!("stuck"));
        assert_eq!(task.error_history().len(), 2);
        assert_eq!(task.block_reason(), Some("stuck"));
        assert!(task.created_files().is_empty());
    }

    #[test]
    fn test_has_result_ignores_whitespace() {
        let mut task = Task::new("t", "d", TaskType::General);
        assert!(!task.has_result());
        task.result = Some("   ".to_string());
        assert!(!task.has_result());
        task.result = Some("ok".to_string());
        assert!(task.has_result());
    }
}
