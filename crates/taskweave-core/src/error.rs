use thiserror::Error;

/// A convenience `Result` alias using [`TaskweaveError`].
pub type TaskweaveResult<T> = Result<T, TaskweaveError>;

/// Top-level error type for Taskweave.
///
/// Variants follow the error classes of the orchestration layer: validation,
/// lookup, execution, resource and capacity failures, plus the ambient
/// storage/config/serialization errors.
#[derive(Error, Debug)]
pub enum TaskweaveError {
    /// Readiness or completion criteria were not satisfied. Every failing
    /// reason is carried, never just the first one.
    #[error("Validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// A status change that the task state machine does not allow.
    #[error("Invalid transition from '{from}' to '{to}'")]
    InvalidTransition {
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },

    /// An unknown task, worker or role.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A worker failed or returned a non-success result.
    #[error("Execution error: {0}")]
    Execution(String),

    /// No backend instance could be acquired, not even a fallback.
    #[error("No backend available: {0}")]
    NoBackendAvailable(String),

    /// A bounded wait elapsed.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A bounded resource is saturated or closed.
    #[error("Capacity error: {0}")]
    Capacity(String),

    /// The relational store rejected an operation.
    #[error("Storage error: {0}")]
    Storage(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TaskweaveError {
    /// Build a validation error from a single reason.
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation(vec![reason.into()])
    }

    /// Whether the condition is local and should be handled by deferral or
    /// retry rather than aborting the run.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_joins_all_reasons() {
        let err = TaskweaveError::Validation(vec![
            "title is blank".to_string(),
            "has 1 unresolved dependency".to_string(),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("title is blank"));
        assert!(msg.contains("unresolved dependency"));
    }

    #[test]
    fn test_invalid_transition_names_both_states() {
        let err = TaskweaveError::InvalidTransition {
            from: "done".to_string(),
            to: "ready".to_string(),
        };
        assert_eq!(err.to_string(), "Invalid transition from 'done' to 'ready'");
    }

    #[test]
    fn test_recoverable_classes() {
        assert!(TaskweaveError::validation("x").is_recoverable());
        assert!(TaskweaveError::Timeout("feedback".into()).is_recoverable());
        assert!(!TaskweaveError::NotFound("task 9".into()).is_recoverable());
        assert!(!TaskweaveError::NoBackendAvailable("code".into()).is_recoverable());
    }
}
