use taskweave_core::{Task, TaskStatus, TaskweaveError, TaskweaveResult};

/// Every reason `task` cannot enter execution. Empty when it can.
///
/// The type is not checked here: `TaskType` is a closed enum, so an unknown
/// type is already rejected when a task is parsed or deserialized.
pub fn readiness_issues(task: &Task) -> Vec<String> {
    let mut issues = Vec::new();
    if task.readiness_criteria.is_empty() {
        issues.push("no readiness criteria defined".to_string());
    }
    if task.title.trim().is_empty() {
        issues.push("title is empty".to_string());
    }
    if task.description.trim().is_empty() {
        issues.push("description is empty".to_string());
    }
    if !task.dependencies.is_empty() {
        issues.push(format!(
            "{} unresolved dependencies: {}",
            task.dependencies.len(),
            task.dependencies.join(", ")
        ));
    }
    issues
}

/// Every reason `task` cannot be marked done. Empty when it can.
pub fn completion_issues(task: &Task) -> Vec<String> {
    let mut issues = Vec::new();
    if task.completion_criteria.is_empty() {
        issues.push("no completion criteria defined".to_string());
    }
    if !matches!(task.status, TaskStatus::InProgress | TaskStatus::InReview) {
        issues.push(format!(
            "status is '{}', expected 'in_progress' or 'in_review'",
            task.status
        ));
    }
    if task.started_at.is_none() {
        issues.push("task was never started".to_string());
    }
    if !task.has_result() {
        issues.push("result is empty".to_string());
    }
    issues
}

/// Gate a task's entry into execution.
///
/// On success the readiness flag is set and a `new` task moves to `ready`;
/// a task past `new` keeps its status. On failure the task is untouched and
/// the error carries every failing reason. The caller persists the result.
pub fn validate_readiness(task: &mut Task) -> TaskweaveResult<()> {
    let issues = readiness_issues(task);
    if !issues.is_empty() {
        return Err(TaskweaveError::Validation(issues));
    }
    task.readiness_criteria_met = true;
    if task.status == TaskStatus::New {
        task.transition_to(TaskStatus::Ready)?;
    }
    Ok(())
}

/// Gate a task's exit into `done`.
///
/// Only the completion flag is set; the status write is the caller's, and
/// the flag must be persisted with it.
pub fn validate_completion(task: &mut Task) -> TaskweaveResult<()> {
    let issues = completion_issues(task);
    if !issues.is_empty() {
        return Err(TaskweaveError::Validation(issues));
    }
    task.completion_criteria_met = true;
    Ok(())
}
