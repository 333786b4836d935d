use crate::validation::{completion_issues, readiness_issues, validate_readiness};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use taskweave_core::task::{META_BLOCK_REASON, META_ERROR_HISTORY};
use taskweave_core::{
    CompletionPolicy, ReviewRecord, ReviewStatus, Task, TaskId, TaskStatus, TaskweaveError,
    TaskweaveResult,
};
use taskweave_store::{TaskFilter, TaskStore};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Assignee recorded on parents completed by roll-up.
pub const ROLL_UP_ASSIGNEE: &str = "roll-up";

/// Per-status task counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Tasks in the store.
    pub total: usize,
    /// Every status appears, zero counts included.
    pub by_status: BTreeMap<String, usize>,
}

impl QueueStats {
    /// Count for one status.
    pub fn count(&self, status: TaskStatus) -> usize {
        self.by_status.get(status.as_str()).copied().unwrap_or(0)
    }
}

/// Durable task queue enforcing the status state machine.
///
/// Every operation is a read-modify-write against the stored record.
/// Operations on the same task must be serialized by the caller; the
/// cross-task edits made by auto-unblock and parent roll-up are serialized
/// here.
pub struct TaskQueue {
    store: Arc<dyn TaskStore>,
    policy: CompletionPolicy,
    cascade: Mutex<()>,
}

impl TaskQueue {
    /// A queue with the default (strict) completion policy.
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self::with_policy(store, CompletionPolicy::default())
    }

    /// A queue with an explicit completion policy.
    pub fn with_policy(store: Arc<dyn TaskStore>, policy: CompletionPolicy) -> Self {
        Self {
            store,
            policy,
            cascade: Mutex::new(()),
        }
    }

    /// Completion policy in force.
    pub fn policy(&self) -> CompletionPolicy {
        self.policy
    }

    /// Persist a new task, assigning its id and key.
    ///
    /// Dependencies that are already done are dropped. A task left with
    /// unresolved dependencies is parked in `blocked` so completing them
    /// promotes it; otherwise it starts as `new`. Runs under the cascade
    /// lock, so a dependency completing meanwhile either is seen as done here
    /// or finds the new task when it unblocks its dependents.
    pub async fn create(&self, mut task: Task) -> TaskweaveResult<Task> {
        let _cascade = self.cascade.lock().await;
        let mut pending = Vec::with_capacity(task.dependencies.len());
        for key in std::mem::take(&mut task.dependencies) {
            match self.store.get_by_key(&key).await? {
                Some(dep) if dep.status.is_terminal_success() => {
                    debug!(dependency = %key, "Dependency already done");
                }
                Some(_) => pending.push(key),
                None => {
                    warn!(dependency = %key, "Dependency key not found, keeping it unresolved");
                    pending.push(key);
                }
            }
        }

        task.id = 0;
        task.key = String::new();
        task.dependencies = pending;
        task.readiness_criteria_met = false;
        task.completion_criteria_met = false;
        task.created_at = Utc::now();
        if task.dependencies.is_empty() {
            task.status = TaskStatus::New;
        } else {
            task.status = TaskStatus::Blocked;
            task.metadata.insert(
                META_BLOCK_REASON.to_string(),
                serde_json::Value::String(format!(
                    "waiting on dependencies: {}",
                    task.dependencies.join(", ")
                )),
            );
        }

        let created = self.store.insert(&task).await?;
        info!(
            task_id = created.id,
            key = %created.key,
            task_type = %created.task_type,
            status = %created.status,
            "Task created"
        );

        for key in &created.dependencies {
            match self.store.append_blocked(key, &created.key).await {
                Ok(()) | Err(TaskweaveError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(created)
    }

    /// Task by id, `NotFound` if missing.
    pub async fn get(&self, id: TaskId) -> TaskweaveResult<Task> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| TaskweaveError::NotFound(format!("task {id}")))
    }

    /// Task by key, `NotFound` if missing.
    pub async fn get_by_key(&self, key: &str) -> TaskweaveResult<Task> {
        self.store
            .get_by_key(key)
            .await?
            .ok_or_else(|| TaskweaveError::NotFound(format!("task {key}")))
    }

    /// Overwrite the stored record. The key is never rewritten.
    pub async fn update(&self, task: &Task) -> TaskweaveResult<()> {
        self.store.update(task).await
    }

    /// Remove a task. Returns whether it existed.
    pub async fn delete(&self, id: TaskId) -> TaskweaveResult<bool> {
        let deleted = self.store.delete(id).await?;
        if deleted {
            info!(task_id = id, "Task deleted");
        }
        Ok(deleted)
    }

    /// Filtered listing, highest priority first, then oldest first.
    pub async fn list(&self, filter: &TaskFilter) -> TaskweaveResult<Vec<Task>> {
        self.store.list(filter).await
    }

    /// A parent's subtasks in creation order.
    pub async fn children(&self, parent_id: TaskId) -> TaskweaveResult<Vec<Task>> {
        let mut children = self.store.list(&TaskFilter::children_of(parent_id)).await?;
        children.sort_by_key(|t| t.id);
        Ok(children)
    }

    /// Run readiness validation and persist the outcome.
    pub async fn mark_ready(&self, id: TaskId) -> TaskweaveResult<Task> {
        let mut task = self.get(id).await?;
        validate_readiness(&mut task)?;
        self.store.update(&task).await?;
        debug!(key = %task.key, status = %task.status, "Readiness validated");
        Ok(task)
    }

    /// Hand a ready task to `assignee`. A blocked task may be assigned
    /// directly once its readiness holds.
    pub async fn assign(&self, id: TaskId, assignee: &str) -> TaskweaveResult<Task> {
        let mut task = self.get(id).await?;
        if task.status == TaskStatus::Blocked {
            let issues = readiness_issues(&task);
            if !issues.is_empty() {
                return Err(TaskweaveError::Validation(issues));
            }
            task.readiness_criteria_met = true;
        }
        task.transition_to(TaskStatus::Assigned)?;
        task.assignee = Some(assignee.to_string());
        task.assigned_at = Some(Utc::now());
        self.store.update(&task).await?;
        info!(key = %task.key, assignee, "Task assigned");
        Ok(task)
    }

    /// Start work. Only the assignee may start a task.
    pub async fn start(&self, id: TaskId, caller: &str) -> TaskweaveResult<Task> {
        let mut task = self.get(id).await?;
        match task.assignee.as_deref() {
            Some(assignee) if assignee == caller => {}
            Some(assignee) => {
                return Err(TaskweaveError::validation(format!(
                    "task {} is assigned to '{assignee}', not '{caller}'",
                    task.key
                )))
            }
            None => {
                return Err(TaskweaveError::validation(format!(
                    "task {} has no assignee",
                    task.key
                )))
            }
        }
        task.transition_to(TaskStatus::InProgress)?;
        if task.started_at.is_none() {
            task.started_at = Some(Utc::now());
        }
        self.store.update(&task).await?;
        info!(key = %task.key, worker = caller, "Task started");
        Ok(task)
    }

    /// Record `result` and `artifacts`, validate completion and mark done.
    ///
    /// The completion flag and the `done` status are persisted together.
    /// Dependents are then unblocked and the parent rolled up. Under the
    /// strict policy a failed validation leaves the stored task unchanged.
    pub async fn complete(
        &self,
        id: TaskId,
        result: impl Into<String>,
        artifacts: Vec<String>,
    ) -> TaskweaveResult<Task> {
        let mut task = self.get(id).await?;
        task.result = Some(result.into());
        for artifact in artifacts {
            if !task.artifacts.contains(&artifact) {
                task.artifacts.push(artifact);
            }
        }

        let issues = completion_issues(&task);
        if !issues.is_empty() {
            match self.policy {
                CompletionPolicy::Strict => return Err(TaskweaveError::Validation(issues)),
                CompletionPolicy::Lenient => warn!(
                    key = %task.key,
                    issues = %issues.join("; "),
                    "Completion criteria unmet, forcing completion (lenient policy)"
                ),
            }
        }
        task.transition_to(TaskStatus::Done)?;
        task.completion_criteria_met = true;
        task.completed_at = Some(Utc::now());
        self.store.update(&task).await?;
        info!(key = %task.key, artifacts = task.artifacts.len(), "Task completed");

        let _cascade = self.cascade.lock().await;
        let mut roots = self.unblock_dependents(&task.key).await?;
        roots.extend(task.parent_id);
        self.roll_up_from(roots).await?;
        Ok(task)
    }

    /// Park a task with a recorded reason.
    pub async fn block(&self, id: TaskId, reason: &str) -> TaskweaveResult<Task> {
        let mut task = self.get(id).await?;
        task.transition_to(TaskStatus::Blocked)?;
        task.metadata.insert(
            META_BLOCK_REASON.to_string(),
            serde_json::Value::String(reason.to_string()),
        );
        self.store.update(&task).await?;
        warn!(key = %task.key, reason, "Task blocked");
        Ok(task)
    }

    /// Move a blocked task back to `ready`. Readiness must hold.
    pub async fn unblock(&self, id: TaskId) -> TaskweaveResult<Task> {
        let mut task = self.get(id).await?;
        if task.status != TaskStatus::Blocked {
            return Err(TaskweaveError::InvalidTransition {
                from: task.status.to_string(),
                to: TaskStatus::Ready.to_string(),
            });
        }
        validate_readiness(&mut task)?;
        task.transition_to(TaskStatus::Ready)?;
        self.store.update(&task).await?;
        info!(key = %task.key, "Task unblocked");
        Ok(task)
    }

    /// Send an in-progress task to `reviewer`.
    pub async fn request_review(&self, id: TaskId, reviewer: &str) -> TaskweaveResult<Task> {
        let mut task = self.get(id).await?;
        task.transition_to(TaskStatus::InReview)?;
        task.review = Some(ReviewRecord {
            reviewer: reviewer.to_string(),
            status: ReviewStatus::Pending,
            comments: Vec::new(),
        });
        self.store.update(&task).await?;
        info!(key = %task.key, reviewer, "Review requested");
        Ok(task)
    }

    /// Mark a task failed. The reason joins its error history.
    pub async fn fail(&self, id: TaskId, reason: &str) -> TaskweaveResult<Task> {
        let mut task = self.get(id).await?;
        task.transition_to(TaskStatus::Failed)?;
        push_error(&mut task, reason);
        task.completed_at = Some(Utc::now());
        self.store.update(&task).await?;
        warn!(key = %task.key, reason, "Task failed");
        Ok(task)
    }

    /// Send a failed task back to `ready` for another attempt.
    pub async fn retry(&self, id: TaskId) -> TaskweaveResult<Task> {
        let mut task = self.get(id).await?;
        task.status.ensure_transition(TaskStatus::Ready)?;
        if task.status != TaskStatus::Failed {
            return Err(TaskweaveError::validation(format!(
                "task {} is '{}', only failed tasks can be retried",
                task.key, task.status
            )));
        }
        validate_readiness(&mut task)?;
        task.transition_to(TaskStatus::Ready)?;
        task.assignee = None;
        task.result = None;
        task.completion_criteria_met = false;
        task.completed_at = None;
        self.store.update(&task).await?;
        info!(key = %task.key, attempts = task.error_history().len(), "Task queued for retry");
        Ok(task)
    }

    /// Append to the task's error history, returning its new length.
    pub async fn append_error(&self, id: TaskId, error: &str) -> TaskweaveResult<usize> {
        let mut task = self.get(id).await?;
        push_error(&mut task, error);
        self.store.update(&task).await?;
        Ok(task.error_history().len())
    }

    /// Merge worker-reported metadata into the task.
    pub async fn merge_metadata(
        &self,
        id: TaskId,
        metadata: HashMap<String, serde_json::Value>,
    ) -> TaskweaveResult<Task> {
        let mut task = self.get(id).await?;
        task.metadata.extend(metadata);
        self.store.update(&task).await?;
        Ok(task)
    }

    /// Drop dependencies that are already done, promoting the task if that
    /// was the last one. For tasks whose dependencies finished before the
    /// key was registered on them.
    pub async fn refresh_dependencies(&self, id: TaskId) -> TaskweaveResult<Task> {
        let _cascade = self.cascade.lock().await;
        let mut task = self.get(id).await?;
        let before = task.dependencies.len();
        let mut pending = Vec::with_capacity(before);
        for key in std::mem::take(&mut task.dependencies) {
            let done = matches!(
                self.store.get_by_key(&key).await?,
                Some(dep) if dep.status.is_terminal_success()
            );
            if !done {
                pending.push(key);
            }
        }
        task.dependencies = pending;
        if task.dependencies.len() == before {
            return Ok(task);
        }
        promote_if_unblocked(&mut task);
        self.store.update(&task).await?;
        if task.dependencies.is_empty() && !self.roll_up_from(vec![task.id]).await?.is_empty() {
            return self.get(id).await;
        }
        Ok(task)
    }

    /// Complete `parent_id` if every child is done, cascading upward.
    /// Returns the parents completed by this call, nearest first. Calling it
    /// again on an already completed parent does nothing.
    pub async fn roll_up_parent(&self, parent_id: TaskId) -> TaskweaveResult<Vec<Task>> {
        let _cascade = self.cascade.lock().await;
        self.roll_up_from(vec![parent_id]).await
    }

    /// Per-status counts across all tasks.
    pub async fn stats(&self) -> TaskweaveResult<QueueStats> {
        let tasks = self.store.list(&TaskFilter::default()).await?;
        let mut by_status: BTreeMap<String, usize> = TaskStatus::ALL
            .iter()
            .map(|s| (s.as_str().to_string(), 0))
            .collect();
        for task in &tasks {
            *by_status.entry(task.status.as_str().to_string()).or_default() += 1;
        }
        Ok(QueueStats {
            total: tasks.len(),
            by_status,
        })
    }

    /// Remove `key` from every dependent's list, promoting dependents whose
    /// list empties while blocked. Returns the ids of dependents left with no
    /// dependencies.
    async fn unblock_dependents(&self, key: &str) -> TaskweaveResult<Vec<TaskId>> {
        let mut freed = Vec::new();
        for mut dependent in self.store.dependents_of(key).await? {
            dependent.dependencies.retain(|k| k != key);
            if dependent.dependencies.is_empty() {
                freed.push(dependent.id);
            }
            let was_blocked = dependent.status == TaskStatus::Blocked;
            if promote_if_unblocked(&mut dependent) {
                info!(key = %dependent.key, resolved = key, "Dependent auto-unblocked");
                self.store.update(&dependent).await?;
            } else {
                if was_blocked && dependent.dependencies.is_empty() {
                    warn!(
                        key = %dependent.key,
                        issues = %readiness_issues(&dependent).join("; "),
                        "Dependencies resolved but task is not ready"
                    );
                }
                debug!(key = %dependent.key, resolved = key, "Dependency removed");
                self.store.update(&dependent).await?;
            }
        }
        Ok(freed)
    }

    /// Roll up each candidate whose children are all done and whose own
    /// dependencies are resolved, continuing with its parent and with
    /// dependents it frees.
    async fn roll_up_from(&self, candidates: Vec<TaskId>) -> TaskweaveResult<Vec<Task>> {
        let mut completed = Vec::new();
        let mut pending = candidates;
        pending.reverse();
        while let Some(id) = pending.pop() {
            let Some(mut parent) = self.store.get(id).await? else {
                continue;
            };
            if parent.status.is_terminal() {
                continue;
            }
            if !parent.dependencies.is_empty() {
                debug!(key = %parent.key, "Roll-up deferred until dependencies resolve");
                continue;
            }
            let children = self.children(id).await?;
            let all_done = !children.is_empty()
                && children
                    .iter()
                    .all(|c| c.status.is_terminal_success() && c.completion_criteria_met);
            if !all_done {
                continue;
            }

            walk_to_in_progress(&mut parent)?;
            parent.result = Some(synthesize(&children));
            for child in &children {
                for artifact in &child.artifacts {
                    if !parent.artifacts.contains(artifact) {
                        parent.artifacts.push(artifact.clone());
                    }
                }
            }
            parent.completion_criteria_met = true;
            parent.transition_to(TaskStatus::Done)?;
            parent.completed_at = Some(Utc::now());
            self.store.update(&parent).await?;
            info!(key = %parent.key, children = children.len(), "Parent rolled up");

            let freed = self.unblock_dependents(&parent.key).await?;
            pending.extend(freed.into_iter().rev());
            pending.extend(parent.parent_id);
            completed.push(parent);
        }
        Ok(completed)
    }
}

fn push_error(task: &mut Task, error: &str) {
    let mut history = task.error_history();
    history.push(error.to_string());
    task.metadata.insert(
        META_ERROR_HISTORY.to_string(),
        serde_json::Value::from(history),
    );
}

/// Promote a blocked task with no dependencies left and readiness holding.
fn promote_if_unblocked(task: &mut Task) -> bool {
    if task.status != TaskStatus::Blocked || !readiness_issues(task).is_empty() {
        return false;
    }
    task.readiness_criteria_met = true;
    task.status = TaskStatus::Ready;
    true
}

/// Walk a parent through legal transitions up to `in_progress`.
fn walk_to_in_progress(parent: &mut Task) -> TaskweaveResult<()> {
    loop {
        let next = match parent.status {
            TaskStatus::New => TaskStatus::Ready,
            TaskStatus::Ready => TaskStatus::Assigned,
            TaskStatus::Assigned | TaskStatus::Blocked => TaskStatus::InProgress,
            TaskStatus::InProgress | TaskStatus::InReview => break,
            TaskStatus::Done | TaskStatus::Failed => {
                return Err(TaskweaveError::InvalidTransition {
                    from: parent.status.to_string(),
                    to: TaskStatus::Done.to_string(),
                })
            }
        };
        parent.transition_to(next)?;
        match next {
            TaskStatus::Ready => parent.readiness_criteria_met = true,
            TaskStatus::Assigned => {
                parent.assignee.get_or_insert_with(|| ROLL_UP_ASSIGNEE.to_string());
                parent.assigned_at.get_or_insert_with(Utc::now);
            }
            _ => {}
        }
    }
    parent.started_at.get_or_insert_with(Utc::now);
    Ok(())
}

fn synthesize(children: &[Task]) -> String {
    let lines: Vec<String> = children
        .iter()
        .map(|c| {
            format!(
                "{} ({}): {}",
                c.key,
                c.title,
                c.result.as_deref().unwrap_or("").trim()
            )
        })
        .collect();
    format!("All {} subtasks completed.\n{}", children.len(), lines.join("\n"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use taskweave_core::TaskType;
    use taskweave_store::SqliteStore;

    fn queue() -> TaskQueue {
        TaskQueue::new(Arc::new(SqliteStore::open_in_memory().unwrap()))
    }

    async fn run_to_done(q: &TaskQueue, id: TaskId, result: &str) -> Task {
        let task = q.get(id).await.unwrap();
        if task.status == TaskStatus::New {
            q.mark_ready(id).await.unwrap();
        }
        q.assign(id, "w").await.unwrap();
        q.start(id, "w").await.unwrap();
        q.complete(id, result, vec![]).await.unwrap()
    }

    #[tokio::test]
    async fn test_create_assigns_key_and_new_status() {
        let q = queue();
        let task = q
            .create(Task::new("A", "do a", TaskType::Generation))
            .await
            .unwrap();
        assert_eq!(task.key, "TASK-0001");
        assert_eq!(task.status, TaskStatus::New);
        assert!(!task.readiness_criteria.is_empty());
    }

    #[tokio::test]
    async fn test_create_with_pending_dependency_parks_blocked() {
        let q = queue();
        let a = q.create(Task::new("A", "a", TaskType::Generation)).await.unwrap();
        let b = q
            .create(Task::new("B", "b", TaskType::Validation).with_dependencies(vec![a.key.clone()]))
            .await
            .unwrap();
        assert_eq!(b.status, TaskStatus::Blocked);
        assert!(b.block_reason().unwrap().contains("TASK-0001"));
        assert_eq!(q.get(a.id).await.unwrap().blocks, vec![b.key.clone()]);
    }

    #[tokio::test]
    async fn test_create_drops_done_dependency() {
        let q = queue();
        let a = q.create(Task::new("A", "a", TaskType::General)).await.unwrap();
        run_to_done(&q, a.id, "ok").await;
        let b = q
            .create(Task::new("B", "b", TaskType::General).with_dependencies(vec![a.key]))
            .await
            .unwrap();
        assert!(b.dependencies.is_empty());
        assert_eq!(b.status, TaskStatus::New);
    }

    #[tokio::test]
    async fn test_start_checks_assignee() {
        let q = queue();
        let a = q.create(Task::new("A", "a", TaskType::General)).await.unwrap();
        q.mark_ready(a.id).await.unwrap();
        q.assign(a.id, "coder").await.unwrap();
        let err = q.start(a.id, "tester").await.unwrap_err();
        assert!(err.to_string().contains("assigned to 'coder'"));
        assert_eq!(q.get(a.id).await.unwrap().status, TaskStatus::Assigned);
    }

    #[tokio::test]
    async fn test_strict_completion_leaves_task_unchanged() {
        let q = queue();
        let a = q.create(Task::new("A", "a", TaskType::General)).await.unwrap();
        q.mark_ready(a.id).await.unwrap();
        q.assign(a.id, "w").await.unwrap();
        q.start(a.id, "w").await.unwrap();

        let err = q.complete(a.id, "  ", vec!["x".into()]).await.unwrap_err();
        assert!(matches!(err, TaskweaveError::Validation(_)));
        let stored = q.get(a.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::InProgress);
        assert!(stored.result.is_none());
        assert!(stored.artifacts.is_empty());
    }

    #[tokio::test]
    async fn test_lenient_completion_forces_flag() {
        let q = TaskQueue::with_policy(
            Arc::new(SqliteStore::open_in_memory().unwrap()),
            CompletionPolicy::Lenient,
        );
        let mut task = Task::new("A", "a", TaskType::General);
        task.completion_criteria.clear();
        let a = q.create(task).await.unwrap();
        q.mark_ready(a.id).await.unwrap();
        q.assign(a.id, "w").await.unwrap();
        q.start(a.id, "w").await.unwrap();
        let done = q.complete(a.id, "ok", vec![]).await.unwrap();
        assert_eq!(done.status, TaskStatus::Done);
        assert!(done.completion_criteria_met);
    }

    #[tokio::test]
    async fn test_completion_flag_persisted_with_status() {
        let q = queue();
        let a = q.create(Task::new("A", "a", TaskType::General)).await.unwrap();
        run_to_done(&q, a.id, "ok").await;
        let reloaded = q.get(a.id).await.unwrap();
        assert_eq!(reloaded.status, TaskStatus::Done);
        assert!(reloaded.completion_criteria_met);
        assert!(reloaded.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_block_and_unblock() {
        let q = queue();
        let a = q.create(Task::new("A", "a", TaskType::General)).await.unwrap();
        q.mark_ready(a.id).await.unwrap();
        let blocked = q.block(a.id, "waiting for credentials").await.unwrap();
        assert_eq!(blocked.block_reason(), Some("waiting for credentials"));
        let ready = q.unblock(a.id).await.unwrap();
        assert_eq!(ready.status, TaskStatus::Ready);
        assert!(q.unblock(a.id).await.is_err());
    }

    #[tokio::test]
    async fn test_unblock_rejected_with_outstanding_dependency() {
        let q = queue();
        let a = q.create(Task::new("A", "a", TaskType::General)).await.unwrap();
        let b = q
            .create(Task::new("B", "b", TaskType::General).with_dependencies(vec![a.key]))
            .await
            .unwrap();
        let err = q.unblock(b.id).await.unwrap_err();
        assert!(err.to_string().contains("unresolved dependencies"));
        assert_eq!(q.get(b.id).await.unwrap().status, TaskStatus::Blocked);
    }

    #[tokio::test]
    async fn test_fail_retry_cycle() {
        let q = queue();
        let a = q.create(Task::new("A", "a", TaskType::General)).await.unwrap();
        q.mark_ready(a.id).await.unwrap();
        q.assign(a.id, "w").await.unwrap();
        q.start(a.id, "w").await.unwrap();
        let failed = q.fail(a.id, "backend crashed").await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error_history(), vec!["backend crashed".to_string()]);

        let ready = q.retry(a.id).await.unwrap();
        assert_eq!(ready.status, TaskStatus::Ready);
        assert!(ready.assignee.is_none());
        assert!(q.retry(a.id).await.is_err());
    }

    #[tokio::test]
    async fn test_append_error_counts() {
        let q = queue();
        let a = q.create(Task::new("A", "a", TaskType::General)).await.unwrap();
        assert_eq!(q.append_error(a.id, "first").await.unwrap(), 1);
        assert_eq!(q.append_error(a.id, "second").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_request_review_then_complete() {
        let q = queue();
        let a = q.create(Task::new("A", "a", TaskType::Review)).await.unwrap();
        q.mark_ready(a.id).await.unwrap();
        q.assign(a.id, "w").await.unwrap();
        q.start(a.id, "w").await.unwrap();
        let review = q.request_review(a.id, "lead").await.unwrap();
        assert_eq!(review.status, TaskStatus::InReview);
        assert_eq!(review.review.unwrap().status, ReviewStatus::Pending);
        let done = q.complete(a.id, "approved", vec![]).await.unwrap();
        assert_eq!(done.status, TaskStatus::Done);
    }

    #[tokio::test]
    async fn test_refresh_dependencies_promotes() {
        let q = queue();
        let a = q.create(Task::new("A", "a", TaskType::General)).await.unwrap();
        let b = q
            .create(Task::new("B", "b", TaskType::General).with_dependencies(vec![a.key.clone()]))
            .await
            .unwrap();
        // Complete A behind the queue's back so no auto-unblock runs.
        let mut raw = q.get(a.id).await.unwrap();
        raw.status = TaskStatus::Done;
        q.update(&raw).await.unwrap();

        let refreshed = q.refresh_dependencies(b.id).await.unwrap();
        assert!(refreshed.dependencies.is_empty());
        assert_eq!(refreshed.status, TaskStatus::Ready);
    }

    #[tokio::test]
    async fn test_stats_counts_every_status() {
        let q = queue();
        let a = q.create(Task::new("A", "a", TaskType::General)).await.unwrap();
        q.create(Task::new("B", "b", TaskType::General)).await.unwrap();
        q.mark_ready(a.id).await.unwrap();
        let stats = q.stats().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.count(TaskStatus::New), 1);
        assert_eq!(stats.count(TaskStatus::Ready), 1);
        assert_eq!(stats.by_status.len(), TaskStatus::ALL.len());
    }

    #[tokio::test]
    async fn test_roll_up_without_children_is_noop() {
        let q = queue();
        let p = q.create(Task::new("P", "p", TaskType::General)).await.unwrap();
        assert!(q.roll_up_parent(p.id).await.unwrap().is_empty());
        assert_eq!(q.get(p.id).await.unwrap().status, TaskStatus::New);
    }

    #[tokio::test]
    async fn test_roll_up_cascades_to_grandparent() {
        let q = queue();
        let g = q.create(Task::new("G", "g", TaskType::General)).await.unwrap();
        let p = q
            .create(Task::new("P", "p", TaskType::General).with_parent(g.id))
            .await
            .unwrap();
        let c = q
            .create(Task::new("C", "c", TaskType::General).with_parent(p.id))
            .await
            .unwrap();
        run_to_done(&q, c.id, "leaf done").await;

        let parent = q.get(p.id).await.unwrap();
        let grand = q.get(g.id).await.unwrap();
        assert_eq!(parent.status, TaskStatus::Done);
        assert!(parent.result.unwrap().contains(&c.key));
        assert_eq!(grand.status, TaskStatus::Done);
        assert!(grand.started_at.is_some());
    }

    #[tokio::test]
    async fn test_roll_up_waits_for_parent_dependencies() {
        let q = queue();
        let d = q.create(Task::new("D", "prerequisite", TaskType::Research)).await.unwrap();
        let p = q
            .create(Task::new("P", "p", TaskType::General).with_dependencies(vec![d.key.clone()]))
            .await
            .unwrap();
        let c = q
            .create(Task::new("C", "c", TaskType::Generation).with_parent(p.id))
            .await
            .unwrap();

        run_to_done(&q, c.id, "child done").await;
        let waiting = q.get(p.id).await.unwrap();
        assert_eq!(waiting.status, TaskStatus::Blocked);
        assert!(waiting.result.is_none());
        assert!(q.roll_up_parent(p.id).await.unwrap().is_empty());

        run_to_done(&q, d.id, "prerequisite done").await;
        let parent = q.get(p.id).await.unwrap();
        assert_eq!(parent.status, TaskStatus::Done);
        assert!(parent.dependencies.is_empty());
        assert!(parent.result.unwrap().contains(&c.key));
    }
}
