use crate::feedback::{FeedbackChannel, FeedbackHandler};
use crate::monitor::WorkerMonitor;
use crate::planner::{DecompositionStrategy, HeuristicDecomposer, PlanDraft};
use crate::task_queue::TaskQueue;
use crate::worker::{ExecutionContext, UpstreamResult, Worker, WorkerOutput, WorkerRegistry};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use taskweave_backend::{BackendLease, LifecycleManager};
use taskweave_core::task::{INPUT_WORKING_PATH, META_CREATED_FILES};
use taskweave_core::{
    FeedbackEvent, FeedbackType, ManagerConfig, Notice, Severity, Task, TaskId, TaskStatus,
    TaskweaveError, TaskweaveResult,
};
use taskweave_store::NoticeLog;
use tracing::{debug, error, info, warn};

/// Sender name on notices the manager appends.
pub const MANAGER: &str = "manager";
/// Input holding the keys whose results are injected as upstream context.
pub const INPUT_UPSTREAM: &str = "upstream";
/// Input holding the original request text.
pub const INPUT_REQUEST: &str = "request";

/// Invoked when a task's error history reaches the escalation threshold.
#[async_trait]
pub trait Escalation: Send + Sync {
    /// Raise `task` with its accumulated error history.
    async fn escalate(&self, task: &Task, errors: &[String]) -> TaskweaveResult<()>;
}

/// Escalation that only logs.
#[derive(Debug, Default)]
pub struct LogEscalation;

#[async_trait]
impl Escalation for LogEscalation {
    async fn escalate(&self, task: &Task, errors: &[String]) -> TaskweaveResult<()> {
        error!(
            key = %task.key,
            failures = errors.len(),
            last_error = errors.last().map(String::as_str).unwrap_or(""),
            "Task escalated after repeated failures"
        );
        Ok(())
    }
}

/// Blocks the referenced task when a worker reports it cannot proceed.
pub struct BlockingHandler {
    queue: Arc<TaskQueue>,
}

impl BlockingHandler {
    /// Block through `queue`.
    pub fn new(queue: Arc<TaskQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl FeedbackHandler for BlockingHandler {
    fn name(&self) -> &str {
        "blocking"
    }

    async fn handle(&self, event: &FeedbackEvent) -> TaskweaveResult<()> {
        let task = self.queue.get(event.task_id).await?;
        if task.status.is_terminal() || task.status == TaskStatus::Blocked {
            debug!(key = %task.key, status = %task.status, "Feedback ignored, nothing to block");
            return Ok(());
        }
        let reason = format!("{}: {}", event.event_type, event.message);
        self.queue.block(task.id, &reason).await?;
        Ok(())
    }
}

/// A parent task and its ordered subtasks, or a single task routed directly.
#[derive(Debug, Clone)]
pub struct Plan {
    /// The task the request was stored as.
    pub root: Task,
    /// Empty when the request runs as a single task.
    pub subtasks: Vec<Task>,
}

impl Plan {
    /// No decomposition happened.
    pub fn is_direct(&self) -> bool {
        self.subtasks.is_empty()
    }
}

/// Result of walking a plan to the end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanOutcome {
    /// Key of the root task.
    pub root_key: String,
    /// Root status once the walk ended.
    pub status: TaskStatus,
    /// Keys of the plan's tasks that are done.
    pub completed: Vec<String>,
    /// Root result, set when the plan finished.
    pub result: Option<String>,
    /// Artifacts of every done task in plan order.
    pub artifacts: Vec<String>,
    /// Wall time of the walk.
    pub duration_ms: u64,
}

/// Planner/executor.
///
/// Turns a request into a plan through the configured
/// [`DecompositionStrategy`] and walks it: subtasks run in creation order,
/// each after its dependencies are done, through the worker the registry
/// selects. A worker failure blocks the task and halts the plan.
pub struct Manager {
    queue: Arc<TaskQueue>,
    workers: Arc<WorkerRegistry>,
    strategy: Arc<dyn DecompositionStrategy>,
    config: ManagerConfig,
    feedback: Option<Arc<FeedbackChannel>>,
    backends: Option<Arc<LifecycleManager>>,
    notices: Option<Arc<dyn NoticeLog>>,
    escalation: Arc<dyn Escalation>,
    monitor: Arc<WorkerMonitor>,
}

impl Manager {
    /// Manager with the heuristic decomposer and log-only escalation.
    pub fn new(queue: Arc<TaskQueue>, workers: Arc<WorkerRegistry>, config: ManagerConfig) -> Self {
        Self {
            queue,
            workers,
            strategy: Arc::new(HeuristicDecomposer),
            config,
            feedback: None,
            backends: None,
            notices: None,
            escalation: Arc::new(LogEscalation),
            monitor: Arc::new(WorkerMonitor::new()),
        }
    }

    /// Replace the decomposition strategy.
    pub fn with_strategy(mut self, strategy: Arc<dyn DecompositionStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Wire the feedback channel. Dependency-needed and
    /// ambiguous-instructions events will block their task.
    pub fn with_feedback(mut self, channel: Arc<FeedbackChannel>) -> Self {
        let handler: Arc<dyn FeedbackHandler> = Arc::new(BlockingHandler::new(self.queue.clone()));
        channel.register(FeedbackType::DependencyNeeded, handler.clone());
        channel.register(FeedbackType::AmbiguousInstructions, handler);
        self.feedback = Some(channel);
        self
    }

    /// Lease a backend instance around every invocation.
    pub fn with_backends(mut self, backends: Arc<LifecycleManager>) -> Self {
        self.backends = Some(backends);
        self
    }

    /// Record task lifecycle notices.
    pub fn with_notices(mut self, notices: Arc<dyn NoticeLog>) -> Self {
        self.notices = Some(notices);
        self
    }

    /// Replace the escalation target.
    pub fn with_escalation(mut self, escalation: Arc<dyn Escalation>) -> Self {
        self.escalation = escalation;
        self
    }

    /// Share an existing monitor.
    pub fn with_monitor(mut self, monitor: Arc<WorkerMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    /// Backing queue.
    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    /// Registered workers.
    pub fn workers(&self) -> &Arc<WorkerRegistry> {
        &self.workers
    }

    /// Per-worker activity.
    pub fn monitor(&self) -> &Arc<WorkerMonitor> {
        &self.monitor
    }

    /// Plan `request` and run it to completion.
    pub async fn handle_request(&self, request: &str) -> TaskweaveResult<PlanOutcome> {
        let plan = self.submit(request).await?;
        self.execute_plan(&plan).await
    }

    /// Create the plan's tasks without running them.
    pub async fn submit(&self, request: &str) -> TaskweaveResult<Plan> {
        let request = request.trim();
        if request.is_empty() {
            return Err(TaskweaveError::validation("request is empty"));
        }
        let draft = self.strategy.decompose(request);
        let plan = self.create_plan(request, &draft).await?;

        info!(
            key = %plan.root.key,
            subtasks = plan.subtasks.len(),
            direct = plan.is_direct(),
            "Plan created"
        );
        let text = if plan.is_direct() {
            format!("{} routed directly", plan.root.title)
        } else {
            let keys: Vec<&str> = plan.subtasks.iter().map(|t| t.key.as_str()).collect();
            format!("{} split into {}", plan.root.title, keys.join(" -> "))
        };
        self.notify(Notice::broadcast(MANAGER, "plan_created", text).about(&plan.root.key))
            .await;
        Ok(plan)
    }

    async fn create_plan(&self, request: &str, draft: &PlanDraft) -> TaskweaveResult<Plan> {
        let mut root = Task::new(&draft.title, &draft.description, draft.task_type)
            .with_input(INPUT_REQUEST, serde_json::json!(request));
        if let Some(path) = &draft.working_path {
            root = root.with_input(INPUT_WORKING_PATH, serde_json::json!(path));
        }
        let shared_input = root.input.clone();
        let root = self.queue.create(root).await?;

        let mut subtasks = Vec::with_capacity(draft.subtasks.len());
        let mut previous: Option<String> = None;
        for sub in &draft.subtasks {
            let mut task = Task::new(&sub.title, &sub.description, sub.task_type).with_parent(root.id);
            task.input = shared_input.clone();
            if let Some(prev) = previous.take() {
                task = task
                    .with_input(INPUT_UPSTREAM, serde_json::json!([prev]))
                    .with_dependencies(vec![prev]);
            }
            let created = self.queue.create(task).await?;
            previous = Some(created.key.clone());
            subtasks.push(created);
        }
        Ok(Plan { root, subtasks })
    }

    /// Walk a plan in creation order. Stops at the first failing task,
    /// leaving earlier completions persisted.
    pub async fn execute_plan(&self, plan: &Plan) -> TaskweaveResult<PlanOutcome> {
        let started = Instant::now();
        let ids: Vec<TaskId> = if plan.is_direct() {
            vec![plan.root.id]
        } else {
            plan.subtasks.iter().map(|t| t.id).collect()
        };

        for id in ids {
            if let Err(e) = self.run_task(id).await {
                error!(key = %plan.root.key, error = %e, "Plan halted");
                self.notify(
                    Notice::broadcast(MANAGER, "plan_halted", e.to_string()).about(&plan.root.key),
                )
                .await;
                return Err(e);
            }
        }

        let root = self.queue.get(plan.root.id).await?;
        let mut completed = Vec::new();
        if root.status.is_terminal_success() {
            completed.push(root.key.clone());
        }
        for child in self.queue.children(root.id).await? {
            if child.status.is_terminal_success() {
                completed.push(child.key);
            }
        }
        let outcome = PlanOutcome {
            root_key: root.key.clone(),
            status: root.status,
            completed,
            result: root.result.clone(),
            artifacts: root.artifacts.clone(),
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            key = %outcome.root_key,
            status = %outcome.status,
            duration_ms = outcome.duration_ms,
            "Plan finished"
        );
        self.notify(
            Notice::broadcast(
                MANAGER,
                "plan_finished",
                format!("{} tasks done", outcome.completed.len()),
            )
            .about(&root.key),
        )
        .await;
        Ok(outcome)
    }

    /// Run one task end to end: wait for its dependencies, make it ready,
    /// pick a worker, assign, start, invoke and complete. A task already
    /// done is returned as is.
    pub async fn run_task(&self, id: TaskId) -> TaskweaveResult<Task> {
        let task = self.queue.get(id).await?;
        if task.status.is_terminal_success() {
            debug!(key = %task.key, "Task already done");
            return Ok(task);
        }

        self.wait_for_dependencies(&task).await?;
        let task = self.bring_to_ready(id).await?;
        let worker = self.workers.select(&task)?;
        self.monitor.register(worker.name(), worker.backend_role()).await;

        self.queue.assign(id, worker.name()).await?;
        let task = self.queue.start(id, worker.name()).await?;
        let upstream = self.upstream_results(&task).await?;
        self.execute_attempts(task, worker, upstream).await
    }

    /// Poll until every dependency is done. A failed or unknown dependency
    /// ends the wait with an error, as does the configured timeout.
    async fn wait_for_dependencies(&self, task: &Task) -> TaskweaveResult<()> {
        let deadline = self.config.dependency_timeout().map(|t| Instant::now() + t);
        let poll = self.config.dependency_poll_interval();
        loop {
            let current = self.queue.get(task.id).await?;
            if current.dependencies.is_empty() {
                return Ok(());
            }

            let mut outstanding = Vec::new();
            let mut resolved_any = false;
            for key in &current.dependencies {
                let dep = self.queue.get_by_key(key).await?;
                match dep.status {
                    TaskStatus::Done => resolved_any = true,
                    TaskStatus::Failed => {
                        return Err(TaskweaveError::Execution(format!(
                            "dependency {key} of {} failed",
                            current.key
                        )))
                    }
                    _ => outstanding.push(key.as_str()),
                }
            }
            if resolved_any {
                self.queue.refresh_dependencies(task.id).await?;
                continue;
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(TaskweaveError::Timeout(format!(
                    "{} still waiting on {}",
                    current.key,
                    outstanding.join(", ")
                )));
            }
            debug!(key = %current.key, waiting_on = %outstanding.join(", "), "Waiting for dependencies");
            tokio::time::sleep(poll).await;
        }
    }

    async fn bring_to_ready(&self, id: TaskId) -> TaskweaveResult<Task> {
        let task = self.queue.get(id).await?;
        match task.status {
            TaskStatus::Ready => Ok(task),
            TaskStatus::New => self.queue.mark_ready(id).await,
            TaskStatus::Blocked => self.queue.unblock(id).await,
            TaskStatus::Failed => self.queue.retry(id).await,
            other => Err(TaskweaveError::validation(format!(
                "task {} is already {other}",
                task.key
            ))),
        }
    }

    async fn upstream_results(&self, task: &Task) -> TaskweaveResult<Vec<UpstreamResult>> {
        let keys: Vec<String> = task
            .input
            .get(INPUT_UPSTREAM)
            .and_then(|v| v.as_array())
            .map(|keys| {
                keys.iter()
                    .filter_map(|k| k.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        let mut upstream = Vec::with_capacity(keys.len());
        for key in keys {
            match self.queue.get_by_key(&key).await {
                Ok(dep) => upstream.push(UpstreamResult::from_task(&dep)),
                Err(TaskweaveError::NotFound(_)) => {
                    warn!(key = %task.key, upstream = %key, "Upstream task missing");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(upstream)
    }

    async fn execute_attempts(
        &self,
        task: Task,
        worker: Arc<dyn Worker>,
        upstream: Vec<UpstreamResult>,
    ) -> TaskweaveResult<Task> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            let current = self.queue.get(task.id).await?;
            let context = ExecutionContext {
                upstream: upstream.clone(),
                working_path: current.working_path().map(String::from),
                retry_count: attempt,
                previous_errors: current.error_history(),
                backend: None,
            };

            let error = match self.invoke(&current, worker.as_ref(), context).await {
                Ok(done) => return Ok(done),
                Err(e) => e,
            };

            let reason = failure_text(&error);
            let failures = self.queue.append_error(task.id, &reason).await?;
            if failures == self.config.escalation_threshold as usize {
                self.escalate(task.id, worker.name()).await;
            }

            attempt += 1;
            let status = self.queue.get(task.id).await?.status;
            if attempt < max_attempts && status == TaskStatus::InProgress {
                warn!(key = %current.key, attempt, error = %reason, "Worker failed, retrying");
                continue;
            }

            self.block_after_failure(task.id, &reason).await?;
            return Err(TaskweaveError::Execution(format!("{}: {reason}", current.key)));
        }
    }

    /// One worker invocation under a backend lease, then completion.
    async fn invoke(
        &self,
        task: &Task,
        worker: &dyn Worker,
        mut context: ExecutionContext,
    ) -> TaskweaveResult<Task> {
        let lease = self.lease_backend(task, worker).await?;
        context.backend = lease.as_ref().map(|l| l.handle().clone());

        self.monitor.start_task(worker.name(), &task.key).await;
        let started = Instant::now();
        let outcome = worker.execute_with_context(task, &context).await;
        if let Some(lease) = lease {
            lease.release().await;
        }
        let elapsed = started.elapsed().as_millis() as u64;

        let output = match outcome {
            Ok(output) if output.success => output,
            Ok(output) => {
                self.monitor.record_error(worker.name(), elapsed).await;
                let text = if output.output.trim().is_empty() {
                    "worker reported failure".to_string()
                } else {
                    output.output
                };
                return Err(TaskweaveError::Execution(text));
            }
            Err(e) => {
                self.monitor.record_error(worker.name(), elapsed).await;
                return Err(e);
            }
        };

        let artifacts = extract_artifacts(&output);
        if !output.metadata.is_empty() {
            self.queue.merge_metadata(task.id, output.metadata).await?;
        }
        match self.queue.complete(task.id, output.output, artifacts).await {
            Ok(done) => {
                self.monitor.finish_task(worker.name(), elapsed).await;
                info!(key = %done.key, worker = worker.name(), duration_ms = elapsed, "Worker finished task");
                Ok(done)
            }
            Err(e) => {
                self.monitor.record_error(worker.name(), elapsed).await;
                Err(e)
            }
        }
    }

    async fn lease_backend(
        &self,
        task: &Task,
        worker: &dyn Worker,
    ) -> TaskweaveResult<Option<BackendLease>> {
        let Some(backends) = &self.backends else {
            return Ok(None);
        };
        match backends.acquire(worker.backend_role()).await {
            Ok(lease) => {
                if lease.used_fallback {
                    warn!(
                        key = %task.key,
                        role = worker.backend_role(),
                        model = %lease.model_id,
                        "Worker running on fallback backend"
                    );
                }
                Ok(Some(lease))
            }
            Err(e) => {
                self.publish(
                    FeedbackEvent::new(
                        task.id,
                        worker.name(),
                        FeedbackType::ResourceUnavailable,
                        Severity::Critical,
                        e.to_string(),
                    )
                    .with_context(serde_json::json!({ "role": worker.backend_role() })),
                )
                .await;
                Err(e)
            }
        }
    }

    async fn escalate(&self, id: TaskId, worker: &str) {
        let task = match self.queue.get(id).await {
            Ok(task) => task,
            Err(e) => {
                warn!(task_id = id, error = %e, "Cannot load task for escalation");
                return;
            }
        };
        let history = task.error_history();
        if let Err(e) = self.escalation.escalate(&task, &history).await {
            warn!(key = %task.key, error = %e, "Escalation failed");
        }
        self.publish(
            FeedbackEvent::new(
                task.id,
                worker,
                FeedbackType::RepeatedFailure,
                Severity::Critical,
                format!("{} failed {} times", task.key, history.len()),
            )
            .with_context(serde_json::json!({ "errors": history }))
            .with_remedy("restructure or reassign the task"),
        )
        .await;
    }

    async fn block_after_failure(&self, id: TaskId, reason: &str) -> TaskweaveResult<()> {
        let task = self.queue.get(id).await?;
        if task.status != TaskStatus::Blocked {
            if let Err(e) = self.queue.block(id, reason).await {
                warn!(key = %task.key, error = %e, "Could not block failed task");
            }
        }
        self.notify(Notice::broadcast(MANAGER, "task_blocked", reason).about(&task.key))
            .await;
        Ok(())
    }

    async fn publish(&self, event: FeedbackEvent) {
        if let Some(feedback) = &self.feedback {
            if let Err(e) = feedback.publish(event).await {
                warn!(error = %e, "Could not publish feedback");
            }
        }
    }

    async fn notify(&self, notice: Notice) {
        if let Some(notices) = &self.notices {
            if let Err(e) = notices.append(&notice).await {
                warn!(kind = %notice.kind, error = %e, "Could not append notice");
            }
        }
    }
}

fn failure_text(error: &TaskweaveError) -> String {
    match error {
        TaskweaveError::Execution(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Declared artifacts plus any reported created files.
fn extract_artifacts(output: &WorkerOutput) -> Vec<String> {
    let mut artifacts = output.artifacts.clone();
    let created = output
        .metadata
        .get(META_CREATED_FILES)
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
        .filter_map(|v| v.as_str());
    for file in created {
        if !artifacts.iter().any(|a| a == file) {
            artifacts.push(file.to_string());
        }
    }
    artifacts
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use taskweave_backend::ROLE_CODE;
    use taskweave_core::TaskType;
    use taskweave_store::SqliteStore;

    struct Flaky {
        failures_left: AtomicUsize,
        calls: AtomicUsize,
        retries_seen: parking_lot::Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl Worker for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        fn backend_role(&self) -> &str {
            ROLE_CODE
        }

        fn can_handle(&self, _task: &Task) -> bool {
            true
        }

        async fn execute(&self, _task: &Task) -> TaskweaveResult<WorkerOutput> {
            unreachable!("context-aware path is used")
        }

        async fn execute_with_context(
            &self,
            _task: &Task,
            context: &ExecutionContext,
        ) -> TaskweaveResult<WorkerOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.retries_seen.lock().push(context.retry_count);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(TaskweaveError::Execution("compile error".to_string()));
            }
            Ok(WorkerOutput::success("fixed")
                .with_metadata(META_CREATED_FILES, serde_json::json!(["src/lib.rs"])))
        }
    }

    #[derive(Default)]
    struct Recorder {
        escalated: AtomicUsize,
    }

    #[async_trait]
    impl Escalation for Recorder {
        async fn escalate(&self, _task: &Task, errors: &[String]) -> TaskweaveResult<()> {
            assert!(!errors.is_empty());
            self.escalated.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn setup(failures: usize, config: ManagerConfig) -> (Manager, Arc<Flaky>, Arc<Recorder>) {
        let queue = Arc::new(TaskQueue::new(Arc::new(SqliteStore::open_in_memory().unwrap())));
        let workers = Arc::new(WorkerRegistry::new());
        let flaky = Arc::new(Flaky {
            failures_left: AtomicUsize::new(failures),
            calls: AtomicUsize::new(0),
            retries_seen: parking_lot::Mutex::new(Vec::new()),
        });
        workers.register(flaky.clone());
        let recorder = Arc::new(Recorder::default());
        let manager = Manager::new(queue, workers, config).with_escalation(recorder.clone());
        (manager, flaky, recorder)
    }

    #[tokio::test]
    async fn test_retry_within_attempt_budget() {
        let config = ManagerConfig {
            max_attempts: 3,
            escalation_threshold: 10,
            ..ManagerConfig::default()
        };
        let (manager, flaky, recorder) = setup(2, config);
        let outcome = manager.handle_request("implement the parser").await.unwrap();

        assert_eq!(outcome.status, TaskStatus::Done);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
        assert_eq!(*flaky.retries_seen.lock(), vec![0, 1, 2]);
        assert_eq!(recorder.escalated.load(Ordering::SeqCst), 0);
        assert_eq!(outcome.artifacts, vec!["src/lib.rs".to_string()]);

        let root = manager.queue().get_by_key(&outcome.root_key).await.unwrap();
        assert_eq!(root.error_history().len(), 2);
    }

    #[tokio::test]
    async fn test_escalates_at_threshold_and_blocks() {
        let config = ManagerConfig {
            max_attempts: 2,
            escalation_threshold: 2,
            ..ManagerConfig::default()
        };
        let (manager, _flaky, recorder) = setup(5, config);
        let err = manager.handle_request("implement the parser").await.unwrap_err();

        assert!(matches!(err, TaskweaveError::Execution(_)));
        assert_eq!(recorder.escalated.load(Ordering::SeqCst), 1);
        let task = manager.queue().get(1).await.unwrap();
        assert_eq!(task.status, TaskStatus::Blocked);
        assert_eq!(task.block_reason(), Some("compile error"));
    }

    #[tokio::test]
    async fn test_failures_past_threshold_escalate_once() {
        let config = ManagerConfig {
            max_attempts: 4,
            escalation_threshold: 2,
            ..ManagerConfig::default()
        };
        let (manager, flaky, recorder) = setup(10, config);
        manager.handle_request("implement the parser").await.unwrap_err();

        assert_eq!(flaky.calls.load(Ordering::SeqCst), 4);
        assert_eq!(recorder.escalated.load(Ordering::SeqCst), 1);
        let task = manager.queue().get(1).await.unwrap();
        assert_eq!(task.error_history().len(), 4);
    }

    #[tokio::test]
    async fn test_empty_request_rejected() {
        let (manager, _, _) = setup(0, ManagerConfig::default());
        assert!(matches!(
            manager.submit("   ").await.unwrap_err(),
            TaskweaveError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn test_failed_dependency_stops_wait() {
        let (manager, _, _) = setup(0, ManagerConfig::default());
        let queue = manager.queue().clone();
        let a = queue.create(Task::new("A", "a", TaskType::General)).await.unwrap();
        let b = queue
            .create(Task::new("B", "b", TaskType::General).with_dependencies(vec![a.key.clone()]))
            .await
            .unwrap();
        queue.mark_ready(a.id).await.unwrap();
        queue.assign(a.id, "x").await.unwrap();
        queue.start(a.id, "x").await.unwrap();
        queue.fail(a.id, "gave up").await.unwrap();

        let err = manager.run_task(b.id).await.unwrap_err();
        assert!(err.to_string().contains("failed"));
        assert_eq!(queue.get(b.id).await.unwrap().status, TaskStatus::Blocked);
    }

    #[tokio::test]
    async fn test_dependency_wait_times_out() {
        let config = ManagerConfig {
            dependency_poll_ms: 10,
            dependency_timeout_secs: 1,
            ..ManagerConfig::default()
        };
        let (manager, _, _) = setup(0, config);
        let queue = manager.queue().clone();
        let a = queue.create(Task::new("A", "a", TaskType::General)).await.unwrap();
        let b = queue
            .create(Task::new("B", "b", TaskType::General).with_dependencies(vec![a.key]))
            .await
            .unwrap();
        let err = manager.run_task(b.id).await.unwrap_err();
        assert!(matches!(err, TaskweaveError::Timeout(_)));
    }

    #[test]
    fn test_extract_artifacts_merges_created_files() {
        let output = WorkerOutput::success("ok")
            .with_artifacts(vec!["report-1".to_string(), "src/a.rs".to_string()])
            .with_metadata(META_CREATED_FILES, serde_json::json!(["src/a.rs", "src/b.rs"]));
        assert_eq!(extract_artifacts(&output), vec!["report-1", "src/a.rs", "src/b.rs"]);
    }
}
