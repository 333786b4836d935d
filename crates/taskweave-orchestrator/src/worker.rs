use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use taskweave_backend::{
    BackendHandle, ROLE_ANALYSIS, ROLE_CODE, ROLE_RESEARCH, ROLE_REVIEW, ROLE_TEST,
};
use taskweave_core::{Task, TaskType, TaskweaveError, TaskweaveResult};
use tracing::{debug, info};

/// What a worker hands back for a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerOutput {
    /// Whether the task met its goal.
    pub success: bool,
    /// Result text, or the error description on failure.
    pub output: String,
    /// Artifact ids produced by the invocation.
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// Merged into the task's metadata, e.g. `created_files` and `errors`.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl WorkerOutput {
    /// Successful output.
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            ..Self::default()
        }
    }

    /// Failed output.
    pub fn failure(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
            ..Self::default()
        }
    }

    /// Attach artifact ids.
    pub fn with_artifacts(mut self, artifacts: Vec<String>) -> Self {
        self.artifacts = artifacts;
        self
    }

    /// Add one metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Output of a finished dependency, as seen by the task that follows it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpstreamResult {
    /// Upstream task key.
    pub key: String,
    /// Upstream task title.
    pub title: String,
    /// Upstream result text.
    pub result: Option<String>,
    /// Upstream artifact ids.
    pub artifacts: Vec<String>,
    /// Files the upstream task reported creating.
    pub created_files: Vec<String>,
    /// Errors the upstream task reported.
    pub errors: Vec<String>,
}

impl UpstreamResult {
    /// Snapshot of a finished task.
    pub fn from_task(task: &Task) -> Self {
        Self {
            key: task.key.clone(),
            title: task.title.clone(),
            result: task.result.clone(),
            artifacts: task.artifacts.clone(),
            created_files: task.created_files(),
            errors: task.reported_errors(),
        }
    }
}

/// Everything injected into a context-aware invocation.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    /// Results of the task's dependencies.
    pub upstream: Vec<UpstreamResult>,
    /// Directory the task operates in, if any.
    pub working_path: Option<String>,
    /// Zero on the first attempt.
    pub retry_count: u32,
    /// Errors from earlier attempts, oldest first.
    pub previous_errors: Vec<String>,
    /// Backend instance leased for this invocation, when backends are wired.
    pub backend: Option<BackendHandle>,
}

impl ExecutionContext {
    /// Files created by every upstream task, in dependency order.
    pub fn upstream_files(&self) -> Vec<String> {
        self.upstream
            .iter()
            .flat_map(|u| u.created_files.iter().cloned())
            .collect()
    }

    /// Errors reported by every upstream task.
    pub fn upstream_errors(&self) -> Vec<String> {
        self.upstream
            .iter()
            .flat_map(|u| u.errors.iter().cloned())
            .collect()
    }
}

/// A specialized worker executing tasks through one backend role.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Stable, unique name.
    fn name(&self) -> &str;

    /// Backend role acquired for the duration of each invocation.
    fn backend_role(&self) -> &str;

    /// Whether this worker accepts `task`.
    fn can_handle(&self, task: &Task) -> bool;

    /// Run `task` without injected context.
    async fn execute(&self, task: &Task) -> TaskweaveResult<WorkerOutput>;

    /// Context-aware entry point. Defaults to [`Worker::execute`].
    async fn execute_with_context(
        &self,
        task: &Task,
        _context: &ExecutionContext,
    ) -> TaskweaveResult<WorkerOutput> {
        self.execute(task).await
    }

    /// Side-effecting operations this worker may invoke. Empty permits all.
    fn allowed_operations(&self) -> Vec<String> {
        Vec::new()
    }

    /// Whether `operation` is allowed.
    fn permits(&self, operation: &str) -> bool {
        let allowed = self.allowed_operations();
        allowed.is_empty() || allowed.iter().any(|op| op == operation)
    }

    /// Concurrent tasks this worker accepts from a [`WorkerPool`].
    fn capacity(&self) -> usize {
        1
    }
}

/// Backend role serving a task type. `general` goes to generation.
pub fn role_for_type(task_type: TaskType) -> &'static str {
    match task_type {
        TaskType::Generation | TaskType::General => ROLE_CODE,
        TaskType::Validation => ROLE_TEST,
        TaskType::Review => ROLE_REVIEW,
        TaskType::Research => ROLE_RESEARCH,
        TaskType::Analysis => ROLE_ANALYSIS,
    }
}

/// Lookup table of workers by name.
pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, Arc<dyn Worker>>>,
}

impl WorkerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
        }
    }

    /// Add or replace a worker under its name.
    pub fn register(&self, worker: Arc<dyn Worker>) {
        let name = worker.name().to_string();
        info!(worker = %name, role = worker.backend_role(), "Registered worker");
        self.workers.write().insert(name, worker);
    }

    /// Worker registered as `name`.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Worker>> {
        self.workers.read().get(name).cloned()
    }

    /// Registered workers sorted by name.
    pub fn workers(&self) -> Vec<Arc<dyn Worker>> {
        let mut workers: Vec<Arc<dyn Worker>> = self.workers.read().values().cloned().collect();
        workers.sort_by(|a, b| a.name().cmp(b.name()));
        workers
    }

    /// Number of registered workers.
    pub fn len(&self) -> usize {
        self.workers.read().len()
    }

    /// No workers registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The worker serving `task` through the fixed type-to-role mapping.
    /// Among several workers on that role the first by name that can handle
    /// the task wins.
    pub fn select(&self, task: &Task) -> TaskweaveResult<Arc<dyn Worker>> {
        let role = role_for_type(task.task_type);
        self.workers()
            .into_iter()
            .find(|w| w.backend_role() == role && w.can_handle(task))
            .ok_or_else(|| {
                TaskweaveError::NotFound(format!(
                    "no worker for role '{role}' can handle {} ({})",
                    task.key, task.task_type
                ))
            })
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct Slot {
    load: usize,
    unavailable: bool,
}

/// Load-aware selector over a [`WorkerRegistry`].
///
/// Candidates must declare the capability, be available and have spare
/// capacity; the least loaded wins, ties broken by name.
pub struct WorkerPool {
    registry: Arc<WorkerRegistry>,
    slots: Arc<Mutex<HashMap<String, Slot>>>,
}

impl WorkerPool {
    /// Pool over `registry`, every worker available.
    pub fn new(registry: Arc<WorkerRegistry>) -> Self {
        Self {
            registry,
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Take a worker out of selection, or put it back.
    pub fn set_available(&self, worker: &str, available: bool) {
        self.slots.lock().entry(worker.to_string()).or_default().unavailable = !available;
    }

    /// Reservations currently held on `worker`.
    pub fn load(&self, worker: &str) -> usize {
        self.slots.lock().get(worker).map_or(0, |s| s.load)
    }

    /// Reserve the best worker for `task`. The reservation is returned when
    /// the [`PoolSlot`] drops.
    pub fn select(&self, task: &Task) -> TaskweaveResult<PoolSlot> {
        let workers = self.registry.workers();
        let mut slots = self.slots.lock();
        let chosen = workers
            .into_iter()
            .filter(|w| w.can_handle(task))
            .filter_map(|w| {
                let slot = slots.get(w.name());
                let unavailable = slot.is_some_and(|s| s.unavailable);
                let load = slot.map_or(0, |s| s.load);
                (!unavailable && load < w.capacity()).then_some((load, w))
            })
            .min_by(|(la, a), (lb, b)| la.cmp(lb).then_with(|| a.name().cmp(b.name())))
            .map(|(_, w)| w)
            .ok_or_else(|| {
                TaskweaveError::NotFound(format!("no worker available for {}", task.key))
            })?;

        let slot = slots.entry(chosen.name().to_string()).or_default();
        slot.load += 1;
        debug!(worker = chosen.name(), load = slot.load, key = %task.key, "Worker reserved");
        Ok(PoolSlot {
            worker: chosen,
            slots: self.slots.clone(),
        })
    }
}

/// A reserved worker. Dropping it frees the reservation.
pub struct PoolSlot {
    worker: Arc<dyn Worker>,
    slots: Arc<Mutex<HashMap<String, Slot>>>,
}

impl PoolSlot {
    /// The reserved worker.
    pub fn worker(&self) -> &Arc<dyn Worker> {
        &self.worker
    }
}

impl Drop for PoolSlot {
    fn drop(&mut self) {
        if let Some(slot) = self.slots.lock().get_mut(self.worker.name()) {
            slot.load = slot.load.saturating_sub(1);
        }
    }
}
