use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// What a worker is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerActivity {
    /// Not executing anything.
    Idle,
    /// Executing a task.
    Working,
    /// Its last execution failed.
    Error,
}

/// Counters accumulated per worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerMetrics {
    /// Successful executions.
    pub tasks_completed: u64,
    /// Failed executions.
    pub errors: u64,
    /// Total time spent executing.
    pub duration_ms: u64,
}

/// Live state of one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerState {
    /// Worker name.
    pub worker: String,
    /// Backend role the worker uses.
    pub role: String,
    /// Key of the task being executed.
    pub current_task: Option<String>,
    /// Current activity.
    pub status: WorkerActivity,
    /// Counters since registration.
    pub metrics: WorkerMetrics,
}

/// Tracks live state and metrics per worker.
pub struct WorkerMonitor {
    states: Arc<RwLock<HashMap<String, WorkerState>>>,
}

impl WorkerMonitor {
    /// An empty monitor.
    pub fn new() -> Self {
        Self {
            states: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start tracking a worker. Existing state is kept.
    pub async fn register(&self, worker: &str, role: &str) {
        let mut states = self.states.write().await;
        states
            .entry(worker.to_string())
            .or_insert_with(|| WorkerState {
                worker: worker.to_string(),
                role: role.to_string(),
                current_task: None,
                status: WorkerActivity::Idle,
                metrics: WorkerMetrics::default(),
            });
    }

    /// Mark a worker as working on a task.
    pub async fn start_task(&self, worker: &str, task_key: &str) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(worker) {
            state.current_task = Some(task_key.to_string());
            state.status = WorkerActivity::Working;
        }
    }

    /// Mark a worker idle after a successful invocation.
    pub async fn finish_task(&self, worker: &str, duration_ms: u64) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(worker) {
            state.current_task = None;
            state.status = WorkerActivity::Idle;
            state.metrics.tasks_completed += 1;
            state.metrics.duration_ms += duration_ms;
        }
    }

    /// Record a failed invocation.
    pub async fn record_error(&self, worker: &str, duration_ms: u64) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(worker) {
            state.current_task = None;
            state.status = WorkerActivity::Error;
            state.metrics.errors += 1;
            state.metrics.duration_ms += duration_ms;
        }
    }

    /// Snapshot of every worker, sorted by name.
    pub async fn snapshot(&self) -> Vec<WorkerState> {
        let states = self.states.read().await;
        let mut all: Vec<WorkerState> = states.values().cloned().collect();
        all.sort_by(|a, b| a.worker.cmp(&b.worker));
        all
    }

    /// State of one worker, if it has been seen.
    pub async fn get_state(&self, worker: &str) -> Option<WorkerState> {
        let states = self.states.read().await;
        states.get(worker).cloned()
    }

    /// Counters summed over every worker.
    pub async fn aggregate_metrics(&self) -> WorkerMetrics {
        let states = self.states.read().await;
        let mut total = WorkerMetrics::default();
        for state in states.values() {
            total.tasks_completed += state.metrics.tasks_completed;
            total.errors += state.metrics.errors;
            total.duration_ms += state.metrics.duration_ms;
        }
        total
    }

    /// Per-worker states plus the aggregate, as JSON.
    pub async fn to_json(&self) -> serde_json::Value {
        let workers = self.snapshot().await;
        let aggregate = self.aggregate_metrics().await;
        serde_json::json!({
            "workers": workers,
            "aggregate": aggregate,
        })
    }
}

impl Default for WorkerMonitor {
    fn default() -> Self {
        Self::new()
    }
}
