use crate::coordinator::Coordinator;
use crate::feedback::FeedbackChannel;
use crate::manager::Manager;
use crate::monitor::WorkerMonitor;
use crate::task_queue::TaskQueue;
use crate::worker::{Worker, WorkerRegistry};
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use taskweave_backend::{default_roles, BackendFactory, LifecycleManager};
use taskweave_core::{TaskweaveConfig, TaskweaveError, TaskweaveResult};
use taskweave_store::{FeedbackStore, NoticeLog, SqliteStore, TaskStore};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Provider used for the default role table when none is configured.
pub const DEFAULT_PROVIDER: &str = "ollama";
/// Model used for the default role table.
pub const DEFAULT_MODEL: &str = "llama3.1:8b";

const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Everything a running Taskweave process shares, built once at startup.
pub struct Runtime {
    config: TaskweaveConfig,
    store: Arc<SqliteStore>,
    queue: Arc<TaskQueue>,
    feedback: Arc<FeedbackChannel>,
    backends: Arc<LifecycleManager>,
    workers: Arc<WorkerRegistry>,
    monitor: Arc<WorkerMonitor>,
    manager: Arc<Manager>,
    coordinator: Arc<Coordinator>,
    background: Mutex<Background>,
}

#[derive(Default)]
struct Background {
    drain: Option<JoinHandle<()>>,
    sweeper: Option<JoinHandle<()>>,
}

impl Runtime {
    /// Wire every component from `config`. Nothing runs until [`Runtime::start`].
    pub fn build(config: TaskweaveConfig, factory: Arc<dyn BackendFactory>) -> TaskweaveResult<Self> {
        config.validate()?;
        let store = Arc::new(match config.database_path() {
            Some(path) => SqliteStore::open(&path)?,
            None => SqliteStore::open_in_memory()?,
        });

        let task_store: Arc<dyn TaskStore> = store.clone();
        let feedback_store: Arc<dyn FeedbackStore> = store.clone();
        let notice_log: Arc<dyn NoticeLog> = store.clone();

        let queue = Arc::new(TaskQueue::with_policy(
            task_store,
            config.manager.completion_policy,
        ));
        let feedback = Arc::new(FeedbackChannel::new(&config.feedback, Some(feedback_store)));

        let roles = if config.backends.roles.is_empty() {
            default_roles(DEFAULT_PROVIDER, DEFAULT_MODEL)
        } else {
            config.backends.roles.clone()
        };
        let backends = Arc::new(LifecycleManager::with_fallback_order(
            factory,
            roles,
            config.backends.fallback_order.clone(),
        ));

        let workers = Arc::new(WorkerRegistry::new());
        let monitor = Arc::new(WorkerMonitor::new());
        let manager = Arc::new(
            Manager::new(queue.clone(), workers.clone(), config.manager.clone())
                .with_feedback(feedback.clone())
                .with_backends(backends.clone())
                .with_notices(notice_log)
                .with_monitor(monitor.clone()),
        );
        let coordinator = Arc::new(Coordinator::new(
            manager.clone(),
            config.dispatcher.max_concurrent,
        ));

        info!(
            database = %config.database,
            max_concurrent = config.dispatcher.max_concurrent,
            "Runtime built"
        );
        Ok(Self {
            config,
            store,
            queue,
            feedback,
            backends,
            workers,
            monitor,
            manager,
            coordinator,
            background: Mutex::new(Background::default()),
        })
    }

    /// Spawn the feedback drain loop and the idle-backend sweeper.
    pub fn start(&self) -> TaskweaveResult<()> {
        let mut background = self.background.lock();
        if background.drain.is_some() {
            return Err(TaskweaveError::Config("runtime already started".to_string()));
        }
        background.drain = Some(self.feedback.start()?);
        background.sweeper = Some(
            self.backends
                .spawn_sweeper(self.config.backends.sweep_interval()),
        );
        info!("Runtime started");
        Ok(())
    }

    /// Close the dispatcher and feedback channel, let queued feedback drain,
    /// stop the sweeper and unload every backend.
    pub async fn shutdown(&self) {
        self.coordinator.close();
        self.feedback.shutdown();
        let (drain, sweeper) = {
            let mut background = self.background.lock();
            (background.drain.take(), background.sweeper.take())
        };
        if let Some(drain) = drain {
            if tokio::time::timeout(DRAIN_GRACE, drain).await.is_err() {
                warn!("Feedback drain did not finish in time");
            }
        }
        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }
        self.backends.unload_all().await;
        info!("Runtime stopped");
    }

    /// Add a worker to the shared registry.
    pub fn register_worker(&self, worker: Arc<dyn Worker>) {
        self.workers.register(worker);
    }

    /// Validated configuration.
    pub fn config(&self) -> &TaskweaveConfig {
        &self.config
    }

    /// SQLite store behind every persistent component.
    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    /// Task queue.
    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    /// Feedback channel.
    pub fn feedback(&self) -> &Arc<FeedbackChannel> {
        &self.feedback
    }

    /// Backend lifecycle manager.
    pub fn backends(&self) -> &Arc<LifecycleManager> {
        &self.backends
    }

    /// Worker registry.
    pub fn workers(&self) -> &Arc<WorkerRegistry> {
        &self.workers
    }

    /// Worker monitor.
    pub fn monitor(&self) -> &Arc<WorkerMonitor> {
        &self.monitor
    }

    /// Planner/executor.
    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    /// Delegation dispatcher.
    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }
}

static GLOBAL: OnceLock<Arc<Runtime>> = OnceLock::new();

/// Install the process-wide runtime. For wiring entry points only; pass the
/// runtime explicitly everywhere else.
pub fn install_global(runtime: Arc<Runtime>) -> TaskweaveResult<()> {
    GLOBAL
        .set(runtime)
        .map_err(|_| TaskweaveError::Config("global runtime already installed".to_string()))
}

/// The installed runtime, if any.
pub fn global() -> Option<Arc<Runtime>> {
    GLOBAL.get().cloned()
}
