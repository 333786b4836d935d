use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use taskweave_core::{FeedbackConfig, FeedbackEvent, FeedbackType, TaskweaveError, TaskweaveResult};
use taskweave_store::FeedbackStore;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Reacts to feedback events of the types it is registered for.
#[async_trait]
pub trait FeedbackHandler: Send + Sync {
    /// Name used in logs and processing errors.
    fn name(&self) -> &str;

    /// Act on one event. An error is recorded on the event.
    async fn handle(&self, event: &FeedbackEvent) -> TaskweaveResult<()>;
}

type HandlerTable = RwLock<HashMap<FeedbackType, Vec<Arc<dyn FeedbackHandler>>>>;

/// Bounded, asynchronously drained queue of feedback events.
///
/// Workers publish; a drain loop started with [`FeedbackChannel::start`]
/// runs the handlers registered for each event's type and then records the
/// event in the feedback store, if one is configured. Handler errors are
/// stored on the event and never requeued.
pub struct FeedbackChannel {
    tx: Mutex<Option<mpsc::Sender<FeedbackEvent>>>,
    rx: Mutex<Option<mpsc::Receiver<FeedbackEvent>>>,
    handlers: Arc<HandlerTable>,
    store: Option<Arc<dyn FeedbackStore>>,
    publish_timeout: Duration,
}

impl FeedbackChannel {
    /// A closed-loop channel sized from `config`, persisting to `store` when given.
    pub fn new(config: &FeedbackConfig, store: Option<Arc<dyn FeedbackStore>>) -> Self {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            store,
            publish_timeout: config.publish_timeout(),
        }
    }

    /// Add `handler` for `event_type`. Handlers run in registration order.
    pub fn register(&self, event_type: FeedbackType, handler: Arc<dyn FeedbackHandler>) {
        info!(event_type = %event_type, handler = handler.name(), "Registered feedback handler");
        self.handlers
            .write()
            .entry(event_type)
            .or_default()
            .push(handler);
    }

    /// Handlers registered for `event_type`.
    pub fn handler_count(&self, event_type: FeedbackType) -> usize {
        self.handlers.read().get(&event_type).map_or(0, Vec::len)
    }

    /// Enqueue an event. On a saturated channel this waits at most the
    /// configured publish timeout, then fails with a timeout error.
    pub async fn publish(&self, event: FeedbackEvent) -> TaskweaveResult<Uuid> {
        let tx = self
            .tx
            .lock()
            .clone()
            .ok_or_else(|| TaskweaveError::Capacity("feedback channel is closed".to_string()))?;
        let id = event.id;
        let (task_id, event_type) = (event.task_id, event.event_type);
        match tx.send_timeout(event, self.publish_timeout).await {
            Ok(()) => {
                debug!(task_id, event_type = %event_type, event_id = %id, "Feedback published");
                Ok(id)
            }
            Err(SendTimeoutError::Timeout(_)) => {
                warn!(task_id, event_type = %event_type, "Feedback channel saturated");
                Err(TaskweaveError::Timeout(format!(
                    "feedback channel full for {}ms",
                    self.publish_timeout.as_millis()
                )))
            }
            Err(SendTimeoutError::Closed(_)) => Err(TaskweaveError::Capacity(
                "feedback channel is closed".to_string(),
            )),
        }
    }

    /// Spawn the drain loop. Fails if it was already started.
    pub fn start(&self) -> TaskweaveResult<JoinHandle<()>> {
        let mut rx = self.rx.lock().take().ok_or_else(|| {
            TaskweaveError::Config("feedback drain loop already started".to_string())
        })?;
        let handlers = self.handlers.clone();
        let store = self.store.clone();
        Ok(tokio::spawn(async move {
            info!("Feedback drain loop started");
            while let Some(event) = rx.recv().await {
                process(&handlers, store.as_deref(), event).await;
            }
            info!("Feedback drain loop stopped");
        }))
    }

    /// Close the channel. Events already queued are still drained.
    pub fn shutdown(&self) {
        if self.tx.lock().take().is_some() {
            info!("Feedback channel closed");
        }
    }

    /// Whether [`Self::shutdown`] was called.
    pub fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }
}

async fn process(handlers: &HandlerTable, store: Option<&dyn FeedbackStore>, mut event: FeedbackEvent) {
    let registered: Vec<Arc<dyn FeedbackHandler>> = handlers
        .read()
        .get(&event.event_type)
        .cloned()
        .unwrap_or_default();

    if registered.is_empty() {
        debug!(event_type = %event.event_type, task_id = event.task_id, "No handler for feedback event");
    }

    let mut errors = Vec::new();
    for handler in &registered {
        if let Err(e) = handler.handle(&event).await {
            warn!(handler = handler.name(), event_id = %event.id, error = %e, "Feedback handler failed");
            errors.push(format!("{}: {e}", handler.name()));
        }
    }

    event.processed = true;
    event.processed_at = Some(Utc::now());
    event.processing_error = (!errors.is_empty()).then(|| errors.join("; "));

    if let Some(store) = store {
        if let Err(e) = store.record(&event).await {
            warn!(event_id = %event.id, error = %e, "Failed to record feedback event");
        }
    }
}
