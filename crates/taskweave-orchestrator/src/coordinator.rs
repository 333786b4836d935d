use crate::manager::{Manager, Plan, PlanOutcome};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use taskweave_core::{TaskId, TaskweaveError, TaskweaveResult};
use tokio::sync::{watch, Semaphore};
use tokio::task::AbortHandle;
use tracing::{info, warn};

/// Lifecycle of a delegated request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegationState {
    /// Waiting for a concurrency slot.
    Queued,
    /// Holding a slot and executing.
    Running,
    /// The plan finished.
    Completed,
    /// The plan returned an error.
    Failed,
    /// Aborted through [`Coordinator::cancel`].
    Cancelled,
}

impl DelegationState {
    /// Whether the delegation has stopped.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Live view of one delegated request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationStatus {
    /// Id of the plan's root task.
    pub id: TaskId,
    /// Key of the plan's root task.
    pub key: String,
    /// Request text as submitted.
    pub request: String,
    /// Current state.
    pub state: DelegationState,
    /// When `delegate` accepted the request.
    pub submitted_at: DateTime<Utc>,
    /// When a slot was acquired.
    pub started_at: Option<DateTime<Utc>>,
    /// When a terminal state was reached.
    pub finished_at: Option<DateTime<Utc>>,
    /// Set on completion.
    pub outcome: Option<PlanOutcome>,
    /// Set on failure.
    pub error: Option<String>,
}

struct Delegation {
    status: Arc<watch::Sender<DelegationStatus>>,
    abort: Option<AbortHandle>,
}

/// Fire-and-forget dispatcher running each delegated plan on its own task
/// under a global concurrency cap.
pub struct Coordinator {
    manager: Arc<Manager>,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    delegations: RwLock<HashMap<TaskId, Delegation>>,
}

impl Coordinator {
    /// A dispatcher running at most `max_concurrent` plans at once (at least 1).
    pub fn new(manager: Arc<Manager>, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            manager,
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            delegations: RwLock::new(HashMap::new()),
        }
    }

    /// Manager that executes delegated plans.
    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    /// Plan `request` and run it in the background. Returns the root task id
    /// as soon as the plan's tasks exist; execution waits for a free slot.
    pub async fn delegate(&self, request: &str) -> TaskweaveResult<TaskId> {
        let plan = self.manager.submit(request).await?;
        Ok(self.dispatch(request, plan))
    }

    fn dispatch(&self, request: &str, plan: Plan) -> TaskId {
        let id = plan.root.id;
        let (tx, _rx) = watch::channel(DelegationStatus {
            id,
            key: plan.root.key.clone(),
            request: request.to_string(),
            state: DelegationState::Queued,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            outcome: None,
            error: None,
        });
        let status = Arc::new(tx);
        self.delegations.write().insert(
            id,
            Delegation {
                status: status.clone(),
                abort: None,
            },
        );

        let manager = self.manager.clone();
        let permits = self.permits.clone();
        let handle = tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                warn!(task_id = id, "Dispatcher closed before delegation started");
                return;
            };
            let started = status.send_if_modified(|s| {
                if s.state.is_terminal() {
                    return false;
                }
                s.state = DelegationState::Running;
                s.started_at = Some(Utc::now());
                true
            });
            if !started {
                return;
            }
            info!(task_id = id, "Delegation running");

            let result = manager.execute_plan(&plan).await;
            status.send_if_modified(|s| {
                if s.state.is_terminal() {
                    return false;
                }
                s.finished_at = Some(Utc::now());
                match result {
                    Ok(outcome) => {
                        s.state = DelegationState::Completed;
                        s.outcome = Some(outcome);
                    }
                    Err(e) => {
                        s.state = DelegationState::Failed;
                        s.error = Some(e.to_string());
                    }
                }
                true
            });
            info!(task_id = id, state = ?status.borrow().state, "Delegation finished");
        });

        if let Some(delegation) = self.delegations.write().get_mut(&id) {
            delegation.abort = Some(handle.abort_handle());
        }
        info!(task_id = id, "Delegation admitted");
        id
    }

    /// Snapshot of one delegation, `None` for an unknown id.
    pub fn status(&self, id: TaskId) -> Option<DelegationStatus> {
        self.delegations
            .read()
            .get(&id)
            .map(|d| d.status.borrow().clone())
    }

    /// Wait for a delegation to reach a terminal state.
    pub async fn wait(&self, id: TaskId) -> TaskweaveResult<DelegationStatus> {
        let mut rx = self
            .delegations
            .read()
            .get(&id)
            .map(|d| d.status.subscribe())
            .ok_or_else(|| TaskweaveError::NotFound(format!("delegation {id}")))?;
        let status = rx
            .wait_for(|s| s.state.is_terminal())
            .await
            .map_err(|_| TaskweaveError::Execution(format!("delegation {id} vanished")))?;
        Ok(status.clone())
    }

    /// Abort an in-flight delegation. Side effects already performed stay,
    /// and its tasks keep their last recorded status. Returns false if it had
    /// already finished.
    pub fn cancel(&self, id: TaskId) -> TaskweaveResult<bool> {
        let delegations = self.delegations.read();
        let delegation = delegations
            .get(&id)
            .ok_or_else(|| TaskweaveError::NotFound(format!("delegation {id}")))?;
        let cancelled = delegation.status.send_if_modified(|s| {
            if s.state.is_terminal() {
                return false;
            }
            s.state = DelegationState::Cancelled;
            s.finished_at = Some(Utc::now());
            true
        });
        if cancelled {
            if let Some(abort) = &delegation.abort {
                abort.abort();
            }
            warn!(task_id = id, "Delegation cancelled");
        }
        Ok(cancelled)
    }

    /// Delegations not yet finished, oldest first.
    pub fn active(&self) -> Vec<DelegationStatus> {
        let mut active: Vec<DelegationStatus> = self
            .delegations
            .read()
            .values()
            .map(|d| d.status.borrow().clone())
            .filter(|s| !s.state.is_terminal())
            .collect();
        active.sort_by_key(|s| s.id);
        active
    }

    /// Slots currently held by running delegations.
    pub fn in_flight(&self) -> usize {
        self.max_concurrent - self.permits.available_permits()
    }

    /// Effective concurrency cap.
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Drop finished delegations from the registry, returning how many.
    pub fn prune_finished(&self) -> usize {
        let mut delegations = self.delegations.write();
        let before = delegations.len();
        delegations.retain(|_, d| !d.status.borrow().state.is_terminal());
        before - delegations.len()
    }

    /// Stop admitting new work; queued delegations are abandoned.
    pub fn close(&self) {
        self.permits.close();
    }
}
