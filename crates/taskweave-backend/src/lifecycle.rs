use crate::client::{BackendClient, BackendFactory};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use taskweave_core::{RoleConfig, TaskweaveError, TaskweaveResult};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

/// A backend instance handed to a worker.
#[derive(Clone)]
pub struct BackendHandle {
    /// Role the caller asked for.
    pub role: String,
    /// Role whose instance is actually serving the request.
    pub served_by: String,
    /// Concrete model in use, which differs from the requested role's model
    /// after a fallback.
    pub model_id: String,
    /// Set when `served_by` differs from `role`.
    pub used_fallback: bool,
    client: Arc<dyn BackendClient>,
}

impl BackendHandle {
    /// Client to send prompts to.
    pub fn client(&self) -> &Arc<dyn BackendClient> {
        &self.client
    }
}

impl std::fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendHandle")
            .field("role", &self.role)
            .field("served_by", &self.served_by)
            .field("model_id", &self.model_id)
            .field("used_fallback", &self.used_fallback)
            .finish()
    }
}

/// A counted reference to a loaded instance.
///
/// Call [`BackendLease::release`] when done. A lease dropped without release
/// still gives its reference back, and any unload it triggers runs on a
/// spawned task.
pub struct BackendLease {
    handle: BackendHandle,
    generation: u64,
    inner: Arc<Inner>,
    released: bool,
}

impl BackendLease {
    /// The handle this lease holds a reference for.
    pub fn handle(&self) -> &BackendHandle {
        &self.handle
    }

    /// Give the reference back, unloading the instance if this was the last
    /// one and the role neither keeps alive nor idles.
    pub async fn release(mut self) {
        self.released = true;
        if let Some(client) = self.inner.decrement(&self.handle.served_by, self.generation) {
            unload_client(&self.handle.served_by, client).await;
        }
    }
}

impl std::ops::Deref for BackendLease {
    type Target = BackendHandle;

    fn deref(&self) -> &BackendHandle {
        &self.handle
    }
}

impl Drop for BackendLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!(role = %self.handle.served_by, "Backend lease dropped without release");
        if let Some(client) = self.inner.decrement(&self.handle.served_by, self.generation) {
            let role = self.handle.served_by.clone();
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move { unload_client(&role, client).await });
            }
        }
    }
}

/// Live view of one loaded instance.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    /// Role the instance was loaded for.
    pub role: String,
    /// Model the instance serves.
    pub model_id: String,
    /// Outstanding leases.
    pub ref_count: usize,
    /// Whether the instance survives its last release.
    pub keep_alive: bool,
    /// Idle period before the sweep unloads it.
    pub idle_unload_secs: u64,
    /// When the instance was loaded.
    pub loaded_at: DateTime<Utc>,
    /// Time since the last reference was released, if currently unreferenced.
    pub idle_ms: Option<u64>,
}

/// A client checked out of the instance table, with the generation of the
/// instance it came from.
type Checkout = (Arc<dyn BackendClient>, u64);

struct Instance {
    config: RoleConfig,
    client: Arc<dyn BackendClient>,
    /// Distinguishes successive loads of the same role.
    generation: u64,
    ref_count: usize,
    loaded_at: DateTime<Utc>,
    last_released: Option<Instant>,
}

impl Instance {
    fn expired(&self, now: Instant) -> bool {
        if self.ref_count > 0 || self.config.keep_alive {
            return false;
        }
        match self.last_released {
            Some(at) => now.saturating_duration_since(at) >= self.config.idle_unload(),
            None => false,
        }
    }
}

struct Inner {
    factory: Arc<dyn BackendFactory>,
    roles: RwLock<HashMap<String, RoleConfig>>,
    fallback_order: Vec<String>,
    instances: Mutex<HashMap<String, Instance>>,
    load_gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    generations: AtomicU64,
}

impl Inner {
    fn role(&self, role: &str) -> Option<RoleConfig> {
        self.roles.read().get(role).cloned()
    }

    /// Take another reference on an already loaded instance.
    fn share(&self, role: &str) -> Option<Checkout> {
        let mut instances = self.instances.lock();
        let instance = instances.get_mut(role)?;
        instance.ref_count += 1;
        instance.last_released = None;
        Some((instance.client.clone(), instance.generation))
    }

    fn load_gate(&self, role: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.load_gates
            .lock()
            .entry(role.to_string())
            .or_default()
            .clone()
    }

    fn insert_loaded(&self, config: RoleConfig, client: Arc<dyn BackendClient>) -> u64 {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        self.instances.lock().insert(
            config.role.clone(),
            Instance {
                config,
                client,
                generation,
                ref_count: 1,
                loaded_at: Utc::now(),
                last_released: None,
            },
        );
        generation
    }

    /// Load on first use, share afterwards. Loads of the same role are
    /// serialized so concurrent first acquisitions end up on one instance.
    async fn checkout(&self, config: &RoleConfig) -> TaskweaveResult<Checkout> {
        if let Some(checkout) = self.share(&config.role) {
            return Ok(checkout);
        }
        let gate = self.load_gate(&config.role);
        let _loading = gate.lock().await;
        if let Some(checkout) = self.share(&config.role) {
            return Ok(checkout);
        }

        let client = self.factory.connect(config).await?;
        info!(
            role = %config.role,
            provider = %config.provider,
            model = %client.model_id(),
            "Loaded backend instance"
        );
        let generation = self.insert_loaded(config.clone(), client.clone());
        Ok((client, generation))
    }

    /// Drop one reference taken on `generation` of `role`. Returns the client
    /// when it must be unloaded now. A reference to an instance that has
    /// since been unloaded or reloaded is ignored.
    fn decrement(&self, role: &str, generation: u64) -> Option<Arc<dyn BackendClient>> {
        let mut instances = self.instances.lock();
        let instance = instances.get_mut(role)?;
        if instance.generation != generation {
            debug!(
                role,
                generation,
                current = instance.generation,
                "Ignoring stale backend reference"
            );
            return None;
        }
        instance.ref_count = instance.ref_count.saturating_sub(1);
        debug!(role, ref_count = instance.ref_count, "Released backend reference");
        if instance.ref_count > 0 {
            return None;
        }
        instance.last_released = Some(Instant::now());
        if instance.config.keep_alive || instance.config.idle_unload_secs > 0 {
            return None;
        }
        instances.remove(role).map(|instance| instance.client)
    }

    fn take_expired(&self, now: Instant) -> Vec<(String, Arc<dyn BackendClient>)> {
        let mut instances = self.instances.lock();
        let expired: Vec<String> = instances
            .iter()
            .filter(|(_, instance)| instance.expired(now))
            .map(|(role, _)| role.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|role| instances.remove(&role).map(|i| (role, i.client)))
            .collect()
    }

    /// Order in which other roles are tried when `role` is unavailable:
    /// already loaded instances, then the configured fallback order, then
    /// every other registered role by name.
    fn fallback_candidates(&self, role: &str) -> Vec<String> {
        let mut candidates: Vec<String> = {
            let instances = self.instances.lock();
            let mut loaded: Vec<String> = instances.keys().cloned().collect();
            loaded.sort();
            loaded
        };
        candidates.extend(self.fallback_order.iter().cloned());
        let mut registered: Vec<String> = self.roles.read().keys().cloned().collect();
        registered.sort();
        candidates.extend(registered);

        let mut seen = std::collections::HashSet::new();
        candidates.retain(|c| c != role && seen.insert(c.clone()));
        candidates
    }
}

async fn unload_client(role: &str, client: Arc<dyn BackendClient>) {
    match client.unload().await {
        Ok(()) => info!(role, model = %client.model_id(), "Unloaded backend instance"),
        Err(e) => warn!(role, error = %e, "Backend unload failed"),
    }
}

/// Acquires and releases shared backend instances per worker role.
///
/// The first acquisition of a role loads its instance through the
/// [`BackendFactory`]; later acquisitions share it under a reference count.
/// When the count reaches zero the instance is unloaded at once, kept for its
/// idle-unload period, or kept indefinitely if the role is keep-alive. An
/// unregistered or unreachable role is served by another role's instance
/// with [`BackendHandle::used_fallback`] set.
pub struct LifecycleManager {
    inner: Arc<Inner>,
}

impl LifecycleManager {
    /// A manager over `roles` with no explicit fallback order.
    pub fn new(factory: Arc<dyn BackendFactory>, roles: Vec<RoleConfig>) -> Self {
        Self::with_fallback_order(factory, roles, Vec::new())
    }

    /// A manager that tries `fallback_order` before other registered roles.
    pub fn with_fallback_order(
        factory: Arc<dyn BackendFactory>,
        roles: Vec<RoleConfig>,
        fallback_order: Vec<String>,
    ) -> Self {
        let roles = roles.into_iter().map(|r| (r.role.clone(), r)).collect();
        Self {
            inner: Arc::new(Inner {
                factory,
                roles: RwLock::new(roles),
                fallback_order,
                instances: Mutex::new(HashMap::new()),
                load_gates: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(0),
            }),
        }
    }

    /// Register or replace a role. A loaded instance keeps its old settings
    /// until it is unloaded.
    pub fn register_role(&self, config: RoleConfig) {
        info!(role = %config.role, model = %config.model_id, "Registered backend role");
        self.inner.roles.write().insert(config.role.clone(), config);
    }

    /// Registered roles, sorted by name.
    pub fn roles(&self) -> Vec<RoleConfig> {
        let mut roles: Vec<RoleConfig> = self.inner.roles.read().values().cloned().collect();
        roles.sort_by(|a, b| a.role.cmp(&b.role));
        roles
    }

    /// Acquire an instance for `role`, falling back to another role when it
    /// is unregistered or cannot be loaded.
    pub async fn acquire(&self, role: &str) -> TaskweaveResult<BackendLease> {
        match self.inner.role(role) {
            Some(config) => match self.inner.checkout(&config).await {
                Ok(checkout) => return Ok(self.lease(role, role, checkout, false)),
                Err(e) => warn!(role, error = %e, "Backend role unreachable, trying fallback"),
            },
            None => warn!(role, "Backend role not registered, trying fallback"),
        }

        for candidate in self.inner.fallback_candidates(role) {
            let Some(config) = self.inner.role(&candidate) else {
                continue;
            };
            match self.inner.checkout(&config).await {
                Ok(checkout) => {
                    info!(role, fallback = %candidate, model = %checkout.0.model_id(), "Using fallback backend");
                    return Ok(self.lease(role, &candidate, checkout, true));
                }
                Err(e) => debug!(role, fallback = %candidate, error = %e, "Fallback unreachable"),
            }
        }

        Err(TaskweaveError::NoBackendAvailable(format!(
            "role '{role}' is unavailable and no fallback could be loaded"
        )))
    }

    fn lease(
        &self,
        role: &str,
        served_by: &str,
        (client, generation): Checkout,
        used_fallback: bool,
    ) -> BackendLease {
        BackendLease {
            generation,
            handle: BackendHandle {
                role: role.to_string(),
                served_by: served_by.to_string(),
                model_id: client.model_id().to_string(),
                used_fallback,
                client,
            },
            inner: self.inner.clone(),
            released: false,
        }
    }

    /// Change a role's keep-alive flag, on the registered config and on a
    /// loaded instance. Turning it off leaves unloading to the sweep.
    pub fn set_keep_alive(&self, role: &str, keep_alive: bool) -> TaskweaveResult<()> {
        {
            let mut roles = self.inner.roles.write();
            let config = roles
                .get_mut(role)
                .ok_or_else(|| TaskweaveError::NotFound(format!("backend role '{role}'")))?;
            config.keep_alive = keep_alive;
        }
        let mut instances = self.inner.instances.lock();
        if let Some(instance) = instances.get_mut(role) {
            instance.config.keep_alive = keep_alive;
            if !keep_alive && instance.ref_count == 0 && instance.last_released.is_none() {
                instance.last_released = Some(Instant::now());
            }
        }
        Ok(())
    }

    /// Whether `role` currently has an instance.
    pub fn is_loaded(&self, role: &str) -> bool {
        self.inner.instances.lock().contains_key(role)
    }

    /// Outstanding leases on `role`, 0 when not loaded.
    pub fn ref_count(&self, role: &str) -> usize {
        self.inner
            .instances
            .lock()
            .get(role)
            .map_or(0, |instance| instance.ref_count)
    }

    /// Every loaded instance, sorted by role.
    pub fn status(&self) -> Vec<InstanceStatus> {
        let now = Instant::now();
        let instances = self.inner.instances.lock();
        let mut status: Vec<InstanceStatus> = instances
            .iter()
            .map(|(role, instance)| InstanceStatus {
                role: role.clone(),
                model_id: instance.client.model_id().to_string(),
                ref_count: instance.ref_count,
                keep_alive: instance.config.keep_alive,
                idle_unload_secs: instance.config.idle_unload_secs,
                loaded_at: instance.loaded_at,
                idle_ms: instance
                    .last_released
                    .map(|at| now.saturating_duration_since(at).as_millis() as u64),
            })
            .collect();
        status.sort_by(|a, b| a.role.cmp(&b.role));
        status
    }

    /// Unload every unreferenced, non-keep-alive instance whose idle period
    /// has elapsed. Returns the unloaded roles.
    pub async fn sweep_idle(&self) -> Vec<String> {
        self.sweep_at(Instant::now()).await
    }

    async fn sweep_at(&self, now: Instant) -> Vec<String> {
        let expired = self.inner.take_expired(now);
        let mut roles = Vec::with_capacity(expired.len());
        for (role, client) in expired {
            unload_client(&role, client).await;
            roles.push(role);
        }
        roles
    }

    /// Run [`Self::sweep_idle`] every `interval` until the manager is dropped.
    /// Intervals shorter than a millisecond are raised to one.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let interval = interval.max(MIN_SWEEP_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                for (role, client) in inner.take_expired(Instant::now()) {
                    unload_client(&role, client).await;
                }
            }
            debug!("Backend sweeper stopped");
        })
    }

    /// Unload every instance regardless of references. For shutdown.
    pub async fn unload_all(&self) {
        let all: Vec<(String, Arc<dyn BackendClient>)> = self
            .inner
            .instances
            .lock()
            .drain()
            .map(|(role, instance)| (role, instance.client))
            .collect();
        for (role, client) in all {
            unload_client(&role, client).await;
        }
    }
}
