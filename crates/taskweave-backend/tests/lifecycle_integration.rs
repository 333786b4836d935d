#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use taskweave_backend::{default_roles, BackendClient, BackendFactory, LifecycleManager, ROLE_CODE, ROLE_REVIEW};
use taskweave_core::{RoleConfig, TaskweaveResult};

struct EchoClient {
    model: String,
}

#[async_trait]
impl BackendClient for EchoClient {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn generate(&self, system: Option<&str>, prompt: &str) -> TaskweaveResult<String> {
        Ok(format!("[{}] {} {prompt}", self.model, system.unwrap_or("")))
    }
}

#[derive(Default)]
struct CountingFactory {
    connects: AtomicUsize,
}

#[async_trait]
impl BackendFactory for CountingFactory {
    async fn connect(&self, config: &RoleConfig) -> TaskweaveResult<Arc<dyn BackendClient>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(EchoClient {
            model: config.model_id.clone(),
        }))
    }
}

// ---------------------------------------------------------------------------
// Many workers hammering one role load it exactly once and leave it unloaded
// ---------------------------------------------------------------------------

#[tokio::test]
async fn parallel_workers_share_one_instance() {
    let factory = Arc::new(CountingFactory::default());
    let mgr = Arc::new(LifecycleManager::new(
        factory.clone(),
        vec![RoleConfig::new("test", "mock", "tester")],
    ));

    // Hold one lease for the whole run so the instance is never torn down
    // between workers.
    let anchor = mgr.acquire("test").await.unwrap();

    let mut handles = Vec::new();
    for i in 0..12 {
        let mgr = mgr.clone();
        handles.push(tokio::spawn(async move {
            let lease = mgr.acquire("test").await.unwrap();
            let out = lease.client().generate(None, &format!("job {i}")).await.unwrap();
            lease.release().await;
            out
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().contains("tester"));
    }

    assert_eq!(factory.connects.load(Ordering::SeqCst), 1);
    assert_eq!(mgr.ref_count("test"), 1);
    anchor.release().await;
    assert!(!mgr.is_loaded("test"));
}

// ---------------------------------------------------------------------------
// Default role table: code stays warm, review idles out through the sweeper
// ---------------------------------------------------------------------------

#[tokio::test]
async fn default_roles_keep_code_warm() {
    let factory = Arc::new(CountingFactory::default());
    let mut roles = default_roles("mock", "base-8b");
    for role in roles.iter_mut().filter(|r| r.role == ROLE_REVIEW) {
        role.idle_unload_secs = 0;
    }
    let mgr = LifecycleManager::new(factory, roles);

    mgr.acquire(ROLE_CODE).await.unwrap().release().await;
    mgr.acquire(ROLE_REVIEW).await.unwrap().release().await;

    assert!(mgr.is_loaded(ROLE_CODE));
    assert!(!mgr.is_loaded(ROLE_REVIEW));
}

#[tokio::test]
async fn sweeper_stops_when_manager_dropped() {
    let factory = Arc::new(CountingFactory::default());
    let mgr = LifecycleManager::new(factory, vec![RoleConfig::new("code", "mock", "coder")]);
    let sweeper = mgr.spawn_sweeper(Duration::from_millis(10));
    drop(mgr);
    tokio::time::timeout(Duration::from_secs(2), sweeper)
        .await
        .expect("sweeper should exit")
        .unwrap();
}
