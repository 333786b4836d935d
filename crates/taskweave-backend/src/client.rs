use async_trait::async_trait;
use std::sync::Arc;
use taskweave_core::{RoleConfig, TaskweaveResult};

/// A loaded generative-backend instance.
///
/// Implementations own the provider wire protocol; the lifecycle manager only
/// loads, shares and unloads them.
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Concrete model this instance serves.
    fn model_id(&self) -> &str;

    /// Single-shot completion.
    async fn generate(&self, system_prompt: Option<&str>, prompt: &str) -> TaskweaveResult<String>;

    /// Release provider-side resources. Called once, when the instance is
    /// torn down.
    async fn unload(&self) -> TaskweaveResult<()> {
        Ok(())
    }
}

/// Resolves a role's provider id into a live [`BackendClient`].
///
/// An error means the role is unreachable, which makes the lifecycle manager
/// try a fallback role.
#[async_trait]
pub trait BackendFactory: Send + Sync {
    /// Load an instance for `config`.
    async fn connect(&self, config: &RoleConfig) -> TaskweaveResult<Arc<dyn BackendClient>>;
}
