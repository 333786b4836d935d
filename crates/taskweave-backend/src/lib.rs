//! Generative-backend lifecycle for Taskweave workers.
//!
//! Each worker kind maps to a backend role. The [`LifecycleManager`] loads a
//! role's instance on first use, shares it between concurrent workers under a
//! reference count, and unloads it when the last reference is released, after
//! an idle period, or never for keep-alive roles.

/// Backend client and factory traits.
pub mod client;
/// Reference-counted instance management with fallback.
pub mod lifecycle;
/// Default role table.
pub mod roles;

pub use client::{BackendClient, BackendFactory};
pub use lifecycle::{BackendHandle, BackendLease, InstanceStatus, LifecycleManager};
pub use roles::{
    default_roles, ROLE_ANALYSIS, ROLE_CODE, ROLE_RESEARCH, ROLE_REVIEW, ROLE_TEST,
};
