//! Access to the coordination service and the lease-based election built on it.
//!
//! - `k8s_backend`: the `K8sBackend` trait over the Kubernetes API, with a kube-rs
//!   implementation. All writes carry a `resourceVersion` so the API server
//!   rejects concurrent modifications with 409 Conflict.
//! - `election`: the `LeaseCoordinator` acquire/renew/release loop.

pub mod election;
pub mod k8s_backend;

pub use election::{
    ElectionConfig, ElectionError, LeaderElectionRecord, LeaseCoordinator, LeaseObserver,
};
pub use k8s_backend::{K8sBackend, KubeBackend};

/// Error type for coordination operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum CoordinationError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("backend error: {0}")]
    BackendError(String),
    /// Optimistic concurrency failure: the object already exists or changed since it was read.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("operation timed out")]
    Timeout,
}

impl CoordinationError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, CoordinationError::Conflict(_))
    }
}
