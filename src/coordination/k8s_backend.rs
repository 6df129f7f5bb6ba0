//! Abstraction over Kubernetes API operations for testability.
//!
//! This module defines the `K8sBackend` trait which abstracts the handful of
//! Kubernetes API calls leader election needs, allowing the coordinator,
//! relabeler and self-registration to work with either a real cluster or an
//! in-memory backend in tests.

use async_trait::async_trait;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::{Api, PostParams};
use kube::Resource;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Debug;

use super::CoordinationError;

/// Trait abstracting Kubernetes API operations.
///
/// Implementations must not retry internally; callers decide what is transient.
/// `get_*` returns `Ok(None)` when the object does not exist. `create_*` and
/// `replace_*` return `CoordinationError::Conflict` when the API server rejects
/// the write with 409 (object exists, or `resourceVersion` mismatch).
#[async_trait]
pub trait K8sBackend: Send + Sync + Clone + 'static {
    // ========================================================================
    // Lease operations
    // ========================================================================

    async fn get_lease(&self, namespace: &str, name: &str)
    -> Result<Option<Lease>, CoordinationError>;

    async fn create_lease(&self, namespace: &str, lease: &Lease)
    -> Result<Lease, CoordinationError>;

    /// Replace an existing lease using CAS semantics.
    /// The lease's resourceVersion must match the current version.
    async fn replace_lease(
        &self,
        namespace: &str,
        name: &str,
        lease: &Lease,
    ) -> Result<Lease, CoordinationError>;

    // ========================================================================
    // Pod operations (self-registration)
    // ========================================================================

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, CoordinationError>;

    async fn replace_pod(
        &self,
        namespace: &str,
        name: &str,
        pod: &Pod,
    ) -> Result<Pod, CoordinationError>;

    // ========================================================================
    // Service operations (traffic routing)
    // ========================================================================

    async fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Service>, CoordinationError>;

    async fn replace_service(
        &self,
        namespace: &str,
        name: &str,
        service: &Service,
    ) -> Result<Service, CoordinationError>;
}

// ============================================================================
// Real Kubernetes backend using kube-rs
// ============================================================================

/// Real Kubernetes backend using kube-rs client.
#[derive(Clone)]
pub struct KubeBackend {
    client: kube::Client,
}

impl KubeBackend {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    /// Create a new KubeBackend using the default in-cluster or kubeconfig configuration.
    pub async fn try_default() -> Result<Self, CoordinationError> {
        let client = kube::Client::try_default()
            .await
            .map_err(|e| CoordinationError::ConnectionFailed(e.to_string()))?;
        Ok(Self::new(client))
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

async fn get_opt<K>(api: Api<K>, name: &str) -> Result<Option<K>, CoordinationError>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    match api.get(name).await {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
        Err(e) => Err(CoordinationError::BackendError(e.to_string())),
    }
}

async fn create<K>(api: Api<K>, obj: &K) -> Result<K, CoordinationError>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
{
    match api.create(&PostParams::default(), obj).await {
        Ok(created) => Ok(created),
        Err(kube::Error::Api(e)) if e.code == 409 => Err(CoordinationError::Conflict(
            "object already exists".into(),
        )),
        Err(e) => Err(CoordinationError::BackendError(e.to_string())),
    }
}

async fn replace<K>(api: Api<K>, name: &str, obj: &K) -> Result<K, CoordinationError>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
{
    match api.replace(name, &PostParams::default(), obj).await {
        Ok(replaced) => Ok(replaced),
        Err(kube::Error::Api(e)) if e.code == 409 => Err(CoordinationError::Conflict(
            "resourceVersion mismatch".into(),
        )),
        Err(kube::Error::Api(e)) if e.code == 404 => {
            Err(CoordinationError::NotFound(name.to_string()))
        }
        Err(e) => Err(CoordinationError::BackendError(e.to_string())),
    }
}

#[async_trait]
impl K8sBackend for KubeBackend {
    async fn get_lease(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Lease>, CoordinationError> {
        get_opt(self.api::<Lease>(namespace), name).await
    }

    async fn create_lease(
        &self,
        namespace: &str,
        lease: &Lease,
    ) -> Result<Lease, CoordinationError> {
        create(self.api::<Lease>(namespace), lease).await
    }

    async fn replace_lease(
        &self,
        namespace: &str,
        name: &str,
        lease: &Lease,
    ) -> Result<Lease, CoordinationError> {
        replace(self.api::<Lease>(namespace), name, lease).await
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, CoordinationError> {
        get_opt(self.api::<Pod>(namespace), name).await
    }

    async fn replace_pod(
        &self,
        namespace: &str,
        name: &str,
        pod: &Pod,
    ) -> Result<Pod, CoordinationError> {
        replace(self.api::<Pod>(namespace), name, pod).await
    }

    async fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Service>, CoordinationError> {
        get_opt(self.api::<Service>(namespace), name).await
    }

    async fn replace_service(
        &self,
        namespace: &str,
        name: &str,
        service: &Service,
    ) -> Result<Service, CoordinationError> {
        replace(self.api::<Service>(namespace), name, service).await
    }
}
