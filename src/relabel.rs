//! Points the shared routing Service at the current leader.
//!
//! The Service selector is keyed on the label every replica puts on its own Pod
//! at startup (see `registration`), so setting `selector[key] = identity` sends
//! all traffic to exactly this replica. Only the leader writes the selector;
//! that exclusivity comes from the lease, not from anything here.

use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::info;

use crate::coordination::{CoordinationError, K8sBackend};
use crate::identity::Identity;
use crate::role::{LeadershipError, LeadershipHooks};
use crate::settings::RoutingSettings;

#[derive(Debug, thiserror::Error)]
pub enum RelabelError {
    #[error("routing service {namespace}/{name} not found")]
    ServiceNotFound { namespace: String, name: String },
    #[error("failed to read routing service: {0}")]
    Read(#[source] CoordinationError),
    #[error("failed to update routing service: {0}")]
    Write(#[source] CoordinationError),
}

#[derive(Clone)]
pub struct TrafficRelabeler<B: K8sBackend> {
    backend: B,
    namespace: String,
    service_name: String,
    selector_key: String,
    identity: Identity,
}

impl<B: K8sBackend> TrafficRelabeler<B> {
    pub fn new(
        backend: B,
        namespace: impl Into<String>,
        service_name: impl Into<String>,
        selector_key: impl Into<String>,
        identity: Identity,
    ) -> Self {
        Self {
            backend,
            namespace: namespace.into(),
            service_name: service_name.into(),
            selector_key: selector_key.into(),
            identity,
        }
    }

    pub fn from_settings(backend: B, settings: &RoutingSettings, identity: Identity) -> Self {
        Self::new(
            backend,
            settings.namespace.clone(),
            settings.service_name.clone(),
            settings.selector_key.clone(),
            identity,
        )
    }

    /// Set the Service selector's key to our identity and write it back with CAS.
    ///
    /// A conflict is returned as an error rather than retried: only the leader
    /// should be writing this object.
    pub async fn relabel(&self) -> Result<BTreeMap<String, String>, RelabelError> {
        let mut service = self
            .backend
            .get_service(&self.namespace, &self.service_name)
            .await
            .map_err(RelabelError::Read)?
            .ok_or_else(|| RelabelError::ServiceNotFound {
                namespace: self.namespace.clone(),
                name: self.service_name.clone(),
            })?;

        let spec = service.spec.get_or_insert_with(Default::default);
        spec.selector
            .get_or_insert_with(BTreeMap::new)
            .insert(self.selector_key.clone(), self.identity.to_string());

        let updated = self
            .backend
            .replace_service(&self.namespace, &self.service_name, &service)
            .await
            .map_err(RelabelError::Write)?;

        let selector = updated
            .spec
            .and_then(|s| s.selector)
            .unwrap_or_default();
        info!(
            identity = %self.identity,
            service = %self.service_name,
            selector = ?selector,
            "updated service selector to current pod"
        );
        Ok(selector)
    }
}

#[async_trait]
impl<B: K8sBackend> LeadershipHooks for TrafficRelabeler<B> {
    async fn started_leading(&self) -> Result<(), LeadershipError> {
        self.relabel()
            .await
            .map(|_| ())
            .map_err(|e| LeadershipError::new("traffic relabel", e))
    }

    async fn stopped_leading(&self) {
        info!(identity = %self.identity, "stopped being leader, selector left for the next leader");
    }
}
