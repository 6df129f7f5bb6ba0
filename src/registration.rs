use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::coordination::{CoordinationError, K8sBackend};
use crate::identity::Identity;

#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("own pod {namespace}/{name} not found")]
    PodNotFound { namespace: String, name: String },
    #[error("failed to read own pod: {0}")]
    Read(#[source] CoordinationError),
    #[error("failed to update own pod labels: {0}")]
    Write(#[source] CoordinationError),
}

/// Label this replica's own Pod with `label_key=<identity>`.
///
/// The Pod is looked up by the identity (the pod name). If the label already has
/// the right value nothing is written, so repeated calls are harmless.
pub async fn register_self<B: K8sBackend>(
    backend: &B,
    namespace: &str,
    label_key: &str,
    identity: &Identity,
) -> Result<(), RegistrationError> {
    let mut pod = backend
        .get_pod(namespace, identity.as_str())
        .await
        .map_err(RegistrationError::Read)?
        .ok_or_else(|| RegistrationError::PodNotFound {
            namespace: namespace.to_string(),
            name: identity.to_string(),
        })?;

    let labels = pod.metadata.labels.get_or_insert_with(BTreeMap::new);
    if labels.get(label_key).map(String::as_str) == Some(identity.as_str()) {
        debug!(identity = %identity, label = %label_key, "pod label already set");
        return Ok(());
    }
    labels.insert(label_key.to_string(), identity.to_string());

    let updated = backend
        .replace_pod(namespace, identity.as_str(), &pod)
        .await
        .map_err(RegistrationError::Write)?;

    let value = updated
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(label_key))
        .cloned()
        .unwrap_or_default();
    info!(identity = %identity, label = %label_key, value = %value, "updated pod label");
    Ok(())
}
