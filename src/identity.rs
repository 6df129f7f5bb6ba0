//! Replica identity used as the lease holder token and as the routing label value.

use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("replica identity is empty")]
    Empty,
    #[error("could not determine a replica identity: no configured identity and no usable host name")]
    Unresolved,
}

/// Immutable per-process identity, unique across the fleet (normally the pod name).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity(String);

impl Identity {
    pub fn new(value: impl Into<String>) -> Result<Self, IdentityError> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(IdentityError::Empty);
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Resolve the identity from an explicit value, falling back to the OS host name.
    ///
    /// In Kubernetes the `HOSTNAME` variable (already folded into `configured` by
    /// the settings layer) and the host name are both the pod name.
    pub fn resolve(configured: Option<&str>) -> Result<Self, IdentityError> {
        if let Some(value) = configured.filter(|v| !v.trim().is_empty()) {
            return Self::new(value);
        }
        get_hostname()
            .ok_or(IdentityError::Unresolved)
            .and_then(Self::new)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Identity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Get the hostname of the current machine
pub fn get_hostname() -> Option<String> {
    hostname::get().ok().and_then(|h| h.into_string().ok())
}
