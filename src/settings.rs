use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Environment variables that override values from the config file.
pub const ENV_LEASE_DURATION: &str = "LEASE_DURATION";
pub const ENV_RENEWAL_DEADLINE: &str = "RENEWAL_DEADLINE";
pub const ENV_RETRY_PERIOD: &str = "RETRY_PERIOD";
pub const ENV_HOSTNAME: &str = "HOSTNAME";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value {value:?} for {name}: expected a non-negative integer")]
    InvalidEnv { name: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub election: ElectionSettings,
    pub routing: RoutingSettings,
    pub registration: RegistrationSettings,
    pub status: StatusSettings,
    pub workload: WorkloadSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ElectionSettings {
    pub lease_name: String,
    pub namespace: String,
    pub lease_duration_secs: u64,
    pub renew_deadline_secs: u64,
    pub retry_period_secs: u64,
    /// Lock holder token. Resolved from `HOSTNAME` or the OS host name when unset.
    pub identity: Option<String>,
}

impl Default for ElectionSettings {
    fn default() -> Self {
        Self {
            lease_name: default_object_name(),
            namespace: default_namespace(),
            lease_duration_secs: 15,
            renew_deadline_secs: 10,
            retry_period_secs: 5,
            identity: None,
        }
    }
}

impl ElectionSettings {
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_secs)
    }

    pub fn renew_deadline(&self) -> Duration {
        Duration::from_secs(self.renew_deadline_secs)
    }

    pub fn retry_period(&self) -> Duration {
        Duration::from_secs(self.retry_period_secs)
    }
}

/// The Service whose selector is pointed at the current leader.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RoutingSettings {
    pub service_name: String,
    pub namespace: String,
    pub selector_key: String,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self {
            service_name: default_object_name(),
            namespace: default_namespace(),
            selector_key: default_label_key(),
        }
    }
}

/// The label this replica puts on its own Pod at startup.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RegistrationSettings {
    pub namespace: String,
    pub label_key: String,
}

impl Default for RegistrationSettings {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            label_key: default_label_key(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StatusSettings {
    pub listen_addr: String,
}

impl Default for StatusSettings {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WorkloadSettings {
    pub interval_ms: u64,
    /// How long a demotion waits for the workload to acknowledge cancellation.
    pub stop_timeout_ms: u64,
}

impl Default for WorkloadSettings {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            stop_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct LoggingSettings {
    pub format: LogFormat,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

fn default_object_name() -> String {
    "k8s-leader-example".to_string()
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_label_key() -> String {
    "pod".to_string()
}

impl AppConfig {
    /// Load the config file (or defaults), apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut cfg = match path {
            Some(p) => Self::from_toml(&fs::read_to_string(p)?)?,
            None => Self::default(),
        };
        cfg.apply_env(|name| std::env::var(name).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml(data: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(data)?)
    }

    /// Apply overrides looked up by environment variable name.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let secs = |name: &'static str| -> Result<Option<u64>, ConfigError> {
            match lookup(name) {
                Some(value) => value
                    .trim()
                    .parse::<u64>()
                    .map(Some)
                    .map_err(|_| ConfigError::InvalidEnv { name, value }),
                None => Ok(None),
            }
        };

        if let Some(v) = secs(ENV_LEASE_DURATION)? {
            self.election.lease_duration_secs = v;
        }
        if let Some(v) = secs(ENV_RENEWAL_DEADLINE)? {
            self.election.renew_deadline_secs = v;
        }
        if let Some(v) = secs(ENV_RETRY_PERIOD)? {
            self.election.retry_period_secs = v;
        }
        if self.election.identity.is_none() {
            self.election.identity = lookup(ENV_HOSTNAME).filter(|h| !h.trim().is_empty());
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let e = &self.election;
        if e.lease_name.is_empty() || e.namespace.is_empty() {
            return Err(ConfigError::Invalid(
                "election.lease_name and election.namespace must be set".into(),
            ));
        }
        if e.lease_duration_secs == 0 || e.renew_deadline_secs == 0 || e.retry_period_secs == 0 {
            return Err(ConfigError::Invalid(
                "lease duration, renew deadline and retry period must be positive".into(),
            ));
        }
        if e.lease_duration_secs <= e.renew_deadline_secs {
            return Err(ConfigError::Invalid(format!(
                "lease duration ({}s) must be greater than renew deadline ({}s)",
                e.lease_duration_secs, e.renew_deadline_secs
            )));
        }
        if e.renew_deadline_secs <= e.retry_period_secs {
            return Err(ConfigError::Invalid(format!(
                "renew deadline ({}s) must be greater than retry period ({}s)",
                e.renew_deadline_secs, e.retry_period_secs
            )));
        }
        if self.routing.service_name.is_empty() || self.routing.selector_key.is_empty() {
            return Err(ConfigError::Invalid(
                "routing.service_name and routing.selector_key must be set".into(),
            ));
        }
        if self.registration.label_key.is_empty() {
            return Err(ConfigError::Invalid(
                "registration.label_key must be set".into(),
            ));
        }
        self.status_addr()?;
        Ok(())
    }

    pub fn status_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.status.listen_addr.parse().map_err(|_| {
            ConfigError::Invalid(format!(
                "status.listen_addr {:?} is not a socket address",
                self.status.listen_addr
            ))
        })
    }
}
