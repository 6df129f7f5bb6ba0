//! Lease-based leader election.
//!
//! A single `Lease` object is the lock. Whoever has their identity in
//! `holderIdentity` with a `renewTime` younger than `leaseDurationSeconds` is the
//! leader. Every write goes through `replace` with the `resourceVersion` that was
//! read, so when two candidates race the API server accepts exactly one write and
//! the other sees a conflict and simply tries again later.
//!
//! ## Timing
//!
//! - `retry_period`: cadence of both acquisition attempts and renewals.
//! - `renew_deadline`: how long a holder keeps failing to renew before it gives
//!   up leadership locally. The record is left alone and expires on its own.
//! - `lease_duration`: how long other candidates wait after the last renewal
//!   before treating the lease as abandoned.
//!
//! ## Known Limitations
//!
//! - **Clock skew sensitivity**: expiry compares the local wall clock against the
//!   `renewTime` written by the holder. Large skew between nodes widens the window
//!   in which two replicas can both believe they lead.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{CoordinationError, K8sBackend};
use crate::identity::Identity;
use crate::role::LeadershipError;
use crate::settings::ElectionSettings;

/// Lease duration written when voluntarily releasing, so waiting candidates
/// do not have to sit out the full duration.
const RELEASED_LEASE_DURATION_SECS: i32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum ElectionError {
    #[error("invalid election config: {0}")]
    InvalidConfig(String),
    #[error("leadership transition failed: {0}")]
    Leadership(#[from] LeadershipError),
}

#[derive(Debug, Clone)]
pub struct ElectionConfig {
    pub lease_name: String,
    pub namespace: String,
    pub identity: Identity,
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

impl ElectionConfig {
    pub fn from_settings(settings: &ElectionSettings, identity: Identity) -> Self {
        Self {
            lease_name: settings.lease_name.clone(),
            namespace: settings.namespace.clone(),
            identity,
            lease_duration: settings.lease_duration(),
            renew_deadline: settings.renew_deadline(),
            retry_period: settings.retry_period(),
        }
    }

    pub fn validate(&self) -> Result<(), ElectionError> {
        if self.lease_name.is_empty() {
            return Err(ElectionError::InvalidConfig("lease name is empty".into()));
        }
        if self.namespace.is_empty() {
            return Err(ElectionError::InvalidConfig("namespace is empty".into()));
        }
        if self.retry_period.is_zero() {
            return Err(ElectionError::InvalidConfig(
                "retry period must be positive".into(),
            ));
        }
        if self.lease_duration <= self.renew_deadline {
            return Err(ElectionError::InvalidConfig(format!(
                "lease duration {:?} must be greater than renew deadline {:?}",
                self.lease_duration, self.renew_deadline
            )));
        }
        if self.renew_deadline <= self.retry_period {
            return Err(ElectionError::InvalidConfig(format!(
                "renew deadline {:?} must be greater than retry period {:?}",
                self.renew_deadline, self.retry_period
            )));
        }
        if self.lease_duration_secs() < 1 {
            return Err(ElectionError::InvalidConfig(
                "lease duration must be at least one second".into(),
            ));
        }
        Ok(())
    }

    fn lease_duration_secs(&self) -> i32 {
        i32::try_from(self.lease_duration.as_secs()).unwrap_or(i32::MAX)
    }
}

/// Plain view of a lease's election-relevant fields.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LeaderElectionRecord {
    pub holder_identity: Option<String>,
    pub lease_duration_secs: i32,
    pub acquire_time: Option<DateTime<Utc>>,
    pub renew_time: Option<DateTime<Utc>>,
    pub lease_transitions: i32,
}

impl LeaderElectionRecord {
    pub fn from_lease(lease: &Lease, default_duration_secs: i32) -> Self {
        let spec = lease.spec.as_ref();
        Self {
            holder_identity: spec
                .and_then(|s| s.holder_identity.clone())
                .filter(|h| !h.is_empty()),
            lease_duration_secs: spec
                .and_then(|s| s.lease_duration_seconds)
                .unwrap_or(default_duration_secs),
            acquire_time: spec.and_then(|s| s.acquire_time.as_ref()).map(|t| t.0),
            renew_time: spec.and_then(|s| s.renew_time.as_ref()).map(|t| t.0),
            lease_transitions: spec.and_then(|s| s.lease_transitions).unwrap_or(0),
        }
    }

    /// A lease without a renew time counts as expired.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.renew_time
            .map(|rt| now > rt + chrono::Duration::seconds(self.lease_duration_secs as i64))
            .unwrap_or(true)
    }

    pub fn is_held_by(&self, identity: &str) -> bool {
        self.holder_identity.as_deref() == Some(identity)
    }

    fn into_spec(self) -> LeaseSpec {
        LeaseSpec {
            holder_identity: self.holder_identity,
            lease_duration_seconds: Some(self.lease_duration_secs),
            acquire_time: self.acquire_time.map(MicroTime),
            renew_time: self.renew_time.map(MicroTime),
            lease_transitions: Some(self.lease_transitions),
            ..Default::default()
        }
    }
}

/// Receiver of the coordinator's leadership transitions.
///
/// `on_acquired` and `on_lost` strictly alternate, starting with `on_acquired`.
/// Both run inline in the election task, so the loop does not renew while they
/// are executing.
#[async_trait]
pub trait LeaseObserver: Send {
    /// This replica now holds the lease. An error is fatal: the coordinator
    /// reports `on_lost`, releases the lease and stops.
    async fn on_acquired(&mut self) -> Result<(), LeadershipError>;

    /// This replica no longer holds the lease, or is about to release it.
    async fn on_lost(&mut self);

    /// The observed holder of the lease changed (including to ourselves).
    fn on_new_leader(&mut self, _holder: &str) {}
}

enum AcquireOutcome {
    Acquired,
    /// `in_flight` is set when cancellation interrupted a write attempt.
    Cancelled { in_flight: bool },
}

enum RenewOutcome {
    Lost,
    Cancelled,
}

/// Runs the acquire/renew/release protocol for one lease on behalf of one identity.
pub struct LeaseCoordinator<B: K8sBackend> {
    backend: B,
    config: ElectionConfig,
    observed_leader: watch::Sender<Option<String>>,
}

impl<B: K8sBackend> LeaseCoordinator<B> {
    pub fn new(backend: B, config: ElectionConfig) -> Result<Self, ElectionError> {
        config.validate()?;
        let (observed_leader, _) = watch::channel(None);
        Ok(Self {
            backend,
            config,
            observed_leader,
        })
    }

    pub fn config(&self) -> &ElectionConfig {
        &self.config
    }

    pub fn identity(&self) -> &Identity {
        &self.config.identity
    }

    /// Holder identity seen on the most recent successful read of the lease.
    pub fn leader(&self) -> watch::Receiver<Option<String>> {
        self.observed_leader.subscribe()
    }

    /// Run the election until `cancel` fires.
    ///
    /// Returns `Ok(())` after a cancellation (releasing the lease first if held,
    /// or if the cancellation cut off a write) and an error only when the
    /// observer rejects a leadership transition.
    pub async fn run<O: LeaseObserver>(
        &self,
        cancel: CancellationToken,
        observer: &mut O,
    ) -> Result<(), ElectionError> {
        let id = self.config.identity.as_str();
        let lease = self.config.lease_name.as_str();
        info!(identity = %id, lease = %lease, namespace = %self.config.namespace, "starting leader election");
        let mut seen_leader = self.leader();

        loop {
            match self.acquire(&cancel, observer, &mut seen_leader).await {
                AcquireOutcome::Acquired => {}
                AcquireOutcome::Cancelled { in_flight } => {
                    // An interrupted write may still have landed on the server.
                    if in_flight {
                        self.release_bounded().await;
                    }
                    info!(identity = %id, lease = %lease, "leader election cancelled before acquiring");
                    return Ok(());
                }
            }

            info!(identity = %id, lease = %lease, "acquired lease, starting leadership");
            if let Err(e) = observer.on_acquired().await {
                error!(identity = %id, lease = %lease, error = %e, "leadership start failed, giving up the lease");
                observer.on_lost().await;
                self.release_bounded().await;
                return Err(e.into());
            }

            let outcome = self.renew(&cancel, observer, &mut seen_leader).await;
            observer.on_lost().await;
            match outcome {
                RenewOutcome::Lost => {
                    info!(identity = %id, lease = %lease, "leadership lost, back to candidate");
                }
                RenewOutcome::Cancelled => {
                    self.release_bounded().await;
                    info!(identity = %id, lease = %lease, "leader election stopped");
                    return Ok(());
                }
            }
        }
    }

    /// Poll for the lease every `retry_period` until it is ours or we are cancelled.
    async fn acquire<O: LeaseObserver>(
        &self,
        cancel: &CancellationToken,
        observer: &mut O,
        seen_leader: &mut watch::Receiver<Option<String>>,
    ) -> AcquireOutcome {
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return AcquireOutcome::Cancelled { in_flight: false };
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => return AcquireOutcome::Cancelled { in_flight: true },
                r = tokio::time::timeout(self.config.renew_deadline, self.try_acquire_or_renew()) => {
                    r.unwrap_or(Err(CoordinationError::Timeout))
                }
            };
            report_new_leader(seen_leader, observer);

            match result {
                Ok(true) => return AcquireOutcome::Acquired,
                Ok(false) => {
                    debug!(identity = %self.config.identity, attempt, "lease held by another replica");
                }
                Err(e) if e.is_conflict() => {
                    debug!(identity = %self.config.identity, attempt, error = %e, "lost acquisition race, retrying");
                }
                Err(e) => {
                    warn!(identity = %self.config.identity, attempt, error = %e, "failed to acquire lease, retrying");
                }
            }
            attempt = attempt.wrapping_add(1);

            tokio::select! {
                _ = cancel.cancelled() => return AcquireOutcome::Cancelled { in_flight: false },
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }
        }
    }

    /// Renew every `retry_period` until renewal has failed for `renew_deadline`,
    /// another replica is seen holding the lease, or we are cancelled.
    ///
    /// Each attempt is bounded by `retry_period`, so `lost` follows the deadline
    /// by at most one more period.
    async fn renew<O: LeaseObserver>(
        &self,
        cancel: &CancellationToken,
        observer: &mut O,
        seen_leader: &mut watch::Receiver<Option<String>>,
    ) -> RenewOutcome {
        let mut last_renewed = Instant::now();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return RenewOutcome::Cancelled,
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => return RenewOutcome::Cancelled,
                r = tokio::time::timeout(self.config.retry_period, self.try_acquire_or_renew()) => {
                    r.unwrap_or(Err(CoordinationError::Timeout))
                }
            };
            report_new_leader(seen_leader, observer);

            match result {
                Ok(true) => {
                    last_renewed = Instant::now();
                    debug!(identity = %self.config.identity, "renewed lease");
                    continue;
                }
                Ok(false) => {
                    warn!(identity = %self.config.identity, holder = ?self.observed_leader.borrow().clone(), "lease taken over by another replica");
                    return RenewOutcome::Lost;
                }
                Err(e) => {
                    warn!(identity = %self.config.identity, error = %e, "failed to renew lease");
                }
            }

            if last_renewed.elapsed() >= self.config.renew_deadline {
                warn!(
                    identity = %self.config.identity,
                    deadline = ?self.config.renew_deadline,
                    "could not renew lease before the renew deadline"
                );
                return RenewOutcome::Lost;
            }
        }
    }

    /// One acquisition or renewal attempt.
    ///
    /// Returns `Ok(true)` if we hold the lease afterwards and `Ok(false)` if another
    /// identity holds an unexpired lease. A lost write race surfaces as
    /// `CoordinationError::Conflict`.
    pub async fn try_acquire_or_renew(&self) -> Result<bool, CoordinationError> {
        let ns = self.config.namespace.as_str();
        let name = self.config.lease_name.as_str();
        let id = self.config.identity.as_str();
        let now = Utc::now();
        let duration_secs = self.config.lease_duration_secs();

        let Some(existing) = self.backend.get_lease(ns, name).await? else {
            debug!(identity = %id, lease = %name, "lease not found, creating");
            let record = LeaderElectionRecord {
                holder_identity: Some(id.to_string()),
                lease_duration_secs: duration_secs,
                acquire_time: Some(now),
                renew_time: Some(now),
                lease_transitions: 0,
            };
            let lease = Lease {
                metadata: kube::api::ObjectMeta {
                    name: Some(name.to_string()),
                    namespace: Some(ns.to_string()),
                    ..Default::default()
                },
                spec: Some(record.into_spec()),
            };
            self.backend.create_lease(ns, &lease).await?;
            self.observe_holder(Some(id));
            return Ok(true);
        };

        let record = LeaderElectionRecord::from_lease(&existing, duration_secs);
        self.observe_holder(record.holder_identity.as_deref());

        let held_by_us = record.is_held_by(id);
        if record.holder_identity.is_some() && !held_by_us && !record.is_expired(now) {
            return Ok(false);
        }

        let rv = existing.metadata.resource_version.clone().ok_or_else(|| {
            CoordinationError::BackendError("existing lease has no resourceVersion".into())
        })?;

        let updated = if held_by_us {
            LeaderElectionRecord {
                holder_identity: Some(id.to_string()),
                lease_duration_secs: duration_secs,
                renew_time: Some(now),
                acquire_time: record.acquire_time.or(Some(now)),
                lease_transitions: record.lease_transitions,
            }
        } else {
            debug!(identity = %id, lease = %name, previous = ?record.holder_identity, "taking over unheld or expired lease");
            LeaderElectionRecord {
                holder_identity: Some(id.to_string()),
                lease_duration_secs: duration_secs,
                acquire_time: Some(now),
                renew_time: Some(now),
                lease_transitions: record.lease_transitions.saturating_add(1),
            }
        };

        let lease = Lease {
            metadata: kube::api::ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(ns.to_string()),
                resource_version: Some(rv),
                uid: existing.metadata.uid.clone(),
                labels: existing.metadata.labels.clone(),
                annotations: existing.metadata.annotations.clone(),
                ..Default::default()
            },
            spec: Some(updated.into_spec()),
        };
        self.backend.replace_lease(ns, name, &lease).await?;
        self.observe_holder(Some(id));
        Ok(true)
    }

    /// Voluntarily give up the lease by clearing `holderIdentity`.
    ///
    /// Only writes if we are still the holder, so it can never clear someone
    /// else's lease. Returns whether a release was written.
    pub async fn release(&self) -> Result<bool, CoordinationError> {
        let ns = self.config.namespace.as_str();
        let name = self.config.lease_name.as_str();
        let id = self.config.identity.as_str();

        let Some(existing) = self.backend.get_lease(ns, name).await? else {
            return Ok(false);
        };
        let record =
            LeaderElectionRecord::from_lease(&existing, self.config.lease_duration_secs());
        if !record.is_held_by(id) {
            debug!(identity = %id, holder = ?record.holder_identity, "not the holder, nothing to release");
            return Ok(false);
        }
        let rv = existing
            .metadata
            .resource_version
            .clone()
            .ok_or_else(|| CoordinationError::BackendError("no resourceVersion".into()))?;

        let now = Utc::now();
        let released = LeaderElectionRecord {
            holder_identity: None,
            lease_duration_secs: RELEASED_LEASE_DURATION_SECS,
            acquire_time: Some(now),
            renew_time: Some(now),
            lease_transitions: record.lease_transitions,
        };
        let lease = Lease {
            metadata: kube::api::ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(ns.to_string()),
                resource_version: Some(rv),
                uid: existing.metadata.uid.clone(),
                labels: existing.metadata.labels.clone(),
                annotations: existing.metadata.annotations.clone(),
                ..Default::default()
            },
            spec: Some(released.into_spec()),
        };
        self.backend.replace_lease(ns, name, &lease).await?;
        self.observe_holder(None);
        Ok(true)
    }

    async fn release_bounded(&self) {
        let id = &self.config.identity;
        match tokio::time::timeout(self.config.retry_period, self.release()).await {
            Ok(Ok(true)) => info!(identity = %id, lease = %self.config.lease_name, "released lease"),
            Ok(Ok(false)) => debug!(identity = %id, "lease not held, skipped release"),
            Ok(Err(e)) => {
                warn!(identity = %id, error = %e, "failed to release lease, leaving it to expire")
            }
            Err(_) => warn!(identity = %id, "timed out releasing lease, leaving it to expire"),
        }
    }

    fn observe_holder(&self, holder: Option<&str>) {
        self.observed_leader.send_if_modified(|current| {
            if current.as_deref() == holder {
                false
            } else {
                *current = holder.map(str::to_string);
                true
            }
        });
    }
}

/// Tell the observer about a holder change seen since the last call.
fn report_new_leader<O: LeaseObserver>(
    seen_leader: &mut watch::Receiver<Option<String>>,
    observer: &mut O,
) {
    if !seen_leader.has_changed().unwrap_or(false) {
        return;
    }
    let holder = seen_leader.borrow_and_update().clone();
    if let Some(holder) = holder {
        observer.on_new_leader(&holder);
    }
}
