#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::api::core::v1::{Pod, Service, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use vigil::coordination::{ElectionConfig, LeaseObserver};
use vigil::identity::Identity;
use vigil::role::{LeadershipError, LeadershipHooks};
use vigil::workload::LeaderWorkload;

pub const NAMESPACE: &str = "default";
pub const LEASE_NAME: &str = "demo";
pub const SERVICE_NAME: &str = "k8s-leader-example";

pub fn identity(name: &str) -> Identity {
    Identity::new(name).unwrap()
}

/// Election config with the default 15s/10s/5s timings.
pub fn election_config(id: &str) -> ElectionConfig {
    ElectionConfig {
        lease_name: LEASE_NAME.to_string(),
        namespace: NAMESPACE.to_string(),
        identity: identity(id),
        lease_duration: Duration::from_secs(15),
        renew_deadline: Duration::from_secs(10),
        retry_period: Duration::from_secs(5),
    }
}

pub fn test_pod(name: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            labels: Some(BTreeMap::new()),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn test_service() -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(SERVICE_NAME.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            labels: Some(BTreeMap::new()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(BTreeMap::new()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// A lease held by `holder` that was last renewed at `renewed`.
pub fn held_lease(holder: &str, renewed: DateTime<Utc>, duration_secs: i32) -> Lease {
    Lease {
        metadata: ObjectMeta {
            name: Some(LEASE_NAME.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            ..Default::default()
        },
        spec: Some(LeaseSpec {
            holder_identity: Some(holder.to_string()),
            lease_duration_seconds: Some(duration_secs),
            acquire_time: Some(MicroTime(renewed)),
            renew_time: Some(MicroTime(renewed)),
            lease_transitions: Some(0),
            ..Default::default()
        }),
    }
}

pub fn selector_value(service: &Service, key: &str) -> Option<String> {
    service
        .spec
        .as_ref()
        .and_then(|s| s.selector.as_ref())
        .and_then(|s| s.get(key))
        .cloned()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Acquired,
    Lost,
}

/// Observer that records every transition with the (tokio) time it happened.
#[derive(Clone, Default)]
pub struct RecordingObserver {
    pub events: Arc<Mutex<Vec<(Transition, Instant)>>>,
    pub leaders: Arc<std::sync::Mutex<Vec<String>>>,
    /// When set, `on_acquired` fails once.
    pub fail_acquire: Arc<AtomicBool>,
}

impl RecordingObserver {
    pub async fn transitions(&self) -> Vec<Transition> {
        self.events.lock().await.iter().map(|(t, _)| *t).collect()
    }

    pub async fn count(&self, which: Transition) -> usize {
        self.events
            .lock()
            .await
            .iter()
            .filter(|(t, _)| *t == which)
            .count()
    }

    pub async fn last_at(&self, which: Transition) -> Option<Instant> {
        self.events
            .lock()
            .await
            .iter()
            .rev()
            .find(|(t, _)| *t == which)
            .map(|(_, at)| *at)
    }
}

#[async_trait]
impl LeaseObserver for RecordingObserver {
    async fn on_acquired(&mut self) -> Result<(), LeadershipError> {
        self.events
            .lock()
            .await
            .push((Transition::Acquired, Instant::now()));
        if self.fail_acquire.swap(false, Ordering::SeqCst) {
            return Err(LeadershipError::new("test hook", "injected failure"));
        }
        Ok(())
    }

    async fn on_lost(&mut self) {
        self.events
            .lock()
            .await
            .push((Transition::Lost, Instant::now()));
    }

    fn on_new_leader(&mut self, holder: &str) {
        self.leaders.lock().unwrap().push(holder.to_string());
    }
}

/// Alternation check: acquired, lost, acquired, lost, ...
pub fn assert_alternating(transitions: &[Transition]) {
    for (i, t) in transitions.iter().enumerate() {
        let expected = if i % 2 == 0 {
            Transition::Acquired
        } else {
            Transition::Lost
        };
        assert_eq!(*t, expected, "transition {} out of order: {:?}", i, transitions);
    }
}

/// Hooks that record calls, optionally failing the start hook.
#[derive(Default)]
pub struct RecordingHooks {
    pub calls: std::sync::Mutex<Vec<&'static str>>,
    pub fail_start: AtomicBool,
    /// How long `started_leading` takes before returning.
    pub start_delay: Duration,
    /// Snapshot of the workload's running flag when `stopped_leading` ran.
    pub workload_running_at_stop: std::sync::Mutex<Vec<bool>>,
    pub workload: Option<Arc<TrackedWorkload>>,
}

impl RecordingHooks {
    pub fn with_workload(workload: Arc<TrackedWorkload>) -> Self {
        Self {
            workload: Some(workload),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl LeadershipHooks for RecordingHooks {
    async fn started_leading(&self) -> Result<(), LeadershipError> {
        self.calls.lock().unwrap().push("start");
        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(LeadershipError::new("test hook", "start refused"));
        }
        Ok(())
    }

    async fn stopped_leading(&self) {
        self.calls.lock().unwrap().push("stop");
        if let Some(w) = &self.workload {
            self.workload_running_at_stop
                .lock()
                .unwrap()
                .push(w.is_running());
        }
    }
}

/// Workload that tracks whether it is running and how many times it started.
pub struct TrackedWorkload {
    running: AtomicBool,
    pub starts: AtomicUsize,
    /// Extra time the workload takes to wind down after cancellation.
    pub linger: Duration,
}

impl TrackedWorkload {
    pub fn new() -> Arc<Self> {
        Self::lingering(Duration::ZERO)
    }

    pub fn lingering(linger: Duration) -> Arc<Self> {
        Arc::new(Self {
            running: AtomicBool::new(false),
            starts: AtomicUsize::new(0),
            linger,
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LeaderWorkload for TrackedWorkload {
    async fn run(&self, cancel: CancellationToken) {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        cancel.cancelled().await;
        if !self.linger.is_zero() {
            tokio::time::sleep(self.linger).await;
        }
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Poll `f` until it returns true or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut f: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if f().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
