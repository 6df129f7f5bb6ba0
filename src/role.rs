//! Local leadership state machine.
//!
//! `Follower --acquired--> Leader --lost--> Follower`, and either state moves to
//! the terminal `Stopped` on shutdown. The controller is the only writer of the
//! role; everyone else gets a read-only `watch::Receiver<Role>`.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coordination::LeaseObserver;
use crate::identity::Identity;
use crate::workload::LeaderWorkload;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Leader,
    Stopped,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Follower => write!(f, "Follower"),
            Role::Leader => write!(f, "Leader"),
            Role::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Failure of the leadership-start hook.
#[derive(Debug, thiserror::Error)]
#[error("{step}: {message}")]
pub struct LeadershipError {
    pub step: &'static str,
    pub message: String,
}

impl LeadershipError {
    pub fn new(step: &'static str, err: impl std::fmt::Display) -> Self {
        Self {
            step,
            message: err.to_string(),
        }
    }
}

/// Hooks run on each leadership transition, exactly once per transition.
#[async_trait]
pub trait LeadershipHooks: Send + Sync + 'static {
    /// Runs before the workload starts. Errors abort the transition.
    async fn started_leading(&self) -> Result<(), LeadershipError>;

    /// Runs after the workload has stopped (or failed to stop in time).
    async fn stopped_leading(&self);
}

struct ActiveWorkload {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Drives the role from lease transitions and supervises the leader workload.
pub struct RoleController {
    identity: Identity,
    hooks: Arc<dyn LeadershipHooks>,
    workload: Arc<dyn LeaderWorkload>,
    shutdown: CancellationToken,
    stop_timeout: Duration,
    role: watch::Sender<Role>,
    active: Option<ActiveWorkload>,
}

impl RoleController {
    /// `shutdown` is the process-wide token; each workload run gets a child of it.
    pub fn new(
        identity: Identity,
        hooks: Arc<dyn LeadershipHooks>,
        workload: Arc<dyn LeaderWorkload>,
        shutdown: CancellationToken,
        stop_timeout: Duration,
    ) -> Self {
        let (role, _) = watch::channel(Role::Follower);
        Self {
            identity,
            hooks,
            workload,
            shutdown,
            stop_timeout,
            role,
            active: None,
        }
    }

    pub fn role(&self) -> watch::Receiver<Role> {
        self.role.subscribe()
    }

    pub fn current(&self) -> Role {
        *self.role.borrow()
    }

    fn set_role(&self, next: Role) {
        let prev = self.role.send_replace(next);
        if prev != next {
            debug!(identity = %self.identity, from = %prev, to = %next, "role transition");
        }
    }

    /// Enter the terminal `Stopped` state, demoting first if still leading.
    pub async fn stop(&mut self) {
        if self.current() == Role::Leader {
            self.demote().await;
        }
        self.set_role(Role::Stopped);
    }

    async fn demote(&mut self) {
        if let Some(active) = self.active.take() {
            active.cancel.cancel();
            match tokio::time::timeout(self.stop_timeout, active.handle).await {
                Ok(Ok(())) => debug!(identity = %self.identity, "leader workload stopped"),
                Ok(Err(e)) => warn!(identity = %self.identity, error = %e, "leader workload ended abnormally"),
                Err(_) => warn!(
                    identity = %self.identity,
                    timeout = ?self.stop_timeout,
                    "leader workload did not stop in time, proceeding without it"
                ),
            }
        }
        self.hooks.stopped_leading().await;
        self.set_role(Role::Follower);
    }
}

#[async_trait]
impl LeaseObserver for RoleController {
    async fn on_acquired(&mut self) -> Result<(), LeadershipError> {
        match self.current() {
            Role::Follower => {}
            role => {
                warn!(identity = %self.identity, role = %role, "ignoring acquired while not a follower");
                return Ok(());
            }
        }

        // Stay a follower until traffic points here and the workload is running.
        if let Err(e) = self.hooks.started_leading().await {
            warn!(identity = %self.identity, error = %e, "leadership start hook failed, staying follower");
            return Err(e);
        }

        let cancel = self.shutdown.child_token();
        let workload = self.workload.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { workload.run(token).await });
        self.active = Some(ActiveWorkload { cancel, handle });
        self.set_role(Role::Leader);
        info!(identity = %self.identity, "became leader");
        Ok(())
    }

    async fn on_lost(&mut self) {
        if self.current() != Role::Leader {
            warn!(identity = %self.identity, role = %self.current(), "ignoring lost while not the leader");
            return;
        }
        self.demote().await;
        info!(identity = %self.identity, "stopped being leader");
    }

    fn on_new_leader(&mut self, holder: &str) {
        if holder == self.identity.as_str() {
            return;
        }
        info!(identity = %self.identity, leader = %holder, "new leader observed");
    }
}
