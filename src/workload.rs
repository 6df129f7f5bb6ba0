use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Work that may only run while this replica is the leader.
///
/// Implementations must return promptly once `cancel` fires; there is no
/// preemptive interruption.
#[async_trait]
pub trait LeaderWorkload: Send + Sync + 'static {
    async fn run(&self, cancel: CancellationToken);
}

/// Default workload: logs a heartbeat every `interval` while leading.
#[derive(Debug, Clone)]
pub struct HeartbeatWorkload {
    interval: Duration,
}

impl HeartbeatWorkload {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

#[async_trait]
impl LeaderWorkload for HeartbeatWorkload {
    async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("stopped leader loop");
                    return;
                }
                _ = ticker.tick() => {
                    info!("performing leader tasks");
                }
            }
        }
    }
}
