//! WorkerHeartbeat - keeps this process visible in the worker registry.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::ports::WorkerRegistry;

/// Registers a worker identity, refreshes its heartbeat every `ttl / 2` and
/// deregisters it on shutdown.
pub struct WorkerHeartbeat {
    workers: Arc<dyn WorkerRegistry>,
    worker_id: String,
    ttl: Duration,
}

impl WorkerHeartbeat {
    pub fn new(workers: Arc<dyn WorkerRegistry>, worker_id: impl Into<String>, ttl: Duration) -> Self {
        Self {
            workers,
            worker_id: worker_id.into(),
            ttl,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Register and write the first heartbeat before returning, so the
    /// worker is live as soon as this succeeds; refreshing continues in a
    /// background task until `shutdown` is cancelled.
    pub async fn start(self, shutdown: CancellationToken) -> Result<JoinHandle<()>> {
        self.workers.register(&self.worker_id).await?;
        self.workers.heartbeat(&self.worker_id, self.ttl).await?;
        info!(worker_id = %self.worker_id, ttl_ms = self.ttl.as_millis() as u64, "worker registered");
        Ok(tokio::spawn(async move { self.run(shutdown).await }))
    }

    async fn run(self, shutdown: CancellationToken) {
        let period = (self.ttl / 2).max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately and start() already beat.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.workers.heartbeat(&self.worker_id, self.ttl).await {
                        Ok(()) => debug!(worker_id = %self.worker_id, "heartbeat"),
                        Err(e) => warn!(worker_id = %self.worker_id, error = %e, "heartbeat failed"),
                    }
                }
            }
        }

        match self.workers.deregister(&self.worker_id).await {
            Ok(()) => info!(worker_id = %self.worker_id, "worker deregistered"),
            Err(e) => warn!(worker_id = %self.worker_id, error = %e, "failed to deregister worker"),
        }
    }
}
