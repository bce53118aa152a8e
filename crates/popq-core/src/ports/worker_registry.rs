//! WorkerRegistry port
//!
//! A shared set of worker identities (`workers`) plus a per-worker expiring
//! key (`worker:{id}:heartbeat`). Set membership says who announced
//! themselves; the heartbeat key says who is still alive.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

pub const WORKERS_KEY: &str = "workers";

pub fn heartbeat_key(worker_id: &str) -> String {
    format!("worker:{worker_id}:heartbeat")
}

#[async_trait]
pub trait WorkerRegistry: Send + Sync {
    /// Idempotent.
    async fn register(&self, worker_id: &str) -> Result<()>;

    /// Idempotent. Also drops the heartbeat key.
    async fn deregister(&self, worker_id: &str) -> Result<()>;

    async fn heartbeat(&self, worker_id: &str, ttl: Duration) -> Result<()>;

    async fn members(&self) -> Result<Vec<String>>;

    async fn is_alive(&self, worker_id: &str) -> Result<bool>;

    /// Registered members whose heartbeat has not expired.
    async fn live_workers(&self) -> Result<Vec<String>> {
        let mut live = Vec::new();
        for worker in self.members().await? {
            if self.is_alive(&worker).await? {
                live.push(worker);
            }
        }
        Ok(live)
    }
}
