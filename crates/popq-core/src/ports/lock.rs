//! DistributedLock port
//!
//! A non-reentrant lease with a TTL. `LockPolicy::acquire` wraps the raw
//! `try_acquire` with a bounded number of retries so a contended dequeue
//! surfaces `QueueError::LockTimeout` instead of blocking.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;

use crate::domain::LeaseToken;
use crate::error::{QueueError, Result};

/// Proof of holding a resource until `expires_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub resource: String,
    pub token: LeaseToken,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Single acquisition attempt; `None` when someone else holds the lease.
    async fn try_acquire(&self, resource: &str, ttl: Duration) -> Result<Option<Lease>>;

    /// Release if still held by this lease. Returns `false` when the lease had
    /// already expired or been taken over.
    async fn release(&self, lease: &Lease) -> Result<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    pub ttl: Duration,
    pub retry_count: u32,
    pub retry_delay: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::from_millis(1000),
            retry_count: 10,
            retry_delay: Duration::from_millis(200),
        }
    }
}

impl LockPolicy {
    /// One initial attempt plus `retry_count` retries, sleeping `retry_delay`
    /// plus up to 50% jitter in between.
    pub async fn acquire(&self, lock: &dyn DistributedLock, resource: &str) -> Result<Lease> {
        let attempts = self.retry_count + 1;
        for attempt in 1..=attempts {
            if let Some(lease) = lock.try_acquire(resource, self.ttl).await? {
                return Ok(lease);
            }
            if attempt < attempts {
                tokio::time::sleep(self.jittered_delay()).await;
            }
        }
        Err(QueueError::LockTimeout {
            resource: resource.to_string(),
            attempts,
        })
    }

    fn jittered_delay(&self) -> Duration {
        let base = self.retry_delay.as_millis() as u64;
        if base == 0 {
            return Duration::ZERO;
        }
        let jitter = rand::thread_rng().gen_range(0..=base / 2);
        Duration::from_millis(base + jitter)
    }
}
