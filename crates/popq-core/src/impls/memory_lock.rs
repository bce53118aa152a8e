//! InMemoryLock - lease lock shared by every engine holding the same instance.
//!
//! Expiry is judged against the injected clock, so tests can let a lease lapse
//! by advancing a `ManualClock`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{QueueError, Result};
use crate::ports::{Clock, DistributedLock, IdGenerator, Lease};

pub struct InMemoryLock {
    leases: Mutex<HashMap<String, Lease>>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl InMemoryLock {
    pub fn new(clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            leases: Mutex::new(HashMap::new()),
            clock,
            ids,
        }
    }
}

#[async_trait]
impl DistributedLock for InMemoryLock {
    async fn try_acquire(&self, resource: &str, ttl: Duration) -> Result<Option<Lease>> {
        let now = self.clock.now();
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| QueueError::Config(format!("lock ttl out of range: {e}")))?;
        let mut leases = self.leases.lock();
        if let Some(current) = leases.get(resource)
            && current.expires_at > now
        {
            return Ok(None);
        }
        let lease = Lease {
            resource: resource.to_string(),
            token: self.ids.generate_lease_token(),
            expires_at: now + ttl,
        };
        leases.insert(resource.to_string(), lease.clone());
        Ok(Some(lease))
    }

    async fn release(&self, lease: &Lease) -> Result<bool> {
        let mut leases = self.leases.lock();
        match leases.get(&lease.resource) {
            Some(current) if current.token == lease.token => {
                leases.remove(&lease.resource);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{LockPolicy, ManualClock, UlidGenerator};

    fn lock() -> (Arc<ManualClock>, InMemoryLock) {
        let clock = Arc::new(ManualClock::default());
        let ids = Arc::new(UlidGenerator::new(clock.clone()));
        (clock.clone(), InMemoryLock::new(clock, ids))
    }

    #[tokio::test]
    async fn second_acquire_fails_until_release() {
        let (_clock, lock) = lock();
        let ttl = Duration::from_secs(1);

        let lease = lock.try_acquire("locks:queue:email", ttl).await.unwrap().unwrap();
        assert!(lock.try_acquire("locks:queue:email", ttl).await.unwrap().is_none());
        assert!(lock.try_acquire("locks:queue:sms", ttl).await.unwrap().is_some());

        assert!(lock.release(&lease).await.unwrap());
        assert!(!lock.release(&lease).await.unwrap());
        assert!(lock.try_acquire("locks:queue:email", ttl).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over() {
        let (clock, lock) = lock();
        let ttl = Duration::from_millis(1000);

        let stale = lock.try_acquire("r", ttl).await.unwrap().unwrap();
        clock.advance_ms(1001);
        let fresh = lock.try_acquire("r", ttl).await.unwrap().unwrap();

        assert_ne!(stale.token, fresh.token);
        assert!(!lock.release(&stale).await.unwrap());
        assert!(lock.release(&fresh).await.unwrap());
    }

    #[tokio::test]
    async fn policy_gives_up_with_lock_timeout() {
        let (_clock, lock) = lock();
        let policy = LockPolicy {
            ttl: Duration::from_secs(5),
            retry_count: 2,
            retry_delay: Duration::ZERO,
        };
        let _held = policy.acquire(&lock, "r").await.unwrap();

        let err = policy.acquire(&lock, "r").await.unwrap_err();
        assert!(matches!(err, QueueError::LockTimeout { attempts: 3, .. }));
        assert!(err.is_transient());
    }
}
