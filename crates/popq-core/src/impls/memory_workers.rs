//! InMemoryWorkerRegistry - worker set and heartbeat keys in process memory.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::{QueueError, Result};
use crate::ports::{Clock, WorkerRegistry};

#[derive(Default)]
struct Registry {
    members: BTreeSet<String>,
    heartbeats: HashMap<String, DateTime<Utc>>,
}

pub struct InMemoryWorkerRegistry {
    registry: Mutex<Registry>,
    clock: Arc<dyn Clock>,
}

impl InMemoryWorkerRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            clock,
        }
    }
}

#[async_trait]
impl WorkerRegistry for InMemoryWorkerRegistry {
    async fn register(&self, worker_id: &str) -> Result<()> {
        self.registry.lock().members.insert(worker_id.to_string());
        Ok(())
    }

    async fn deregister(&self, worker_id: &str) -> Result<()> {
        let mut registry = self.registry.lock();
        registry.members.remove(worker_id);
        registry.heartbeats.remove(worker_id);
        Ok(())
    }

    async fn heartbeat(&self, worker_id: &str, ttl: Duration) -> Result<()> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| QueueError::Config(format!("heartbeat ttl out of range: {e}")))?;
        let expires_at = self.clock.now() + ttl;
        self.registry
            .lock()
            .heartbeats
            .insert(worker_id.to_string(), expires_at);
        Ok(())
    }

    async fn members(&self) -> Result<Vec<String>> {
        Ok(self.registry.lock().members.iter().cloned().collect())
    }

    async fn is_alive(&self, worker_id: &str) -> Result<bool> {
        let now = self.clock.now();
        Ok(self
            .registry
            .lock()
            .heartbeats
            .get(worker_id)
            .is_some_and(|expires_at| *expires_at > now))
    }
}
