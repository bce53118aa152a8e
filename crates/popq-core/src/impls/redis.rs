//! Redis adapters: dispatch index, distributed lock and worker registry.
//!
//! Key layout (all keys carry the configured prefix):
//! - `queue:{name}`              sorted set of identifiers by score
//! - `queue:{name}:{identifier}` serialized job record
//! - `locks:queue:{name}`        lock lease (SET NX PX)
//! - `workers`                   set of worker identities
//! - `worker:{id}:heartbeat`     liveness key with TTL

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::Script;
use redis::aio::MultiplexedConnection;

use crate::error::{QueueError, Result};
use crate::ports::dispatch_index::{payload_key, queue_key};
use crate::ports::worker_registry::{WORKERS_KEY, heartbeat_key};
use crate::ports::{
    Clock, DispatchEntry, DispatchIndex, DistributedLock, IdGenerator, IndexedJob, Lease,
    WorkerRegistry,
};

/// Pops due members in score order and removes them in the same script so
/// two workers can never receive the same identifier.
const POP_DUE_LUA: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
if #ids > 0 then
  redis.call('ZREM', KEYS[1], unpack(ids))
end
return ids
"#;

const RELEASE_IF_OWNER_LUA: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        QueueError::Index(err.to_string())
    }
}

fn registry_err(err: redis::RedisError) -> QueueError {
    QueueError::Registry(err.to_string())
}

/// Shared multiplexed connection plus key prefix.
#[derive(Clone)]
pub struct RedisConnection {
    conn: MultiplexedConnection,
    prefix: String,
}

impl RedisConnection {
    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        tracing::info!(url = %redact(url), "connected to redis");
        Ok(Self {
            conn,
            prefix: prefix.into(),
        })
    }

    fn key(&self, raw: impl AsRef<str>) -> String {
        prefixed(&self.prefix, raw.as_ref())
    }

    fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }
}

fn prefixed(prefix: &str, raw: &str) -> String {
    format!("{prefix}{raw}")
}

/// Strips credentials before a URL reaches the logs.
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***@{}", &url[..scheme_end], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}

pub struct RedisDispatchIndex {
    redis: RedisConnection,
    pop_due_script: Script,
}

impl RedisDispatchIndex {
    pub fn new(redis: RedisConnection) -> Self {
        Self {
            redis,
            pop_due_script: Script::new(POP_DUE_LUA),
        }
    }
}

#[async_trait]
impl DispatchIndex for RedisDispatchIndex {
    async fn push(&self, entries: &[DispatchEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for entry in entries {
            pipe.zadd(
                self.redis.key(queue_key(&entry.name)),
                &entry.identifier,
                entry.score,
            )
            .ignore();
            pipe.set(
                self.redis.key(payload_key(&entry.name, &entry.identifier)),
                &entry.payload,
            )
            .ignore();
        }
        let mut conn = self.redis.conn();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn pop_due(&self, name: &str, max_score: i64, count: usize) -> Result<Vec<String>> {
        let mut conn = self.redis.conn();
        let ids: Vec<String> = self
            .pop_due_script
            .key(self.redis.key(queue_key(name)))
            .arg(max_score)
            .arg(count)
            .invoke_async(&mut conn)
            .await?;
        Ok(ids)
    }

    async fn payloads(&self, name: &str, identifiers: &[String]) -> Result<Vec<Option<String>>> {
        if identifiers.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = identifiers
            .iter()
            .map(|identifier| self.redis.key(payload_key(name, identifier)))
            .collect();
        let mut conn = self.redis.conn();
        let values: Vec<Option<String>> = redis::cmd("MGET").arg(keys).query_async(&mut conn).await?;
        Ok(values)
    }

    async fn remove_payload(&self, name: &str, identifier: &str) -> Result<()> {
        let mut conn = self.redis.conn();
        let _: () = redis::cmd("DEL")
            .arg(self.redis.key(payload_key(name, identifier)))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn len(&self, name: &str) -> Result<u64> {
        let mut conn = self.redis.conn();
        let len: u64 = redis::cmd("ZCARD")
            .arg(self.redis.key(queue_key(name)))
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }

    async fn snapshot(&self, name: &str) -> Result<Vec<IndexedJob>> {
        let mut conn = self.redis.conn();
        let entries: Vec<(String, f64)> = redis::cmd("ZRANGE")
            .arg(self.redis.key(queue_key(name)))
            .arg(0)
            .arg(-1)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;
        Ok(entries
            .into_iter()
            .map(|(identifier, score)| IndexedJob {
                identifier,
                score: score as i64,
            })
            .collect())
    }
}

pub struct RedisLock {
    redis: RedisConnection,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    release_script: Script,
}

impl RedisLock {
    pub fn new(redis: RedisConnection, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            redis,
            clock,
            ids,
            release_script: Script::new(RELEASE_IF_OWNER_LUA),
        }
    }
}

#[async_trait]
impl DistributedLock for RedisLock {
    async fn try_acquire(&self, resource: &str, ttl: Duration) -> Result<Option<Lease>> {
        let token = self.ids.generate_lease_token();
        let ttl_ms = ttl.as_millis().max(1) as u64;
        let mut conn = self.redis.conn();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(self.redis.key(resource))
            .arg(token.to_string())
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(acquired.map(|_| Lease {
            resource: resource.to_string(),
            token,
            expires_at: self.clock.now() + chrono::Duration::milliseconds(ttl_ms as i64),
        }))
    }

    async fn release(&self, lease: &Lease) -> Result<bool> {
        let mut conn = self.redis.conn();
        let released: i64 = self
            .release_script
            .key(self.redis.key(&lease.resource))
            .arg(lease.token.to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(released != 0)
    }
}

pub struct RedisWorkerRegistry {
    redis: RedisConnection,
}

impl RedisWorkerRegistry {
    pub fn new(redis: RedisConnection) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl WorkerRegistry for RedisWorkerRegistry {
    async fn register(&self, worker_id: &str) -> Result<()> {
        let mut conn = self.redis.conn();
        let _: () = redis::cmd("SADD")
            .arg(self.redis.key(WORKERS_KEY))
            .arg(worker_id)
            .query_async(&mut conn)
            .await
            .map_err(registry_err)?;
        Ok(())
    }

    async fn deregister(&self, worker_id: &str) -> Result<()> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.srem(self.redis.key(WORKERS_KEY), worker_id).ignore();
        pipe.del(self.redis.key(heartbeat_key(worker_id))).ignore();
        let mut conn = self.redis.conn();
        let _: () = pipe.query_async(&mut conn).await.map_err(registry_err)?;
        Ok(())
    }

    async fn heartbeat(&self, worker_id: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.redis.conn();
        let _: () = redis::cmd("SET")
            .arg(self.redis.key(heartbeat_key(worker_id)))
            .arg("alive")
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await
            .map_err(registry_err)?;
        Ok(())
    }

    async fn members(&self) -> Result<Vec<String>> {
        let mut conn = self.redis.conn();
        let mut members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.redis.key(WORKERS_KEY))
            .query_async(&mut conn)
            .await
            .map_err(registry_err)?;
        members.sort();
        Ok(members)
    }

    async fn is_alive(&self, worker_id: &str) -> Result<bool> {
        let mut conn = self.redis.conn();
        let exists: bool = redis::cmd("EXISTS")
            .arg(self.redis.key(heartbeat_key(worker_id)))
            .query_async(&mut conn)
            .await
            .map_err(registry_err)?;
        Ok(exists)
    }
}
