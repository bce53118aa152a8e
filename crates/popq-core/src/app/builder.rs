//! QueueBuilder - wiring ports and runners into a `JobQueue`.
//!
//! Every port defaults to its in-memory implementation, so
//! `QueueBuilder::new().build()` gives a working single-process queue.
//! `build()` fails fast: runners named in `expect_runners` must be defined and
//! every declared dependency must point at a defined runner.

use std::sync::Arc;

use crate::config::{IndexBackend, QueueConfig, StoreBackend};
use crate::error::QueueError;
use crate::impls::{InMemoryDispatchIndex, InMemoryLock, InMemoryStore, InMemoryWorkerRegistry};
use crate::ports::{
    Clock, DispatchIndex, DistributedLock, DurableStore, IdGenerator, SystemClock, UlidGenerator,
    WorkerRegistry,
};
use crate::queue::{JobHandler, JobQueue, QueuePorts, QueueSettings, RunnerOptions};
use crate::typed::{Handler, Task, TypedHandler};

/// ```ignore
/// let queue = QueueBuilder::new()
///     .define("email", handler_fn(send_email), RunnerOptions::new())
///     .expect_runners(&["email"])
///     .build()?;
/// ```
pub struct QueueBuilder {
    store: Option<Arc<dyn DurableStore>>,
    index: Option<Arc<dyn DispatchIndex>>,
    lock: Option<Arc<dyn DistributedLock>>,
    workers: Option<Arc<dyn WorkerRegistry>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    settings: QueueSettings,
    runners: Vec<(String, Arc<dyn JobHandler>, RunnerOptions)>,
    expected_runners: Option<Vec<String>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing runners: {0:?}; these were expected but never defined")]
    MissingRunners(Vec<String>),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl QueueBuilder {
    pub fn new() -> Self {
        Self {
            store: None,
            index: None,
            lock: None,
            workers: None,
            clock: None,
            ids: None,
            settings: QueueSettings::default(),
            runners: Vec::new(),
            expected_runners: None,
        }
    }

    /// Builder with settings and backends taken from `config`.
    ///
    /// Connects to Postgres and Redis when they are selected. Selecting a
    /// backend whose cargo feature is disabled is a `QueueError::Config`.
    pub async fn from_config(config: &QueueConfig) -> Result<Self, QueueError> {
        config.validate()?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(clock.clone()));
        let mut builder = Self::new()
            .with_settings(config.settings())
            .with_clock(clock.clone())
            .with_ids(ids.clone());

        match config.store.backend {
            StoreBackend::Memory => {}
            StoreBackend::Postgres => {
                builder = builder.with_store(connect_postgres(config).await?);
            }
        }

        match config.index.backend {
            IndexBackend::Memory => {}
            IndexBackend::Redis => {
                let (index, lock, workers) = connect_redis(config, clock, ids).await?;
                builder = builder
                    .with_index(index)
                    .with_lock(lock)
                    .with_workers(workers);
            }
        }

        Ok(builder)
    }

    pub fn with_store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_index(mut self, index: Arc<dyn DispatchIndex>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_lock(mut self, lock: Arc<dyn DistributedLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn with_workers(mut self, workers: Arc<dyn WorkerRegistry>) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Also drives the default lock, worker registry and id generator.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn with_settings(mut self, settings: QueueSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Runner registered at `build()` time; duplicate names and cycles fail
    /// the build.
    pub fn define(
        mut self,
        name: impl Into<String>,
        handler: impl JobHandler + 'static,
        options: RunnerOptions,
    ) -> Self {
        self.runners.push((name.into(), Arc::new(handler), options));
        self
    }

    pub fn define_typed<T, H>(self, handler: H, options: RunnerOptions) -> Self
    where
        T: Task,
        H: Handler<T> + 'static,
    {
        self.define(T::NAME, TypedHandler::<T, H>::new(handler), options)
    }

    pub fn expect_runners(mut self, names: &[&str]) -> Self {
        self.expected_runners = Some(names.iter().map(|name| name.to_string()).collect());
        self
    }

    pub fn build(self) -> Result<Arc<JobQueue>, BuildError> {
        if let Some(expected) = &self.expected_runners {
            let missing: Vec<String> = expected
                .iter()
                .filter(|name| !self.runners.iter().any(|(defined, _, _)| defined == *name))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingRunners(missing));
            }
        }

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(clock.clone())));
        let ports = QueuePorts {
            store: self.store.unwrap_or_else(|| Arc::new(InMemoryStore::new())),
            index: self
                .index
                .unwrap_or_else(|| Arc::new(InMemoryDispatchIndex::new())),
            lock: self
                .lock
                .unwrap_or_else(|| Arc::new(InMemoryLock::new(clock.clone(), ids.clone()))),
            workers: self
                .workers
                .unwrap_or_else(|| Arc::new(InMemoryWorkerRegistry::new(clock.clone()))),
            clock,
            ids,
        };

        let queue = JobQueue::new(ports, self.settings);
        for (name, handler, options) in self.runners {
            queue.define_arc(name, handler, options)?;
        }
        if let Some((name, dependency)) = queue.first_missing_dependency() {
            return Err(QueueError::MissingDependency { name, dependency }.into());
        }
        Ok(Arc::new(queue))
    }
}

impl Default for QueueBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "postgres-backend")]
async fn connect_postgres(config: &QueueConfig) -> Result<Arc<dyn DurableStore>, QueueError> {
    let url = required_url(config.store.url.as_deref(), "store.url")?;
    let store = crate::impls::postgres::PostgresStore::connect(url, config.store.max_connections).await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "postgres-backend"))]
async fn connect_postgres(_config: &QueueConfig) -> Result<Arc<dyn DurableStore>, QueueError> {
    Err(QueueError::Config(
        "store backend 'postgres' requires the postgres-backend feature".into(),
    ))
}

type RedisPorts = (
    Arc<dyn DispatchIndex>,
    Arc<dyn DistributedLock>,
    Arc<dyn WorkerRegistry>,
);

#[cfg(feature = "redis-backend")]
async fn connect_redis(
    config: &QueueConfig,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
) -> Result<RedisPorts, QueueError> {
    use crate::impls::redis::{RedisConnection, RedisDispatchIndex, RedisLock, RedisWorkerRegistry};

    let url = required_url(config.index.url.as_deref(), "index.url")?;
    let conn = RedisConnection::connect(url, config.index.key_prefix.clone()).await?;
    Ok((
        Arc::new(RedisDispatchIndex::new(conn.clone())),
        Arc::new(RedisLock::new(conn.clone(), clock, ids)),
        Arc::new(RedisWorkerRegistry::new(conn)),
    ))
}

#[cfg(not(feature = "redis-backend"))]
async fn connect_redis(
    _config: &QueueConfig,
    _clock: Arc<dyn Clock>,
    _ids: Arc<dyn IdGenerator>,
) -> Result<RedisPorts, QueueError> {
    Err(QueueError::Config(
        "index backend 'redis' requires the redis-backend feature".into(),
    ))
}

#[cfg(any(feature = "postgres-backend", feature = "redis-backend"))]
fn required_url<'a>(url: Option<&'a str>, key: &str) -> Result<&'a str, QueueError> {
    url.ok_or_else(|| QueueError::Config(format!("{key} is required")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::handler_fn;
    use tokio_util::sync::CancellationToken;

    fn noop() -> impl JobHandler + 'static {
        handler_fn(|_job, _cancel: CancellationToken| async { Ok(true) })
    }

    #[test]
    fn build_success() {
        let queue = QueueBuilder::new()
            .define("email", noop(), RunnerOptions::new())
            .expect_runners(&["email"])
            .build()
            .unwrap();
        assert_eq!(queue.runner_names(), vec!["email".to_string()]);
    }

    #[test]
    fn build_reports_missing_runners() {
        let result = QueueBuilder::new()
            .define("email", noop(), RunnerOptions::new())
            .expect_runners(&["email", "sms"])
            .build();
        assert!(matches!(
            result,
            Err(BuildError::MissingRunners(missing)) if missing == vec!["sms".to_string()]
        ));
    }

    #[test]
    fn build_without_expectations() {
        assert!(QueueBuilder::new().build().is_ok());
    }

    #[test]
    fn build_reports_undefined_dependency() {
        let result = QueueBuilder::new()
            .define("report", noop(), RunnerOptions::new().depends_on("ingest"))
            .build();
        assert!(matches!(
            result,
            Err(BuildError::Queue(QueueError::MissingDependency { name, dependency }))
                if name == "report" && dependency == "ingest"
        ));
    }

    #[test]
    fn build_rejects_duplicate_runner() {
        let result = QueueBuilder::new()
            .define("email", noop(), RunnerOptions::new())
            .define("email", noop(), RunnerOptions::new())
            .build();
        assert!(matches!(
            result,
            Err(BuildError::Queue(QueueError::DuplicateRunner(name))) if name == "email"
        ));
    }

    #[tokio::test]
    async fn from_config_uses_configured_settings() {
        let config = QueueConfig {
            retries: 5,
            ..QueueConfig::default()
        };
        let queue = QueueBuilder::from_config(&config).await.unwrap().build().unwrap();
        assert_eq!(queue.settings().retries, 5);
    }

    #[cfg(not(feature = "redis-backend"))]
    #[tokio::test]
    async fn from_config_rejects_disabled_backend() {
        let mut config = QueueConfig::default();
        config.index.backend = IndexBackend::Redis;
        config.index.url = Some("redis://localhost".into());

        let result = QueueBuilder::from_config(&config).await;
        assert!(matches!(result, Err(QueueError::Config(_))));
    }
}
