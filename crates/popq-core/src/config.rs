//! Configuration management.
//!
//! Sources, later ones winning:
//! 1. serde defaults below
//! 2. an optional TOML file
//! 3. `POPQ_*` environment variables, `__` separating nested keys
//!    (`POPQ_INDEX__BACKEND=redis`, `POPQ_LOCK__TTL_MS=2000`)

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::app::LoopSettings;
use crate::error::{QueueError, Result};
use crate::ports::{LockPolicy, validate_collection_name};
use crate::queue::{QueueSettings, RetryPolicy};

pub const ENV_PREFIX: &str = "POPQ";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Attempts allowed before dead-lettering.
    #[serde(default = "default_retries")]
    pub retries: u32,

    #[serde(default = "default_collection")]
    pub collection: String,

    #[serde(default = "default_dead_letter_collection")]
    pub dead_letter_collection: String,

    /// Jobs popped per dequeue call.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Run the jobs of one batch concurrently.
    #[serde(default = "default_parallel_execution")]
    pub parallel_execution: bool,

    /// Sleep between sweeps that found nothing to do.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Handler timeout for runners without their own.
    #[serde(default = "default_job_timeout_ms")]
    pub job_timeout_ms: u64,

    /// Generated when absent.
    #[serde(default)]
    pub worker_id: Option<String>,

    /// Heartbeat TTL; the heartbeat is refreshed every half of it.
    #[serde(default = "default_worker_timeout_ms")]
    pub worker_timeout_ms: u64,

    #[serde(default)]
    pub backoff: BackoffConfig,

    #[serde(default)]
    pub lock: LockConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub index: IndexConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    #[default]
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default)]
    pub strategy: BackoffStrategy,

    #[serde(default = "default_backoff_delay_ms")]
    pub delay_ms: u64,

    /// Only used by the exponential strategy.
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::default(),
            delay_ms: default_backoff_delay_ms(),
            multiplier: default_backoff_multiplier(),
        }
    }
}

impl BackoffConfig {
    pub fn policy(&self) -> RetryPolicy {
        let delay = Duration::from_millis(self.delay_ms);
        match self.strategy {
            BackoffStrategy::Fixed => RetryPolicy::fixed(delay),
            BackoffStrategy::Exponential => RetryPolicy::exponential(delay, self.multiplier),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_lock_ttl_ms")]
    pub ttl_ms: u64,

    #[serde(default = "default_lock_retry_count")]
    pub retry_count: u32,

    #[serde(default = "default_lock_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_lock_ttl_ms(),
            retry_count: default_lock_retry_count(),
            retry_delay_ms: default_lock_retry_delay_ms(),
        }
    }
}

impl LockConfig {
    pub fn policy(&self) -> LockPolicy {
        LockPolicy {
            ttl: Duration::from_millis(self.ttl_ms),
            retry_count: self.retry_count,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Connection URL; required for postgres.
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: None,
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexBackend {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default)]
    pub backend: IndexBackend,

    /// Connection URL; required for redis.
    #[serde(default)]
    pub url: Option<String>,

    /// Prepended to every key.
    #[serde(default)]
    pub key_prefix: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_retries() -> u32 { 3 }
fn default_collection() -> String { "pop_queues".to_string() }
fn default_dead_letter_collection() -> String { "dead_letter_queue".to_string() }
fn default_batch_size() -> usize { 1000 }
fn default_parallel_execution() -> bool { true }
fn default_poll_interval_ms() -> u64 { 1000 }
fn default_job_timeout_ms() -> u64 { 600_000 }
fn default_worker_timeout_ms() -> u64 { 30_000 }
fn default_backoff_delay_ms() -> u64 { 2000 }
fn default_backoff_multiplier() -> f64 { 2.0 }
fn default_lock_ttl_ms() -> u64 { 1000 }
fn default_lock_retry_count() -> u32 { 10 }
fn default_lock_retry_delay_ms() -> u64 { 200 }
fn default_max_connections() -> u32 { 10 }
fn default_log_level() -> String { "info".to_string() }

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            collection: default_collection(),
            dead_letter_collection: default_dead_letter_collection(),
            batch_size: default_batch_size(),
            parallel_execution: default_parallel_execution(),
            poll_interval_ms: default_poll_interval_ms(),
            job_timeout_ms: default_job_timeout_ms(),
            worker_id: None,
            worker_timeout_ms: default_worker_timeout_ms(),
            backoff: BackoffConfig::default(),
            lock: LockConfig::default(),
            store: StoreConfig::default(),
            index: IndexConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

impl QueueConfig {
    /// Load from the environment and, if given, a TOML file. A missing file
    /// is an error; the result is validated.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        Self::from_builder(builder.add_source(environment()))
    }

    fn from_builder(builder: config::ConfigBuilder<config::builder::DefaultState>) -> Result<Self> {
        let cfg: QueueConfig = builder.build()?.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.retries == 0 {
            return Err(QueueError::Config("retries must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(QueueError::Config("batch_size must be at least 1".into()));
        }
        if self.worker_timeout_ms < 2 {
            return Err(QueueError::Config(
                "worker_timeout_ms must be at least 2".into(),
            ));
        }
        validate_collection_name(&self.collection)?;
        validate_collection_name(&self.dead_letter_collection)?;
        if self.store.backend == StoreBackend::Postgres && self.store.url.is_none() {
            return Err(QueueError::Config("store.url is required for postgres".into()));
        }
        if self.index.backend == IndexBackend::Redis && self.index.url.is_none() {
            return Err(QueueError::Config("index.url is required for redis".into()));
        }
        Ok(())
    }

    pub fn settings(&self) -> QueueSettings {
        QueueSettings {
            retries: self.retries,
            collection: self.collection.clone(),
            dead_letter_collection: self.dead_letter_collection.clone(),
            retry_policy: self.backoff.policy(),
            lock_policy: self.lock.policy(),
            default_timeout: Duration::from_millis(self.job_timeout_ms),
        }
    }

    pub fn loop_settings(&self) -> LoopSettings {
        LoopSettings {
            batch_size: self.batch_size,
            parallel: self.parallel_execution,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_timeout_ms)
    }
}
