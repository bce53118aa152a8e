//! Queue engine: the job lifecycle state machine over the ports.
//!
//! `JobQueue` owns its runner registry, event bus and metrics; nothing is
//! global. One engine per process, shared behind an `Arc`.

mod dependency;
mod dispatch;
mod events;
mod inspect;
mod lifecycle;
mod metrics;
mod retry;
mod runner;

pub use dependency::DependencyGraph;
pub use dispatch::{EnqueueOptions, NewJob, score_for};
pub use events::{EventBus, Listener};
pub use inspect::PageQuery;
pub use lifecycle::{FailOutcome, PendingRepublish};
pub use metrics::{Metrics, MetricsSnapshot};
pub use retry::RetryPolicy;
pub use runner::{
    CompletionCallback, FnHandler, HandlerError, HandlerResult, JobHandler, Middleware,
    RunnerDefinition, RunnerOptions, RunnerRegistry, handler_fn,
};

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::domain::{EventKind, JobRecord, QueueEvent};
use crate::error::Result;
use crate::ports::{
    Clock, DispatchEntry, DispatchIndex, DistributedLock, DurableStore, EventSink, IdGenerator,
    LockPolicy, WorkerRegistry,
};

/// Engine-wide settings.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Attempts allowed before a job is dead-lettered.
    pub retries: u32,
    pub collection: String,
    pub dead_letter_collection: String,
    pub retry_policy: RetryPolicy,
    pub lock_policy: LockPolicy,
    /// Handler timeout for runners without their own.
    pub default_timeout: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            retries: 3,
            collection: "pop_queues".to_string(),
            dead_letter_collection: "dead_letter_queue".to_string(),
            retry_policy: RetryPolicy::default(),
            lock_policy: LockPolicy::default(),
            default_timeout: Duration::from_secs(600),
        }
    }
}

/// Port handles the engine runs on.
#[derive(Clone)]
pub struct QueuePorts {
    pub store: Arc<dyn DurableStore>,
    pub index: Arc<dyn DispatchIndex>,
    pub lock: Arc<dyn DistributedLock>,
    pub workers: Arc<dyn WorkerRegistry>,
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdGenerator>,
}

pub struct JobQueue {
    store: Arc<dyn DurableStore>,
    index: Arc<dyn DispatchIndex>,
    lock: Arc<dyn DistributedLock>,
    workers: Arc<dyn WorkerRegistry>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    runners: RwLock<RunnerRegistry>,
    events: EventBus,
    metrics: Metrics,
    settings: QueueSettings,
}

impl JobQueue {
    pub fn new(ports: QueuePorts, settings: QueueSettings) -> Self {
        Self {
            store: ports.store,
            index: ports.index,
            lock: ports.lock,
            workers: ports.workers,
            clock: ports.clock,
            ids: ports.ids,
            runners: RwLock::new(RunnerRegistry::new()),
            events: EventBus::new(),
            metrics: Metrics::default(),
            settings,
        }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn ids(&self) -> &Arc<dyn IdGenerator> {
        &self.ids
    }

    pub fn workers(&self) -> &Arc<dyn WorkerRegistry> {
        &self.workers
    }

    /// Register a runner for `name`.
    pub fn define(
        &self,
        name: impl Into<String>,
        handler: impl JobHandler + 'static,
        options: RunnerOptions,
    ) -> Result<()> {
        self.define_arc(name, Arc::new(handler), options)
    }

    pub fn define_arc(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn JobHandler>,
        options: RunnerOptions,
    ) -> Result<()> {
        let name = name.into();
        if let Some(collection) = &options.collection {
            crate::ports::validate_collection_name(collection)?;
        }
        self.runners.write().register(RunnerDefinition {
            name: name.clone(),
            handler,
            options,
        })?;
        tracing::debug!(name = %name, "runner defined");
        Ok(())
    }

    pub fn runner(&self, name: &str) -> Option<Arc<RunnerDefinition>> {
        self.runners.read().get(name)
    }

    pub fn runner_names(&self) -> Vec<String> {
        self.runners.read().names()
    }

    pub(crate) fn first_missing_dependency(&self) -> Option<(String, String)> {
        self.runners.read().first_missing_dependency()
    }

    pub fn on<F>(&self, kind: EventKind, listener: F)
    where
        F: Fn(&QueueEvent) + Send + Sync + 'static,
    {
        self.events.on(kind, listener);
    }

    pub fn add_sink(&self, sink: Arc<dyn EventSink>) {
        self.events.add_sink(sink);
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Durable collection for a runner, honoring its override.
    pub fn collection_for(&self, name: &str) -> String {
        self.runner(name)
            .and_then(|runner| runner.options.collection.clone())
            .unwrap_or_else(|| self.settings.collection.clone())
    }

    pub fn retries_for(&self, name: &str) -> u32 {
        self.runner(name)
            .and_then(|runner| runner.options.retries)
            .unwrap_or(self.settings.retries)
    }

    pub fn timeout_for(&self, name: &str) -> Duration {
        self.runner(name)
            .and_then(|runner| runner.options.timeout)
            .unwrap_or(self.settings.default_timeout)
    }

    fn dispatch_entry(&self, record: &JobRecord, score: i64) -> Result<DispatchEntry> {
        Ok(DispatchEntry {
            name: record.name.clone(),
            identifier: record.identifier.clone(),
            score,
            payload: serde_json::to_string(record)?,
        })
    }

    fn emit(&self, kind: EventKind, record: &JobRecord) {
        self.events
            .emit(&QueueEvent::new(kind, record.clone(), self.clock.now()));
    }
}
