//! Runner definitions: handler, options and the per-engine registry.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::dependency::DependencyGraph;
use crate::domain::JobRecord;
use crate::error::{QueueError, Result};
use crate::ports::PayloadSchema;

/// Error type a handler may return; its `Display` becomes the failed reason.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// `Ok(true)` finishes the job, `Ok(false)` fails it with reason "Failed".
pub type HandlerResult = std::result::Result<bool, HandlerError>;

/// A job handler.
///
/// The token is cancelled when the job's timeout elapses or the worker shuts
/// down; long-running handlers should watch it and return early.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: JobRecord, cancel: CancellationToken) -> HandlerResult;
}

/// Adapter turning an async closure into a `JobHandler`.
pub struct FnHandler<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(JobRecord, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobRecord, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn handle(&self, job: JobRecord, cancel: CancellationToken) -> HandlerResult {
        (self.0)(job, cancel).await
    }
}

/// Hook run before the handler. An error fails the attempt like a handler
/// error would.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn before(&self, job: &JobRecord) -> std::result::Result<(), HandlerError>;
}

pub type CompletionCallback = Arc<dyn Fn(&JobRecord) + Send + Sync>;

/// Options for `JobQueue::define`.
#[derive(Clone, Default)]
pub struct RunnerOptions {
    /// Falls back to the engine's default job timeout.
    pub timeout: Option<Duration>,
    pub schema: Option<Arc<dyn PayloadSchema>>,
    /// Upstream runner names that must be drained first.
    pub dependencies: Vec<String>,
    pub middleware: Vec<Arc<dyn Middleware>>,
    pub on_complete: Option<CompletionCallback>,
    /// Durable collection override.
    pub collection: Option<String>,
    /// Retry budget override.
    pub retries: Option<u32>,
}

impl RunnerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn schema(mut self, schema: impl PayloadSchema + 'static) -> Self {
        self.schema = Some(Arc::new(schema));
        self
    }

    pub fn depends_on(mut self, upstream: impl Into<String>) -> Self {
        self.dependencies.push(upstream.into());
        self
    }

    pub fn middleware(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(&JobRecord) + Send + Sync + 'static,
    {
        self.on_complete = Some(Arc::new(callback));
        self
    }

    pub fn collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }
}

impl std::fmt::Debug for RunnerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerOptions")
            .field("timeout", &self.timeout)
            .field("schema", &self.schema.is_some())
            .field("dependencies", &self.dependencies)
            .field("middleware", &self.middleware.len())
            .field("on_complete", &self.on_complete.is_some())
            .field("collection", &self.collection)
            .field("retries", &self.retries)
            .finish()
    }
}

pub struct RunnerDefinition {
    pub name: String,
    pub handler: Arc<dyn JobHandler>,
    pub options: RunnerOptions,
}

impl RunnerDefinition {
    pub fn validate_payload(&self, payload: &serde_json::Value) -> Result<()> {
        match &self.options.schema {
            Some(schema) => schema.validate(payload).map_err(|errors| QueueError::Validation {
                name: self.name.clone(),
                errors,
            }),
            None => Ok(()),
        }
    }
}

/// Registry of runners (name -> definition).
///
/// Names iterate in sorted order so sweeps visit queues deterministically.
#[derive(Default)]
pub struct RunnerRegistry {
    runners: BTreeMap<String, Arc<RunnerDefinition>>,
    graph: DependencyGraph,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails on a duplicate name or when the declared dependencies would close
    /// a cycle; the registry is unchanged on error.
    pub fn register(&mut self, definition: RunnerDefinition) -> Result<()> {
        if self.runners.contains_key(&definition.name) {
            return Err(QueueError::DuplicateRunner(definition.name));
        }
        for upstream in &definition.options.dependencies {
            self.graph.add_dependency(&definition.name, upstream);
        }
        if let Some(cycle) = self.graph.detect_cycle() {
            self.graph.remove_runner(&definition.name);
            return Err(QueueError::DependencyCycle(cycle));
        }
        self.runners
            .insert(definition.name.clone(), Arc::new(definition));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<RunnerDefinition>> {
        self.runners.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.runners.keys().cloned().collect()
    }

    pub fn dependencies_of(&self, name: &str) -> Vec<String> {
        self.graph.dependencies_of(name)
    }

    /// First `(runner, dependency)` pair whose dependency is not defined.
    pub fn first_missing_dependency(&self) -> Option<(String, String)> {
        self.runners.values().find_map(|runner| {
            runner
                .options
                .dependencies
                .iter()
                .find(|upstream| !self.runners.contains_key(upstream.as_str()))
                .map(|upstream| (runner.name.clone(), upstream.clone()))
        })
    }

    pub fn len(&self) -> usize {
        self.runners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::RequiredFields;

    fn definition(name: &str, options: RunnerOptions) -> RunnerDefinition {
        RunnerDefinition {
            name: name.to_string(),
            handler: Arc::new(handler_fn(|_job, _cancel| async { Ok(true) })),
            options,
        }
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = RunnerRegistry::new();
        registry.register(definition("email", RunnerOptions::new())).unwrap();

        let err = registry
            .register(definition("email", RunnerOptions::new()))
            .unwrap_err();
        assert!(matches!(err, QueueError::DuplicateRunner(name) if name == "email"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn cycles_are_rejected_and_rolled_back() {
        let mut registry = RunnerRegistry::new();
        registry
            .register(definition("a", RunnerOptions::new().depends_on("b")))
            .unwrap();

        let err = registry
            .register(definition("b", RunnerOptions::new().depends_on("a")))
            .unwrap_err();
        assert!(matches!(err, QueueError::DependencyCycle(_)));
        assert!(registry.get("b").is_none());
        assert!(registry.dependencies_of("b").is_empty());
    }

    #[test]
    fn missing_dependencies_are_reported() {
        let mut registry = RunnerRegistry::new();
        registry
            .register(definition("report", RunnerOptions::new().depends_on("ingest")))
            .unwrap();
        assert_eq!(
            registry.first_missing_dependency(),
            Some(("report".to_string(), "ingest".to_string()))
        );

        registry.register(definition("ingest", RunnerOptions::new())).unwrap();
        assert_eq!(registry.first_missing_dependency(), None);
        assert_eq!(registry.names(), vec!["ingest".to_string(), "report".to_string()]);
    }

    #[test]
    fn schema_failures_become_validation_errors() {
        let runner = definition("email", RunnerOptions::new().schema(RequiredFields::new(["to"])));

        assert!(runner.validate_payload(&serde_json::json!({"to": "x"})).is_ok());
        let err = runner.validate_payload(&serde_json::json!({})).unwrap_err();
        assert!(matches!(err, QueueError::Validation { name, .. } if name == "email"));
    }

    #[tokio::test]
    async fn closure_handlers_receive_the_job() {
        let handler = handler_fn(|job: JobRecord, _cancel| async move {
            Ok(job.identifier == "e1")
        });
        let job = JobRecord::new(
            crate::domain::RecordId::from_ulid(ulid::Ulid::new()),
            "email",
            "e1",
            serde_json::Value::Null,
            chrono::Utc::now(),
        );

        assert!(handler.handle(job, CancellationToken::new()).await.unwrap());
    }
}
