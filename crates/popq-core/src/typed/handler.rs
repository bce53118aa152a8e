//! Handler<T> and the type-erasing adapter that makes it a `JobHandler`.

use std::marker::PhantomData;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::task::Task;
use crate::domain::JobRecord;
use crate::queue::{HandlerResult, JobHandler};

/// Runs a decoded task. `job` is the durable record the payload came from.
#[async_trait]
pub trait Handler<T: Task>: Send + Sync {
    async fn handle(&self, task: T, job: &JobRecord, cancel: CancellationToken) -> HandlerResult;
}

/// Wraps a `Handler<T>` as a `JobHandler`; the payload is decoded on every
/// call and a decode error fails the attempt.
pub struct TypedHandler<T: Task, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Task, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Task, H: Handler<T>> JobHandler for TypedHandler<T, H> {
    async fn handle(&self, job: JobRecord, cancel: CancellationToken) -> HandlerResult {
        let task: T = serde_json::from_value(job.data.clone())
            .map_err(|e| format!("payload decode for '{}': {e}", T::NAME))?;
        self.handler.handle(task, &job, cancel).await
    }
}
