//! Typed jobs: serde payloads bound to a runner name at compile time.

pub mod handler;
pub mod task;

pub use self::handler::{Handler, TypedHandler};
pub use self::task::Task;

use crate::domain::JobRecord;
use crate::error::Result;
use crate::queue::{EnqueueOptions, JobQueue, RunnerOptions};

impl JobQueue {
    /// `define` for `T::NAME` with a typed handler.
    pub fn define_typed<T, H>(&self, handler: H, options: RunnerOptions) -> Result<()>
    where
        T: Task,
        H: Handler<T> + 'static,
    {
        self.define(T::NAME, TypedHandler::<T, H>::new(handler), options)
    }

    /// `enqueue` under `T::NAME` with the task serialized as `data`.
    pub async fn enqueue_task<T: Task>(
        &self,
        task: &T,
        identifier: impl Into<String>,
        options: EnqueueOptions,
    ) -> Result<JobRecord> {
        let data = serde_json::to_value(task)?;
        self.enqueue(T::NAME, identifier, data, options).await
    }
}
