//! ExecutionLoop - the polling loop that drives defined runners.
//!
//! One sweep visits every defined name: dependency gate, locked batch
//! dequeue, then each job runs through middleware and its handler under the
//! runner's timeout. The handler's verdict is recorded with `finish` or
//! `fail`. When no name produced work the loop sleeps for the poll interval.
//! In parallel mode a retry's backoff runs in a background task owned by the
//! loop and is drained on shutdown.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::JobRecord;
use crate::error::{QueueError, Result};
use crate::queue::{FailOutcome, HandlerError, JobQueue, PendingRepublish};

const FAILED_REASON: &str = "Failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopSettings {
    pub batch_size: usize,
    /// Await the jobs of one batch concurrently instead of one by one.
    pub parallel: bool,
    pub poll_interval: Duration,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            parallel: true,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Result of visiting one name during a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    /// Nothing was due.
    Idle,
    /// An upstream runner still has eligible jobs.
    Blocked,
    Processed(usize),
}

/// What happened to a job after its handler ran.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Finished(JobRecord),
    Failed(FailOutcome),
}

pub struct ExecutionLoop {
    queue: Arc<JobQueue>,
    settings: LoopSettings,
    backoffs: Mutex<JoinSet<()>>,
}

impl ExecutionLoop {
    pub fn new(queue: Arc<JobQueue>, settings: LoopSettings) -> Self {
        Self {
            queue,
            settings,
            backoffs: Mutex::new(JoinSet::new()),
        }
    }

    pub fn settings(&self) -> &LoopSettings {
        &self.settings
    }

    /// Run one dequeued job to completion and record the result.
    ///
    /// Middleware and handler share the runner's timeout. The handler gets a
    /// child of `shutdown`; it is also cancelled when the timeout elapses, and
    /// the attempt then fails with a timeout reason without waiting for the
    /// handler any further.
    pub async fn process_job(
        &self,
        job: JobRecord,
        shutdown: &CancellationToken,
    ) -> Result<JobOutcome> {
        let Some(runner) = self.queue.runner(&job.name) else {
            let reason = format!("no runner defined for '{}'", job.name);
            return Ok(JobOutcome::Failed(self.record_failure(&job, &reason, shutdown).await?));
        };

        let timeout = self.queue.timeout_for(&job.name);
        let cancel = shutdown.child_token();
        let attempt = async {
            for middleware in &runner.options.middleware {
                if let Err(e) = middleware.before(&job).await {
                    warn!(name = %job.name, identifier = %job.identifier, error = %e, "middleware rejected job");
                    return Err(e.to_string());
                }
            }
            match AssertUnwindSafe(runner.handler.handle(job.clone(), cancel.clone()))
                .catch_unwind()
                .await
            {
                Ok(Ok(success)) => Ok(success),
                Ok(Err(e)) => Err(handler_reason(&e)),
                Err(_) => Err("handler panicked".to_string()),
            }
        };

        let verdict: std::result::Result<bool, String> = tokio::select! {
            verdict = attempt => verdict,
            _ = tokio::time::sleep(timeout) => {
                cancel.cancel();
                warn!(
                    name = %job.name,
                    identifier = %job.identifier,
                    timeout_ms = timeout.as_millis() as u64,
                    "job timed out"
                );
                Err(format!("Timed out after {}ms", timeout.as_millis()))
            }
        };

        match verdict {
            Ok(true) => Ok(JobOutcome::Finished(self.queue.finish(&job).await?)),
            Ok(false) => Ok(JobOutcome::Failed(
                self.record_failure(&job, FAILED_REASON, shutdown).await?,
            )),
            Err(reason) => Ok(JobOutcome::Failed(
                self.record_failure(&job, &reason, shutdown).await?,
            )),
        }
    }

    /// Sequential loops wait out the backoff inline. Parallel loops commit
    /// the retry and hand the pause and re-publish to a background task, so
    /// other jobs and names keep moving.
    async fn record_failure(
        &self,
        job: &JobRecord,
        reason: &str,
        shutdown: &CancellationToken,
    ) -> Result<FailOutcome> {
        if !self.settings.parallel {
            return self.queue.fail(job, reason, false).await;
        }
        let (outcome, pending) = self.queue.fail_deferred(job, reason, false).await?;
        if let Some(pending) = pending {
            self.defer_republish(pending, shutdown.clone());
        }
        Ok(outcome)
    }

    fn defer_republish(&self, pending: PendingRepublish, shutdown: CancellationToken) {
        let queue = self.queue.clone();
        let mut backoffs = self.backoffs.lock();
        while backoffs.try_join_next().is_some() {}
        backoffs.spawn(async move {
            // Shutdown cuts the pause short; the record is already pending.
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(pending.pause) => {}
            }
            let name = pending.record.name.clone();
            let identifier = pending.record.identifier.clone();
            if let Err(e) = queue.republish(pending).await {
                error!(%name, %identifier, error = %e, "failed to re-publish retried job");
            }
        });
    }

    /// Number of retried jobs still waiting out their backoff.
    pub fn pending_backoffs(&self) -> usize {
        self.backoffs.lock().len()
    }

    /// Wait for every deferred re-publish to complete.
    pub async fn drain_backoffs(&self) {
        let mut backoffs = std::mem::take(&mut *self.backoffs.lock());
        while let Some(joined) = backoffs.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "backoff task ended abnormally");
            }
        }
    }

    async fn process_logged(&self, job: JobRecord, shutdown: &CancellationToken) {
        let name = job.name.clone();
        let identifier = job.identifier.clone();
        if let Err(e) = self.process_job(job, shutdown).await {
            error!(%name, %identifier, error = %e, "failed to record job outcome");
        }
    }

    /// Gate on dependencies, dequeue one batch of `name` and run it.
    pub async fn run_name(&self, name: &str, shutdown: &CancellationToken) -> Result<SweepOutcome> {
        match self.queue.check_job_dependencies(name).await {
            Ok(()) => {}
            Err(QueueError::DependencyPending(upstream)) => {
                debug!(name, %upstream, "waiting on upstream runner");
                return Ok(SweepOutcome::Blocked);
            }
            Err(e) => return Err(e),
        }

        let jobs = self.queue.dequeue_batch(name, self.settings.batch_size).await?;
        if jobs.is_empty() {
            return Ok(SweepOutcome::Idle);
        }
        let count = jobs.len();

        if self.settings.parallel {
            join_all(jobs.into_iter().map(|job| self.process_logged(job, shutdown))).await;
        } else {
            for job in jobs {
                self.process_logged(job, shutdown).await;
            }
        }
        Ok(SweepOutcome::Processed(count))
    }

    /// Visit every defined name once. Returns the number of jobs processed;
    /// errors are logged and the name counts as idle.
    pub async fn sweep(&self, shutdown: &CancellationToken) -> usize {
        let mut processed = 0;
        for name in self.queue.runner_names() {
            if shutdown.is_cancelled() {
                break;
            }
            match self.run_name(&name, shutdown).await {
                Ok(SweepOutcome::Processed(n)) => processed += n,
                Ok(SweepOutcome::Idle | SweepOutcome::Blocked) => {}
                Err(e) if e.is_transient() => {
                    warn!(%name, error = %e, "sweep skipped name");
                }
                Err(e) => {
                    error!(%name, error = %e, "sweep failed for name");
                }
            }
        }
        processed
    }

    /// Sweep until `shutdown` is cancelled. In-flight jobs of the current
    /// batch and pending re-publishes are awaited before returning.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            batch_size = self.settings.batch_size,
            parallel = self.settings.parallel,
            "execution loop started"
        );
        while !shutdown.is_cancelled() {
            if self.sweep(&shutdown).await > 0 {
                continue;
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }
        self.drain_backoffs().await;
        info!("execution loop stopped");
    }

    pub fn spawn(self) -> LoopHandle {
        let token = CancellationToken::new();
        let shutdown = token.clone();
        let join = tokio::spawn(async move { self.run(shutdown).await });
        LoopHandle { token, join }
    }
}

fn handler_reason(err: &HandlerError) -> String {
    let reason = err.to_string();
    if reason.is_empty() {
        FAILED_REASON.to_string()
    } else {
        reason
    }
}

/// Handle to a spawned `ExecutionLoop`.
pub struct LoopHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl LoopHandle {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Stop taking new batches; running handlers see their token cancelled.
    pub fn request_shutdown(&self) {
        self.token.cancel();
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        if let Err(e) = self.join.await {
            error!(error = %e, "execution loop task ended abnormally");
        }
    }
}
