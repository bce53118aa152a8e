//! Terminal and retry transitions: finish, fail, dead-letter, requeue.

use std::time::Duration;

use tracing::{error, info, warn};

use super::JobQueue;
use super::dispatch::score_for;
use crate::domain::{EventKind, JobRecord, JobUpdate, RecordId};
use crate::error::{QueueError, Result};

/// What `fail` did with the job.
#[derive(Debug, Clone, PartialEq)]
pub enum FailOutcome {
    /// Back to pending with a fresh dispatch entry.
    Retried(JobRecord),
    /// Retry budget exhausted; copied to the dead-letter collection.
    DeadLettered(JobRecord),
}

impl FailOutcome {
    pub fn record(&self) -> &JobRecord {
        match self {
            FailOutcome::Retried(record) | FailOutcome::DeadLettered(record) => record,
        }
    }

    pub fn is_dead_lettered(&self) -> bool {
        matches!(self, FailOutcome::DeadLettered(_))
    }
}

/// A retried job waiting out its backoff before it is dispatched again.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRepublish {
    pub record: JobRecord,
    pub pause: Duration,
}

impl JobQueue {
    async fn transition(&self, job: &JobRecord, update: JobUpdate) -> Result<JobRecord> {
        let collection = self.collection_for(&job.name);
        self.store
            .update_by_identifier(&collection, &job.name, &job.identifier, update)
            .await?
            .ok_or_else(|| QueueError::NotFound {
                name: job.name.clone(),
                id: job.identifier.clone(),
            })
    }

    /// Mark the job done and drop its dispatch payload.
    pub async fn finish(&self, job: &JobRecord) -> Result<JobRecord> {
        let updated = self
            .transition(job, JobUpdate::Finished { at: self.clock.now() })
            .await?;
        self.index.remove_payload(&job.name, &job.identifier).await?;
        self.metrics.record_success(updated.duration);

        info!(
            name = %updated.name,
            identifier = %updated.identifier,
            attempts = updated.attempts,
            duration_ms = updated.duration,
            "job finished"
        );
        self.emit(EventKind::JobFinished, &updated);
        if let Some(callback) = self
            .runner(&updated.name)
            .and_then(|runner| runner.options.on_complete.clone())
        {
            callback(&updated);
        }
        Ok(updated)
    }

    /// Record a failed attempt.
    ///
    /// While `attempts < retries` (or always, when `force` is set) the job
    /// goes back to pending and is re-published after the backoff pause; the
    /// pause only delays this call. Otherwise it is marked failed and copied
    /// to the dead-letter collection.
    pub async fn fail(&self, job: &JobRecord, reason: &str, force: bool) -> Result<FailOutcome> {
        let (outcome, pending) = self.fail_deferred(job, reason, force).await?;
        if let Some(pending) = pending {
            if !pending.pause.is_zero() {
                tokio::time::sleep(pending.pause).await;
            }
            self.republish(pending).await?;
        }
        Ok(outcome)
    }

    /// Like `fail`, but leaves the backoff pause and the re-publish to the
    /// caller. The durable transition is already committed when this
    /// returns; a retried job is invisible to dequeue until `republish` runs.
    pub async fn fail_deferred(
        &self,
        job: &JobRecord,
        reason: &str,
        force: bool,
    ) -> Result<(FailOutcome, Option<PendingRepublish>)> {
        let retries = self.retries_for(&job.name);
        let now = self.clock.now();

        if force || job.attempts < retries {
            let updated = self
                .transition(
                    job,
                    JobUpdate::Retry {
                        reason: reason.to_string(),
                        at: now,
                    },
                )
                .await?;
            self.metrics.record_retry();

            let pause = self.settings.retry_policy.next_delay(updated.attempts.max(1));
            warn!(
                name = %updated.name,
                identifier = %updated.identifier,
                attempts = updated.attempts,
                retries,
                forced = force,
                reason,
                backoff_ms = pause.as_millis() as u64,
                "job failed, retrying"
            );
            let pending = PendingRepublish {
                record: updated.clone(),
                pause,
            };
            Ok((FailOutcome::Retried(updated), Some(pending)))
        } else {
            let updated = self
                .transition(
                    job,
                    JobUpdate::Terminal {
                        reason: reason.to_string(),
                        at: now,
                    },
                )
                .await?;
            self.store
                .insert_dead_letter(&self.settings.dead_letter_collection, &updated)
                .await?;
            self.index.remove_payload(&job.name, &job.identifier).await?;
            self.metrics.record_failure();

            error!(
                name = %updated.name,
                identifier = %updated.identifier,
                attempts = updated.attempts,
                retries,
                reason,
                "job dead-lettered"
            );
            self.emit(EventKind::JobFailed, &updated);
            Ok((FailOutcome::DeadLettered(updated), None))
        }
    }

    /// Re-score a retried job and put it back in the dispatch index.
    pub async fn republish(&self, pending: PendingRepublish) -> Result<()> {
        let record = pending.record;
        let score = score_for(self.clock.now_ms(), record.priority, record.delay);
        self.index.push(&[self.dispatch_entry(&record, score)?]).await?;
        self.emit(EventKind::JobRetried, &record);
        Ok(())
    }

    /// Force a job back to pending by its internal record id, whatever its
    /// attempt count.
    pub async fn requeue(&self, name: &str, id: RecordId) -> Result<FailOutcome> {
        let collection = self.collection_for(name);
        let record = self
            .store
            .find_by_internal_id(&collection, id)
            .await?
            .ok_or_else(|| QueueError::NotFound {
                name: name.to_string(),
                id: id.to_string(),
            })?;
        info!(name, identifier = %record.identifier, %id, "manual requeue");
        self.fail(&record, "Manually requeued", true).await
    }
}
