//! Enqueue and dequeue against the durable store and the dispatch index.

use serde_json::Value;
use tracing::{debug, warn};

use super::JobQueue;
use crate::domain::{EventKind, JobRecord, JobUpdate};
use crate::error::{QueueError, Result};
use crate::ports::dispatch_index::lock_key;
use crate::ports::{DispatchEntry, IndexedJob};

/// Score of a dispatch entry: lower pops first. Delay pushes a job later,
/// priority pulls it earlier.
pub fn score_for(now_ms: i64, priority: i64, delay: i64) -> i64 {
    now_ms.saturating_add(delay).saturating_sub(priority)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub priority: i64,
    /// Milliseconds.
    pub delay: i64,
    /// Pins the initial score; requeues always recompute it.
    pub score: Option<i64>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn delay(mut self, delay_ms: i64) -> Self {
        self.delay = delay_ms;
        self
    }

    pub fn score(mut self, score: i64) -> Self {
        self.score = Some(score);
        self
    }
}

/// One job of an `enqueue_batch` call.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub identifier: String,
    pub data: Value,
    pub options: EnqueueOptions,
}

impl NewJob {
    pub fn new(identifier: impl Into<String>, data: Value) -> Self {
        Self {
            identifier: identifier.into(),
            data,
            options: EnqueueOptions::default(),
        }
    }

    pub fn with_options(mut self, options: EnqueueOptions) -> Self {
        self.options = options;
        self
    }
}

impl JobQueue {
    fn validate_payload(&self, name: &str, data: &Value) -> Result<()> {
        match self.runner(name) {
            Some(runner) => runner.validate_payload(data),
            None => Ok(()),
        }
    }

    fn new_record(
        &self,
        name: &str,
        identifier: String,
        data: Value,
        options: &EnqueueOptions,
    ) -> JobRecord {
        JobRecord::new(
            self.ids.generate_record_id(),
            name,
            identifier,
            data,
            self.clock.now(),
        )
        .with_priority(options.priority)
        .with_delay(options.delay)
    }

    /// Upsert the durable record, then publish its dispatch entry.
    ///
    /// A validation failure writes nothing. If the index write fails after the
    /// upsert, the error is returned and the record stays pending until
    /// `repair_orphans` re-publishes it.
    pub async fn enqueue(
        &self,
        name: &str,
        identifier: impl Into<String>,
        data: Value,
        options: EnqueueOptions,
    ) -> Result<JobRecord> {
        self.validate_payload(name, &data)?;
        let collection = self.collection_for(name);
        let record = self.new_record(name, identifier.into(), data, &options);

        let stored = self.store.upsert_by_identifier(&collection, record).await?;
        let score = options
            .score
            .unwrap_or_else(|| score_for(self.clock.now_ms(), stored.priority, stored.delay));
        self.index.push(&[self.dispatch_entry(&stored, score)?]).await?;

        debug!(name, identifier = %stored.identifier, score, "job enqueued");
        self.emit(EventKind::JobEnqueued, &stored);
        Ok(stored)
    }

    /// Validate every payload, upsert every record, then publish all entries
    /// in one round trip.
    pub async fn enqueue_batch(&self, name: &str, jobs: Vec<NewJob>) -> Result<Vec<JobRecord>> {
        for job in &jobs {
            self.validate_payload(name, &job.data)?;
        }
        let collection = self.collection_for(name);

        let mut stored = Vec::with_capacity(jobs.len());
        let mut entries = Vec::with_capacity(jobs.len());
        for job in jobs {
            let record = self.new_record(name, job.identifier, job.data, &job.options);
            let record = self.store.upsert_by_identifier(&collection, record).await?;
            let score = job
                .options
                .score
                .unwrap_or_else(|| score_for(self.clock.now_ms(), record.priority, record.delay));
            entries.push(self.dispatch_entry(&record, score)?);
            stored.push(record);
        }
        self.index.push(&entries).await?;

        debug!(name, count = stored.len(), "job batch enqueued");
        for record in &stored {
            self.emit(EventKind::JobEnqueued, record);
        }
        Ok(stored)
    }

    /// Pop the lowest-score due job, if any.
    pub async fn dequeue_one(&self, name: &str) -> Result<Option<JobRecord>> {
        Ok(self.dequeue_batch(name, 1).await?.into_iter().next())
    }

    /// Pop up to `batch_size` due jobs while holding the per-name lock, and
    /// mark each one picked in the durable store.
    ///
    /// Entries whose payload is missing or unreadable, or that have no
    /// durable record, are dropped with a warning and not returned. If the
    /// store fails part-way, entries not yet marked picked are restored to
    /// the index and the picked ones are returned; the error surfaces only
    /// when nothing was picked.
    pub async fn dequeue_batch(&self, name: &str, batch_size: usize) -> Result<Vec<JobRecord>> {
        if batch_size == 0 {
            return Ok(Vec::new());
        }
        let lease = self
            .settings
            .lock_policy
            .acquire(self.lock.as_ref(), &lock_key(name))
            .await?;

        let result = self.dequeue_locked(name, batch_size).await;

        match self.lock.release(&lease).await {
            Ok(true) => {}
            Ok(false) => warn!(name, "dequeue lock lease expired before release"),
            Err(e) => warn!(name, error = %e, "failed to release dequeue lock"),
        }
        result
    }

    async fn dequeue_locked(&self, name: &str, batch_size: usize) -> Result<Vec<JobRecord>> {
        let now = self.clock.now();
        let identifiers = self
            .index
            .pop_due(name, now.timestamp_millis(), batch_size)
            .await?;
        if identifiers.is_empty() {
            return Ok(Vec::new());
        }
        let payloads = self.index.payloads(name, &identifiers).await?;
        let collection = self.collection_for(name);

        let mut popped: Vec<(String, String)> = Vec::with_capacity(identifiers.len());
        for (identifier, payload) in identifiers.into_iter().zip(payloads) {
            let Some(payload) = payload else {
                warn!(name, identifier = %identifier, "popped job has no payload; skipping");
                continue;
            };
            if let Err(e) = serde_json::from_str::<JobRecord>(&payload) {
                warn!(name, identifier = %identifier, error = %e, "popped job has a corrupt payload; skipping");
                continue;
            }
            popped.push((identifier, payload));
        }

        let mut jobs = Vec::with_capacity(popped.len());
        for (position, (identifier, _)) in popped.iter().enumerate() {
            let update = JobUpdate::Picked { at: now };
            match self.store.update_by_identifier(&collection, name, identifier, update).await {
                Ok(Some(record)) => {
                    debug!(name, identifier = %identifier, attempts = record.attempts, "job dequeued");
                    jobs.push(record);
                }
                Ok(None) => {
                    warn!(name, identifier = %identifier, "popped job has no durable record; skipping");
                }
                Err(e) => {
                    // Entries already marked picked are delivered; only the rest go back.
                    self.restore_popped(name, &popped[position..], now.timestamp_millis())
                        .await;
                    if jobs.is_empty() {
                        return Err(e);
                    }
                    warn!(
                        name,
                        delivered = jobs.len(),
                        restored = popped.len() - position,
                        error = %e,
                        "store failed mid-batch; returning the picked part"
                    );
                    break;
                }
            }
        }
        self.metrics.record_processed(jobs.len() as u64);
        Ok(jobs)
    }

    /// Put popped entries back so the jobs stay visible to the next sweep.
    async fn restore_popped(&self, name: &str, popped: &[(String, String)], score: i64) {
        let entries: Vec<DispatchEntry> = popped
            .iter()
            .map(|(identifier, payload)| DispatchEntry {
                name: name.to_string(),
                identifier: identifier.clone(),
                score,
                payload: payload.clone(),
            })
            .collect();
        if let Err(e) = self.index.push(&entries).await {
            warn!(name, count = entries.len(), error = %e, "failed to restore popped jobs");
        }
    }

    /// Number of eligible entries for `name`.
    pub async fn length(&self, name: &str) -> Result<u64> {
        self.index.len(name).await
    }

    /// Ordered `(identifier, score)` listing; nothing is removed.
    pub async fn snapshot(&self, name: &str) -> Result<Vec<IndexedJob>> {
        self.index.snapshot(name).await
    }

    /// Records currently in the dispatch index, in dequeue order.
    pub async fn get_eligible(&self, name: &str) -> Result<Vec<JobRecord>> {
        let entries = self.index.snapshot(name).await?;
        let identifiers: Vec<String> = entries.into_iter().map(|e| e.identifier).collect();
        let payloads = self.index.payloads(name, &identifiers).await?;
        Ok(payloads
            .into_iter()
            .flatten()
            .filter_map(|payload| serde_json::from_str(&payload).ok())
            .collect())
    }

    /// `Err(DependencyPending)` while any upstream runner of `name` still has
    /// eligible entries.
    pub async fn check_job_dependencies(&self, name: &str) -> Result<()> {
        let upstreams = self.runners.read().dependencies_of(name);
        for upstream in upstreams {
            if self.index.len(&upstream).await? > 0 {
                return Err(QueueError::DependencyPending(upstream));
            }
        }
        Ok(())
    }
}
