//! Read-side inspection and operator sweeps (redistribution, orphan repair).

use std::collections::HashSet;

use chrono::Duration;
use tracing::{info, warn};

use super::JobQueue;
use super::dispatch::score_for;
use crate::domain::{JobRecord, JobStatus};
use crate::error::Result;
use crate::ports::dispatch_index::lock_key;
use crate::ports::{DispatchEntry, JobFilter, SortOrder};

const REPAIR_PAGE_SIZE: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageQuery {
    /// Only records created within this many days.
    pub last_n_days: Option<i64>,
    pub skip: usize,
    pub limit: usize,
    pub order: SortOrder,
    pub status: Option<JobStatus>,
}

impl Default for PageQuery {
    fn default() -> Self {
        Self {
            last_n_days: None,
            skip: 0,
            limit: 50,
            order: SortOrder::Desc,
            status: None,
        }
    }
}

impl JobQueue {
    /// Durable records of `name` created within the last `hours` hours.
    pub async fn count_in_last_hours(&self, name: &str, hours: i64) -> Result<u64> {
        let since = self.clock.now() - Duration::hours(hours);
        let filter = JobFilter::for_name(name).created_since(since);
        self.store
            .count_eligible(&self.collection_for(name), &filter)
            .await
    }

    pub async fn paginate_executed(&self, name: &str, query: &PageQuery) -> Result<Vec<JobRecord>> {
        let mut filter = JobFilter::for_name(name);
        if let Some(days) = query.last_n_days {
            filter = filter.created_since(self.clock.now() - Duration::days(days));
        }
        if let Some(status) = query.status {
            filter = filter.with_status(status);
        }
        self.store
            .paginate(
                &self.collection_for(name),
                &filter,
                query.order,
                query.skip,
                query.limit,
            )
            .await
    }

    /// Newest dead letters first.
    pub async fn dead_letters(
        &self,
        name: &str,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<JobRecord>> {
        self.store
            .list_dead_letters(&self.settings.dead_letter_collection, Some(name), skip, limit)
            .await
    }

    /// Re-publish every current entry of `name` with score "now", so any live
    /// worker may pick it up on its next sweep.
    ///
    /// There is no worker affinity: entries are not bound to a particular
    /// worker identity.
    pub async fn redistribute_jobs(&self, name: &str) -> Result<usize> {
        let live = self.workers.live_workers().await?;
        let lease = self
            .settings
            .lock_policy
            .acquire(self.lock.as_ref(), &lock_key(name))
            .await?;
        let result = self.republish_now(name).await;
        if let Err(e) = self.lock.release(&lease).await {
            warn!(name, error = %e, "failed to release redistribution lock");
        }
        let count = result?;
        info!(name, count, live_workers = live.len(), "jobs redistributed");
        Ok(count)
    }

    async fn republish_now(&self, name: &str) -> Result<usize> {
        let entries = self.index.snapshot(name).await?;
        if entries.is_empty() {
            return Ok(0);
        }
        let identifiers: Vec<String> = entries.into_iter().map(|e| e.identifier).collect();
        let payloads = self.index.payloads(name, &identifiers).await?;
        let now_ms = self.clock.now_ms();
        let republished: Vec<DispatchEntry> = identifiers
            .into_iter()
            .zip(payloads)
            .filter_map(|(identifier, payload)| {
                payload.map(|payload| DispatchEntry {
                    name: name.to_string(),
                    identifier,
                    score: now_ms,
                    payload,
                })
            })
            .collect();
        self.index.push(&republished).await?;
        Ok(republished.len())
    }

    /// Re-publish durable records of `name` that are pending and unpicked but
    /// have no dispatch entry, e.g. after an index write was lost during
    /// enqueue. Scores are rebuilt from the record's own timestamps.
    pub async fn repair_orphans(&self, name: &str) -> Result<usize> {
        let lease = self
            .settings
            .lock_policy
            .acquire(self.lock.as_ref(), &lock_key(name))
            .await?;
        let result = self.republish_orphans(name).await;
        if let Err(e) = self.lock.release(&lease).await {
            warn!(name, error = %e, "failed to release repair lock");
        }
        let count = result?;
        if count > 0 {
            info!(name, count, "orphaned jobs re-published");
        }
        Ok(count)
    }

    async fn republish_orphans(&self, name: &str) -> Result<usize> {
        let indexed: HashSet<String> = self
            .index
            .snapshot(name)
            .await?
            .into_iter()
            .map(|e| e.identifier)
            .collect();
        let collection = self.collection_for(name);
        let filter = JobFilter::for_name(name).unpicked();

        let mut orphans = Vec::new();
        let mut skip = 0;
        loop {
            let page = self
                .store
                .paginate(&collection, &filter, SortOrder::Asc, skip, REPAIR_PAGE_SIZE)
                .await?;
            let fetched = page.len();
            for record in page {
                if indexed.contains(&record.identifier) {
                    continue;
                }
                let base = record.requeued_at.unwrap_or(record.created_at);
                let score = score_for(base.timestamp_millis(), record.priority, record.delay);
                orphans.push(self.dispatch_entry(&record, score)?);
            }
            if fetched < REPAIR_PAGE_SIZE {
                break;
            }
            skip += fetched;
        }
        self.index.push(&orphans).await?;
        Ok(orphans.len())
    }
}
