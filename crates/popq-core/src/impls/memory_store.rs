//! InMemoryStore - durable store for tests and the demo CLI.
//!
//! Nothing survives a restart, but the semantics (upsert by name and
//! identifier, dead-letter copies, filtering and pagination) match the
//! Postgres adapter.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{JobRecord, JobUpdate, RecordId};
use crate::error::Result;
use crate::ports::{DurableStore, JobFilter, SortOrder};

/// `(name, identifier)`
type RecordKey = (String, String);

fn key(name: &str, identifier: &str) -> RecordKey {
    (name.to_string(), identifier.to_string())
}

#[derive(Default)]
struct Collection {
    records: HashMap<RecordKey, JobRecord>,
    by_id: HashMap<RecordId, RecordKey>,
}

#[derive(Default)]
struct StoreState {
    collections: HashMap<String, Collection>,
    dead_letters: HashMap<String, Vec<JobRecord>>,
}

#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sort_records(records: &mut [JobRecord], order: SortOrder) {
    records.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
    if order == SortOrder::Desc {
        records.reverse();
    }
}

#[async_trait]
impl DurableStore for InMemoryStore {
    async fn upsert_by_identifier(
        &self,
        collection: &str,
        record: JobRecord,
    ) -> Result<JobRecord> {
        let mut state = self.state.lock().await;
        let coll = state.collections.entry(collection.to_string()).or_default();
        let record_key = key(&record.name, &record.identifier);
        match coll.records.get_mut(&record_key) {
            Some(existing) => {
                existing.resubmit(&record);
                Ok(existing.clone())
            }
            None => {
                coll.by_id.insert(record.id, record_key.clone());
                coll.records.insert(record_key, record.clone());
                Ok(record)
            }
        }
    }

    async fn update_by_identifier(
        &self,
        collection: &str,
        name: &str,
        identifier: &str,
        update: JobUpdate,
    ) -> Result<Option<JobRecord>> {
        let mut state = self.state.lock().await;
        let Some(record) = state
            .collections
            .get_mut(collection)
            .and_then(|coll| coll.records.get_mut(&key(name, identifier)))
        else {
            return Ok(None);
        };
        record.apply(&update);
        Ok(Some(record.clone()))
    }

    async fn find_by_internal_id(
        &self,
        collection: &str,
        id: RecordId,
    ) -> Result<Option<JobRecord>> {
        let state = self.state.lock().await;
        Ok(state.collections.get(collection).and_then(|coll| {
            coll.by_id
                .get(&id)
                .and_then(|record_key| coll.records.get(record_key))
                .cloned()
        }))
    }

    async fn find_by_identifier(
        &self,
        collection: &str,
        name: &str,
        identifier: &str,
    ) -> Result<Option<JobRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .collections
            .get(collection)
            .and_then(|coll| coll.records.get(&key(name, identifier)))
            .cloned())
    }

    async fn insert_dead_letter(&self, collection: &str, record: &JobRecord) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .dead_letters
            .entry(collection.to_string())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn list_dead_letters(
        &self,
        collection: &str,
        name: Option<&str>,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<JobRecord>> {
        let state = self.state.lock().await;
        let mut records: Vec<JobRecord> = state
            .dead_letters
            .get(collection)
            .map(|letters| {
                letters
                    .iter()
                    .filter(|record| name.is_none_or(|n| record.name == n))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        sort_records(&mut records, SortOrder::Desc);
        Ok(records.into_iter().skip(skip).take(limit).collect())
    }

    async fn count_eligible(&self, collection: &str, filter: &JobFilter) -> Result<u64> {
        let state = self.state.lock().await;
        Ok(state
            .collections
            .get(collection)
            .map(|coll| coll.records.values().filter(|r| filter.matches(r)).count() as u64)
            .unwrap_or(0))
    }

    async fn paginate(
        &self,
        collection: &str,
        filter: &JobFilter,
        order: SortOrder,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<JobRecord>> {
        let state = self.state.lock().await;
        let mut records: Vec<JobRecord> = state
            .collections
            .get(collection)
            .map(|coll| {
                coll.records
                    .values()
                    .filter(|r| filter.matches(r))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        sort_records(&mut records, order);
        Ok(records.into_iter().skip(skip).take(limit).collect())
    }
}
