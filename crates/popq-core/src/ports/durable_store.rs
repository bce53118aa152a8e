//! DurableStore port
//!
//! The durable store is the source of truth for every job record. Records are
//! keyed by `(collection, name, identifier)`, so runners sharing a collection
//! may reuse identifiers. The internal `RecordId` is only used by operator
//! tooling (manual requeue).
//!
//! Implementations:
//! - `impls::memory_store::InMemoryStore` (tests, demo)
//! - `impls::postgres::PostgresStore` (feature `postgres-backend`)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{JobRecord, JobStatus, JobUpdate, RecordId};
use crate::error::{QueueError, Result};

/// Filter shared by counting and pagination.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub name: Option<String>,
    pub created_since: Option<DateTime<Utc>>,
    pub status: Option<JobStatus>,
    /// Only records that are pending and have no `pickedAt`.
    pub unpicked_only: bool,
}

impl JobFilter {
    pub fn for_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn created_since(mut self, since: DateTime<Utc>) -> Self {
        self.created_since = Some(since);
        self
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn unpicked(mut self) -> Self {
        self.unpicked_only = true;
        self
    }

    pub fn matches(&self, record: &JobRecord) -> bool {
        if let Some(name) = &self.name
            && &record.name != name
        {
            return false;
        }
        if let Some(since) = self.created_since
            && record.created_at < since
        {
            return false;
        }
        if let Some(status) = self.status
            && record.status != status
        {
            return false;
        }
        if self.unpicked_only
            && (record.status != JobStatus::Pending || record.picked_at.is_some())
        {
            return false;
        }
        true
    }
}

/// Sort direction on `createdAt`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Insert the record, or merge it into the existing record with the same
    /// name and identifier. Returns the stored record.
    async fn upsert_by_identifier(&self, collection: &str, record: JobRecord)
    -> Result<JobRecord>;

    /// Apply a transition to the record with this name and identifier and
    /// return the updated record, or `None` when no such record exists.
    async fn update_by_identifier(
        &self,
        collection: &str,
        name: &str,
        identifier: &str,
        update: JobUpdate,
    ) -> Result<Option<JobRecord>>;

    async fn find_by_internal_id(&self, collection: &str, id: RecordId)
    -> Result<Option<JobRecord>>;

    async fn find_by_identifier(
        &self,
        collection: &str,
        name: &str,
        identifier: &str,
    ) -> Result<Option<JobRecord>>;

    /// Append a copy of the record to the dead-letter collection.
    async fn insert_dead_letter(&self, collection: &str, record: &JobRecord) -> Result<()>;

    async fn list_dead_letters(
        &self,
        collection: &str,
        name: Option<&str>,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<JobRecord>>;

    async fn count_eligible(&self, collection: &str, filter: &JobFilter) -> Result<u64>;

    async fn paginate(
        &self,
        collection: &str,
        filter: &JobFilter,
        order: SortOrder,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<JobRecord>>;
}

/// Collection names end up in SQL as table names, so only plain identifiers
/// are accepted.
pub fn validate_collection_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
                && name.len() <= 63
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(QueueError::InvalidCollection(name.to_string()))
    }
}
