//! PostgresStore - durable store backed by one table per collection.
//!
//! Tables are created on first use. `failed_reason` and `run_history` are
//! JSONB arrays; transitions are applied inside a transaction with the row
//! locked (`FOR UPDATE`) so the record logic lives in one place
//! (`JobRecord::apply`) for every backend.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Row};

use crate::domain::{FailedReason, JobRecord, JobStatus, JobUpdate, RecordId, RunSnapshot};
use crate::error::{QueueError, Result};
use crate::ports::{DurableStore, JobFilter, SortOrder, validate_collection_name};

const COLUMNS: &str = "id, identifier, name, data, created_at, priority, delay, attempts, \
     picked_at, finished_at, requeued_at, status, duration, latency, failed_reason, run_history";

impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        QueueError::Store(err.to_string())
    }
}

pub struct PostgresStore {
    pool: PgPool,
    ensured: Mutex<HashSet<String>>,
}

impl PostgresStore {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        tracing::info!(max_connections, "connected to postgres");
        Ok(Self::with_pool(pool))
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self {
            pool,
            ensured: Mutex::new(HashSet::new()),
        }
    }

    async fn ensure_table(&self, collection: &str, dead_letter: bool) -> Result<()> {
        validate_collection_name(collection)?;
        if self.ensured.lock().contains(collection) {
            return Ok(());
        }
        let ddl = if dead_letter {
            dead_letter_table_sql(collection)
        } else {
            job_table_sql(collection)
        };
        sqlx::query(&ddl).execute(&self.pool).await?;
        tracing::debug!(collection, "ensured table");
        self.ensured.lock().insert(collection.to_string());
        Ok(())
    }
}

fn job_table_sql(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            id TEXT PRIMARY KEY,
            identifier TEXT NOT NULL,
            name TEXT NOT NULL,
            data JSONB,
            created_at TIMESTAMPTZ NOT NULL,
            priority BIGINT NOT NULL DEFAULT 0,
            delay BIGINT NOT NULL DEFAULT 0,
            attempts INTEGER NOT NULL DEFAULT 0,
            picked_at TIMESTAMPTZ,
            finished_at TIMESTAMPTZ,
            requeued_at TIMESTAMPTZ,
            status TEXT NOT NULL DEFAULT 'pending',
            duration BIGINT,
            latency BIGINT,
            failed_reason JSONB NOT NULL DEFAULT '[]',
            run_history JSONB NOT NULL DEFAULT '[]',
            UNIQUE (name, identifier)
        )"
    )
}

/// Producer-owned fields only; name and identifier are the conflict key.
const UPSERT_CONFLICT: &str = " ON CONFLICT (name, identifier) DO UPDATE SET \
     data = EXCLUDED.data, priority = EXCLUDED.priority, delay = EXCLUDED.delay";

/// Same shape, but a job may be dead-lettered more than once after a manual
/// requeue, so rows get their own key.
fn dead_letter_table_sql(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            dead_letter_id BIGSERIAL PRIMARY KEY,
            id TEXT NOT NULL,
            identifier TEXT NOT NULL,
            name TEXT NOT NULL,
            data JSONB,
            created_at TIMESTAMPTZ NOT NULL,
            priority BIGINT NOT NULL DEFAULT 0,
            delay BIGINT NOT NULL DEFAULT 0,
            attempts INTEGER NOT NULL DEFAULT 0,
            picked_at TIMESTAMPTZ,
            finished_at TIMESTAMPTZ,
            requeued_at TIMESTAMPTZ,
            status TEXT NOT NULL DEFAULT 'failed',
            duration BIGINT,
            latency BIGINT,
            failed_reason JSONB NOT NULL DEFAULT '[]',
            run_history JSONB NOT NULL DEFAULT '[]'
        )"
    )
}

fn push_filter(builder: &mut QueryBuilder<'_, Postgres>, filter: &JobFilter) {
    builder.push(" WHERE TRUE");
    if let Some(name) = &filter.name {
        builder.push(" AND name = ").push_bind(name.clone());
    }
    if let Some(since) = filter.created_since {
        builder.push(" AND created_at >= ").push_bind(since);
    }
    if let Some(status) = filter.status {
        builder.push(" AND status = ").push_bind(status.as_str());
    }
    if filter.unpicked_only {
        builder.push(" AND status = 'pending' AND picked_at IS NULL");
    }
}

fn order_sql(order: SortOrder) -> &'static str {
    match order {
        SortOrder::Asc => " ORDER BY created_at ASC, id ASC",
        SortOrder::Desc => " ORDER BY created_at DESC, id DESC",
    }
}

fn record_from_row(row: &PgRow) -> Result<JobRecord> {
    let raw_id: String = row.try_get("id")?;
    let id = RecordId::parse(&raw_id)
        .ok_or_else(|| QueueError::Store(format!("malformed record id '{raw_id}'")))?;
    let raw_status: String = row.try_get("status")?;
    let status = JobStatus::parse(&raw_status)
        .ok_or_else(|| QueueError::Store(format!("unknown status '{raw_status}'")))?;
    let attempts: i32 = row.try_get("attempts")?;
    let data: Option<serde_json::Value> = row.try_get("data")?;
    let Json(failed_reason): Json<Vec<FailedReason>> = row.try_get("failed_reason")?;
    let Json(run_history): Json<Vec<RunSnapshot>> = row.try_get("run_history")?;

    Ok(JobRecord {
        id,
        identifier: row.try_get("identifier")?,
        name: row.try_get("name")?,
        data: data.unwrap_or(serde_json::Value::Null),
        created_at: row.try_get("created_at")?,
        priority: row.try_get("priority")?,
        delay: row.try_get("delay")?,
        attempts: attempts.max(0) as u32,
        picked_at: row.try_get::<Option<DateTime<Utc>>, _>("picked_at")?,
        finished_at: row.try_get::<Option<DateTime<Utc>>, _>("finished_at")?,
        requeued_at: row.try_get::<Option<DateTime<Utc>>, _>("requeued_at")?,
        status,
        duration: row.try_get("duration")?,
        latency: row.try_get("latency")?,
        failed_reason,
        run_history,
    })
}

fn push_values(builder: &mut QueryBuilder<'_, Postgres>, record: &JobRecord) {
    builder.push(" VALUES (");
    let mut values = builder.separated(", ");
    values
        .push_bind(record.id.as_ulid().to_string())
        .push_bind(record.identifier.clone())
        .push_bind(record.name.clone())
        .push_bind(record.data.clone())
        .push_bind(record.created_at)
        .push_bind(record.priority)
        .push_bind(record.delay)
        .push_bind(record.attempts as i32)
        .push_bind(record.picked_at)
        .push_bind(record.finished_at)
        .push_bind(record.requeued_at)
        .push_bind(record.status.as_str())
        .push_bind(record.duration)
        .push_bind(record.latency)
        .push_bind(Json(record.failed_reason.clone()))
        .push_bind(Json(record.run_history.clone()));
    values.push_unseparated(")");
}

#[async_trait]
impl DurableStore for PostgresStore {
    async fn upsert_by_identifier(
        &self,
        collection: &str,
        record: JobRecord,
    ) -> Result<JobRecord> {
        self.ensure_table(collection, false).await?;
        let mut builder = QueryBuilder::new(format!("INSERT INTO {collection} ({COLUMNS})"));
        push_values(&mut builder, &record);
        builder.push(UPSERT_CONFLICT);
        builder.push(format!(" RETURNING {COLUMNS}"));
        let row = builder.build().fetch_one(&self.pool).await?;
        record_from_row(&row)
    }

    async fn update_by_identifier(
        &self,
        collection: &str,
        name: &str,
        identifier: &str,
        update: JobUpdate,
    ) -> Result<Option<JobRecord>> {
        self.ensure_table(collection, false).await?;
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM {collection} WHERE name = $1 AND identifier = $2 FOR UPDATE"
        ))
        .bind(name)
        .bind(identifier)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        let mut record = record_from_row(&row)?;
        record.apply(&update);

        sqlx::query(&format!(
            "UPDATE {collection} SET attempts = $2, picked_at = $3, finished_at = $4, \
             requeued_at = $5, status = $6, duration = $7, latency = $8, \
             failed_reason = $9, run_history = $10 WHERE id = $1"
        ))
        .bind(record.id.as_ulid().to_string())
        .bind(record.attempts as i32)
        .bind(record.picked_at)
        .bind(record.finished_at)
        .bind(record.requeued_at)
        .bind(record.status.as_str())
        .bind(record.duration)
        .bind(record.latency)
        .bind(Json(&record.failed_reason))
        .bind(Json(&record.run_history))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(Some(record))
    }

    async fn find_by_internal_id(
        &self,
        collection: &str,
        id: RecordId,
    ) -> Result<Option<JobRecord>> {
        self.ensure_table(collection, false).await?;
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM {collection} WHERE id = $1"))
            .bind(id.as_ulid().to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn find_by_identifier(
        &self,
        collection: &str,
        name: &str,
        identifier: &str,
    ) -> Result<Option<JobRecord>> {
        self.ensure_table(collection, false).await?;
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM {collection} WHERE name = $1 AND identifier = $2"
        ))
        .bind(name)
        .bind(identifier)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn insert_dead_letter(&self, collection: &str, record: &JobRecord) -> Result<()> {
        self.ensure_table(collection, true).await?;
        let mut builder = QueryBuilder::new(format!("INSERT INTO {collection} ({COLUMNS})"));
        push_values(&mut builder, record);
        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn list_dead_letters(
        &self,
        collection: &str,
        name: Option<&str>,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<JobRecord>> {
        self.ensure_table(collection, true).await?;
        let filter = JobFilter {
            name: name.map(str::to_string),
            ..JobFilter::default()
        };
        let mut builder = QueryBuilder::new(format!("SELECT {COLUMNS} FROM {collection}"));
        push_filter(&mut builder, &filter);
        builder.push(" ORDER BY dead_letter_id DESC");
        builder.push(" OFFSET ").push_bind(skip as i64);
        builder.push(" LIMIT ").push_bind(limit as i64);
        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn count_eligible(&self, collection: &str, filter: &JobFilter) -> Result<u64> {
        self.ensure_table(collection, false).await?;
        let mut builder = QueryBuilder::new(format!("SELECT COUNT(*) FROM {collection}"));
        push_filter(&mut builder, filter);
        let count: i64 = builder.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(count.max(0) as u64)
    }

    async fn paginate(
        &self,
        collection: &str,
        filter: &JobFilter,
        order: SortOrder,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<JobRecord>> {
        self.ensure_table(collection, false).await?;
        let mut builder = QueryBuilder::new(format!("SELECT {COLUMNS} FROM {collection}"));
        push_filter(&mut builder, filter);
        builder.push(order_sql(order));
        builder.push(" OFFSET ").push_bind(skip as i64);
        builder.push(" LIMIT ").push_bind(limit as i64);
        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(record_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_sql_binds_each_condition() {
        let filter = JobFilter::for_name("email")
            .created_since(Utc::now())
            .with_status(JobStatus::Done);
        let mut builder: QueryBuilder<'_, Postgres> = QueryBuilder::new("SELECT * FROM jobs");
        push_filter(&mut builder, &filter);

        assert_eq!(
            builder.sql(),
            "SELECT * FROM jobs WHERE TRUE AND name = $1 AND created_at >= $2 AND status = $3"
        );
    }

    #[test]
    fn unpicked_filter_is_literal() {
        let mut builder: QueryBuilder<'_, Postgres> = QueryBuilder::new("SELECT * FROM jobs");
        push_filter(&mut builder, &JobFilter::default().unpicked());

        assert!(builder.sql().ends_with("AND status = 'pending' AND picked_at IS NULL"));
    }

    #[test]
    fn identifiers_are_unique_per_name() {
        assert!(job_table_sql("pop_queues").contains("UNIQUE (name, identifier)"));
        assert!(!dead_letter_table_sql("dead_letter_queue").contains("UNIQUE"));
        assert!(UPSERT_CONFLICT.contains("ON CONFLICT (name, identifier)"));
        assert!(!UPSERT_CONFLICT.contains("name = EXCLUDED.name"));
    }

    #[test]
    fn order_is_stable_on_ties() {
        assert!(order_sql(SortOrder::Desc).ends_with("id DESC"));
        assert!(order_sql(SortOrder::Asc).ends_with("id ASC"));
    }
}
