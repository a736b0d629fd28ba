//! Durable record storage.
//!
//! The store owns the `outbox_record` rows. Scheduling inserts happen inside
//! the caller's business transaction ([`SqlxRecordStore::insert`]); the
//! dispatch side reads and updates through the pool. Correctness of the
//! unconditional updates rests on the partition/key discipline: partition
//! ownership is single-writer and the per-key guard serializes workers, so
//! no two writers ever race on the same row.

use async_trait::async_trait;
use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::error::{OutboxError, OutboxResult};
use crate::record::{OutboxRecord, RecordStatus};

pub mod memory;

pub use memory::InMemoryRecordStore;

/// Storage contract used by the delivery side of the engine.
///
/// The engine ships a Postgres implementation ([`SqlxRecordStore`]) and an
/// in-memory one ([`InMemoryRecordStore`]) for tests and embedding.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert or update a record (all mutable columns).
    async fn save(&self, record: &OutboxRecord) -> OutboxResult<()>;

    /// Distinct keys with at least one eligible `NEW` record in the given
    /// partitions, oldest first, at most `batch_size`.
    ///
    /// With `skip_keys_with_prior_failures` a key is excluded when any
    /// earlier record with the same key is still non-completed, which
    /// enforces strict per-key ordering in the presence of failures.
    async fn find_eligible_keys_in_partitions(
        &self,
        partitions: &[i32],
        batch_size: i64,
        skip_keys_with_prior_failures: bool,
    ) -> OutboxResult<Vec<String>>;

    /// All `NEW` records for a key, in creation order.
    async fn find_incomplete_records_by_key(&self, key: &str) -> OutboxResult<Vec<OutboxRecord>>;

    async fn count_by_status(&self, status: RecordStatus) -> OutboxResult<i64>;

    async fn count_by_partition(
        &self,
        partition: i32,
        status: RecordStatus,
    ) -> OutboxResult<i64>;

    /// `NEW`-record counts per partition, for the pending-records gauges.
    async fn pending_per_partition(&self, partitions: &[i32]) -> OutboxResult<Vec<(i32, i64)>>;

    async fn delete_by_id(&self, id: Uuid) -> OutboxResult<()>;

    async fn delete_by_status(&self, status: RecordStatus) -> OutboxResult<u64>;

    async fn delete_by_key_and_status(
        &self,
        key: &str,
        status: RecordStatus,
    ) -> OutboxResult<u64>;

    /// Reset `FAILED` records created at or after `since` back to `NEW`
    /// with cleared failure bookkeeping. Returns the number of records
    /// requeued.
    async fn replay_failed_since(&self, since: DateTime<Utc>) -> OutboxResult<u64>;

    /// Reset the `FAILED` records of one key back to `NEW`.
    async fn replay_failed_by_key(&self, key: &str) -> OutboxResult<u64>;
}

/// SQLx-based record store backed by PostgreSQL.
pub struct SqlxRecordStore {
    pool: PgPool,
}

impl SqlxRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert a freshly scheduled record inside the caller's transaction.
    ///
    /// This is the schedule-time write path: the record becomes durable if
    /// and only if the business transaction commits.
    pub async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        record: &OutboxRecord,
    ) -> OutboxResult<()> {
        let context = serde_json::to_value(&record.context)?;
        sqlx::query(
            r#"
            INSERT INTO outbox_record (
                id,
                status,
                record_key,
                record_type,
                payload,
                context,
                partition_no,
                created_at,
                completed_at,
                failure_count,
                failure_reason,
                next_retry_at,
                handler_id
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(record.id)
        .bind(record.status.as_str())
        .bind(&record.key)
        .bind(&record.record_type)
        .bind(&record.payload)
        .bind(&context)
        .bind(record.partition)
        .bind(record.created_at)
        .bind(record.completed_at)
        .bind(record.failure_count)
        .bind(&record.failure_reason)
        .bind(record.next_retry_at)
        .bind(&record.handler_id)
        .execute(&mut **tx)
        .await
        .context("Failed to insert record into outbox")?;

        debug!(
            record_id = %record.id,
            record_key = %record.key,
            handler_id = %record.handler_id,
            partition = record.partition,
            "Record inserted into outbox"
        );

        Ok(())
    }

    fn map_record(row: &sqlx::postgres::PgRow) -> anyhow::Result<OutboxRecord> {
        let status: String = row.try_get("status")?;
        let context: serde_json::Value = row.try_get("context")?;
        Ok(OutboxRecord {
            id: row.try_get("id")?,
            status: RecordStatus::from_db(&status)?,
            key: row.try_get("record_key")?,
            record_type: row.try_get("record_type")?,
            payload: row.try_get("payload")?,
            context: serde_json::from_value(context)?,
            partition: row.try_get("partition_no")?,
            created_at: row.try_get("created_at")?,
            completed_at: row.try_get("completed_at")?,
            failure_count: row.try_get("failure_count")?,
            failure_reason: row.try_get("failure_reason")?,
            next_retry_at: row.try_get("next_retry_at")?,
            handler_id: row.try_get("handler_id")?,
        })
    }
}

#[async_trait]
impl RecordStore for SqlxRecordStore {
    async fn save(&self, record: &OutboxRecord) -> OutboxResult<()> {
        let context = serde_json::to_value(&record.context)?;
        sqlx::query(
            r#"
            INSERT INTO outbox_record (
                id,
                status,
                record_key,
                record_type,
                payload,
                context,
                partition_no,
                created_at,
                completed_at,
                failure_count,
                failure_reason,
                next_retry_at,
                handler_id
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                completed_at = EXCLUDED.completed_at,
                failure_count = EXCLUDED.failure_count,
                failure_reason = EXCLUDED.failure_reason,
                next_retry_at = EXCLUDED.next_retry_at
            "#,
        )
        .bind(record.id)
        .bind(record.status.as_str())
        .bind(&record.key)
        .bind(&record.record_type)
        .bind(&record.payload)
        .bind(&context)
        .bind(record.partition)
        .bind(record.created_at)
        .bind(record.completed_at)
        .bind(record.failure_count)
        .bind(&record.failure_reason)
        .bind(record.next_retry_at)
        .bind(&record.handler_id)
        .execute(&self.pool)
        .await
        .context("Failed to save outbox record")?;

        Ok(())
    }

    async fn find_eligible_keys_in_partitions(
        &self,
        partitions: &[i32],
        batch_size: i64,
        skip_keys_with_prior_failures: bool,
    ) -> OutboxResult<Vec<String>> {
        if partitions.is_empty() {
            return Ok(Vec::new());
        }

        let query = if skip_keys_with_prior_failures {
            r#"
            SELECT r.record_key
            FROM outbox_record r
            WHERE r.partition_no = ANY($1)
              AND r.status = 'NEW'
              AND r.next_retry_at <= NOW()
              AND NOT EXISTS (
                  SELECT 1
                  FROM outbox_record prior
                  WHERE prior.record_key = r.record_key
                    AND prior.created_at < r.created_at
                    AND prior.status <> 'COMPLETED'
              )
            GROUP BY r.record_key
            ORDER BY MIN(r.created_at) ASC
            LIMIT $2
            "#
        } else {
            r#"
            SELECT r.record_key
            FROM outbox_record r
            WHERE r.partition_no = ANY($1)
              AND r.status = 'NEW'
              AND r.next_retry_at <= NOW()
            GROUP BY r.record_key
            ORDER BY MIN(r.created_at) ASC
            LIMIT $2
            "#
        };

        let rows = sqlx::query(query)
            .bind(partitions)
            .bind(batch_size)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch eligible keys")?;

        let keys = rows
            .into_iter()
            .map(|row| row.try_get("record_key"))
            .collect::<Result<Vec<String>, sqlx::Error>>()
            .context("Failed to parse eligible keys")?;

        debug!(count = keys.len(), "Fetched eligible keys");

        Ok(keys)
    }

    async fn find_incomplete_records_by_key(&self, key: &str) -> OutboxResult<Vec<OutboxRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT
                id,
                status,
                record_key,
                record_type,
                payload,
                context,
                partition_no,
                created_at,
                completed_at,
                failure_count,
                failure_reason,
                next_retry_at,
                handler_id
            FROM outbox_record
            WHERE record_key = $1 AND status = 'NEW'
            ORDER BY created_at ASC
            "#,
        )
        .bind(key)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch incomplete records")?;

        let records = rows
            .iter()
            .map(Self::map_record)
            .collect::<anyhow::Result<Vec<_>>>()
            .context("Failed to parse outbox records")?;

        Ok(records)
    }

    async fn count_by_status(&self, status: RecordStatus) -> OutboxResult<i64> {
        let row = sqlx::query(
            r#"SELECT COUNT(*)::BIGINT AS count FROM outbox_record WHERE status = $1"#,
        )
        .bind(status.as_str())
        .fetch_one(&self.pool)
        .await
        .context("Failed to count records by status")?;

        Ok(row.try_get("count").unwrap_or(0))
    }

    async fn count_by_partition(
        &self,
        partition: i32,
        status: RecordStatus,
    ) -> OutboxResult<i64> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*)::BIGINT AS count
            FROM outbox_record
            WHERE partition_no = $1 AND status = $2
            "#,
        )
        .bind(partition)
        .bind(status.as_str())
        .fetch_one(&self.pool)
        .await
        .context("Failed to count records by partition")?;

        Ok(row.try_get("count").unwrap_or(0))
    }

    async fn pending_per_partition(&self, partitions: &[i32]) -> OutboxResult<Vec<(i32, i64)>> {
        if partitions.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT partition_no, COUNT(*)::BIGINT AS pending
            FROM outbox_record
            WHERE partition_no = ANY($1) AND status = 'NEW'
            GROUP BY partition_no
            "#,
        )
        .bind(partitions)
        .fetch_all(&self.pool)
        .await
        .context("Failed to compute pending counts")?;

        rows.into_iter()
            .map(|row| {
                Ok((
                    row.try_get::<i32, _>("partition_no")?,
                    row.try_get::<i64, _>("pending")?,
                ))
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(OutboxError::from)
    }

    async fn delete_by_id(&self, id: Uuid) -> OutboxResult<()> {
        let result = sqlx::query(r#"DELETE FROM outbox_record WHERE id = $1"#)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to delete record")?;

        if result.rows_affected() == 0 {
            return Err(OutboxError::RecordNotFound(id));
        }

        Ok(())
    }

    async fn delete_by_status(&self, status: RecordStatus) -> OutboxResult<u64> {
        let result = sqlx::query(r#"DELETE FROM outbox_record WHERE status = $1"#)
            .bind(status.as_str())
            .execute(&self.pool)
            .await
            .context("Failed to delete records by status")?;

        Ok(result.rows_affected())
    }

    async fn delete_by_key_and_status(
        &self,
        key: &str,
        status: RecordStatus,
    ) -> OutboxResult<u64> {
        let result =
            sqlx::query(r#"DELETE FROM outbox_record WHERE record_key = $1 AND status = $2"#)
                .bind(key)
                .bind(status.as_str())
                .execute(&self.pool)
                .await
                .context("Failed to delete records by key and status")?;

        Ok(result.rows_affected())
    }

    async fn replay_failed_since(&self, since: DateTime<Utc>) -> OutboxResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_record
            SET status = 'NEW',
                failure_count = 0,
                failure_reason = NULL,
                next_retry_at = NOW()
            WHERE status = 'FAILED' AND created_at >= $1
            "#,
        )
        .bind(since)
        .execute(&self.pool)
        .await
        .context("Failed to replay failed records")?;

        Ok(result.rows_affected())
    }

    async fn replay_failed_by_key(&self, key: &str) -> OutboxResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_record
            SET status = 'NEW',
                failure_count = 0,
                failure_reason = NULL,
                next_retry_at = NOW()
            WHERE status = 'FAILED' AND record_key = $1
            "#,
        )
        .bind(key)
        .execute(&self.pool)
        .await
        .context("Failed to replay failed records for key")?;

        Ok(result.rows_affected())
    }
}
