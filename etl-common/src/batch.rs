//! The durable batch store.
//!
//! Every ingested batch is persisted here before a trigger message is
//! published, so a redelivered or retried message can always re-read the
//! exact payload that was accepted. Rows in `batches` also carry the batch
//! lifecycle status, which is what makes short-circuiting of redeliveries
//! possible: a batch in a terminal status is never processed again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("database operation failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("batch {0} does not exist")]
    NotFound(Uuid),
}

/// Lifecycle status of a batch.
///
/// `Complete`, `Quarantined` and `Archived` are terminal: once a batch
/// reaches one of them its status only changes through janitor archival.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "batch_status")]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Ingested,
    Validating,
    Transforming,
    Loading,
    Complete,
    Quarantined,
    Archived,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Complete | BatchStatus::Quarantined | BatchStatus::Archived
        )
    }
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct Batch {
    pub id: Uuid,
    pub handle: String,
    pub source: String,
    pub record_count: i32,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub valid_count: Option<i32>,
    pub invalid_count: Option<i32>,
    pub inserted_count: Option<i32>,
    pub updated_count: Option<i32>,
    pub skipped_count: Option<i32>,
}

/// One raw record of a batch, exactly as accepted at ingest.
#[derive(Debug, sqlx::FromRow)]
pub struct RawRecord {
    pub seq: i32,
    pub body: serde_json::Value,
}

/// A record the validator refused, kept for inspection and replay.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Rejection {
    pub seq: i32,
    pub reason: String,
    pub body: serde_json::Value,
}

/// Persist a new batch and its raw records in one transaction, in `Ingested`
/// status. The returned batch carries the generated storage handle that the
/// trigger message will reference.
pub async fn create(
    pool: &PgPool,
    source: &str,
    records: &[serde_json::Value],
) -> Result<Batch, BatchError> {
    let id = Uuid::now_v7();
    let handle = format!(
        "raw/sales_data_{}_{}.json",
        Utc::now().format("%Y%m%d_%H%M%S"),
        id.simple()
    );

    let mut tx = pool.begin().await?;

    let batch: Batch = sqlx::query_as(
        r#"
INSERT INTO batches (id, handle, source, record_count, status)
VALUES ($1, $2, $3, $4, 'ingested'::batch_status)
RETURNING *
        "#,
    )
    .bind(id)
    .bind(&handle)
    .bind(source)
    .bind(records.len() as i32)
    .fetch_one(&mut *tx)
    .await?;

    for (seq, body) in records.iter().enumerate() {
        sqlx::query("INSERT INTO raw_records (batch_id, seq, body) VALUES ($1, $2, $3)")
            .bind(id)
            .bind(seq as i32)
            .bind(body)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;

    Ok(batch)
}

/// Fetch a batch by id.
pub async fn get<'c, E>(executor: E, id: Uuid) -> Result<Batch, BatchError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let batch: Option<Batch> = sqlx::query_as("SELECT * FROM batches WHERE id = $1")
        .bind(id)
        .fetch_optional(executor)
        .await?;

    batch.ok_or(BatchError::NotFound(id))
}

/// Fetch the raw records of a batch in their original order.
pub async fn raw_records<'c, E>(executor: E, id: Uuid) -> Result<Vec<RawRecord>, BatchError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let records = sqlx::query_as("SELECT seq, body FROM raw_records WHERE batch_id = $1 ORDER BY seq")
        .bind(id)
        .fetch_all(executor)
        .await?;

    Ok(records)
}

/// Move a batch to `to`, unless it already reached a terminal status.
///
/// Returns false when the batch was terminal (or missing), which callers
/// treat as the signal to short-circuit a redelivered message. Retried
/// attempts may move the status backwards (e.g. `Loading` back to
/// `Validating`); stages are recomputed from the raw records every attempt.
pub async fn advance_status<'c, E>(
    executor: E,
    id: Uuid,
    to: BatchStatus,
) -> Result<bool, BatchError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let result = sqlx::query(
        r#"
UPDATE batches
SET status = $2
WHERE id = $1
  AND status NOT IN ('complete'::batch_status, 'quarantined'::batch_status, 'archived'::batch_status)
        "#,
    )
    .bind(id)
    .bind(to)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Record the validation split of a batch.
pub async fn record_validation<'c, E>(
    executor: E,
    id: Uuid,
    valid_count: i32,
    invalid_count: i32,
) -> Result<(), BatchError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    sqlx::query("UPDATE batches SET valid_count = $2, invalid_count = $3 WHERE id = $1")
        .bind(id)
        .bind(valid_count)
        .bind(invalid_count)
        .execute(executor)
        .await?;

    Ok(())
}

/// Persist the records the validator refused. Tolerates redelivery: a
/// (batch, seq) pair already recorded is left untouched.
pub async fn reject_records(
    pool: &PgPool,
    id: Uuid,
    rejections: &[Rejection],
) -> Result<(), BatchError> {
    let mut tx = pool.begin().await?;

    for rejection in rejections {
        sqlx::query(
            r#"
INSERT INTO rejected_records (batch_id, seq, reason, body)
VALUES ($1, $2, $3, $4)
ON CONFLICT (batch_id, seq) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(rejection.seq)
        .bind(&rejection.reason)
        .bind(&rejection.body)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    Ok(())
}

/// The outcome of merging one batch into the warehouse. Every record of the
/// batch lands in exactly one counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadResult {
    pub inserted: i32,
    pub updated: i32,
    pub skipped: i32,
}

/// Mark a batch `Complete`, recording its load counters.
///
/// Guarded on `Loading` so it can run inside the same transaction as the
/// warehouse merge: if a concurrent attempt completed the batch first, this
/// returns false and the caller rolls its merge back, keeping the load
/// exactly-once in effect.
pub async fn complete_load<'c, E>(
    executor: E,
    id: Uuid,
    counts: &LoadResult,
) -> Result<bool, BatchError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let result = sqlx::query(
        r#"
UPDATE batches
SET status = 'complete'::batch_status,
    completed_at = NOW(),
    inserted_count = $2,
    updated_count = $3,
    skipped_count = $4
WHERE id = $1
  AND status = 'loading'::batch_status
        "#,
    )
    .bind(id)
    .bind(counts.inserted)
    .bind(counts.updated)
    .bind(counts.skipped)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Move a batch to `Quarantined` and record the reason.
///
/// Idempotent: re-quarantining keeps the first recorded reason. Returns
/// false if the batch already completed or was archived, in which case
/// nothing is written.
pub async fn quarantine(pool: &PgPool, id: Uuid, reason: &str) -> Result<bool, BatchError> {
    let mut tx = pool.begin().await?;

    let result = sqlx::query(
        r#"
UPDATE batches
SET status = 'quarantined'::batch_status
WHERE id = $1
  AND status NOT IN ('complete'::batch_status, 'archived'::batch_status)
        "#,
    )
    .bind(id)
    .execute(&mut *tx)
    .await?;

    if result.rows_affected() == 0 {
        return Ok(false);
    }

    sqlx::query(
        r#"
INSERT INTO quarantined_batches (batch_id, reason)
VALUES ($1, $2)
ON CONFLICT (batch_id) DO NOTHING
        "#,
    )
    .bind(id)
    .bind(reason)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(true)
}
