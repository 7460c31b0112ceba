//! Scheduled maintenance for the warehouse, the job queue and the batch
//! store.
//!
//! Every task here repairs state the hot path deliberately leaves behind:
//! duplicate warehouse rows, finished queue jobs, leases held by dead
//! workers, raw payloads of long-completed batches and ingested batches
//! whose trigger message was lost. Each task is idempotent, so a crashed
//! run is simply retried on the next interval.

use std::str::FromStr;
use std::time::Instant;

use chrono::Utc;
use sqlx::postgres::PgPool;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use etl_common::batch::{self, BatchError};
use etl_common::pgqueue::{NewJob, PgQueue, PgQueueError, PipelineMessage};
use etl_common::schema;

use crate::config::JanitorSettings;

#[derive(Error, Debug)]
pub enum JanitorError {
    #[error("database operation failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("queue operation failed: {0}")]
    Queue(#[from] PgQueueError),
    #[error("batch store operation failed: {0}")]
    Batch(#[from] BatchError),
}

/// Which row of a duplicate group survives deduplication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupKeep {
    /// Keep the earliest row by ingestion order.
    First,
    /// Keep the latest row by ingestion order.
    Last,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseDedupKeepError;

impl FromStr for DedupKeep {
    type Err = ParseDedupKeepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first" => Ok(DedupKeep::First),
            "last" => Ok(DedupKeep::Last),
            _ => Err(ParseDedupKeepError),
        }
    }
}

/// Counters for one cleanup run. The janitor reports its own metrics; this
/// is mostly a test surface.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct CleanupResult {
    pub rows_deduplicated: u64,
    pub jobs_purged: u64,
    pub jobs_poisoned: u64,
    pub jobs_reset: u64,
    pub batches_archived: u64,
    pub batches_reenqueued: u64,
}

pub struct Janitor {
    pool: PgPool,
    queue: PgQueue,
    settings: JanitorSettings,
}

fn track_task(task: &'static str, start: Instant) {
    let labels = [("task", task)];
    metrics::histogram!("janitor_task_duration_seconds", &labels)
        .record(start.elapsed().as_secs_f64());
}

impl Janitor {
    pub fn new(pool: PgPool, settings: JanitorSettings) -> Self {
        let queue = PgQueue::new_from_pool(pool.clone());

        Self {
            pool,
            queue,
            settings,
        }
    }

    /// Run every cleanup task once, in order.
    pub async fn run_once(&self) -> Result<CleanupResult, JanitorError> {
        info!("starting cleanup run");
        metrics::counter!("janitor_cleanup_runs_total").increment(1);

        let start = Instant::now();
        let rows_deduplicated = self.dedup_warehouse().await?;
        track_task("dedup_warehouse", start);
        metrics::counter!("janitor_rows_deduplicated_total").increment(rows_deduplicated);

        let start = Instant::now();
        let jobs_purged = self.purge_finished_jobs().await?;
        track_task("purge_finished_jobs", start);
        metrics::counter!("janitor_jobs_purged_total").increment(jobs_purged);

        let start = Instant::now();
        let jobs_poisoned = self.fail_poison_pills().await?;
        track_task("fail_poison_pills", start);
        metrics::counter!("janitor_jobs_poisoned_total").increment(jobs_poisoned);

        let start = Instant::now();
        let jobs_reset = self.reset_stalled_jobs().await?;
        track_task("reset_stalled_jobs", start);
        metrics::counter!("janitor_jobs_reset_total").increment(jobs_reset);

        let start = Instant::now();
        let batches_archived = self.archive_batches().await?;
        track_task("archive_batches", start);
        metrics::counter!("janitor_batches_archived_total").increment(batches_archived);

        let start = Instant::now();
        let batches_reenqueued = self.reenqueue_lost_batches().await?;
        track_task("reenqueue_lost_batches", start);
        metrics::counter!("janitor_batches_reenqueued_total").increment(batches_reenqueued);

        if jobs_poisoned > 0 {
            warn!("failed {} stalled jobs with no attempts left", jobs_poisoned);
        }
        if jobs_reset > 0 {
            warn!("reset {} stalled jobs", jobs_reset);
        }

        let result = CleanupResult {
            rows_deduplicated,
            jobs_purged,
            jobs_poisoned,
            jobs_reset,
            batches_archived,
            batches_reenqueued,
        };
        info!(
            rows_deduplicated,
            jobs_purged,
            jobs_poisoned,
            jobs_reset,
            batches_archived,
            batches_reenqueued,
            "cleanup run complete"
        );

        Ok(result)
    }

    /// Delete duplicate warehouse rows, retaining one row per natural key
    /// according to the configured keep rule. Rows loaded together share an
    /// ingestion date, so the surrogate id breaks ties in load order.
    async fn dedup_warehouse(&self) -> Result<u64, JanitorError> {
        let order = match self.settings.dedup_keep {
            DedupKeep::First => "ASC",
            DedupKeep::Last => "DESC",
        };

        // The key was validated against the schema allowlist at startup.
        let query = format!(
            r#"
WITH ranked AS (
    SELECT id, ROW_NUMBER() OVER (
        PARTITION BY {key}
        ORDER BY ingestion_date {order}, id {order}
    ) AS keep_rank
    FROM {table}
)
DELETE FROM {table}
WHERE id IN (SELECT id FROM ranked WHERE keep_rank > 1)
            "#,
            key = self.settings.dedup_key,
            order = order,
            table = schema::WAREHOUSE_TABLE,
        );

        let result = sqlx::query(&query).execute(&self.pool).await?;

        Ok(result.rows_affected())
    }

    /// Delete completed and failed jobs older than the retention window.
    async fn purge_finished_jobs(&self) -> Result<u64, JanitorError> {
        let cutoff = Utc::now() - self.settings.job_retention;

        let result = sqlx::query(
            r#"
DELETE FROM pipeline_jobs
WHERE status IN ('completed'::job_status, 'failed'::job_status)
  AND finished_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Fail stalled jobs that already consumed every attempt and quarantine
    /// their batches. Handing these back to the queue would let a batch that
    /// kills workers circulate forever.
    async fn fail_poison_pills(&self) -> Result<u64, JanitorError> {
        let cutoff = Utc::now() - self.settings.stall_timeout;

        let batch_ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
WITH stalled AS (
    SELECT id FROM pipeline_jobs
    WHERE status = 'running'::job_status
      AND started_at <= $1
      AND attempt >= max_attempts
    FOR UPDATE SKIP LOCKED
)
UPDATE pipeline_jobs
SET status = 'failed'::job_status,
    finished_at = NOW(),
    failure_reason = $2
FROM stalled
WHERE pipeline_jobs.id = stalled.id
RETURNING pipeline_jobs.batch_id
            "#,
        )
        .bind(cutoff)
        .bind("stalled with no attempts left")
        .fetch_all(&self.pool)
        .await?;

        for batch_id in &batch_ids {
            batch::quarantine(&self.pool, *batch_id, "batch processing stalled with no attempts left")
                .await?;
        }

        Ok(batch_ids.len() as u64)
    }

    /// Hand stalled running jobs back to the queue. A worker that died
    /// holding a lease becomes indistinguishable from a transient failure
    /// once its job is available again.
    async fn reset_stalled_jobs(&self) -> Result<u64, JanitorError> {
        let cutoff = Utc::now() - self.settings.stall_timeout;

        let result = sqlx::query(
            r#"
WITH stalled AS (
    SELECT id FROM pipeline_jobs
    WHERE status = 'running'::job_status
      AND started_at <= $1
      AND attempt < max_attempts
    FOR UPDATE SKIP LOCKED
)
UPDATE pipeline_jobs
SET status = 'available'::job_status,
    started_at = NULL,
    scheduled_at = NOW()
FROM stalled
WHERE pipeline_jobs.id = stalled.id
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Archive completed batches past the retention window: the status
    /// flips to `archived` and the raw payload is deleted. Batch metadata
    /// and counters are retained.
    async fn archive_batches(&self) -> Result<u64, JanitorError> {
        let cutoff = Utc::now() - self.settings.archive_age;

        let mut tx = self.pool.begin().await?;

        let archived: Vec<Uuid> = sqlx::query_scalar(
            r#"
UPDATE batches
SET status = 'archived'::batch_status
WHERE status = 'complete'::batch_status
  AND completed_at < $1
RETURNING id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM raw_records WHERE batch_id = ANY($1)")
            .bind(&archived)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(archived.len() as u64)
    }

    /// Enqueue a fresh job for ingested batches that have none. The grace
    /// period keeps this from racing an ingest whose publish is still in
    /// flight.
    // TODO: sweep batches stuck mid-pipeline with no live job
    async fn reenqueue_lost_batches(&self) -> Result<u64, JanitorError> {
        let cutoff = Utc::now() - self.settings.reenqueue_grace;

        let lost: Vec<(Uuid, String, i32)> = sqlx::query_as(
            r#"
SELECT id, handle, record_count
FROM batches
WHERE status = 'ingested'::batch_status
  AND created_at < $1
  AND NOT EXISTS (
      SELECT 1 FROM pipeline_jobs
      WHERE pipeline_jobs.batch_id = batches.id
        AND pipeline_jobs.status IN ('available'::job_status, 'running'::job_status)
  )
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        let count = lost.len() as u64;

        for (batch_id, batch_handle, record_count) in lost {
            info!("re-enqueueing batch {} with no live job", batch_id);

            let message = PipelineMessage {
                batch_id,
                batch_handle,
                record_count,
            };
            self.queue
                .enqueue(NewJob::new(message, self.settings.max_attempts))
                .await?;
        }

        Ok(count)
    }
}
