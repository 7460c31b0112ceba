use std::time;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;
use uuid::Uuid;

/// Enumeration of errors for operations with PgQueue.
/// Errors can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum PgQueueError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("transition of job {job_id} to '{to}' matched no running row")]
    TransitionError { job_id: i64, to: &'static str },
}

/// Enumeration of errors returned when retrying a Job.
#[derive(Error, Debug)]
pub enum RetryError {
    #[error("retry is an invalid transition for a job that reached max_attempts")]
    RetryInvalidError { job: Job },
    #[error(transparent)]
    QueueError(#[from] PgQueueError),
}

/// Enumeration of possible statuses for a Job.
/// Available: A job that is waiting in the queue to be picked up by a worker.
/// Completed: A job that was successfully completed by a worker.
/// Failed: A job that was unsuccessfully completed by a worker.
/// Running: A job that was picked up by a worker and it's currently being run.
#[derive(Debug, PartialEq, Eq, Clone, Copy, sqlx::Type)]
#[sqlx(type_name = "job_status")]
#[sqlx(rename_all = "lowercase")]
pub enum JobStatus {
    Available,
    Completed,
    Failed,
    Running,
}

/// The unit handed from ingest to the pipeline workers. It references a
/// batch but never carries the payload, so redelivery stays cheap and the
/// records can be re-read from the batch store on every attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineMessage {
    pub batch_id: Uuid,
    pub batch_handle: String,
    pub record_count: i32,
}

/// A new pipeline job to be enqueued into a PgQueue.
#[derive(Debug)]
pub struct NewJob {
    pub message: PipelineMessage,
    pub max_attempts: i32,
}

impl NewJob {
    pub fn new(message: PipelineMessage, max_attempts: i32) -> Self {
        Self {
            message,
            max_attempts,
        }
    }
}

/// A dequeued pipeline job, leased to one worker by the dequeue query.
///
/// A Job resolves exactly once: `complete`, `fail` and `retry` all consume
/// it. The attempt counter was already incremented by the dequeue that
/// produced this value.
#[derive(Debug, sqlx::FromRow)]
pub struct Job {
    pub id: i64,
    pub batch_id: Uuid,
    pub batch_handle: String,
    pub record_count: i32,
    pub attempt: i32,
    pub attempted_by: Vec<String>,
    pub max_attempts: i32,
    pub status: JobStatus,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

impl Job {
    /// The message this job delivers, re-derived from its columns.
    pub fn message(&self) -> PipelineMessage {
        PipelineMessage {
            batch_id: self.batch_id,
            batch_handle: self.batch_handle.clone(),
            record_count: self.record_count,
        }
    }

    /// Returns whether this job has consumed all of its allowed attempts.
    pub fn is_gte_max_attempts(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Consume `Job` to mark it as completed.
    pub async fn complete(self, pool: &PgPool) -> Result<(), PgQueueError> {
        let base_query = r#"
UPDATE
    pipeline_jobs
SET
    finished_at = NOW(),
    status = 'completed'::job_status
WHERE
    id = $1
    AND status = 'running'::job_status
        "#;

        let result = sqlx::query(base_query)
            .bind(self.id)
            .execute(pool)
            .await
            .map_err(|error| PgQueueError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        if result.rows_affected() == 0 {
            return Err(PgQueueError::TransitionError {
                job_id: self.id,
                to: "completed",
            });
        }

        Ok(())
    }

    /// Consume `Job` to mark it as failed, recording the reason.
    pub async fn fail(self, reason: &str, pool: &PgPool) -> Result<(), PgQueueError> {
        let base_query = r#"
UPDATE
    pipeline_jobs
SET
    finished_at = NOW(),
    status = 'failed'::job_status,
    failure_reason = $2
WHERE
    id = $1
    AND status = 'running'::job_status
        "#;

        let result = sqlx::query(base_query)
            .bind(self.id)
            .bind(reason)
            .execute(pool)
            .await
            .map_err(|error| PgQueueError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        if result.rows_affected() == 0 {
            return Err(PgQueueError::TransitionError {
                job_id: self.id,
                to: "failed",
            });
        }

        Ok(())
    }

    /// Consume `Job` to hand it back to the queue, deliverable again after
    /// `interval`. The attempt counter is not reset.
    ///
    /// Retrying a job whose attempts are exhausted is refused: the job is
    /// handed back inside `RetryInvalidError` so the caller can fail it and
    /// quarantine its batch instead.
    pub async fn retry(
        self,
        reason: &str,
        interval: time::Duration,
        pool: &PgPool,
    ) -> Result<(), RetryError> {
        if self.is_gte_max_attempts() {
            return Err(RetryError::RetryInvalidError { job: self });
        }

        let scheduled_at = Utc::now() + chrono::Duration::milliseconds(interval.as_millis() as i64);

        let base_query = r#"
UPDATE
    pipeline_jobs
SET
    status = 'available'::job_status,
    scheduled_at = $2,
    failure_reason = $3
WHERE
    id = $1
    AND status = 'running'::job_status
        "#;

        let result = sqlx::query(base_query)
            .bind(self.id)
            .bind(scheduled_at)
            .bind(reason)
            .execute(pool)
            .await
            .map_err(|error| PgQueueError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        if result.rows_affected() == 0 {
            return Err(RetryError::QueueError(PgQueueError::TransitionError {
                job_id: self.id,
                to: "available",
            }));
        }

        Ok(())
    }
}

/// A queue of pipeline trigger messages implemented on top of the
/// `pipeline_jobs` PostgreSQL table.
#[derive(Clone)]
pub struct PgQueue {
    pool: PgPool,
}

pub type PgQueueResult<T> = std::result::Result<T, PgQueueError>;

impl PgQueue {
    /// Initialize a new PgQueue backed by a lazy connection pool.
    pub fn new(url: &str, max_connections: u32) -> PgQueueResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy(url)
            .map_err(|error| PgQueueError::ConnectionError { error })?;

        Ok(Self { pool })
    }

    /// Initialize a new PgQueue sharing an already constructed pool.
    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Enqueue a NewJob for immediate delivery.
    /// We take ownership of NewJob to enforce a specific NewJob is only enqueued once.
    pub async fn enqueue(&self, job: NewJob) -> PgQueueResult<()> {
        self.enqueue_at(job, Utc::now()).await
    }

    /// Enqueue a NewJob that only becomes deliverable after `delay`.
    pub async fn enqueue_in(&self, job: NewJob, delay: time::Duration) -> PgQueueResult<()> {
        let scheduled_at = Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
        self.enqueue_at(job, scheduled_at).await
    }

    async fn enqueue_at(&self, job: NewJob, scheduled_at: DateTime<Utc>) -> PgQueueResult<()> {
        let base_query = r#"
INSERT INTO pipeline_jobs
    (batch_id, batch_handle, record_count, max_attempts, status, scheduled_at)
VALUES
    ($1, $2, $3, $4, 'available'::job_status, $5)
        "#;

        sqlx::query(base_query)
            .bind(job.message.batch_id)
            .bind(&job.message.batch_handle)
            .bind(job.message.record_count)
            .bind(job.max_attempts)
            .bind(scheduled_at)
            .execute(&self.pool)
            .await
            .map_err(|error| PgQueueError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        Ok(())
    }

    /// Dequeue the oldest deliverable Job, if any.
    ///
    /// The dequeue is atomic across concurrent workers: the selected row is
    /// locked with SKIP LOCKED, moved to running and stamped with this
    /// worker's name in one statement.
    pub async fn dequeue(&self, attempted_by: &str) -> PgQueueResult<Option<Job>> {
        let base_query = r#"
WITH available_in_queue AS (
    SELECT
        id
    FROM
        pipeline_jobs
    WHERE
        status = 'available'::job_status
        AND scheduled_at <= NOW()
    ORDER BY
        scheduled_at,
        id
    LIMIT 1
    FOR UPDATE SKIP LOCKED
)
UPDATE
    pipeline_jobs
SET
    attempt = pipeline_jobs.attempt + 1,
    started_at = NOW(),
    status = 'running'::job_status,
    attempted_by = array_append(pipeline_jobs.attempted_by, $1)
FROM
    available_in_queue
WHERE
    pipeline_jobs.id = available_in_queue.id
RETURNING
    pipeline_jobs.*
        "#;

        let job: Option<Job> = sqlx::query_as(base_query)
            .bind(attempted_by)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| PgQueueError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> PipelineMessage {
        PipelineMessage {
            batch_id: Uuid::now_v7(),
            batch_handle: "raw/sales_data_20240612_120000_test.json".to_owned(),
            record_count: 10,
        }
    }

    async fn fetch_job(pool: &PgPool, id: i64) -> Job {
        sqlx::query_as("SELECT * FROM pipeline_jobs WHERE id = $1")
            .bind(id)
            .fetch_one(pool)
            .await
            .expect("failed to fetch job row")
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_can_enqueue_and_dequeue_job(db: PgPool) {
        let queue = PgQueue::new_from_pool(db);
        let message = message();

        queue
            .enqueue(NewJob::new(message.clone(), 3))
            .await
            .expect("failed to enqueue job");

        let job = queue
            .dequeue("worker_1")
            .await
            .expect("failed to dequeue job")
            .expect("no job was dequeued");

        assert_eq!(job.attempt, 1);
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.attempted_by, vec!["worker_1".to_owned()]);
        assert!(job.started_at.is_some());
        assert_eq!(job.finished_at, None);
        assert_eq!(job.message(), message);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_dequeue_returns_none_on_empty_queue(db: PgPool) {
        let queue = PgQueue::new_from_pool(db);

        let job = queue
            .dequeue("worker_1")
            .await
            .expect("failed to dequeue job");

        assert!(job.is_none());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_dequeue_skips_delayed_jobs(db: PgPool) {
        let queue = PgQueue::new_from_pool(db);

        queue
            .enqueue_in(NewJob::new(message(), 3), time::Duration::from_secs(3600))
            .await
            .expect("failed to enqueue job");

        let job = queue
            .dequeue("worker_1")
            .await
            .expect("failed to dequeue job");

        assert!(job.is_none());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_can_complete_job(db: PgPool) {
        let queue = PgQueue::new_from_pool(db.clone());

        queue
            .enqueue(NewJob::new(message(), 3))
            .await
            .expect("failed to enqueue job");
        let job = queue
            .dequeue("worker_1")
            .await
            .expect("failed to dequeue job")
            .expect("no job was dequeued");
        let job_id = job.id;

        job.complete(&db).await.expect("failed to complete job");

        let row = fetch_job(&db, job_id).await;
        assert_eq!(row.status, JobStatus::Completed);
        assert!(row.finished_at.is_some());

        let next = queue
            .dequeue("worker_1")
            .await
            .expect("failed to dequeue job");
        assert!(next.is_none());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_can_fail_job(db: PgPool) {
        let queue = PgQueue::new_from_pool(db.clone());

        queue
            .enqueue(NewJob::new(message(), 3))
            .await
            .expect("failed to enqueue job");
        let job = queue
            .dequeue("worker_1")
            .await
            .expect("failed to dequeue job")
            .expect("no job was dequeued");
        let job_id = job.id;

        job.fail("batch failed data quality checks", &db)
            .await
            .expect("failed to fail job");

        let row = fetch_job(&db, job_id).await;
        assert_eq!(row.status, JobStatus::Failed);
        assert_eq!(
            row.failure_reason.as_deref(),
            Some("batch failed data quality checks")
        );
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_can_retry_job_and_dequeue_again(db: PgPool) {
        let queue = PgQueue::new_from_pool(db.clone());

        queue
            .enqueue(NewJob::new(message(), 3))
            .await
            .expect("failed to enqueue job");
        let job = queue
            .dequeue("worker_1")
            .await
            .expect("failed to dequeue job")
            .expect("no job was dequeued");
        assert_eq!(job.attempt, 1);
        let job_id = job.id;

        job.retry("store unreachable", time::Duration::ZERO, &db)
            .await
            .expect("failed to retry job");

        let job = queue
            .dequeue("worker_2")
            .await
            .expect("failed to dequeue job")
            .expect("retried job was not dequeued");

        assert_eq!(job.id, job_id);
        assert_eq!(job.attempt, 2);
        assert_eq!(
            job.attempted_by,
            vec!["worker_1".to_owned(), "worker_2".to_owned()]
        );
        assert!(!job.is_gte_max_attempts());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_retry_with_exhausted_attempts_hands_the_job_back(db: PgPool) {
        let queue = PgQueue::new_from_pool(db.clone());

        queue
            .enqueue(NewJob::new(message(), 1))
            .await
            .expect("failed to enqueue job");
        let job = queue
            .dequeue("worker_1")
            .await
            .expect("failed to dequeue job")
            .expect("no job was dequeued");
        assert!(job.is_gte_max_attempts());
        let job_id = job.id;

        let job = match job
            .retry("store unreachable", time::Duration::ZERO, &db)
            .await
        {
            Err(RetryError::RetryInvalidError { job }) => job,
            other => panic!("expected RetryInvalidError, got {:?}", other),
        };

        // The returned job can still be resolved.
        job.fail("retries exhausted", &db)
            .await
            .expect("failed to fail job");

        let row = fetch_job(&db, job_id).await;
        assert_eq!(row.status, JobStatus::Failed);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_retry_delays_next_delivery(db: PgPool) {
        let queue = PgQueue::new_from_pool(db.clone());

        queue
            .enqueue(NewJob::new(message(), 3))
            .await
            .expect("failed to enqueue job");
        let job = queue
            .dequeue("worker_1")
            .await
            .expect("failed to dequeue job")
            .expect("no job was dequeued");

        job.retry("store unreachable", time::Duration::from_secs(3600), &db)
            .await
            .expect("failed to retry job");

        let job = queue
            .dequeue("worker_1")
            .await
            .expect("failed to dequeue job");
        assert!(job.is_none());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_transitions_require_a_running_job(db: PgPool) {
        let queue = PgQueue::new_from_pool(db.clone());

        queue
            .enqueue(NewJob::new(message(), 3))
            .await
            .expect("failed to enqueue job");
        let job = queue
            .dequeue("worker_1")
            .await
            .expect("failed to dequeue job")
            .expect("no job was dequeued");

        // Simulate an out-of-band transition, e.g. a janitor reset.
        sqlx::query("UPDATE pipeline_jobs SET status = 'available'::job_status WHERE id = $1")
            .bind(job.id)
            .execute(&db)
            .await
            .expect("failed to update job row");

        let result = job.complete(&db).await;
        assert!(matches!(
            result,
            Err(PgQueueError::TransitionError {
                to: "completed",
                ..
            })
        ));
    }
}
