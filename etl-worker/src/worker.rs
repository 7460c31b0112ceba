//! The pipeline worker: polls the job queue and drives each batch through
//! validation, transformation and load.

use std::sync::Arc;
use std::time;

use chrono::NaiveDate;
use sqlx::PgPool;
use tokio::sync;
use tracing::{error, info, warn};

use etl_common::batch::{self, BatchStatus};
use etl_common::health::HealthHandle;
use etl_common::pgqueue::{Job, PgQueue, RetryError};
use etl_common::retry::RetryPolicy;

use crate::config::PipelineSettings;
use crate::error::{PipelineError, WorkerError};
use crate::load;
use crate::report::{self, LoadNotification, Notifier};
use crate::transform;
use crate::validate;

/// What processing a job amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// The batch was loaded and the job completed.
    Completed,
    /// The batch was already settled; the job completed without writing.
    ShortCircuited,
    /// A transient failure; the job went back to the queue.
    Retried,
    /// The batch was quarantined and the job failed.
    Quarantined,
}

/// A worker to poll `PgQueue` and spawn tasks to process batches when a job
/// becomes available.
pub struct PipelineWorker {
    /// An identifier for this worker. Used to mark jobs we have consumed.
    name: String,
    /// The queue we will be dequeuing jobs from.
    queue: PgQueue,
    /// The warehouse pool shared by every processing task.
    pool: PgPool,
    /// The interval for polling the queue.
    poll_interval: time::Duration,
    /// Maximum number of concurrent jobs being processed.
    max_concurrent_jobs: usize,
    /// The retry policy used to calculate retry intervals when a job fails
    /// with a transient error.
    retry_policy: RetryPolicy,
    /// Validated merge settings, shared by every job this worker processes.
    settings: PipelineSettings,
    /// Where completed-load notifications go.
    notifier: Arc<dyn Notifier>,
    /// The liveness check handle, to call on a schedule to report healthy.
    liveness: HealthHandle,
}

impl PipelineWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        queue: PgQueue,
        pool: PgPool,
        poll_interval: time::Duration,
        max_concurrent_jobs: usize,
        retry_policy: RetryPolicy,
        settings: PipelineSettings,
        notifier: Arc<dyn Notifier>,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            name: name.to_owned(),
            queue,
            pool,
            poll_interval,
            max_concurrent_jobs,
            retry_policy,
            settings,
            notifier,
            liveness,
        }
    }

    /// Wait until a job becomes available in our queue.
    async fn wait_for_job(&self) -> Result<Job, WorkerError> {
        let mut interval = tokio::time::interval(self.poll_interval);

        loop {
            interval.tick().await;
            self.liveness.report_healthy().await;

            if let Some(job) = self.queue.dequeue(&self.name).await? {
                metrics::counter!("pipeline_jobs_dequeued_total").increment(1);
                return Ok(job);
            }
        }
    }

    /// Run this worker to continuously process any jobs that become available.
    pub async fn run(&self) -> Result<(), WorkerError> {
        let semaphore = Arc::new(sync::Semaphore::new(self.max_concurrent_jobs));
        let report_semaphore_utilization = || {
            metrics::gauge!("pipeline_worker_saturation_percent")
                .set(1f64 - semaphore.available_permits() as f64 / self.max_concurrent_jobs as f64);
        };

        loop {
            report_semaphore_utilization();
            let job = self.wait_for_job().await?;
            self.spawn_processing_task(semaphore.clone(), job).await;
        }
    }

    /// Spawn a Tokio task to process a job once we successfully acquire a
    /// permit.
    async fn spawn_processing_task(
        &self,
        semaphore: Arc<sync::Semaphore>,
        job: Job,
    ) -> tokio::task::JoinHandle<Result<JobOutcome, WorkerError>> {
        let permit = semaphore
            .acquire_owned()
            .await
            .expect("semaphore has been closed");

        let pool = self.pool.clone();
        let retry_policy = self.retry_policy;
        let settings = self.settings.clone();
        let notifier = self.notifier.clone();

        tokio::spawn(async move {
            let result = process_job(&pool, job, &retry_policy, &settings, &*notifier).await;
            drop(permit);
            match result {
                Ok(outcome) => Ok(outcome),
                Err(error) => {
                    error!("failed to process batch job: {}", error);
                    Err(error)
                }
            }
        })
    }
}

/// The successful ways a pipeline run over one batch can end.
enum PipelineRun {
    /// The batch was already settled; nothing was written.
    ShortCircuit(BatchStatus),
    /// The batch loaded; these are the facts to report.
    Loaded {
        notification: LoadNotification,
        sale_dates: Vec<NaiveDate>,
    },
}

/// Process one batch job end to end.
///
/// The job completes when the batch either loads or short-circuits;
/// transient failures go back to the queue with backoff, everything else
/// quarantines the batch and fails the job.
async fn process_job(
    pool: &PgPool,
    job: Job,
    retry_policy: &RetryPolicy,
    settings: &PipelineSettings,
    notifier: &dyn Notifier,
) -> Result<JobOutcome, WorkerError> {
    let now = tokio::time::Instant::now();

    match run_pipeline(pool, &job, settings).await {
        Ok(PipelineRun::ShortCircuit(status)) => {
            let batch_id = job.message().batch_id;
            job.complete(pool).await?;

            metrics::counter!("pipeline_batches_short_circuited_total").increment(1);
            info!(
                batch_id = %batch_id,
                status = ?status,
                "batch already settled, nothing to do"
            );

            Ok(JobOutcome::ShortCircuited)
        }
        Ok(PipelineRun::Loaded {
            notification,
            sale_dates,
        }) => {
            job.complete(pool).await?;

            metrics::counter!("pipeline_batches_completed_total").increment(1);
            metrics::histogram!("load_batch_duration_seconds").record(now.elapsed().as_secs_f64());

            report_best_effort(pool, &notification, &sale_dates, settings, notifier).await;

            Ok(JobOutcome::Completed)
        }
        Err(error) => handle_failure(pool, job, error, retry_policy).await,
    }
}

/// Drive one batch through the pipeline stages.
///
/// All early exits are either a `ShortCircuit` (the batch is settled, write
/// nothing) or an error for `handle_failure` to route.
async fn run_pipeline(
    pool: &PgPool,
    job: &Job,
    settings: &PipelineSettings,
) -> Result<PipelineRun, PipelineError> {
    let message = job.message();

    let batch = batch::get(pool, message.batch_id).await?;

    if batch.status.is_terminal() {
        return Ok(PipelineRun::ShortCircuit(batch.status));
    }

    if batch.handle != message.batch_handle {
        return Err(PipelineError::SchemaViolation(format!(
            "batch {} is stored under handle '{}', not '{}'",
            batch.id, batch.handle, message.batch_handle
        )));
    }

    if let Some(status) = advance_or_settled(pool, batch.id, BatchStatus::Validating).await? {
        return Ok(PipelineRun::ShortCircuit(status));
    }

    let records = batch::raw_records(pool, batch.id).await?;
    if records.len() as i32 != batch.record_count {
        return Err(PipelineError::SchemaViolation(format!(
            "batch {} holds {} raw records, expected {}",
            batch.id,
            records.len(),
            batch.record_count
        )));
    }

    let validated = validate::validate_batch(&records);
    let valid_count = validated.candidates.len() as i32;
    let invalid_count = validated.rejected.len() as i32;

    metrics::counter!("records_validated_total", &[("outcome", "valid")])
        .increment(valid_count as u64);
    metrics::counter!("records_validated_total", &[("outcome", "invalid")])
        .increment(invalid_count as u64);

    // Rejections are persisted even when the whole batch ends up
    // quarantined: they are the evidence of why.
    if invalid_count > 0 {
        batch::reject_records(pool, batch.id, &validated.rejected).await?;
    }
    batch::record_validation(pool, batch.id, valid_count, invalid_count).await?;

    if valid_count == 0 {
        return Err(PipelineError::DataQuality(format!(
            "batch {} has no valid records out of {}",
            batch.id, batch.record_count
        )));
    }

    let valid_fraction = f64::from(valid_count) / f64::from(batch.record_count);
    if valid_fraction < settings.min_valid_fraction {
        return Err(PipelineError::DataQuality(format!(
            "batch {} kept only {} of {} records, below the configured floor of {}",
            batch.id, valid_count, batch.record_count, settings.min_valid_fraction
        )));
    }

    if let Some(status) = advance_or_settled(pool, batch.id, BatchStatus::Transforming).await? {
        return Ok(PipelineRun::ShortCircuit(status));
    }

    let canonical: Vec<_> = validated
        .candidates
        .into_iter()
        .map(|candidate| transform::transform(candidate, batch.created_at))
        .collect();

    let mut sale_dates: Vec<NaiveDate> = canonical.iter().map(|record| record.sale_date).collect();
    sale_dates.sort_unstable();
    sale_dates.dedup();

    if let Some(status) = advance_or_settled(pool, batch.id, BatchStatus::Loading).await? {
        return Ok(PipelineRun::ShortCircuit(status));
    }

    // The merge and the batch completion commit together: if a concurrent
    // delivery completed the batch first, our merge rolls back and the
    // warehouse sees this batch exactly once.
    let mut txn = pool.begin().await?;
    let result = load::apply(&mut txn, &canonical, settings).await?;
    let completed = batch::complete_load(&mut *txn, batch.id, &result).await?;
    if !completed {
        txn.rollback().await?;
        let settled = batch::get(pool, batch.id).await?;
        return Ok(PipelineRun::ShortCircuit(settled.status));
    }
    txn.commit().await?;

    metrics::counter!("records_loaded_total", &[("action", "inserted")])
        .increment(result.inserted as u64);
    metrics::counter!("records_loaded_total", &[("action", "updated")])
        .increment(result.updated as u64);
    metrics::counter!("records_loaded_total", &[("action", "skipped")])
        .increment(result.skipped as u64);
    info!(
        batch_id = %batch.id,
        inserted = result.inserted,
        updated = result.updated,
        skipped = result.skipped,
        "batch loaded into warehouse"
    );

    Ok(PipelineRun::Loaded {
        notification: LoadNotification {
            batch_id: batch.id,
            source: batch.source,
            record_count: batch.record_count,
            valid_count,
            invalid_count,
            inserted: result.inserted,
            updated: result.updated,
            skipped: result.skipped,
        },
        sale_dates,
    })
}

/// Advance the batch status, or report what it settled to if the transition
/// was refused.
async fn advance_or_settled(
    pool: &PgPool,
    id: uuid::Uuid,
    to: BatchStatus,
) -> Result<Option<BatchStatus>, PipelineError> {
    if batch::advance_status(pool, id, to).await? {
        Ok(None)
    } else {
        let batch = batch::get(pool, id).await?;
        Ok(Some(batch.status))
    }
}

/// Route a pipeline failure: transient errors retry with backoff until the
/// attempt bound, everything else quarantines the batch and fails the job.
async fn handle_failure(
    pool: &PgPool,
    job: Job,
    error: PipelineError,
    retry_policy: &RetryPolicy,
) -> Result<JobOutcome, WorkerError> {
    let batch_id = job.message().batch_id;
    let attempt = job.attempt;
    let reason = error.to_string();

    if error.is_retryable() {
        let interval = retry_policy.time_until_next_retry(attempt);

        return match job.retry(&reason, interval, pool).await {
            Ok(()) => {
                warn!(
                    batch_id = %batch_id,
                    attempt,
                    %reason,
                    "transient failure, batch will be retried"
                );
                metrics::counter!("pipeline_job_retries_total").increment(1);

                Ok(JobOutcome::Retried)
            }
            // Attempts are exhausted: the batch is treated as a poison pill.
            Err(RetryError::RetryInvalidError { job }) => {
                quarantine_and_fail(pool, job, &reason).await
            }
            Err(RetryError::QueueError(queue_error)) => Err(WorkerError::QueueError(queue_error)),
        };
    }

    if matches!(error, PipelineError::LogicDefect(_)) {
        error!(batch_id = %batch_id, %reason, "logic defect while processing batch");
    } else {
        warn!(batch_id = %batch_id, %reason, "batch cannot be processed, quarantining");
    }

    quarantine_and_fail(pool, job, &reason).await
}

async fn quarantine_and_fail(
    pool: &PgPool,
    job: Job,
    reason: &str,
) -> Result<JobOutcome, WorkerError> {
    let batch_id = job.message().batch_id;

    // False means the batch settled to complete or archived elsewhere, or
    // never existed; either way there is nothing to quarantine.
    if batch::quarantine(pool, batch_id, reason).await? {
        metrics::counter!("pipeline_batches_quarantined_total").increment(1);
    }

    job.fail(reason, pool).await?;

    Ok(JobOutcome::Quarantined)
}

/// The advisory reporting step after a committed load. Failures here are
/// logged and absorbed: the batch is already durable.
async fn report_best_effort(
    pool: &PgPool,
    notification: &LoadNotification,
    sale_dates: &[NaiveDate],
    settings: &PipelineSettings,
    notifier: &dyn Notifier,
) {
    if let Err(error) = report::refresh_summaries(pool, sale_dates).await {
        warn!(
            batch_id = %notification.batch_id,
            %error,
            "failed to refresh summary tables"
        );
    }

    match report::quality_checks(pool, &settings.unique_key).await {
        Ok(quality) => {
            if !quality.is_clean() {
                warn!(
                    batch_id = %notification.batch_id,
                    negative_prices = quality.negative_prices,
                    blank_keys = quality.blank_keys,
                    duplicate_keys = quality.duplicate_keys,
                    "warehouse quality checks found violations"
                );
                for (check, count) in [
                    ("negative_prices", quality.negative_prices),
                    ("blank_keys", quality.blank_keys),
                    ("duplicate_keys", quality.duplicate_keys),
                ] {
                    if count > 0 {
                        metrics::counter!("warehouse_quality_violations_total", &[("check", check)])
                            .increment(count as u64);
                    }
                }
            }
        }
        Err(error) => {
            warn!(
                batch_id = %notification.batch_id,
                %error,
                "failed to run warehouse quality checks"
            );
        }
    }

    let outcome = notifier.notify(notification).await;
    metrics::counter!("notifications_sent_total", &[("outcome", outcome.as_str())]).increment(1);
}
