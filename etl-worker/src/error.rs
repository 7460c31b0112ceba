use etl_common::batch::BatchError;
use etl_common::database;
use etl_common::pgqueue::PgQueueError;
use thiserror::Error;

/// Classification of a failed pipeline run.
///
/// The class decides what happens to the batch: `TransientInfra` is retried
/// with backoff until attempts run out, everything else quarantines the
/// batch immediately since re-running the same payload cannot succeed.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("transient infrastructure failure: {0}")]
    TransientInfra(#[source] sqlx::Error),
    #[error("data quality failure: {0}")]
    DataQuality(String),
    #[error("schema violation: {0}")]
    SchemaViolation(String),
    #[error("logic defect: {0}")]
    LogicDefect(String),
}

impl PipelineError {
    /// Stable label for metrics and logs.
    pub fn class(&self) -> &'static str {
        match self {
            PipelineError::TransientInfra(_) => "transient_infra",
            PipelineError::DataQuality(_) => "data_quality",
            PipelineError::SchemaViolation(_) => "schema_violation",
            PipelineError::LogicDefect(_) => "logic_defect",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::TransientInfra(_))
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(error: sqlx::Error) -> Self {
        if database::is_transient_error(&error) {
            PipelineError::TransientInfra(error)
        } else {
            // Non-transient database errors on our own statements are bugs,
            // not bad input.
            PipelineError::LogicDefect(error.to_string())
        }
    }
}

impl From<BatchError> for PipelineError {
    fn from(error: BatchError) -> Self {
        match error {
            BatchError::Database(error) => PipelineError::from(error),
            BatchError::NotFound(id) => {
                PipelineError::SchemaViolation(format!("batch {} is not in the batch store", id))
            }
        }
    }
}

/// Enumeration of errors that terminate the worker loop itself, as opposed to
/// failing a single batch.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("a queue error occurred: {0}")]
    QueueError(#[from] PgQueueError),
    #[error("a batch store error occurred while resolving a job: {0}")]
    BatchStoreError(#[from] BatchError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_transient_database_errors_are_retryable() {
        let error = PipelineError::from(sqlx::Error::PoolTimedOut);
        assert!(matches!(error, PipelineError::TransientInfra(_)));
        assert!(error.is_retryable());
        assert_eq!(error.class(), "transient_infra");
    }

    #[test]
    fn test_permanent_database_errors_are_defects() {
        let error = PipelineError::from(sqlx::Error::ColumnNotFound("revenue".to_owned()));
        assert!(matches!(error, PipelineError::LogicDefect(_)));
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_missing_batch_is_a_schema_violation() {
        let id = Uuid::now_v7();
        let error = PipelineError::from(BatchError::NotFound(id));
        assert!(matches!(error, PipelineError::SchemaViolation(_)));
        assert!(error.to_string().contains(&id.to_string()));
    }
}
