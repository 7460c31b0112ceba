use std::time::Instant;

use axum::{extract::State, http::StatusCode, Json};
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use tracing::{debug, error};
use uuid::Uuid;

use etl_common::batch::{self, BatchStatus};
use etl_common::pgqueue::{NewJob, PgQueue, PipelineMessage};

use crate::sample;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub queue: PgQueue,
    pub max_attempts: i32,
    pub max_sample_records: usize,
    pub default_source: String,
}

/// The body of a request made to ingest a batch. Callers either send their
/// own records or ask for generated sample data.
#[derive(Deserialize, Serialize, Debug, Default, PartialEq, Clone)]
pub struct BatchPostRequestBody {
    #[serde(default)]
    records: Vec<Value>,

    #[serde(default)]
    use_sample_data: bool,

    #[serde(default = "default_sample_record_count")]
    record_count: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<String>,
}

fn default_sample_record_count() -> usize {
    10
}

#[derive(Serialize, Deserialize, Debug)]
pub struct BatchPostResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<Uuid>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_count: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<BatchStatus>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub async fn post_batch(
    State(state): State<AppState>,
    Json(payload): Json<BatchPostRequestBody>,
) -> Result<Json<BatchPostResponse>, (StatusCode, Json<BatchPostResponse>)> {
    debug!("received payload: {:?}", payload);

    let records = if payload.use_sample_data {
        sample::generate_records(payload.record_count.min(state.max_sample_records))
    } else {
        payload.records
    };

    if records.is_empty() {
        return Err(bad_request("batch contains no records"));
    }

    let source = payload
        .source
        .unwrap_or_else(|| state.default_source.clone());

    // Persist first, publish second. Once the batch row and its raw records
    // are committed the ingest has happened, whatever the queue says next.
    let batch = batch::create(&state.pool, &source, &records)
        .await
        .map_err(internal_error)?;

    metrics::counter!("batches_ingested_total").increment(1);
    metrics::counter!("records_ingested_total").increment(records.len() as u64);

    let job = NewJob::new(
        PipelineMessage {
            batch_id: batch.id,
            batch_handle: batch.handle.clone(),
            record_count: batch.record_count,
        },
        state.max_attempts,
    );

    let start_time = Instant::now();

    if let Err(err) = state.queue.enqueue(job).await {
        // The batch stays ingested; the janitor re-enqueue sweep will pick
        // it up once the queue is reachable again.
        error!("failed to enqueue load job for batch {}: {}", batch.id, err);
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(BatchPostResponse {
                batch_id: Some(batch.id),
                record_count: Some(batch.record_count),
                status: Some(batch.status),
                error: Some("batch stored, but scheduling its load job failed".to_owned()),
            }),
        ));
    }

    let elapsed_time = start_time.elapsed().as_secs_f64();
    metrics::histogram!("batch_api_ingest_duration_seconds").record(elapsed_time);

    Ok(Json(BatchPostResponse {
        batch_id: Some(batch.id),
        record_count: Some(batch.record_count),
        status: Some(batch.status),
        error: None,
    }))
}

fn bad_request(msg: &str) -> (StatusCode, Json<BatchPostResponse>) {
    error!(msg);
    (
        StatusCode::BAD_REQUEST,
        Json(BatchPostResponse {
            batch_id: None,
            record_count: None,
            status: None,
            error: Some(msg.to_owned()),
        }),
    )
}

fn internal_error<E>(err: E) -> (StatusCode, Json<BatchPostResponse>)
where
    E: std::error::Error,
{
    error!("internal error: {}", err);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(BatchPostResponse {
            batch_id: None,
            record_count: None,
            status: None,
            error: Some(err.to_string()),
        }),
    )
}
