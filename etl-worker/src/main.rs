//! Consume `PgQueue` jobs to drive batches through the pipeline.
use std::future::ready;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;

use config::Config;
use error::WorkerError;
use etl_common::database;
use etl_common::health::HealthRegistry;
use etl_common::{
    metrics::serve, metrics::setup_metrics_routes, pgqueue::PgQueue, retry::RetryPolicy,
};
use report::{LogNotifier, Notifier, WebhookNotifier};
use worker::PipelineWorker;

mod config;
mod error;
mod load;
mod report;
mod transform;
mod validate;
mod worker;

async fn index() -> &'static str {
    "etl worker"
}

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("Invalid configuration:");
    let settings = config
        .pipeline
        .settings()
        .expect("invalid pipeline configuration");

    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness
        .register("worker".to_string(), time::Duration::seconds(60))
        .await;

    let retry_policy = RetryPolicy::new(
        config.retry_policy.backoff_coefficient,
        config.retry_policy.initial_interval.0,
        Some(config.retry_policy.maximum_interval.0),
    );
    let pool = database::get_pool(&config.database_url, config.max_pg_connections)
        .expect("failed to create database connection pool");
    let queue = PgQueue::new_from_pool(pool.clone());

    let notifier: Arc<dyn Notifier> = match &config.notification_webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(
            url.as_str(),
            config.notification_timeout.0,
        )),
        None => Arc::new(LogNotifier),
    };

    let worker = PipelineWorker::new(
        &config.worker_name,
        queue,
        pool,
        config.poll_interval.0,
        config.max_concurrent_jobs,
        retry_policy,
        settings,
        notifier,
        worker_liveness,
    );

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())));
    let router = setup_metrics_routes(router);
    let bind = config.bind();
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving liveness and metrics");
    });

    worker.run().await?;

    Ok(())
}
