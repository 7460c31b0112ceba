use axum::Router;
use cleanup::Janitor;
use config::Config;
use envconfig::Envconfig;
use eyre::Result;
use futures::future::{select, Either};
use tokio::sync::Semaphore;

use etl_common::database;
use etl_common::health::{HealthHandle, HealthRegistry};
use etl_common::metrics::setup_metrics_recorder;

mod cleanup;
mod config;
mod handlers;

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app).await?;

    Ok(())
}

async fn cleanup_loop(janitor: Janitor, liveness: HealthHandle, interval_secs: u64) {
    let semaphore = Semaphore::new(1);
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));

    loop {
        let _permit = semaphore.acquire().await;
        interval.tick().await;

        if let Err(error) = janitor.run_once().await {
            tracing::error!("cleanup run failed: {}", error);
        }
        liveness.report_healthy().await;

        drop(_permit);
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");
    let settings = config.settings().expect("invalid janitor configuration");

    let pool = database::get_pool(&config.database_url, config.max_pg_connections)
        .expect("failed to create database connection pool");
    let janitor = Janitor::new(pool, settings);

    let liveness = HealthRegistry::new("liveness");
    let cleanup_liveness = liveness
        .register(
            "cleanup_loop".to_string(),
            time::Duration::seconds((config.cleanup_interval_secs * 4) as i64),
        )
        .await;

    let cleanup_loop = Box::pin(cleanup_loop(
        janitor,
        cleanup_liveness,
        config.cleanup_interval_secs,
    ));

    let recorder_handle = setup_metrics_recorder();
    let app = handlers::app(liveness, Some(recorder_handle));
    let http_server = Box::pin(listen(app, config.bind()));

    match select(http_server, cleanup_loop).await {
        Either::Left((listen_result, _)) => match listen_result {
            Ok(_) => {}
            Err(e) => tracing::error!("failed to start etl-janitor http server, {}", e),
        },
        Either::Right((_, _)) => {
            tracing::error!("etl-janitor cleanup task exited")
        }
    };
}
