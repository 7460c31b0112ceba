use axum::Router;
use config::Config;
use envconfig::Envconfig;
use eyre::Result;

use etl_common::database;
use etl_common::metrics::setup_metrics_routes;
use etl_common::pgqueue::PgQueue;

use handlers::AppState;

mod config;
mod handlers;
mod sample;

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app).await?;

    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let pool = database::get_pool(&config.database_url, config.max_pg_connections)
        .expect("failed to create database connection pool");
    let queue = PgQueue::new_from_pool(pool.clone());

    let max_attempts =
        i32::try_from(config.max_attempts).expect("MAX_ATTEMPTS does not fit in an i32");

    let state = AppState {
        pool,
        queue,
        max_attempts,
        max_sample_records: config.max_sample_records,
        default_source: config.default_source.clone(),
    };

    let app = handlers::add_routes(
        Router::new(),
        state,
        config.max_body_size,
        config.concurrency_limit,
    );
    let app = setup_metrics_routes(app);

    match listen(app, config.bind()).await {
        Ok(_) => {}
        Err(e) => tracing::error!("failed to start etl-api http server, {}", e),
    }
}
