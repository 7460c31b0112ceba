use std::convert::Infallible;

use axum::{extract::DefaultBodyLimit, routing, Router};
use tower::limit::ConcurrencyLimitLayer;

use super::batch::{self, AppState};

pub fn add_routes(
    router: Router,
    state: AppState,
    max_body_size: usize,
    concurrency_limit: usize,
) -> Router {
    router
        .route("/", routing::get(index))
        .route("/_readiness", routing::get(index))
        .route("/_liveness", routing::get(index)) // No async loop for now, just check axum health
        .route(
            "/batch",
            routing::post(batch::post_batch)
                .with_state(state)
                .layer::<_, Infallible>(ConcurrencyLimitLayer::new(concurrency_limit))
                .layer(DefaultBodyLimit::max(max_body_size)),
        )
}

pub async fn index() -> &'static str {
    "etl ingest api"
}
