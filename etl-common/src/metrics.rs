//! Prometheus wiring shared by every process in the workspace.
//!
//! Each binary installs one global recorder, exposes it on `/metrics` and
//! wraps its routes with [`track_metrics`] so HTTP traffic is measured the
//! same way everywhere.

use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    routing::get, Router,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Histogram buckets sized for an ingest API that does bulk inserts: most
/// requests land under 100ms, batch posts can take whole seconds.
const LATENCY_BUCKETS: &[f64] = &[
    0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 15.0, 30.0,
];

/// Serve `router` on `bind` until the process exits or the listener fails.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, router).await
}

/// Install the prometheus recorder and expose it on `/metrics`, wrapping
/// every route already on `router` with request tracking. Call after all
/// service routes are added, layers only apply to routes added before them.
pub fn setup_metrics_routes(router: Router) -> Router {
    let handle = setup_metrics_recorder();

    router
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .layer(axum::middleware::from_fn(track_metrics))
}

/// Install the global prometheus recorder. Callers that do not go through
/// [`setup_metrics_routes`] render the returned handle themselves.
pub fn setup_metrics_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .set_buckets(LATENCY_BUCKETS)
        .expect("non-empty bucket list")
        .install_recorder()
        .expect("failed to install prometheus recorder")
}

/// Record a counter and a latency histogram per route, method and status.
///
/// Runs as a `from_fn` middleware so handlers stay free of metric calls;
/// the matched path pattern is used so per-id URLs collapse into one series.
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let method = req.method().to_string();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| req.uri().path().to_owned(), |m| m.as_str().to_owned());

    let start = Instant::now();
    let response = next.run(req).await;
    let elapsed = start.elapsed().as_secs_f64();

    let labels = [
        ("method", method),
        ("path", path),
        ("status", response.status().as_u16().to_string()),
    ];
    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels).record(elapsed);

    response
}
