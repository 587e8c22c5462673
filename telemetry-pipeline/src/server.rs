use std::future::{ready, Future};
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{MatchedPath, State};
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use health::HealthRegistry;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tower_http::trace::TraceLayer;

use crate::orchestrator::Orchestrator;
use crate::stats::PipelineMetrics;

#[derive(Clone)]
pub struct AppState {
    pub liveness: HealthRegistry,
    pub orchestrator: Arc<Orchestrator>,
}

pub fn router(state: AppState, metrics: Option<PrometheusHandle>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/_readiness", get(readiness))
        .route("/_liveness", get(liveness))
        .route("/stats", get(stats))
        .route(
            "/metrics",
            get(move || match metrics {
                Some(ref recorder_handle) => ready(recorder_handle.render()),
                None => ready("no metrics recorder installed".to_owned()),
            }),
        )
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state)
}

pub async fn index() -> &'static str {
    "telemetry pipeline"
}

/// Ready while the shared producer is connected: after startup, before shutdown.
async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    if state.orchestrator.producer().is_connected() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

async fn liveness(State(state): State<AppState>) -> impl IntoResponse {
    state.liveness.get_status()
}

async fn stats(State(state): State<AppState>) -> Json<PipelineMetrics> {
    Json(state.orchestrator.metrics())
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    const BUCKETS_MS: &[f64] = &[
        1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(BUCKETS_MS)?
        .install_recorder()
}

/// Records request counts and latencies per route.
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = match req.extensions().get::<MatchedPath>() {
        Some(matched_path) => matched_path.as_str().to_owned(),
        None => req.uri().path().to_owned(),
    };
    let method = req.method().to_string();

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    metrics::counter!("http_requests_total", "method" => method.clone(), "path" => path.clone(), "status" => status.clone())
        .increment(1);
    metrics::histogram!("http_requests_duration_seconds", "method" => method, "path" => path, "status" => status)
        .record(latency);

    response
}

pub async fn serve<F>(router: Router, bind: &str, shutdown: F) -> Result<(), std::io::Error>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!("status server listening on {}", listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}
