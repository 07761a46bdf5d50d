//! HTTP surface: health and metrics, stage SSE streams, session stop, and
//! the task queue endpoints.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::service::PipelineService;

pub mod pipeline;
pub mod tasks;

use pipeline::{
    get_session_handler, list_processes_handler, run_stage_handler, stop_session_handler,
};
use tasks::{enqueue_task_handler, revoke_task_handler, task_status_handler};

/// Application state
pub struct AppState {
    pub service: Arc<PipelineService>,
    pub metrics: Option<PrometheusHandle>,
    pub start_time: Instant,
}

/// Build the API router
pub fn router(service: Arc<PipelineService>, metrics: Option<PrometheusHandle>) -> Router {
    let state = Arc::new(AppState {
        service,
        metrics,
        start_time: Instant::now(),
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/sessions/{session_id}", get(get_session_handler))
        .route(
            "/sessions/{session_id}/run/{stage}",
            get(run_stage_handler),
        )
        .route("/sessions/{session_id}/stop", post(stop_session_handler))
        .route("/processes", get(list_processes_handler))
        .route("/tasks", post(enqueue_task_handler))
        .route("/tasks/{task_id}", get(task_status_handler))
        .route("/tasks/{task_id}/revoke", post(revoke_task_handler));

    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .nest("/api", api_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// === Health & Metrics ===

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        queue_workers: state.service.config.queue.workers,
    })
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    uptime_seconds: u64,
    queue_workers: usize,
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = state
        .metrics
        .as_ref()
        .map(|handle| handle.render())
        .unwrap_or_default();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}
