//! Health check endpoints
//!
//! `/health` answers while the process is up, `/ready` only when every
//! shard connection answers a ping, `/metrics` renders Prometheus text.

use crate::metrics::RouterMetrics;
use crate::shard::{ShardCluster, ShardStatus};
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub models: Vec<String>,
}

/// Readiness check response
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub shards_total: usize,
    pub shards_ready: usize,
    pub shards: Vec<ShardStatus>,
}

/// Application state for health endpoints
#[derive(Clone)]
pub struct AppState {
    pub cluster: Arc<ShardCluster>,
    pub metrics: Option<RouterMetrics>,
}

/// Create the health check router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Health endpoint - always returns 200 if process is running
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        models: state.cluster.model_names(),
    })
}

/// Readiness endpoint - 200 only if every shard answers; a fan-out needs them all
async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    let shard_state = state.cluster.health().await;

    let response = ReadyResponse {
        ready: shard_state.is_ready(),
        shards_total: shard_state.shard_count(),
        shards_ready: shard_state.ready_shards(),
        shards: shard_state.shards,
    };

    if response.ready {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

/// Metrics endpoint - returns Prometheus format metrics
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let body = state
        .metrics
        .as_ref()
        .map(RouterMetrics::render)
        .unwrap_or_default();

    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
}
