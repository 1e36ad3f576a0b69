//! Health check endpoints

use crate::metrics::GatewayMetrics;
use crate::shard::ShardState;
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
}

/// Per-shard line of the readiness response
#[derive(Debug, Serialize)]
pub struct ShardReport {
    pub shard_id: u32,
    pub status: &'static str,
    pub session_state: &'static str,
    pub sequence: Option<u64>,
    pub reconnects: u64,
    pub heartbeat_latency_ms: Option<u64>,
}

/// Readiness check response
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub total_shards: u32,
    pub shards_ready: usize,
    pub shards_fatal: usize,
    pub events_received: u64,
    pub shards: Vec<ShardReport>,
}

/// Application state for health endpoints
#[derive(Clone)]
pub struct AppState {
    pub shard_state: ShardState,
    pub metrics: Option<Arc<GatewayMetrics>>,
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
async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Readiness endpoint - 200 when a shard is ready and none has failed fatally
async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    let response = ready_report(&state.shard_state);
    let status = if response.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(response))
}

fn ready_report(shard_state: &ShardState) -> ReadyResponse {
    let shards = shard_state
        .snapshots()
        .into_iter()
        .map(|snapshot| ShardReport {
            shard_id: snapshot.shard_id,
            status: snapshot.status.as_str(),
            session_state: snapshot.session_state.as_str(),
            sequence: snapshot.sequence,
            reconnects: snapshot.reconnects,
            heartbeat_latency_ms: snapshot.heartbeat_latency.map(|l| l.as_millis() as u64),
        })
        .collect();

    ReadyResponse {
        ready: shard_state.is_ready(),
        total_shards: shard_state.total_shards(),
        shards_ready: shard_state.ready_shards(),
        shards_fatal: shard_state.fatal_shards(),
        events_received: shard_state.total_events_received(),
        shards,
    }
}

/// Metrics endpoint - returns Prometheus format metrics
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let Some(metrics) = state.metrics else {
        return (
            StatusCode::NOT_FOUND,
            [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            String::from("metrics recorder not installed\n"),
        );
    };
    metrics.observe_shards(&state.shard_state);

    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        metrics.render(),
    )
}
