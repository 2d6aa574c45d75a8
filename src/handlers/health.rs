//! `GET /health` and `GET /stats` — unauthenticated liveness and aggregate
//! status endpoints, adapted from the teacher's `status.rs` shape
//! (`HealthResponse`/`StatsResponse` as JSON, peak-RSS via `getrusage`).

use super::AppState;
use crate::metrics::get_peak_rss_bytes;
use axum::extract::State;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;

/// `GET /health` response body.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub peak_rss_bytes: u64,
}

/// `GET /health` — plain liveness probe, always `"healthy"` once the
/// process is accepting connections.
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        peak_rss_bytes: get_peak_rss_bytes(),
    })
}

/// `GET /stats` response body: a snapshot of the admission engine and a
/// handful of cumulative relay counters.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub admission_in_flight: u64,
    pub admission_queue_depth: u64,
    pub upstream_retries_total: u64,
    pub idempotency_replays_total: u64,
    pub peak_rss_bytes: u64,
}

/// `GET /stats` — aggregate relay statistics, unauthenticated like
/// `/health` and `/metrics` so operators can scrape it without signing.
pub async fn stats_handler(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    Json(StatsResponse {
        admission_in_flight: state.admission.in_flight() as u64,
        admission_queue_depth: state.admission.queue_depth() as u64,
        upstream_retries_total: state.metrics.upstream_retries_total.get() as u64,
        idempotency_replays_total: state.metrics.idempotency_replays_total.get() as u64,
        peak_rss_bytes: get_peak_rss_bytes(),
    })
}
