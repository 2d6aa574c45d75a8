//! Prometheus metrics for the relay.
//!
//! All metric types use atomics internally (no locks on the hot path).
//! The `Metrics` struct is `Clone`-cheap (Arc-based registry + Arc-based collectors).

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use prometheus::{
    Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec,
    Opts, Registry, TextEncoder, TEXT_FORMAT,
};
use std::sync::Arc;
use std::time::Instant;

use crate::handlers::AppState;

/// All Prometheus metrics for the relay.
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // -- Process & Build --
    pub process_start_time_seconds: Gauge,
    pub build_info: GaugeVec,
    pub process_peak_rss_bytes: Gauge,

    // -- HTTP Requests --
    pub http_requests_total: IntCounterVec,
    pub http_request_duration_seconds: HistogramVec,

    // -- Auth --
    pub auth_attempts_total: IntCounterVec,
    pub auth_failures_total: IntCounterVec,

    // -- Admission --
    pub admission_queue_depth: Gauge,
    pub admission_in_flight: Gauge,
    pub admission_rejected_total: IntCounterVec,

    // -- Upstream --
    pub upstream_requests_total: IntCounterVec,
    pub upstream_retries_total: IntCounter,
    pub upstream_latency_seconds: Histogram,

    // -- Idempotency --
    pub idempotency_replays_total: IntCounter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        // -- Process & Build --
        let process_start_time_seconds =
            Gauge::new("process_start_time_seconds", "Start time of the process").unwrap();
        registry
            .register(Box::new(process_start_time_seconds.clone()))
            .unwrap();

        let build_info = GaugeVec::new(
            Opts::new("cvrelay_build_info", "Build information"),
            &["version"],
        )
        .unwrap();
        registry.register(Box::new(build_info.clone())).unwrap();

        let process_peak_rss_bytes = Gauge::new(
            "process_peak_rss_bytes",
            "Peak resident set size in bytes (updated on scrape)",
        )
        .unwrap();
        registry
            .register(Box::new(process_peak_rss_bytes.clone()))
            .unwrap();

        #[cfg(target_os = "linux")]
        {
            let pc = prometheus::process_collector::ProcessCollector::for_self();
            let _ = registry.register(Box::new(pc));
        }

        // -- HTTP Requests --
        let http_requests_total = IntCounterVec::new(
            Opts::new(
                "cvrelay_http_requests_total",
                "Total HTTP requests by method, status, and route",
            ),
            &["method", "status", "route"],
        )
        .unwrap();
        registry
            .register(Box::new(http_requests_total.clone()))
            .unwrap();

        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "cvrelay_http_request_duration_seconds",
                "HTTP request duration in seconds",
            ),
            &["method", "route"],
        )
        .unwrap();
        registry
            .register(Box::new(http_request_duration_seconds.clone()))
            .unwrap();

        // -- Auth --
        let auth_attempts_total = IntCounterVec::new(
            Opts::new("cvrelay_auth_attempts_total", "Signature auth attempts by result"),
            &["result"],
        )
        .unwrap();
        registry
            .register(Box::new(auth_attempts_total.clone()))
            .unwrap();

        let auth_failures_total = IntCounterVec::new(
            Opts::new("cvrelay_auth_failures_total", "Signature auth failures by reason"),
            &["reason"],
        )
        .unwrap();
        registry
            .register(Box::new(auth_failures_total.clone()))
            .unwrap();

        // -- Admission --
        let admission_queue_depth = Gauge::new(
            "cvrelay_admission_queue_depth",
            "Current admission queue depth (updated on scrape)",
        )
        .unwrap();
        registry
            .register(Box::new(admission_queue_depth.clone()))
            .unwrap();

        let admission_in_flight = Gauge::new(
            "cvrelay_admission_in_flight",
            "Current number of in-flight upstream calls (updated on scrape)",
        )
        .unwrap();
        registry
            .register(Box::new(admission_in_flight.clone()))
            .unwrap();

        let admission_rejected_total = IntCounterVec::new(
            Opts::new("cvrelay_admission_rejected_total", "Admission rejections by reason"),
            &["reason"],
        )
        .unwrap();
        registry
            .register(Box::new(admission_rejected_total.clone()))
            .unwrap();

        // -- Upstream --
        let upstream_requests_total = IntCounterVec::new(
            Opts::new(
                "cvrelay_upstream_requests_total",
                "Total upstream calls by action and outcome",
            ),
            &["action", "outcome"],
        )
        .unwrap();
        registry
            .register(Box::new(upstream_requests_total.clone()))
            .unwrap();

        let upstream_retries_total = IntCounter::new(
            "cvrelay_upstream_retries_total",
            "Total upstream attempt retries",
        )
        .unwrap();
        registry
            .register(Box::new(upstream_retries_total.clone()))
            .unwrap();

        let latency_buckets = vec![
            0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
        ];
        let upstream_latency_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "cvrelay_upstream_latency_seconds",
                "Upstream call latency in seconds, per attempt",
            )
            .buckets(latency_buckets),
        )
        .unwrap();
        registry
            .register(Box::new(upstream_latency_seconds.clone()))
            .unwrap();

        // -- Idempotency --
        let idempotency_replays_total = IntCounter::new(
            "cvrelay_idempotency_replays_total",
            "Total submit requests served from the idempotency store",
        )
        .unwrap();
        registry
            .register(Box::new(idempotency_replays_total.clone()))
            .unwrap();

        Metrics {
            registry,
            process_start_time_seconds,
            build_info,
            process_peak_rss_bytes,
            http_requests_total,
            http_request_duration_seconds,
            auth_attempts_total,
            auth_failures_total,
            admission_queue_depth,
            admission_in_flight,
            admission_rejected_total,
            upstream_requests_total,
            upstream_retries_total,
            upstream_latency_seconds,
            idempotency_replays_total,
        }
    }
}

/// Classify a path into a bounded route label for cardinality control.
pub fn classify_route(path: &str) -> &'static str {
    match path {
        "/health" => "health",
        "/stats" => "stats",
        "/metrics" => "metrics",
        "/v1/submit" => "submit",
        "/v1/get-result" => "get_result",
        "/" => "compat",
        _ => "unknown",
    }
}

/// Axum middleware that records HTTP request metrics.
pub async fn http_metrics_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let method = request.method().to_string();
    let route = classify_route(request.uri().path());

    let start = Instant::now();
    let response = next.run(request).await;
    let duration = start.elapsed().as_secs_f64();

    let status = response.status().as_u16().to_string();

    state
        .metrics
        .http_requests_total
        .with_label_values(&[&method, &status, route])
        .inc();
    state
        .metrics
        .http_request_duration_seconds
        .with_label_values(&[&method, route])
        .observe(duration);

    response
}

/// Handler for GET /metrics — returns Prometheus text format.
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let metrics = &state.metrics;

    metrics
        .process_peak_rss_bytes
        .set(get_peak_rss_bytes() as f64);
    metrics.admission_queue_depth.set(state.admission.queue_depth() as f64);
    metrics.admission_in_flight.set(state.admission.in_flight() as f64);

    let encoder = TextEncoder::new();
    let metric_families = metrics.registry.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
            .into_response();
    }

    (StatusCode::OK, [("content-type", TEXT_FORMAT)], buffer).into_response()
}

/// Peak RSS in bytes via `getrusage(RUSAGE_SELF)`. Linux reports `ru_maxrss`
/// in KiB; other platforms in bytes.
pub fn get_peak_rss_bytes() -> u64 {
    // SAFETY: `libc::getrusage` is a POSIX syscall that writes into a caller-provided
    // `rusage` struct. We zero-initialise it first, and the call is infallible for
    // RUSAGE_SELF. No aliasing or lifetime issues — `usage` is a local stack variable.
    unsafe {
        let mut usage: libc::rusage = std::mem::zeroed();
        if libc::getrusage(libc::RUSAGE_SELF, &mut usage) != 0 {
            return 0;
        }
        #[cfg(target_os = "linux")]
        {
            usage.ru_maxrss as u64 * 1024
        }
        #[cfg(not(target_os = "linux"))]
        {
            usage.ru_maxrss as u64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_routes() {
        assert_eq!(classify_route("/health"), "health");
        assert_eq!(classify_route("/v1/submit"), "submit");
        assert_eq!(classify_route("/v1/get-result"), "get_result");
        assert_eq!(classify_route("/nope"), "unknown");
    }

    #[test]
    fn peak_rss_is_nonzero_after_allocation() {
        let _v: Vec<u8> = vec![0u8; 1024 * 1024];
        assert!(get_peak_rss_bytes() > 0);
    }
}
