//! Shared application state and the relay pipeline core shared by
//! `submit` and `get-result`. Mirrors the teacher's `api/handlers/mod.rs`
//! convention of a top-level `AppState` plus small per-route files.

pub mod auth;
pub mod get_result;
pub mod health;
pub mod submit;

use crate::admission::AdmissionEngine;
use crate::audit::AuditService;
use crate::cipher::SecretCipher;
use crate::config::Config;
use crate::errors::RelayError;
use crate::idempotency::IdempotencyService;
use crate::keystore::ApiKeyStore;
use crate::metrics::Metrics;
use crate::types::{AuditEvent, DownstreamRequest, RelayAction, UpstreamAttempt};
use crate::upstream::{UpstreamClient, UpstreamResult};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::Utc;
use rand::RngCore;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Shared state handed to every handler via `axum::extract::State`.
pub struct AppState {
    pub config: Config,
    pub admission: AdmissionEngine,
    pub upstream: UpstreamClient,
    pub keystore: Box<dyn ApiKeyStore>,
    pub cipher: Box<dyn SecretCipher>,
    pub audit: AuditService,
    pub idempotency: IdempotencyService,
    pub metrics: Arc<Metrics>,
}

/// Stamped into request extensions by the signature middleware on
/// successful verification (spec §4.2's "stamps `api_key_id` into the
/// request context").
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub api_key_id: String,
}

/// Generate `req_` + 8 random bytes hex, used when the caller doesn't
/// supply `X-Request-Id`.
pub fn generate_request_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("req_{}", hex::encode(bytes))
}

fn headers_to_json(headers: &HeaderMap) -> Value {
    let mut map = serde_json::Map::with_capacity(headers.len());
    for name in headers.keys() {
        let joined = headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect::<Vec<_>>()
            .join(", ");
        map.insert(name.as_str().to_ascii_lowercase(), Value::String(joined));
    }
    Value::Object(map)
}

/// The outcome of running the shared pipeline: what goes back to the
/// downstream caller.
pub struct PipelineOutcome {
    pub status: u16,
    pub content_type: String,
    pub body: Bytes,
}

/// Runs audit-write → admit → upstream call → audit-completion →
/// pass-through, shared by submit and get-result (spec §4.5).
#[allow(clippy::too_many_arguments)]
pub async fn run_pipeline(
    state: &AppState,
    action: RelayAction,
    api_key_id: &str,
    request_id: &str,
    method: &str,
    path: &str,
    query: &str,
    headers: &HeaderMap,
    body: &Bytes,
    client_ip: Option<String>,
) -> Result<PipelineOutcome, RelayError> {
    let started = std::time::Instant::now();
    let now = Utc::now();
    let headers_json = headers_to_json(headers);

    let downstream_row = DownstreamRequest {
        id: uuid::Uuid::new_v4().to_string(),
        request_id: request_id.to_string(),
        api_key_id: api_key_id.to_string(),
        action,
        method: method.to_string(),
        path: path.to_string(),
        query: query.to_string(),
        headers: headers_json.clone(),
        body: std::str::from_utf8(body).ok().map(|s| Value::String(s.to_string())),
        client_ip,
        received_at: now,
    };

    // Fail-closed: the downstream row (plus a skeletal attempt-1 marker)
    // must be durable before any upstream I/O is attempted.
    state
        .audit
        .record_downstream_request(&downstream_row)
        .await
        .map_err(|e| RelayError::AuditFailed(e.to_string()))?;

    let skeletal_attempt = UpstreamAttempt {
        id: uuid::Uuid::new_v4().to_string(),
        request_id: request_id.to_string(),
        attempt_number: 1,
        upstream_action: action.upstream_action_name().to_string(),
        request_headers: headers_json,
        request_body: None,
        response_status: None,
        response_headers: None,
        response_body: None,
        latency_ms: 0,
        error: None,
        sent_at: now,
    };
    state
        .audit
        .record_upstream_attempt(&skeletal_attempt)
        .await
        .map_err(|e| RelayError::AuditFailed(e.to_string()))?;

    let cancel = CancellationToken::new();

    let guard = state.admission.acquire(api_key_id, &cancel).await.map_err(|err| {
        state
            .metrics
            .admission_rejected_total
            .with_label_values(&[admit_error_reason(err)])
            .inc();
        admit_error_to_relay(err)
    })?;

    if matches!(action, RelayAction::SubmitTask) {
        state
            .admission
            .pace_submit(&cancel)
            .await
            .map_err(admit_error_to_relay)?;
    }

    let outcome = state.upstream.execute(action, body, headers, &cancel).await;
    drop(guard);

    if outcome.attempts.len() > 1 {
        state
            .metrics
            .upstream_retries_total
            .inc_by((outcome.attempts.len() - 1) as u64);
    }

    for attempt in &outcome.attempts {
        state.metrics.upstream_latency_seconds.observe(attempt.latency_ms as f64 / 1000.0);
        let row = UpstreamAttempt {
            id: uuid::Uuid::new_v4().to_string(),
            request_id: request_id.to_string(),
            attempt_number: attempt.attempt_number,
            upstream_action: action.upstream_action_name().to_string(),
            request_headers: Value::Object(serde_json::Map::new()),
            request_body: None,
            response_status: attempt.status,
            response_headers: attempt
                .headers
                .as_ref()
                .map(|h| Value::Object(
                    h.keys()
                        .map(|k| {
                            let v = h.get_all(k).iter().filter_map(|v| v.to_str().ok()).collect::<Vec<_>>().join(", ");
                            (k.as_str().to_ascii_lowercase(), Value::String(v))
                        })
                        .collect(),
                )),
            response_body: attempt.body.as_ref().map(|b| String::from_utf8_lossy(b).into_owned()),
            latency_ms: attempt.latency_ms,
            error: attempt.error.clone(),
            sent_at: now,
        };
        state
            .audit
            .record_upstream_attempt(&row)
            .await
            .map_err(|e| RelayError::AuditFailed(e.to_string()))?;
    }

    let latency_ms = started.elapsed().as_millis() as u64;

    match outcome.result {
        UpstreamResult::Response { status, headers: resp_headers, body: resp_body } => {
            state
                .audit
                .record_event(&AuditEvent::system(
                    request_id,
                    "upstream_response",
                    action.upstream_action_name(),
                    "upstream",
                    serde_json::json!({ "status": status }),
                ))
                .await
                .map_err(|e| RelayError::AuditFailed(e.to_string()))?;

            let content_type = resp_headers
                .get(axum::http::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("application/json")
                .to_string();

            info!(
                request_id,
                latency_ms, upstream_status = status, "relay pipeline completed"
            );
            state
                .metrics
                .upstream_requests_total
                .with_label_values(&[action.upstream_action_name(), "response"])
                .inc();

            Ok(PipelineOutcome {
                status,
                content_type,
                body: resp_body,
            })
        }
        UpstreamResult::NoResponse { message } => {
            state
                .audit
                .record_event(&AuditEvent::system(
                    request_id,
                    "upstream_failure",
                    action.upstream_action_name(),
                    "upstream",
                    serde_json::json!({ "error": message }),
                ))
                .await
                .map_err(|e| RelayError::AuditFailed(e.to_string()))?;

            error!(request_id, latency_ms, error = %message, "upstream call failed");
            state
                .metrics
                .upstream_requests_total
                .with_label_values(&[action.upstream_action_name(), "no_response"])
                .inc();

            Err(RelayError::UpstreamFailed(message))
        }
    }
}

fn admit_error_reason(err: crate::admission::AdmitError) -> &'static str {
    match err {
        crate::admission::AdmitError::RateLimited => "rate_limited",
        crate::admission::AdmitError::KeyRevoked => "key_revoked",
        crate::admission::AdmitError::Cancelled => "cancelled",
    }
}

fn admit_error_to_relay(err: crate::admission::AdmitError) -> RelayError {
    match err {
        crate::admission::AdmitError::RateLimited => RelayError::RateLimited,
        crate::admission::AdmitError::KeyRevoked => RelayError::KeyRevoked,
        crate::admission::AdmitError::Cancelled => RelayError::UpstreamFailed("cancelled".to_string()),
    }
}

/// `POST /?Action=...` compatibility alias (spec §4.5 "Compatibility
/// route"): dispatches to the submit or get-result pipeline based on the
/// `Action` query parameter, with no idempotency support.
pub async fn compat_handler(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
    headers: axum::http::HeaderMap,
    axum::extract::Extension(auth): axum::extract::Extension<AuthContext>,
    query: axum::extract::RawQuery,
    body: axum::body::Bytes,
) -> Response {
    let query = query.0.unwrap_or_default();
    let action = query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == "Action")
        .map(|(_, v)| v);

    match action {
        Some(v) if v == RelayAction::SubmitTask.upstream_action_name() => {
            submit::submit_without_idempotency(&state, &headers, &auth, &body, &query).await
        }
        Some(v) if v == RelayAction::GetResult.upstream_action_name() => {
            get_result::get_result_without_idempotency(&state, &headers, &auth, &body, &query).await
        }
        _ => RelayError::ValidationFailed("unknown or missing Action".to_string()).into_response(),
    }
}
