//! `POST /v1/submit` and the `Action=CVSync2AsyncSubmitTask` compatibility
//! dispatch, plus idempotency-key handling (spec §4.5 step 4 and step 8).

use super::{generate_request_id, run_pipeline, AppState, AuthContext};
use crate::errors::RelayError;
use crate::idempotency::IdempotencyLookup;
use crate::types::RelayAction;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Duration;
use std::sync::Arc;

/// Body larger than this is rejected with VALIDATION_FAILED / 413 (spec
/// §4.5 step 3), independent of the signature middleware's own 2 MiB cap.
const PIPELINE_BODY_CAP: usize = 20 * 1024 * 1024;

pub async fn submit_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    axum::extract::Extension(auth): axum::extract::Extension<AuthContext>,
    body: Bytes,
) -> Response {
    dispatch(&state, &headers, &auth, &body, "/v1/submit", "").await
}

/// Shared by the compatibility route (spec §4.5 "Compatibility route"),
/// which never honours `Idempotency-Key`.
pub async fn submit_without_idempotency(
    state: &AppState,
    headers: &HeaderMap,
    auth: &AuthContext,
    body: &Bytes,
    query: &str,
) -> Response {
    if body.len() > PIPELINE_BODY_CAP {
        return RelayError::ValidationFailed("body exceeds 20 MiB cap".to_string()).into_response();
    }

    let request_id = request_id_for(headers);
    match run_pipeline(
        state,
        RelayAction::SubmitTask,
        &auth.api_key_id,
        &request_id,
        "POST",
        "/",
        query,
        headers,
        body,
        None,
    )
    .await
    {
        Ok(outcome) => build_response(outcome.status, &outcome.content_type, outcome.body),
        Err(err) => err.into_response(),
    }
}

async fn dispatch(
    state: &AppState,
    headers: &HeaderMap,
    auth: &AuthContext,
    body: &Bytes,
    path: &str,
    query: &str,
) -> Response {
    if body.len() > PIPELINE_BODY_CAP {
        return RelayError::ValidationFailed("body exceeds 20 MiB cap".to_string()).into_response();
    }

    let request_id = request_id_for(headers);

    if let Some(idem_key) = headers.get("idempotency-key").and_then(|v| v.to_str().ok()) {
        let body_hash = crate::idempotency::IdempotencyService::hash_body(body);
        match state.idempotency.lookup(idem_key, &body_hash).await {
            Ok(IdempotencyLookup::Replay { status, content_type, body }) => {
                state.metrics.idempotency_replays_total.inc();
                return build_response(status, &content_type, axum::body::Bytes::from(body));
            }
            Ok(IdempotencyLookup::Invalid) => {
                return RelayError::ValidationFailed("idempotency record expired or body mismatch".to_string())
                    .into_response();
            }
            Ok(IdempotencyLookup::Miss) => {}
            Err(e) => return RelayError::DatabaseError(e.to_string()).into_response(),
        }

        let outcome = match run_pipeline(
            state,
            RelayAction::SubmitTask,
            &auth.api_key_id,
            &request_id,
            "POST",
            path,
            query,
            headers,
            body,
            None,
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(err) => return err.into_response(),
        };

        let body_string = String::from_utf8_lossy(&outcome.body).into_owned();
        if let Err(e) = state
            .idempotency
            .store(
                idem_key,
                &body_hash,
                outcome.status,
                &outcome.content_type,
                &body_string,
                Duration::seconds(state.config.idempotency_ttl_secs),
            )
            .await
        {
            return RelayError::DatabaseError(e.to_string()).into_response();
        }

        return build_response(outcome.status, &outcome.content_type, outcome.body);
    }

    match run_pipeline(
        state,
        RelayAction::SubmitTask,
        &auth.api_key_id,
        &request_id,
        "POST",
        path,
        query,
        headers,
        body,
        None,
    )
    .await
    {
        Ok(outcome) => build_response(outcome.status, &outcome.content_type, outcome.body),
        Err(err) => err.into_response(),
    }
}

fn request_id_for(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(generate_request_id)
}

fn build_response(status: u16, content_type: &str, body: Bytes) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    (status, [(axum::http::header::CONTENT_TYPE, content_type.to_string())], body).into_response()
}
