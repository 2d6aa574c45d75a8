//! `POST /v1/get-result` and the `Action=CVSync2AsyncGetResult`
//! compatibility dispatch. No idempotency, no submit pacing (spec §4.3
//! "Get-result does not pace").

use super::{generate_request_id, run_pipeline, AppState, AuthContext};
use crate::errors::RelayError;
use crate::types::RelayAction;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use std::sync::Arc;

const PIPELINE_BODY_CAP: usize = 20 * 1024 * 1024;

pub async fn get_result_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    axum::extract::Extension(auth): axum::extract::Extension<AuthContext>,
    body: Bytes,
) -> Response {
    dispatch(&state, &headers, &auth, &body, "/v1/get-result", "").await
}

pub async fn get_result_without_idempotency(
    state: &AppState,
    headers: &HeaderMap,
    auth: &AuthContext,
    body: &Bytes,
    query: &str,
) -> Response {
    dispatch(state, headers, auth, body, "/", query).await
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

    let request_id = headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(generate_request_id);

    match run_pipeline(
        state,
        RelayAction::GetResult,
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
        Ok(outcome) => {
            let status = StatusCode::from_u16(outcome.status).unwrap_or(StatusCode::BAD_GATEWAY);
            (status, [(axum::http::header::CONTENT_TYPE, outcome.content_type)], outcome.body).into_response()
        }
        Err(err) => err.into_response(),
    }
}
