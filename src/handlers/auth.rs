//! Signature verification middleware (spec §4.2). Grounded on the
//! teacher's `sigv4_auth_middleware` shape — header extraction, parsing,
//! canonical-request reconstruction, constant-time compare — generalized
//! to mandatory auth (the teacher treats auth as optional) and to the
//! relay's own key store / cipher collaborators.

use super::{AppState, AuthContext};
use crate::errors::RelayError;
use crate::signature::canonical::{canonical_headers, canonical_request, payload_hash};
use crate::signature::{derive_signing_key, signatures_match, string_to_sign, CredentialScope};
use crate::types::KeyStatus;
use axum::body::{to_bytes, Body};
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::{NaiveDateTime, Utc};
use std::sync::Arc;
use tracing::debug;

/// Separate, smaller cap than the pipeline's own body cap (spec §4.5 step
/// 3 uses 20 MiB) — this one only bounds what the verifier itself reads.
const AUTH_VERIFY_BODY_CAP: usize = 2 * 1024 * 1024;

struct ParsedAuthorization {
    access_key: String,
    scope: CredentialScope,
    signed_headers: Vec<String>,
    signature: String,
}

fn parse_authorization(header: &str) -> Result<ParsedAuthorization, RelayError> {
    let rest = header
        .trim()
        .split_once(' ')
        .map(|(_, rest)| rest)
        .ok_or_else(|| RelayError::AuthFailed("malformed Authorization header".to_string()))?;

    let mut credential = None;
    let mut signed_headers = None;
    let mut signature = None;
    for part in rest.split(',') {
        let part = part.trim();
        if let Some(v) = part.strip_prefix("Credential=") {
            credential = Some(v.trim().to_string());
        } else if let Some(v) = part.strip_prefix("SignedHeaders=") {
            signed_headers = Some(v.trim().to_string());
        } else if let Some(v) = part.strip_prefix("Signature=") {
            signature = Some(v.trim().to_string());
        }
    }

    let credential = credential.ok_or_else(|| RelayError::AuthFailed("missing Credential".to_string()))?;
    let signed_headers = signed_headers.ok_or_else(|| RelayError::AuthFailed("missing SignedHeaders".to_string()))?;
    let signature = signature.ok_or_else(|| RelayError::AuthFailed("missing Signature".to_string()))?;

    let (access_key, scope_str) = credential
        .split_once('/')
        .ok_or_else(|| RelayError::AuthFailed("malformed credential scope".to_string()))?;

    let scope = CredentialScope::parse(scope_str)
        .ok_or_else(|| RelayError::AuthFailed("malformed credential scope".to_string()))?;

    Ok(ParsedAuthorization {
        access_key: access_key.to_string(),
        scope,
        signed_headers: signed_headers.split(';').map(str::to_string).collect(),
        signature,
    })
}

/// Verifies the inbound signature (spec §4.2's 8-step order) and stamps
/// `AuthContext` into request extensions on success.
pub async fn signature_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    match verify(&state, request).await {
        Ok((request, api_key_id)) => {
            state.metrics.auth_attempts_total.with_label_values(&["success"]).inc();
            let mut request = request;
            request.extensions_mut().insert(AuthContext { api_key_id });
            next.run(request).await
        }
        Err(err) => {
            state.metrics.auth_attempts_total.with_label_values(&["failure"]).inc();
            state
                .metrics
                .auth_failures_total
                .with_label_values(&[err.kind().code()])
                .inc();
            err.into_response()
        }
    }
}

async fn verify(state: &AppState, request: Request<Body>) -> Result<(Request<Body>, String), RelayError> {
    let (parts, body) = request.into_parts();

    // Step 1: cap and buffer the body so its hash can be checked, then
    // restore a re-readable body for downstream handlers.
    let body_bytes = to_bytes(body, AUTH_VERIFY_BODY_CAP)
        .await
        .map_err(|_| RelayError::AuthFailed("request body too large".to_string()))?;

    // Step 2: parse Authorization.
    let auth_header = parts
        .headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| RelayError::AuthFailed("missing Authorization header".to_string()))?;
    let parsed = parse_authorization(auth_header)?;

    // Step 3: X-Date within the allowed clock skew.
    let x_date = parts
        .headers
        .get("x-date")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| RelayError::AuthFailed("missing X-Date header".to_string()))?
        .to_string();
    let request_time = NaiveDateTime::parse_from_str(&x_date, "%Y%m%dT%H%M%SZ")
        .map_err(|_| RelayError::AuthFailed("unparseable X-Date".to_string()))?
        .and_utc();
    let skew = (Utc::now() - request_time).num_seconds().abs();
    if skew > state.config.max_clock_skew_secs {
        return Err(RelayError::AuthFailed("X-Date outside allowed clock skew".to_string()));
    }

    // Step 4: required signed headers.
    for required in ["host", "x-date", "x-content-sha256"] {
        if !parsed.signed_headers.iter().any(|h| h == required) {
            return Err(RelayError::AuthFailed(format!("{required} must be signed")));
        }
    }

    // Step 5: body hash check.
    let computed_hash = payload_hash(&body_bytes);
    let claimed_hash = parts
        .headers
        .get("x-content-sha256")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| RelayError::AuthFailed("missing X-Content-Sha256 header".to_string()))?;
    if computed_hash != claimed_hash {
        return Err(RelayError::InvalidSignature);
    }

    // Step 6: load the key.
    let key = state
        .keystore
        .find_by_access_key(&parsed.access_key)
        .await
        .map_err(|e| RelayError::DatabaseError(e.to_string()))?
        .ok_or_else(|| RelayError::AuthFailed("unknown access key".to_string()))?;

    match key.effective_status(Utc::now()) {
        KeyStatus::Revoked => return Err(RelayError::KeyRevoked),
        KeyStatus::Expired => return Err(RelayError::KeyExpired),
        KeyStatus::Active => {}
    }

    // Step 7: decrypt secret and verify signature.
    let secret_bytes = state
        .cipher
        .decrypt(&key.secret_ciphertext, &key.secret_nonce)
        .map_err(|_| RelayError::AuthFailed("secret unavailable".to_string()))?;
    let secret = String::from_utf8(secret_bytes).map_err(|_| RelayError::AuthFailed("secret unavailable".to_string()))?;

    // The true authority, when the request carries one (e.g. an HTTP/2
    // `:authority` pseudo-header or an absolute-form request target), takes
    // priority over a literal `Host:` header — a caller shouldn't be able to
    // get a different value signed than what the connection actually
    // terminated on. `canonical_headers` falls back to the `Host:` header
    // itself when no authority is present, which is the common HTTP/1.1 case.
    let authority = parts.uri.authority().map(|a| a.as_str().to_string());
    let (canonical_headers_block, signed_headers_joined) =
        canonical_headers(&parsed.signed_headers, &parts.headers, authority.as_deref());

    let query = parts.uri.query().unwrap_or("");
    let canonical = canonical_request(
        parts.method.as_str(),
        parts.uri.path(),
        query,
        &canonical_headers_block,
        &signed_headers_joined,
        &computed_hash,
    );
    debug!(request_path = %parts.uri.path(), "computed canonical request for verification");

    let sts = string_to_sign(parsed.scope.dialect, &x_date, &parsed.scope, &canonical);
    let signing_key = derive_signing_key(&secret, &parsed.scope);
    let expected = hex::encode(crate::signature::hmac_sha256(&signing_key, sts.as_bytes()));

    if !signatures_match(&expected, &parsed.signature) {
        return Err(RelayError::InvalidSignature);
    }

    // Step 8: region/service/date cross-checks.
    if parsed.scope.region != state.config.upstream_region || parsed.scope.service != state.config.upstream_service {
        return Err(RelayError::InvalidSignature);
    }
    let date_component = &x_date[..8.min(x_date.len())];
    if parsed.scope.date_short != date_component {
        return Err(RelayError::InvalidSignature);
    }

    let request = Request::from_parts(parts, Body::from(body_bytes));
    Ok((request, key.id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_authorization() {
        let header = "AWS4-HMAC-SHA256 Credential=AKID/20260728/cn-north-1/cv/aws4_request, SignedHeaders=host;x-date;x-content-sha256, Signature=abc123";
        let parsed = parse_authorization(header).unwrap();
        assert_eq!(parsed.access_key, "AKID");
        assert_eq!(parsed.scope.region, "cn-north-1");
        assert_eq!(parsed.signed_headers, vec!["host", "x-date", "x-content-sha256"]);
        assert_eq!(parsed.signature, "abc123");
    }

    #[test]
    fn rejects_missing_fields() {
        assert!(parse_authorization("AWS4-HMAC-SHA256 Credential=AKID/20260728/r/s/aws4_request").is_err());
        assert!(parse_authorization("not an auth header").is_err());
    }
}
