//! Upstream signing client: re-signs a request under the operator's own
//! credentials, executes it against the single upstream vision API, and
//! drives Retry-After-aware retries. Retries live here, not in the
//! admission engine — admission only gates concurrency, not outcomes.

use crate::signature::canonical::{canonical_request, payload_hash};
use crate::signature::{derive_signing_key, hmac_sha256, string_to_sign, CredentialScope, Dialect};
use crate::types::RelayAction;
use axum::http::HeaderMap;
use bytes::Bytes;
use chrono::Utc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub struct UpstreamConfig {
    pub base_url: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub region: String,
    pub service: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

/// A single attempt's outcome, regardless of whether it was retried.
#[derive(Debug, Clone)]
pub struct AttemptOutcome {
    pub attempt_number: u32,
    pub status: Option<u16>,
    pub headers: Option<HeaderMap>,
    pub body: Option<Bytes>,
    pub latency_ms: u64,
    pub error: Option<String>,
}

/// The terminal outcome of a (possibly retried) call.
#[derive(Debug, Clone)]
pub enum UpstreamResult {
    /// A response was received from upstream, whatever its status —
    /// including non-2xx, which the pipeline passes through unchanged.
    Response {
        status: u16,
        headers: HeaderMap,
        body: Bytes,
    },
    /// No response at all: network error, timeout, or a cancellation
    /// during a retry sleep. Maps to UPSTREAM_FAILED / 502.
    NoResponse { message: String },
}

pub struct UpstreamCallOutcome {
    pub attempts: Vec<AttemptOutcome>,
    pub result: UpstreamResult,
}

pub struct UpstreamClient {
    http: reqwest::Client,
    config: UpstreamConfig,
}

impl UpstreamClient {
    pub fn new(config: UpstreamConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .expect("reqwest client builds with static config");
        Self { http, config }
    }

    /// Execute `action` with `body`, forwarding only `Content-Type` and
    /// `Accept` from `downstream_headers`. Retries on HTTP 429/5xx up to
    /// `max_retries` times; network errors are not retried.
    pub async fn execute(
        &self,
        action: RelayAction,
        body: &[u8],
        downstream_headers: &HeaderMap,
        cancel: &CancellationToken,
    ) -> UpstreamCallOutcome {
        let accept = downstream_headers
            .get(axum::http::header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/json")
            .to_string();

        let total_attempts = self.config.max_retries + 1;
        let mut attempts = Vec::new();

        for attempt_number in 1..=total_attempts {
            let started = Instant::now();
            match self.send_once(action, body, &accept).await {
                Ok(response) => {
                    let latency_ms = started.elapsed().as_millis() as u64;
                    let is_retryable = attempt_number < total_attempts
                        && (response.status == 429 || response.status >= 500);

                    attempts.push(AttemptOutcome {
                        attempt_number,
                        status: Some(response.status),
                        headers: Some(response.headers.clone()),
                        body: Some(response.body.clone()),
                        latency_ms,
                        error: None,
                    });

                    if is_retryable {
                        let delay = retry_delay(
                            &response.headers,
                            attempt_number,
                            self.config.retry_base_delay,
                            self.config.retry_max_delay,
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => continue,
                            _ = cancel.cancelled() => {
                                return UpstreamCallOutcome {
                                    attempts,
                                    result: UpstreamResult::NoResponse {
                                        message: "cancelled during retry backoff".to_string(),
                                    },
                                };
                            }
                        }
                    }

                    return UpstreamCallOutcome {
                        attempts,
                        result: UpstreamResult::Response {
                            status: response.status,
                            headers: response.headers,
                            body: response.body,
                        },
                    };
                }
                Err(err) => {
                    let latency_ms = started.elapsed().as_millis() as u64;
                    let message = err.to_string();
                    attempts.push(AttemptOutcome {
                        attempt_number,
                        status: None,
                        headers: None,
                        body: None,
                        latency_ms,
                        error: Some(message.clone()),
                    });
                    return UpstreamCallOutcome {
                        attempts,
                        result: UpstreamResult::NoResponse { message },
                    };
                }
            }
        }

        unreachable!("the final attempt never retries")
    }

    async fn send_once(
        &self,
        action: RelayAction,
        body: &[u8],
        accept: &str,
    ) -> Result<RawResponse, reqwest::Error> {
        let query = format!("Action={}&Version=2022-08-31", action.upstream_action_name());
        let url = format!("{}/?{}", self.config.base_url.trim_end_matches('/'), query);

        let host = reqwest::Url::parse(&self.config.base_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default();

        let x_date = Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
        let date_short = x_date[..8].to_string();
        let hashed_body = payload_hash(body);

        let scope = CredentialScope {
            date_short,
            region: self.config.region.clone(),
            service: self.config.service.clone(),
            dialect: Dialect::Aws4,
        };

        let mut headers = HeaderMap::new();
        headers.insert("host", host.parse().unwrap());
        headers.insert("x-date", x_date.parse().unwrap());
        headers.insert("x-content-sha256", hashed_body.parse().unwrap());

        let signed_header_names = vec![
            "host".to_string(),
            "x-content-sha256".to_string(),
            "x-date".to_string(),
        ];
        let (canonical_headers_block, signed_headers) =
            crate::signature::canonical::canonical_headers(&signed_header_names, &headers, Some(&host));

        let canonical = canonical_request(
            "POST",
            "/",
            &query,
            &canonical_headers_block,
            &signed_headers,
            &hashed_body,
        );
        let sts = string_to_sign(Dialect::Aws4, &x_date, &scope, &canonical);
        let signing_key = derive_signing_key(&self.config.secret_access_key, &scope);
        let signature = hex::encode(hmac_sha256(&signing_key, sts.as_bytes()));

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.config.access_key_id,
            scope.scope_string(),
            signed_headers,
            signature
        );

        let response = self
            .http
            .post(&url)
            .header("Authorization", authorization)
            .header("X-Date", x_date)
            .header("X-Content-Sha256", hashed_body)
            .header("Content-Type", "application/json")
            .header("Accept", accept)
            .body(body.to_vec())
            .send()
            .await?;

        let status = response.status().as_u16();
        let mut out_headers = HeaderMap::new();
        for (name, value) in response.headers().iter() {
            if let (Ok(name), Ok(value)) = (
                axum::http::HeaderName::from_bytes(name.as_str().as_bytes()),
                axum::http::HeaderValue::from_bytes(value.as_bytes()),
            ) {
                out_headers.append(name, value);
            }
        }
        let body = response.bytes().await?;

        Ok(RawResponse {
            status,
            headers: out_headers,
            body,
        })
    }
}

struct RawResponse {
    status: u16,
    headers: HeaderMap,
    body: Bytes,
}

/// `Retry-After` if present (integer seconds or an HTTP-date), else
/// exponential backoff `base * 2^attempt` clamped to `max`.
fn retry_delay(headers: &HeaderMap, attempt_number: u32, base: Duration, max: Duration) -> Duration {
    if let Some(value) = headers.get(axum::http::header::RETRY_AFTER).and_then(|v| v.to_str().ok()) {
        if let Some(d) = parse_retry_after(value) {
            return d.min(max);
        }
    }
    let exp = base.saturating_mul(2u32.saturating_pow(attempt_number));
    exp.min(max)
}

fn parse_retry_after(value: &str) -> Option<Duration> {
    if let Ok(secs) = value.trim().parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    if let Ok(date) = chrono::DateTime::parse_from_rfc2822(value.trim()) {
        let now = Utc::now();
        let delta = date.with_timezone(&Utc) - now;
        return Some(Duration::from_secs(delta.num_seconds().max(0) as u64));
    }
    None
}
