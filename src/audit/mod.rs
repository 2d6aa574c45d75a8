//! Audit Service: persists the downstream-request → upstream-attempt →
//! audit-event chain and redacts sensitive fields at write time. Never
//! mutated after write; redaction happens once, here, not at read time.

use crate::types::{AuditEvent, DownstreamRequest, UpstreamAttempt};
use serde_json::Value;
use sqlx::SqlitePool;

const REDACTED: &str = "***";

/// Header/metadata key names the writer always redacts, matched
/// case-insensitively. `x-amz-*` is matched by prefix.
fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    matches!(
        lower.as_str(),
        "authorization" | "x-date" | "x-security-token" | "signature" | "secret_key" | "sk" | "secretkey" | "access_key_secret"
    ) || lower.starts_with("x-amz-")
}

/// Deep-copy a headers/metadata JSON object, replacing sensitive values
/// with `"***"`. The input is never mutated.
pub fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut redacted = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                if is_sensitive_key(k) {
                    redacted.insert(k.clone(), Value::String(REDACTED.to_string()));
                } else {
                    redacted.insert(k.clone(), redact(v));
                }
            }
            Value::Object(redacted)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        other => other.clone(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit write failed: {0}")]
    Write(#[from] sqlx::Error),
}

#[derive(Clone)]
pub struct AuditService {
    pool: SqlitePool,
}

impl AuditService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Write the downstream-request row. Headers are redacted before
    /// persistence. Must succeed before any upstream I/O is attempted
    /// (fail-closed).
    pub async fn record_downstream_request(&self, req: &DownstreamRequest) -> Result<(), AuditError> {
        let headers = redact(&req.headers);
        sqlx::query(
            "INSERT INTO downstream_requests
                (id, request_id, api_key_id, action, method, path, query, headers, body, client_ip, received_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&req.id)
        .bind(&req.request_id)
        .bind(&req.api_key_id)
        .bind(format!("{:?}", req.action))
        .bind(&req.method)
        .bind(&req.path)
        .bind(&req.query)
        .bind(sqlx::types::Json(headers))
        .bind(req.body.as_ref().map(sqlx::types::Json))
        .bind(&req.client_ip)
        .bind(req.received_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Write (or overwrite) one upstream-attempt row. Must be durable
    /// before the response it describes is passed through to the
    /// caller.
    pub async fn record_upstream_attempt(&self, attempt: &UpstreamAttempt) -> Result<(), AuditError> {
        let headers = redact(&attempt.request_headers);
        sqlx::query(
            "INSERT INTO upstream_attempts
                (id, request_id, attempt_number, upstream_action, request_headers, request_body,
                 response_status, response_headers, response_body, latency_ms, error, sent_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&attempt.id)
        .bind(&attempt.request_id)
        .bind(attempt.attempt_number)
        .bind(&attempt.upstream_action)
        .bind(sqlx::types::Json(headers))
        .bind(&attempt.request_body)
        .bind(attempt.response_status.map(|s| s as i64))
        .bind(attempt.response_headers.as_ref().map(|h| sqlx::types::Json(redact(h))))
        .bind(&attempt.response_body)
        .bind(attempt.latency_ms as i64)
        .bind(&attempt.error)
        .bind(attempt.sent_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_event(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let metadata = redact(&event.metadata);
        sqlx::query(
            "INSERT INTO audit_events (id, request_id, event_type, actor, action, resource, metadata, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.id)
        .bind(&event.request_id)
        .bind(&event.event_type)
        .bind(&event.actor)
        .bind(&event.action)
        .bind(&event.resource)
        .bind(sqlx::types::Json(metadata))
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
