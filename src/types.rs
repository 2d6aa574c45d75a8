//! Core data model: API keys, audit chain rows, idempotency records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle status of an [`ApiKey`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Active,
    Revoked,
    Expired,
}

impl std::fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            KeyStatus::Active => "active",
            KeyStatus::Revoked => "revoked",
            KeyStatus::Expired => "expired",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for KeyStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(KeyStatus::Active),
            "revoked" => Ok(KeyStatus::Revoked),
            "expired" => Ok(KeyStatus::Expired),
            other => Err(format!("unknown key status: {other}")),
        }
    }
}

/// A managed downstream API key. Owned by the key-management collaborator;
/// the relay treats it as read-only.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ApiKey {
    pub id: String,
    pub access_key: String,
    pub secret_ciphertext: Vec<u8>,
    pub secret_nonce: Vec<u8>,
    pub secret_hash: String,
    pub status: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub rotation_of: Option<String>,
}

impl ApiKey {
    /// Effective status, collapsing expiry-by-timestamp into `Expired`
    /// regardless of the stored status column.
    pub fn effective_status(&self, now: DateTime<Utc>) -> KeyStatus {
        if let Some(expires_at) = self.expires_at {
            if expires_at <= now {
                return KeyStatus::Expired;
            }
        }
        self.status.parse().unwrap_or(KeyStatus::Revoked)
    }
}

/// The two upstream actions this relay proxies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayAction {
    SubmitTask,
    GetResult,
}

impl RelayAction {
    /// The upstream `Action=` query parameter value.
    pub fn upstream_action_name(&self) -> &'static str {
        match self {
            RelayAction::SubmitTask => "CVSync2AsyncSubmitTask",
            RelayAction::GetResult => "CVSync2AsyncGetResult",
        }
    }
}

/// An immutable record of a single downstream call, written before any
/// upstream I/O (fail-closed audit).
#[derive(Debug, Clone, Serialize)]
pub struct DownstreamRequest {
    pub id: String,
    pub request_id: String,
    pub api_key_id: String,
    pub action: RelayAction,
    pub method: String,
    pub path: String,
    pub query: String,
    pub headers: Value,
    pub body: Option<Value>,
    pub client_ip: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// A single attempt at invoking the upstream API for a given
/// `DownstreamRequest`. Multiple attempts share `request_id` and are
/// ordered by `attempt_number`.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamAttempt {
    pub id: String,
    pub request_id: String,
    pub attempt_number: u32,
    pub upstream_action: String,
    pub request_headers: Value,
    pub request_body: Option<String>,
    pub response_status: Option<u16>,
    pub response_headers: Option<Value>,
    pub response_body: Option<String>,
    pub latency_ms: u64,
    pub error: Option<String>,
    pub sent_at: DateTime<Utc>,
}

/// A discrete, never-mutated audit log entry.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub id: String,
    pub request_id: String,
    pub event_type: String,
    pub actor: String,
    pub action: String,
    pub resource: String,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn system(
        request_id: &str,
        event_type: &str,
        action: &str,
        resource: &str,
        metadata: Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            request_id: request_id.to_string(),
            event_type: event_type.to_string(),
            actor: "system".to_string(),
            action: action.to_string(),
            resource: resource.to_string(),
            metadata,
            created_at: Utc::now(),
        }
    }
}

/// A stored response for a previously seen `Idempotency-Key`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct IdempotencyRecord {
    pub idempotency_key: String,
    pub request_hash: String,
    pub response_status: i64,
    pub response_content_type: String,
    pub response_body: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}
