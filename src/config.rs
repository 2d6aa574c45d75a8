//! Configuration for cv-relay.

use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::net::SocketAddr;
use zeroize::Zeroizing;

/// Relay configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address to listen on for downstream callers.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Base URL of the single upstream vision API.
    pub upstream_base_url: String,

    /// Access key ID used to re-sign requests to upstream.
    pub upstream_access_key_id: String,

    /// Secret access key used to re-sign requests to upstream.
    pub upstream_secret_access_key: String,

    /// Region component of the upstream signing credential scope.
    #[serde(default = "default_region")]
    pub upstream_region: String,

    /// Service component of the upstream signing credential scope.
    #[serde(default = "default_service")]
    pub upstream_service: String,

    /// sqlx connection string for the persistence layer (API keys, audit
    /// chain, idempotency records).
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// 32-byte key used to encrypt API key secrets at rest, decoded once
    /// from base64 at load time. `Zeroizing` keeps the decoded bytes off a
    /// `{:?}` dump and zeroes them on drop instead of lingering in memory
    /// for the life of the process.
    #[serde(deserialize_with = "deserialize_encryption_key", serialize_with = "serialize_encryption_key")]
    pub api_key_encryption_key: Zeroizing<[u8; 32]>,

    /// Maximum number of in-flight upstream requests across all callers.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Maximum number of queued waiters before admission is rejected.
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: usize,

    /// Minimum interval between the start of two successive SubmitTask
    /// calls to upstream.
    #[serde(default = "default_submit_min_interval_ms")]
    pub submit_min_interval_ms: u64,

    /// Maximum number of retries after a failed upstream attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay for exponential retry backoff.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Upper clamp for retry backoff delay.
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Maximum accepted request body size, in bytes.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Allowed clock skew window for X-Date / Authorization date checks.
    #[serde(default = "default_max_clock_skew_secs")]
    pub max_clock_skew_secs: i64,

    /// Time-to-live for stored idempotency records.
    #[serde(default = "default_idempotency_ttl_secs")]
    pub idempotency_ttl_secs: i64,

    /// Upstream request timeout.
    #[serde(default = "default_upstream_timeout_ms")]
    pub upstream_timeout_ms: u64,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("listen_addr", &self.listen_addr)
            .field("upstream_base_url", &self.upstream_base_url)
            .field("upstream_access_key_id", &self.upstream_access_key_id)
            .field("upstream_secret_access_key", &"<redacted>")
            .field("upstream_region", &self.upstream_region)
            .field("upstream_service", &self.upstream_service)
            .field("database_url", &self.database_url)
            .field("api_key_encryption_key", &"<redacted>")
            .field("max_in_flight", &self.max_in_flight)
            .field("max_queue_depth", &self.max_queue_depth)
            .field("submit_min_interval_ms", &self.submit_min_interval_ms)
            .field("max_retries", &self.max_retries)
            .field("retry_base_delay_ms", &self.retry_base_delay_ms)
            .field("retry_max_delay_ms", &self.retry_max_delay_ms)
            .field("max_body_bytes", &self.max_body_bytes)
            .field("max_clock_skew_secs", &self.max_clock_skew_secs)
            .field("idempotency_ttl_secs", &self.idempotency_ttl_secs)
            .field("upstream_timeout_ms", &self.upstream_timeout_ms)
            .finish()
    }
}

/// Base64-decode `s` into exactly 32 bytes, or a description of why not.
fn decode_encryption_key_bytes(s: &str) -> Result<[u8; 32], String> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(s.trim())
        .map_err(|e| format!("api_key_encryption_key is not valid base64: {e}"))?;
    bytes
        .try_into()
        .map_err(|v: Vec<u8>| format!("api_key_encryption_key must decode to exactly 32 bytes, got {}", v.len()))
}

fn deserialize_encryption_key<'de, D>(deserializer: D) -> Result<Zeroizing<[u8; 32]>, D::Error>
where
    D: Deserializer<'de>,
{
    let encoded = String::deserialize(deserializer)?;
    decode_encryption_key_bytes(&encoded)
        .map(Zeroizing::new)
        .map_err(serde::de::Error::custom)
}

fn serialize_encryption_key<S>(key: &Zeroizing<[u8; 32]>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let encoded = base64::engine::general_purpose::STANDARD.encode(key.as_slice());
    serializer.serialize_str(&encoded)
}

fn default_listen_addr() -> SocketAddr {
    "127.0.0.1:8443".parse().unwrap()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_service() -> String {
    "vision".to_string()
}

fn default_database_url() -> String {
    "sqlite://cvrelay.db".to_string()
}

fn default_max_in_flight() -> usize {
    8
}

fn default_max_queue_depth() -> usize {
    64
}

fn default_submit_min_interval_ms() -> u64 {
    100
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_base_delay_ms() -> u64 {
    200
}

fn default_retry_max_delay_ms() -> u64 {
    2_000
}

fn default_max_body_bytes() -> usize {
    20 * 1024 * 1024
}

fn default_max_clock_skew_secs() -> i64 {
    900
}

fn default_idempotency_ttl_secs() -> i64 {
    24 * 60 * 60
}

fn default_upstream_timeout_ms() -> u64 {
    30_000
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(config)
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let listen_addr = std::env::var("CVRELAY_LISTEN_ADDR")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_listen_addr);

        let upstream_base_url = std::env::var("CVRELAY_UPSTREAM_BASE_URL")
            .map_err(|_| ConfigError::Missing("CVRELAY_UPSTREAM_BASE_URL"))?;
        let upstream_access_key_id = std::env::var("CVRELAY_UPSTREAM_ACCESS_KEY_ID")
            .map_err(|_| ConfigError::Missing("CVRELAY_UPSTREAM_ACCESS_KEY_ID"))?;
        let upstream_secret_access_key = std::env::var("CVRELAY_UPSTREAM_SECRET_ACCESS_KEY")
            .map_err(|_| ConfigError::Missing("CVRELAY_UPSTREAM_SECRET_ACCESS_KEY"))?;
        let api_key_encryption_key = std::env::var("CVRELAY_API_KEY_ENCRYPTION_KEY")
            .map_err(|_| ConfigError::Missing("CVRELAY_API_KEY_ENCRYPTION_KEY"))?;

        Ok(Self {
            listen_addr,
            upstream_base_url,
            upstream_access_key_id,
            upstream_secret_access_key,
            upstream_region: std::env::var("CVRELAY_UPSTREAM_REGION")
                .unwrap_or_else(|_| default_region()),
            upstream_service: std::env::var("CVRELAY_UPSTREAM_SERVICE")
                .unwrap_or_else(|_| default_service()),
            database_url: std::env::var("CVRELAY_DATABASE_URL")
                .unwrap_or_else(|_| default_database_url()),
            api_key_encryption_key: decode_encryption_key_bytes(&api_key_encryption_key)
                .map(Zeroizing::new)
                .map_err(ConfigError::Parse)?,
            max_in_flight: std::env::var("CVRELAY_MAX_IN_FLIGHT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_max_in_flight),
            max_queue_depth: std::env::var("CVRELAY_MAX_QUEUE_DEPTH")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_max_queue_depth),
            submit_min_interval_ms: std::env::var("CVRELAY_SUBMIT_MIN_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_submit_min_interval_ms),
            max_retries: std::env::var("CVRELAY_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_max_retries),
            retry_base_delay_ms: std::env::var("CVRELAY_RETRY_BASE_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_retry_base_delay_ms),
            retry_max_delay_ms: std::env::var("CVRELAY_RETRY_MAX_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_retry_max_delay_ms),
            max_body_bytes: std::env::var("CVRELAY_MAX_BODY_BYTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_max_body_bytes),
            max_clock_skew_secs: std::env::var("CVRELAY_MAX_CLOCK_SKEW_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_max_clock_skew_secs),
            idempotency_ttl_secs: std::env::var("CVRELAY_IDEMPOTENCY_TTL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_idempotency_ttl_secs),
            upstream_timeout_ms: std::env::var("CVRELAY_UPSTREAM_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_upstream_timeout_ms),
        })
    }

    /// Load configuration from file if an explicit path or a well-known
    /// default location resolves, otherwise fall back to environment
    /// variables.
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(path) = std::env::var("CVRELAY_CONFIG") {
            return Self::from_file(&path);
        }

        for path in &["cvrelay.toml", "/etc/cvrelay/config.toml"] {
            if std::path::Path::new(path).exists() {
                return Self::from_file(path);
            }
        }

        Self::from_env()
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("missing required environment variable: {0}")]
    Missing(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_toml() {
        let toml = r#"
            upstream_base_url = "https://vision.internal"
            upstream_access_key_id = "AKIDEXAMPLE"
            upstream_secret_access_key = "secret"
            api_key_encryption_key = "MDEyMzQ1Njc4OTAxMjM0NTY3ODkwMTIzNDU2Nzg5MDE="
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.listen_addr.port(), 8443);
        assert_eq!(config.max_in_flight, 8);
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.retry_base_delay_ms, 200);
        assert_eq!(config.retry_max_delay_ms, 2_000);
    }

    #[test]
    fn overrides_defaults() {
        let toml = r#"
            listen_addr = "0.0.0.0:9100"
            upstream_base_url = "https://vision.internal"
            upstream_access_key_id = "AKIDEXAMPLE"
            upstream_secret_access_key = "secret"
            api_key_encryption_key = "MDEyMzQ1Njc4OTAxMjM0NTY3ODkwMTIzNDU2Nzg5MDE="
            max_in_flight = 16
            submit_min_interval_ms = 250
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.listen_addr.port(), 9100);
        assert_eq!(config.max_in_flight, 16);
        assert_eq!(config.submit_min_interval_ms, 250);
    }

    #[test]
    fn encryption_key_decodes_to_32_raw_bytes() {
        let toml = r#"
            upstream_base_url = "https://vision.internal"
            upstream_access_key_id = "AKIDEXAMPLE"
            upstream_secret_access_key = "secret"
            api_key_encryption_key = "MDEyMzQ1Njc4OTAxMjM0NTY3ODkwMTIzNDU2Nzg5MDE="
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.api_key_encryption_key.as_slice(), b"01234567890123456789012345678901");
    }

    #[test]
    fn encryption_key_of_wrong_length_is_rejected() {
        let toml = r#"
            upstream_base_url = "https://vision.internal"
            upstream_access_key_id = "AKIDEXAMPLE"
            upstream_secret_access_key = "secret"
            api_key_encryption_key = "dG9vc2hvcnQ="
        "#;

        assert!(toml::from_str::<Config>(toml).is_err());
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let toml = r#"
            upstream_base_url = "https://vision.internal"
            upstream_access_key_id = "AKIDEXAMPLE"
            upstream_secret_access_key = "super-secret-value"
            api_key_encryption_key = "MDEyMzQ1Njc4OTAxMjM0NTY3ODkwMTIzNDU2Nzg5MDE="
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        let debug_output = format!("{config:?}");
        assert!(!debug_output.contains("super-secret-value"));
        assert!(!debug_output.contains("MDEyMzQ1Njc4OTAxMjM0NTY3ODkwMTIzNDU2Nzg5MDE="));
    }
}
