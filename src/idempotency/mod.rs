//! Idempotency Service: resolve-or-store a submit response by
//! `Idempotency-Key` + request-body hash, giving exactly-once semantics
//! for submit replays.

use crate::types::IdempotencyRecord;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;

#[derive(Debug, thiserror::Error)]
pub enum IdempotencyError {
    #[error("idempotency store error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Outcome of probing the store for a previously seen key.
pub enum IdempotencyLookup {
    /// No prior record; proceed and record the response after success.
    Miss,
    /// A live, hash-matching record exists; replay it byte-for-byte.
    Replay {
        status: u16,
        content_type: String,
        body: String,
    },
    /// A record exists but is expired or was written for a different
    /// body — VALIDATION_FAILED.
    Invalid,
}

#[derive(Clone)]
pub struct IdempotencyService {
    pool: SqlitePool,
}

impl IdempotencyService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn hash_body(body: &[u8]) -> String {
        hex::encode(Sha256::digest(body))
    }

    pub async fn lookup(&self, key: &str, body_hash: &str) -> Result<IdempotencyLookup, IdempotencyError> {
        let record = sqlx::query_as::<_, IdempotencyRecord>(
            "SELECT idempotency_key, request_hash, response_status, response_content_type, response_body, created_at, expires_at
             FROM idempotency_records WHERE idempotency_key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        let Some(record) = record else {
            return Ok(IdempotencyLookup::Miss);
        };

        if record.expires_at <= Utc::now() || record.request_hash != body_hash {
            return Ok(IdempotencyLookup::Invalid);
        }

        Ok(IdempotencyLookup::Replay {
            status: record.response_status as u16,
            content_type: record.response_content_type,
            body: record.response_body,
        })
    }

    pub async fn store(
        &self,
        key: &str,
        body_hash: &str,
        status: u16,
        content_type: &str,
        body: &str,
        ttl: chrono::Duration,
    ) -> Result<(), IdempotencyError> {
        let now: DateTime<Utc> = Utc::now();
        let expires_at = now + ttl;
        sqlx::query(
            "INSERT INTO idempotency_records
                (idempotency_key, request_hash, response_status, response_content_type, response_body, created_at, expires_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(idempotency_key) DO NOTHING",
        )
        .bind(key)
        .bind(body_hash)
        .bind(status as i64)
        .bind(content_type)
        .bind(body)
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
