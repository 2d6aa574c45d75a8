//! API key lookup. The relay treats keys as read-only; creation/rotation
//! happens out of band (no HTTP CRUD surface is exposed by this crate).

use crate::types::ApiKey;
use async_trait::async_trait;
use sqlx::SqlitePool;

#[derive(Debug, thiserror::Error)]
pub enum KeyStoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub trait ApiKeyStore: Send + Sync {
    async fn find_by_access_key(&self, access_key: &str) -> Result<Option<ApiKey>, KeyStoreError>;
}

#[derive(Clone)]
pub struct SqliteApiKeyStore {
    pool: SqlitePool,
}

impl SqliteApiKeyStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Test/bootstrap helper: insert an active key directly. Not exposed
    /// over HTTP — key management is an external collaborator.
    #[cfg(any(test, feature = "test-util"))]
    pub async fn seed_active_key(
        &self,
        id: &str,
        access_key: &str,
        secret_ciphertext: &[u8],
        secret_nonce: &[u8],
        secret_hash: &str,
    ) -> Result<(), KeyStoreError> {
        let now = chrono::Utc::now();
        sqlx::query(
            "INSERT INTO api_keys (id, access_key, secret_ciphertext, secret_nonce, secret_hash, status, expires_at, revoked_at, created_at, updated_at, rotation_of)
             VALUES (?, ?, ?, ?, ?, 'active', NULL, NULL, ?, ?, NULL)",
        )
        .bind(id)
        .bind(access_key)
        .bind(secret_ciphertext)
        .bind(secret_nonce)
        .bind(secret_hash)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ApiKeyStore for SqliteApiKeyStore {
    async fn find_by_access_key(&self, access_key: &str) -> Result<Option<ApiKey>, KeyStoreError> {
        let key = sqlx::query_as::<_, ApiKey>(
            "SELECT id, access_key, secret_ciphertext, secret_nonce, secret_hash, status,
                    expires_at, revoked_at, created_at, updated_at, rotation_of
             FROM api_keys WHERE access_key = ?",
        )
        .bind(access_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(key)
    }
}

#[async_trait]
impl ApiKeyStore for Box<dyn ApiKeyStore> {
    async fn find_by_access_key(&self, access_key: &str) -> Result<Option<ApiKey>, KeyStoreError> {
        (**self).find_by_access_key(access_key).await
    }
}
