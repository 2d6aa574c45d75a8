//! SQLite pool construction and schema bootstrap for the persistence
//! layer (API keys, audit chain, idempotency records).

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;

/// Connect to `database_url`, creating the file if needed, and apply the
/// schema. Mirrors the teacher's `SqliteKeyManager::new` convention of
/// running `CREATE TABLE IF NOT EXISTS` at startup rather than a
/// separate migration step.
pub async fn connect(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new().max_connections(8).connect_with(options).await?;

    for statement in include_str!("../migrations/0001_init.sql").split(';') {
        let statement = statement.trim();
        if statement.is_empty() {
            continue;
        }
        sqlx::query(statement).execute(&pool).await?;
    }

    Ok(pool)
}
