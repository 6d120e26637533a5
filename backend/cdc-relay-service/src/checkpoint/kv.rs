use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{RelayError, Result};

/// Byte-oriented durable key/value store.
///
/// Not self-locking: concurrent writers to one key must be prevented by the
/// caller (the collection lease).
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn put(&self, key: &str, value: &[u8]) -> Result<()>;
}

/// Redis-backed store; shares the connection manager with the lock backend.
#[derive(Clone)]
pub struct RedisKvStore {
    conn: ConnectionManager,
}

impl RedisKvStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(key).await.map_err(|e| {
            error!("Failed to read key {} from Redis: {}", key, e);
            RelayError::Redis(e)
        })?;
        Ok(value)
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, value).await.map_err(|e| {
            error!("Failed to write key {} to Redis: {}", key, e);
            RelayError::Redis(e)
        })?;
        debug!(key = %key, bytes = value.len(), "Stored value in Redis");
        Ok(())
    }
}

/// Postgres-backed store.
///
/// Schema:
/// ```sql
/// CREATE TABLE IF NOT EXISTS cdc_relay_offsets (
///     offset_key VARCHAR(512) PRIMARY KEY,
///     offset_value BYTEA NOT NULL,
///     updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
/// );
/// ```
#[derive(Clone)]
pub struct PgKvStore {
    pool: PgPool,
}

impl PgKvStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the offsets table (idempotent)
    pub async fn initialize(&self) -> Result<()> {
        info!("Initializing CDC relay offset table");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cdc_relay_offsets (
                offset_key VARCHAR(512) PRIMARY KEY,
                offset_value BYTEA NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to create cdc_relay_offsets table: {}", e);
            RelayError::Database(e)
        })?;

        Ok(())
    }
}

#[async_trait]
impl KvStore for PgKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let value = sqlx::query_scalar::<_, Vec<u8>>(
            r#"
            SELECT offset_value FROM cdc_relay_offsets
            WHERE offset_key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to read offset {}: {}", key, e);
            RelayError::Database(e)
        })?;

        Ok(value)
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cdc_relay_offsets (offset_key, offset_value, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (offset_key)
            DO UPDATE SET
                offset_value = EXCLUDED.offset_value,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(chrono::Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to save offset {}: {}", key, e);
            RelayError::Database(e)
        })?;

        debug!(key = %key, "Saved offset to Postgres");
        Ok(())
    }
}

/// In-process store for tests and single-node runs.
#[derive(Clone, Default)]
pub struct MemoryKvStore {
    entries: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    fail_writes: Arc<std::sync::atomic::AtomicBool>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `put` fail, simulating an unavailable store.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
            warn!(key = %key, "Memory store rejecting write");
            return Err(RelayError::Checkpoint(format!(
                "store unavailable for key {}",
                key
            )));
        }
        self.entries
            .lock()
            .await
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryKvStore::new();
        assert_eq!(store.get("a").await.unwrap(), None);

        store.put("a", b"1").await.unwrap();
        store.put("a", b"2").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(b"2".to_vec()));
        assert_eq!(store.keys().await, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_memory_store_write_failure() {
        let store = MemoryKvStore::new();
        store.set_fail_writes(true);
        assert!(store.put("a", b"1").await.is_err());
        store.set_fail_writes(false);
        assert!(store.put("a", b"1").await.is_ok());
    }

    // Note: requires a running PostgreSQL instance
    #[tokio::test]
    #[ignore] // Requires database
    async fn test_pg_store_upsert() {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgresql://localhost/nova_test".to_string());
        let pool = PgPool::connect(&database_url)
            .await
            .expect("Failed to connect to test database");
        let store = PgKvStore::new(pool.clone());
        store.initialize().await.unwrap();

        store.put("test:conn1-coll1", b"{\"0\":10}").await.unwrap();
        store.put("test:conn1-coll1", b"{\"0\":20}").await.unwrap();
        assert_eq!(
            store.get("test:conn1-coll1").await.unwrap(),
            Some(b"{\"0\":20}".to_vec())
        );

        sqlx::query("DELETE FROM cdc_relay_offsets WHERE offset_key = 'test:conn1-coll1'")
            .execute(&pool)
            .await
            .unwrap();
    }
}
