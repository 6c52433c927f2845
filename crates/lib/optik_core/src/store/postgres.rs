//! Shared state in the `shared_state` table.
//!
//! Every operation is a single statement, so increments and overwrites are
//! atomic per key without application-level locking. Rows whose
//! `expires_at` has passed are treated as absent and reaped by
//! [`SharedStateStore::purge_expired`].

use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;

use super::{SharedStateStore, StoreError};

/// PostgreSQL-backed [`SharedStateStore`].
#[derive(Clone, Debug)]
pub struct PgSharedStore {
    pool: PgPool,
}

impl PgSharedStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SharedStateStore for PgSharedStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let value = sqlx::query_scalar::<_, String>(
            "SELECT value FROM shared_state \
             WHERE key = $1 AND (expires_at IS NULL OR expires_at > now())",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(value)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO shared_state (key, value, expires_at) \
             VALUES ($1, $2, now() + make_interval(secs => $3)) \
             ON CONFLICT (key) DO UPDATE \
             SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at",
        )
        .bind(key)
        .bind(value)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let removed = sqlx::query_scalar::<_, bool>(
            "DELETE FROM shared_state WHERE key = $1 \
             RETURNING (expires_at IS NULL OR expires_at > now())",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(removed.unwrap_or(false))
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM shared_state \
             WHERE key = $1 AND (expires_at IS NULL OR expires_at > now()))",
        )
        .bind(key)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        // An expired row restarts at 1 with no expiry, as if it never existed.
        let value = sqlx::query_scalar::<_, String>(
            "INSERT INTO shared_state (key, value, expires_at) VALUES ($1, '1', NULL) \
             ON CONFLICT (key) DO UPDATE SET \
               value = CASE \
                 WHEN shared_state.expires_at IS NOT NULL AND shared_state.expires_at <= now() \
                   THEN '1' \
                 ELSE (shared_state.value::bigint + 1)::text \
               END, \
               expires_at = CASE \
                 WHEN shared_state.expires_at IS NOT NULL AND shared_state.expires_at <= now() \
                   THEN NULL \
                 ELSE shared_state.expires_at \
               END \
             RETURNING value",
        )
        .bind(key)
        .fetch_one(&self.pool)
        .await?;
        value.parse().map_err(|_| StoreError::NotAnInteger {
            key: key.to_string(),
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE shared_state SET expires_at = now() + make_interval(secs => $2) \
             WHERE key = $1 AND (expires_at IS NULL OR expires_at > now())",
        )
        .bind(key)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let millis = sqlx::query_scalar::<_, i64>(
            "SELECT (EXTRACT(EPOCH FROM (expires_at - now())) * 1000)::bigint \
             FROM shared_state WHERE key = $1 AND expires_at > now()",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(millis
            .and_then(|ms| u64::try_from(ms).ok())
            .map(Duration::from_millis))
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM shared_state WHERE expires_at IS NOT NULL AND expires_at <= now()",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
