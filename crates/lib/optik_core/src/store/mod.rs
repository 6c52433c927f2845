//! Shared key/value state with TTL semantics.
//!
//! Failure counters, the token blacklist, refresh-token slots and rate-limit
//! buckets all live behind [`SharedStateStore`]. Production deployments use
//! [`postgres::PgSharedStore`] so every process sees the same values;
//! [`memory::MemoryStore`] serves as the in-process fallback and test double.

pub mod memory;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryStore;
pub use postgres::PgSharedStore;

/// Errors raised by a shared state backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("Stored value for '{key}' is not an integer")]
    NotAnInteger { key: String },

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Key/value store with per-key expiry and atomic counters.
///
/// An expired key is indistinguishable from a missing one for every operation.
#[async_trait]
pub trait SharedStateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Overwrite `key` with `value`, expiring after `ttl`.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Returns whether a live key was removed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Atomically increment an integer counter, creating it at 1 without expiry.
    async fn incr(&self, key: &str) -> Result<i64, StoreError>;

    /// Set the expiry of a live key. Returns false when the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Remaining lifetime of a live key that carries an expiry.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError>;

    /// Drop expired entries. Returns how many were removed.
    async fn purge_expired(&self) -> Result<u64, StoreError>;
}

/// Key layout shared with every deployment of the back-office.
pub mod keys {
    use super::Uuid;

    pub fn refresh_token(user_id: Uuid) -> String {
        format!("refresh_token:{user_id}")
    }

    pub fn blacklist(token: &str) -> String {
        format!("blacklist:{token}")
    }

    pub fn login_attempts(identifier: &str) -> String {
        format!("login_attempts:{identifier}")
    }

    /// Counter key for a rate-limit bucket.
    pub fn rate_limit(prefix: &str, key: &str) -> String {
        format!("{prefix}:{key}")
    }

    /// Marker key for a bucket serving an extended block.
    pub fn rate_limit_block(prefix: &str, key: &str) -> String {
        format!("{prefix}:blocked:{key}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout_is_stable() {
        let id = Uuid::nil();
        assert_eq!(
            keys::refresh_token(id),
            "refresh_token:00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(keys::blacklist("abc.def"), "blacklist:abc.def");
        assert_eq!(keys::login_attempts("10.0.0.1"), "login_attempts:10.0.0.1");
        assert_eq!(keys::rate_limit("api_limit", "10.0.0.1"), "api_limit:10.0.0.1");
        assert_eq!(
            keys::rate_limit_block("login_limit", "k"),
            "login_limit:blocked:k"
        );
    }
}
