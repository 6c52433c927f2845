//! Single-slot refresh token storage.
//!
//! Each user has at most one valid refresh token. Storing a new one silently
//! replaces the old, which is what makes rotation invalidate predecessors;
//! concurrent rotations end with whichever write landed last.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use super::{AuthError, timed};
use crate::store::{SharedStateStore, keys};

#[derive(Clone)]
pub struct RefreshTokenStore {
    store: Arc<dyn SharedStateStore>,
    ttl: Duration,
    timeout: Duration,
}

impl RefreshTokenStore {
    pub fn new(store: Arc<dyn SharedStateStore>, ttl: Duration, timeout: Duration) -> Self {
        Self {
            store,
            ttl,
            timeout,
        }
    }

    pub async fn store(&self, user_id: Uuid, token: &str) -> Result<(), AuthError> {
        timed(
            "refresh token write",
            self.timeout,
            self.store
                .set_with_ttl(&keys::refresh_token(user_id), token, self.ttl),
        )
        .await
    }

    pub async fn get(&self, user_id: Uuid) -> Result<Option<String>, AuthError> {
        timed(
            "refresh token read",
            self.timeout,
            self.store.get(&keys::refresh_token(user_id)),
        )
        .await
    }

    /// Whether `token` is byte-identical to the stored one.
    pub async fn matches(&self, user_id: Uuid, token: &str) -> Result<bool, AuthError> {
        Ok(self
            .get(user_id)
            .await?
            .is_some_and(|stored| stored.as_bytes() == token.as_bytes()))
    }

    /// Returns whether a token was stored.
    pub async fn revoke(&self, user_id: Uuid) -> Result<bool, AuthError> {
        timed(
            "refresh token delete",
            self.timeout,
            self.store.delete(&keys::refresh_token(user_id)),
        )
        .await
    }
}
