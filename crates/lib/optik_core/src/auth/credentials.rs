//! Credential lookup and lockout bookkeeping.
//!
//! Every method is a single atomic row operation. Callers never assume a
//! transaction spans two calls.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use super::AuthError;
use crate::models::auth::Credential;

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Fetch the credential for `user_code` at the store with `store_code`.
    async fn find_by_identity(
        &self,
        user_code: &str,
        store_code: &str,
    ) -> Result<Option<Credential>, AuthError>;

    async fn find_by_id(&self, user_id: Uuid) -> Result<Option<Credential>, AuthError>;

    /// Atomically bump the failure counter, returning the new count.
    ///
    /// If the record carries a lock that has passed by `now`, the lock is
    /// cleared and counting restarts at 1 in the same operation.
    async fn increment_failure(&self, user_id: Uuid, now: DateTime<Utc>)
    -> Result<i32, AuthError>;

    async fn set_lock(&self, user_id: Uuid, until: DateTime<Utc>) -> Result<(), AuthError>;

    /// Zero the failure counter and clear any lock.
    async fn reset_failure(&self, user_id: Uuid) -> Result<(), AuthError>;

    async fn update_last_login(&self, user_id: Uuid, at: DateTime<Utc>) -> Result<(), AuthError>;
}

/// In-process [`CredentialStore`].
#[derive(Clone, Default)]
pub struct MemoryCredentialStore {
    users: Arc<DashMap<Uuid, Credential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a credential.
    pub fn insert(&self, credential: Credential) {
        self.users.insert(credential.user_id, credential);
    }

    pub fn set_active(&self, user_id: Uuid, active: bool) {
        if let Some(mut user) = self.users.get_mut(&user_id) {
            user.is_active = active;
        }
    }

    fn update<T>(
        &self,
        user_id: Uuid,
        f: impl FnOnce(&mut Credential) -> T,
    ) -> Result<T, AuthError> {
        self.users
            .get_mut(&user_id)
            .map(|mut user| f(user.value_mut()))
            .ok_or_else(|| AuthError::Internal(format!("no credential for user {user_id}")))
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn find_by_identity(
        &self,
        user_code: &str,
        store_code: &str,
    ) -> Result<Option<Credential>, AuthError> {
        Ok(self
            .users
            .iter()
            .find(|u| u.user_code == user_code && u.store_code == store_code)
            .map(|u| u.clone()))
    }

    async fn find_by_id(&self, user_id: Uuid) -> Result<Option<Credential>, AuthError> {
        Ok(self.users.get(&user_id).map(|u| u.clone()))
    }

    async fn increment_failure(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<i32, AuthError> {
        self.update(user_id, |user| {
            if user.locked_until.is_some_and(|until| until <= now) {
                user.locked_until = None;
                user.failed_attempts = 0;
            }
            user.failed_attempts += 1;
            user.failed_attempts
        })
    }

    async fn set_lock(&self, user_id: Uuid, until: DateTime<Utc>) -> Result<(), AuthError> {
        self.update(user_id, |user| user.locked_until = Some(until))
    }

    async fn reset_failure(&self, user_id: Uuid) -> Result<(), AuthError> {
        self.update(user_id, |user| {
            user.failed_attempts = 0;
            user.locked_until = None;
        })
    }

    async fn update_last_login(&self, user_id: Uuid, at: DateTime<Utc>) -> Result<(), AuthError> {
        self.update(user_id, |user| user.last_login_at = Some(at))
    }
}
