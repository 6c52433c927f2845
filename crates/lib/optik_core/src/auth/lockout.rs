//! Account lockout after repeated failed logins.
//!
//! The per-account failure counter lives on the credential record and is
//! only ever changed through the store's atomic increment/reset. Concurrent
//! failures may overshoot the threshold by a few before every request sees
//! the lock; they can never be lost.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use super::credentials::CredentialStore;
use super::{AuthError, timed};
use crate::clock::SharedClock;
use crate::models::auth::Credential;
use crate::store::{SharedStateStore, keys};

pub struct AccountLockoutTracker {
    credentials: Arc<dyn CredentialStore>,
    counters: Arc<dyn SharedStateStore>,
    clock: SharedClock,
    threshold: u32,
    lockout: Duration,
    timeout: Duration,
}

impl AccountLockoutTracker {
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        counters: Arc<dyn SharedStateStore>,
        clock: SharedClock,
        threshold: u32,
        lockout: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            credentials,
            counters,
            clock,
            threshold,
            lockout,
            timeout,
        }
    }

    /// True iff the credential carries a lock that has not yet passed.
    pub fn is_locked(&self, credential: &Credential) -> bool {
        credential
            .locked_until
            .is_some_and(|until| until > self.clock.now())
    }

    /// Look the user up and report whether they are locked out.
    pub async fn is_user_locked(&self, user_id: Uuid) -> Result<bool, AuthError> {
        let credential = timed(
            "lockout check",
            self.timeout,
            self.credentials.find_by_id(user_id),
        )
        .await?;
        Ok(credential.is_some_and(|c| self.is_locked(&c)))
    }

    /// Count a failed attempt, locking the account once the threshold is hit.
    ///
    /// A failure after an earlier lock has run out starts a fresh budget.
    /// Returns the failure count after this attempt.
    pub async fn record_failure(&self, credential: &Credential) -> Result<i32, AuthError> {
        let user_id = credential.user_id;
        let now = self.clock.now();
        let attempts = timed(
            "failure increment",
            self.timeout,
            self.credentials.increment_failure(user_id, now),
        )
        .await?;

        if attempts >= self.threshold_i32() {
            let until = self.lock_deadline(now)?;
            timed(
                "lock write",
                self.timeout,
                self.credentials.set_lock(user_id, until),
            )
            .await?;
            warn!(
                %user_id,
                attempts,
                locked_until = %until,
                "account locked after repeated login failures"
            );
        }
        Ok(attempts)
    }

    /// Reset the failure counter after a successful login.
    pub async fn record_success(&self, credential: &Credential) -> Result<(), AuthError> {
        if credential.failed_attempts > 0 || credential.locked_until.is_some() {
            info!(
                user_id = %credential.user_id,
                previous_failures = credential.failed_attempts,
                "clearing login failures"
            );
        }
        timed(
            "failure reset",
            self.timeout,
            self.credentials.reset_failure(credential.user_id),
        )
        .await
    }

    /// Count a failure from `source` in `login_attempts:<source>`, which
    /// expires one lockout window after the first failure.
    pub async fn record_source_failure(&self, source: &str) -> Result<i64, AuthError> {
        let key = keys::login_attempts(source);
        let count = timed("source counter", self.timeout, self.counters.incr(&key)).await?;
        if count == 1 {
            timed(
                "source counter expiry",
                self.timeout,
                self.counters.expire(&key, self.lockout),
            )
            .await?;
        }
        if self.threshold > 0 && count % i64::from(self.threshold) == 0 {
            warn!(source, failures = count, "repeated login failures from one source");
        }
        Ok(count)
    }

    /// Failures counted for `source` in the current window.
    pub async fn source_failures(&self, source: &str) -> Result<i64, AuthError> {
        let value = timed(
            "source counter read",
            self.timeout,
            self.counters.get(&keys::login_attempts(source)),
        )
        .await?;
        Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    fn threshold_i32(&self) -> i32 {
        i32::try_from(self.threshold).unwrap_or(i32::MAX)
    }

    fn lock_deadline(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, AuthError> {
        chrono::Duration::from_std(self.lockout)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .ok_or_else(|| AuthError::Internal("lockout duration out of range".into()))
    }
}
