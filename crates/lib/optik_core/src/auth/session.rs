//! Server-side session tracking.
//!
//! A session binds a refresh token's `jti` to the device that logged in.
//! Sessions are capped per user; creating one beyond the cap deactivates the
//! oldest. Inactive and expired sessions look exactly like missing ones.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::distr::Alphanumeric;
use rand::{Rng, rng};
use tracing::{debug, info};
use uuid::Uuid;

use super::jwt::new_jti;
use super::{AuthError, timed};
use crate::clock::SharedClock;
use crate::models::auth::{DeviceInfo, Session};

/// Persistence for sessions.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn insert(&self, session: &Session) -> Result<(), AuthError>;

    async fn find(&self, session_id: &str) -> Result<Option<Session>, AuthError>;

    async fn touch(&self, session_id: &str, at: DateTime<Utc>) -> Result<(), AuthError>;

    async fn set_refresh_jti(&self, session_id: &str, jti: &str) -> Result<(), AuthError>;

    /// Returns whether an active session was deactivated.
    async fn deactivate(&self, session_id: &str) -> Result<bool, AuthError>;

    /// Deactivate all of a user's sessions except `except`.
    async fn deactivate_all(&self, user_id: Uuid, except: Option<&str>)
    -> Result<u64, AuthError>;

    /// Active, unexpired sessions of a user, newest first.
    async fn list_live(&self, user_id: Uuid, now: DateTime<Utc>)
    -> Result<Vec<Session>, AuthError>;

    /// Delete sessions that are inactive or expired.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, AuthError>;
}

/// Generate an opaque session ID (64 alphanumeric chars).
fn generate_session_id() -> String {
    rng()
        .sample_iter(&Alphanumeric)
        .take(64)
        .map(char::from)
        .collect()
}

pub struct SessionRegistry {
    repo: Arc<dyn SessionRepository>,
    clock: SharedClock,
    lifetime: Duration,
    max_sessions: usize,
    timeout: Duration,
}

impl SessionRegistry {
    pub fn new(
        repo: Arc<dyn SessionRepository>,
        clock: SharedClock,
        lifetime: Duration,
        max_sessions: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            repo,
            clock,
            lifetime,
            max_sessions,
            timeout,
        }
    }

    /// Open a session for `user_id` with a fresh refresh `jti`, then evict the
    /// oldest sessions beyond the cap.
    pub async fn create(&self, user_id: Uuid, device: DeviceInfo) -> Result<Session, AuthError> {
        let now = self.clock.now();
        let expires_at = chrono::Duration::from_std(self.lifetime)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .ok_or_else(|| AuthError::Internal("session lifetime out of range".into()))?;
        let session = Session {
            id: generate_session_id(),
            user_id,
            refresh_jti: new_jti(),
            device,
            created_at: now,
            last_activity_at: now,
            expires_at,
            is_active: true,
        };
        timed("session insert", self.timeout, self.repo.insert(&session)).await?;
        info!(
            %user_id,
            device = session.device.kind.as_str(),
            source = %session.device.source_addr,
            "session created"
        );
        self.evict_oldest_beyond_cap(user_id, self.max_sessions, Some(&session.id))
            .await?;
        Ok(session)
    }

    /// Return the session if it is active and unexpired, recording activity.
    pub async fn validate(&self, session_id: &str) -> Result<Option<Session>, AuthError> {
        let now = self.clock.now();
        let found = timed("session lookup", self.timeout, self.repo.find(session_id)).await?;
        let Some(mut session) = found.filter(|s| s.is_live(now)) else {
            debug!("session missing, revoked or expired");
            return Ok(None);
        };
        timed("session touch", self.timeout, self.repo.touch(session_id, now)).await?;
        session.last_activity_at = now;
        Ok(Some(session))
    }

    /// Bind the session to the refresh token carrying `jti`.
    pub async fn bind_refresh_jti(&self, session_id: &str, jti: &str) -> Result<(), AuthError> {
        timed(
            "session jti update",
            self.timeout,
            self.repo.set_refresh_jti(session_id, jti),
        )
        .await
    }

    pub async fn revoke(&self, session_id: &str) -> Result<bool, AuthError> {
        timed("session revoke", self.timeout, self.repo.deactivate(session_id)).await
    }

    pub async fn revoke_all(&self, user_id: Uuid, except: Option<&str>) -> Result<u64, AuthError> {
        let revoked = timed(
            "session revoke all",
            self.timeout,
            self.repo.deactivate_all(user_id, except),
        )
        .await?;
        info!(%user_id, revoked, "sessions revoked");
        Ok(revoked)
    }

    /// Live sessions of a user, newest first.
    pub async fn list(&self, user_id: Uuid) -> Result<Vec<Session>, AuthError> {
        let now = self.clock.now();
        timed("session list", self.timeout, self.repo.list_live(user_id, now)).await
    }

    /// Deactivate the oldest live sessions so at most `max_sessions` remain.
    /// `keep` is never evicted and counts towards the cap.
    pub async fn evict_oldest_beyond_cap(
        &self,
        user_id: Uuid,
        max_sessions: usize,
        keep: Option<&str>,
    ) -> Result<u64, AuthError> {
        let live = self.list(user_id).await?;
        let kept = keep.is_some_and(|id| live.iter().any(|s| s.id == id));
        let others = live.iter().filter(|s| Some(s.id.as_str()) != keep);
        let mut evicted = 0;
        for session in others.skip(max_sessions.saturating_sub(usize::from(kept))) {
            if self.revoke(&session.id).await? {
                evicted += 1;
            }
        }
        if evicted > 0 {
            info!(%user_id, evicted, "evicted sessions beyond cap");
        }
        Ok(evicted)
    }

    pub async fn purge_expired(&self) -> Result<u64, AuthError> {
        let now = self.clock.now();
        timed("session purge", self.timeout, self.repo.purge_expired(now)).await
    }
}

/// In-process [`SessionRepository`].
#[derive(Clone, Default)]
pub struct MemorySessionRepository {
    sessions: Arc<DashMap<String, Session>>,
}

impl MemorySessionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionRepository for MemorySessionRepository {
    async fn insert(&self, session: &Session) -> Result<(), AuthError> {
        self.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn find(&self, session_id: &str) -> Result<Option<Session>, AuthError> {
        Ok(self.sessions.get(session_id).map(|s| s.clone()))
    }

    async fn touch(&self, session_id: &str, at: DateTime<Utc>) -> Result<(), AuthError> {
        if let Some(mut s) = self.sessions.get_mut(session_id) {
            s.last_activity_at = at;
        }
        Ok(())
    }

    async fn set_refresh_jti(&self, session_id: &str, jti: &str) -> Result<(), AuthError> {
        if let Some(mut s) = self.sessions.get_mut(session_id) {
            s.refresh_jti = jti.to_string();
        }
        Ok(())
    }

    async fn deactivate(&self, session_id: &str) -> Result<bool, AuthError> {
        Ok(self
            .sessions
            .get_mut(session_id)
            .map(|mut s| std::mem::replace(&mut s.is_active, false))
            .unwrap_or(false))
    }

    async fn deactivate_all(
        &self,
        user_id: Uuid,
        except: Option<&str>,
    ) -> Result<u64, AuthError> {
        let mut count = 0;
        for mut s in self.sessions.iter_mut() {
            if s.user_id == user_id && s.is_active && except != Some(s.id.as_str()) {
                s.is_active = false;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn list_live(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<Session>, AuthError> {
        let mut live: Vec<Session> = self
            .sessions
            .iter()
            .filter(|s| s.user_id == user_id && s.is_live(now))
            .map(|s| s.clone())
            .collect();
        live.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(live)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, AuthError> {
        let before = self.sessions.len();
        self.sessions.retain(|_, s| s.is_live(now));
        Ok(before.saturating_sub(self.sessions.len()) as u64)
    }
}
