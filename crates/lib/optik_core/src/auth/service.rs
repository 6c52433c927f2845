//! The authentication orchestrator.
//!
//! Login runs rate limit → credential lookup → lock check → active check →
//! password verify → attempt record → session create → token issue. Every
//! failure branch writes a login attempt with its reason before returning.

use std::sync::Arc;

use sqlx::PgPool;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::attempts::{LoginAttemptLog, MemoryAttemptLog};
use super::blacklist::TokenBlacklist;
use super::credentials::{CredentialStore, MemoryCredentialStore};
use super::jwt::{TokenIssuer, new_jti};
use super::lockout::AccountLockoutTracker;
use super::password::PasswordHasher;
use super::queries::{PgCredentialStore, PgLoginAttemptLog, PgSessionRepository};
use super::refresh::RefreshTokenStore;
use super::session::{MemorySessionRepository, SessionRegistry, SessionRepository};
use super::{AuthError, AuthRejection, AuthResult, timed};
use crate::clock::SharedClock;
use crate::config::AuthConfig;
use crate::models::auth::{
    Credential, DeviceInfo, FailureReason, LoginAttempt, Session, TokenClaims, TokenPair,
    TokenSubject, UserProfile,
};
use crate::rate_limit::{RateLimitDecision, RateLimitTier, RateLimiter, login_key};
use crate::store::{MemoryStore, PgSharedStore, SharedStateStore};

/// Credentials presented at login.
#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub user_code: String,
    pub store_code: String,
    pub password: String,
}

/// A successful login.
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub tokens: TokenPair,
    pub user: UserProfile,
    pub session_id: String,
}

/// What a housekeeping sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub shared_keys: u64,
    pub sessions: u64,
}

/// The collaborators an [`AuthService`] runs against.
pub struct AuthBackends {
    pub credentials: Arc<dyn CredentialStore>,
    pub attempts: Arc<dyn LoginAttemptLog>,
    pub sessions: Arc<dyn SessionRepository>,
    pub shared: Arc<dyn SharedStateStore>,
    pub limiter: RateLimiter,
}

impl AuthBackends {
    /// Everything in PostgreSQL; rate-limit counters are shared across processes.
    pub fn postgres(pool: PgPool, config: &AuthConfig) -> Self {
        let shared: Arc<dyn SharedStateStore> = Arc::new(PgSharedStore::new(pool.clone()));
        Self {
            credentials: Arc::new(PgCredentialStore::new(pool.clone())),
            attempts: Arc::new(PgLoginAttemptLog::new(pool.clone())),
            sessions: Arc::new(PgSessionRepository::new(pool)),
            limiter: RateLimiter::shared(
                shared.clone(),
                config.rate_limits.clone(),
                config.store_timeout,
            ),
            shared,
        }
    }

    /// Everything in process memory. Nothing survives a restart.
    pub fn in_memory(
        credentials: MemoryCredentialStore,
        attempts: MemoryAttemptLog,
        clock: SharedClock,
        config: &AuthConfig,
    ) -> Self {
        Self {
            credentials: Arc::new(credentials),
            attempts: Arc::new(attempts),
            sessions: Arc::new(MemorySessionRepository::new()),
            shared: Arc::new(MemoryStore::with_clock(clock.clone())),
            limiter: RateLimiter::with_fallback(
                None,
                clock,
                config.rate_limits.clone(),
                config.store_timeout,
            ),
        }
    }
}

pub struct AuthService {
    config: AuthConfig,
    clock: SharedClock,
    hasher: PasswordHasher,
    credentials: Arc<dyn CredentialStore>,
    attempts: Arc<dyn LoginAttemptLog>,
    lockout: AccountLockoutTracker,
    tokens: TokenIssuer,
    blacklist: TokenBlacklist,
    refresh_tokens: RefreshTokenStore,
    sessions: SessionRegistry,
    shared: Arc<dyn SharedStateStore>,
    limiter: RateLimiter,
}

impl AuthService {
    pub fn new(config: AuthConfig, clock: SharedClock, backends: AuthBackends) -> Self {
        let timeout = config.store_timeout;
        let AuthBackends {
            credentials,
            attempts,
            sessions,
            shared,
            limiter,
        } = backends;
        Self {
            hasher: PasswordHasher::new(config.bcrypt_cost),
            lockout: AccountLockoutTracker::new(
                credentials.clone(),
                shared.clone(),
                clock.clone(),
                config.max_login_attempts,
                config.lockout_duration,
                timeout,
            ),
            tokens: TokenIssuer::new(&config, clock.clone()),
            blacklist: TokenBlacklist::new(shared.clone(), clock.clone(), timeout),
            refresh_tokens: RefreshTokenStore::new(shared.clone(), config.refresh_ttl, timeout),
            sessions: SessionRegistry::new(
                sessions,
                clock.clone(),
                config.refresh_ttl,
                config.max_sessions_per_user,
                timeout,
            ),
            credentials,
            attempts,
            shared,
            limiter,
            clock,
            config,
        }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Exchange user code, store code and password for a token pair.
    #[instrument(
        skip_all,
        fields(
            user_code = %request.user_code,
            store_code = %request.store_code,
            source = %device.source_addr,
        )
    )]
    pub async fn login(
        &self,
        request: &LoginRequest,
        device: DeviceInfo,
    ) -> AuthResult<LoginOutcome> {
        let key = login_key(&device.source_addr, &request.user_code, &request.store_code);
        if let RateLimitDecision::Blocked { retry_after } =
            self.limiter.consume(RateLimitTier::Login, &key).await
        {
            return Err(AuthRejection::RateLimitExceeded { retry_after });
        }

        let found = timed(
            "credential lookup",
            self.config.store_timeout,
            self.credentials
                .find_by_identity(&request.user_code, &request.store_code),
        )
        .await?;
        let Some(credential) = found else {
            return Err(self
                .reject(request, None, &device, FailureReason::UserNotFound)
                .await);
        };
        let user_id = credential.user_id;

        if self.lockout.is_locked(&credential) {
            return Err(self
                .reject(request, Some(user_id), &device, FailureReason::AccountLocked)
                .await);
        }
        if !credential.is_active {
            return Err(self
                .reject(request, Some(user_id), &device, FailureReason::AccountInactive)
                .await);
        }

        let valid = self
            .hasher
            .verify(&request.password, &credential.password_hash)
            .await?;
        if !valid {
            let rejection = self
                .reject(request, Some(user_id), &device, FailureReason::InvalidPassword)
                .await;
            self.lockout.record_failure(&credential).await?;
            return Err(rejection);
        }

        self.lockout.record_success(&credential).await?;
        let now = self.clock.now();
        timed(
            "last login update",
            self.config.store_timeout,
            self.credentials.update_last_login(user_id, now),
        )
        .await?;
        self.record_attempt(request, Some(user_id), &device, None)
            .await?;

        let session = self.sessions.create(user_id, device).await?;
        let subject = TokenSubject {
            user_id,
            user_code: credential.user_code.clone(),
            store_id: credential.store_id,
            role: credential.role,
            session_id: session.id.clone(),
        };
        let tokens = self.tokens.issue_pair(&subject, &session.refresh_jti)?;
        self.refresh_tokens
            .store(user_id, &tokens.refresh_token)
            .await?;

        let mut user = credential.profile();
        user.last_login_at = Some(now);
        info!(%user_id, role = %credential.role, "login succeeded");
        Ok(LoginOutcome {
            tokens,
            user,
            session_id: session.id,
        })
    }

    /// End the session bound to `access_token`, or every session of its user.
    ///
    /// The token must carry a valid signature but may have expired. Repeating
    /// a logout is harmless.
    #[instrument(skip_all, fields(all_sessions = all_sessions))]
    pub async fn logout(&self, access_token: &str, all_sessions: bool) -> AuthResult<()> {
        let Some(claims) = self.tokens.verify_access_allow_expired(access_token) else {
            return Err(AuthRejection::AuthenticationFailed(
                FailureReason::InvalidToken,
            ));
        };
        let user_id = claims.sub;
        self.blacklist.blacklist(access_token, claims.exp).await?;

        if all_sessions {
            self.refresh_tokens.revoke(user_id).await?;
            self.sessions.revoke_all(user_id, None).await?;
        } else {
            self.release_refresh_slot(user_id, &claims.session_id)
                .await?;
            self.sessions.revoke(&claims.session_id).await?;
        }
        info!(%user_id, session_id = %claims.session_id, all_sessions, "logged out");
        Ok(())
    }

    /// Rotate a refresh token into a new token pair.
    ///
    /// The presented token stops working: the slot now holds its successor
    /// and the session is rebound to the successor's `jti`.
    #[instrument(skip_all)]
    pub async fn refresh(&self, refresh_token: &str) -> AuthResult<TokenPair> {
        let Some(claims) = self.tokens.verify_refresh(refresh_token) else {
            return Err(AuthRejection::AuthenticationFailed(
                FailureReason::InvalidToken,
            ));
        };
        let user_id = claims.sub;

        if !self.refresh_tokens.matches(user_id, refresh_token).await? {
            debug!(%user_id, "refresh token is not the current one");
            return Err(AuthRejection::AuthenticationFailed(
                FailureReason::RefreshTokenMismatch,
            ));
        }

        let Some(session) = self.sessions.validate(&claims.session_id).await? else {
            return Err(AuthRejection::SessionExpired);
        };
        if session.refresh_jti != claims.jti {
            warn!(%user_id, session_id = %session.id, "refresh token not bound to its session");
            return Err(AuthRejection::AuthenticationFailed(
                FailureReason::RefreshTokenMismatch,
            ));
        }

        self.active_credential(user_id).await?;

        // Rebind the session only once its new refresh token is stored.
        let jti = new_jti();
        let tokens = self.tokens.reissue_pair(&claims, &jti)?;
        self.refresh_tokens
            .store(user_id, &tokens.refresh_token)
            .await?;
        self.sessions.bind_refresh_jti(&session.id, &jti).await?;
        debug!(%user_id, session_id = %session.id, "tokens rotated");
        Ok(tokens)
    }

    /// Gate for authenticated requests: a valid, unrevoked access token.
    pub async fn authenticate(&self, access_token: &str) -> AuthResult<TokenClaims> {
        let Some(claims) = self.tokens.verify_access(access_token) else {
            return Err(AuthRejection::AuthenticationFailed(
                FailureReason::InvalidToken,
            ));
        };
        if self.blacklist.is_blacklisted(access_token).await? {
            debug!(user_id = %claims.sub, "revoked token presented");
            return Err(AuthRejection::AuthenticationFailed(
                FailureReason::TokenRevoked,
            ));
        }
        Ok(claims)
    }

    /// Profile of the user behind `access_token`.
    #[instrument(skip_all)]
    pub async fn whoami(&self, access_token: &str) -> AuthResult<UserProfile> {
        let claims = self.authenticate(access_token).await?;
        self.profile(&claims).await
    }

    /// Profile for already-authenticated claims, checking the session and
    /// account are still live.
    pub async fn profile(&self, claims: &TokenClaims) -> AuthResult<UserProfile> {
        if self.sessions.validate(&claims.session_id).await?.is_none() {
            return Err(AuthRejection::SessionExpired);
        }
        Ok(self.active_credential(claims.sub).await?.profile())
    }

    /// Live sessions of the authenticated user, newest first.
    pub async fn list_sessions(&self, claims: &TokenClaims) -> AuthResult<Vec<Session>> {
        Ok(self.sessions.list(claims.sub).await?)
    }

    /// Revoke one of the authenticated user's own sessions.
    ///
    /// Returns `false` when no such live session belongs to the user.
    #[instrument(skip_all, fields(user_id = %claims.sub))]
    pub async fn revoke_session(&self, claims: &TokenClaims, session_id: &str) -> AuthResult<bool> {
        let owned = self
            .sessions
            .list(claims.sub)
            .await?
            .iter()
            .any(|s| s.id == session_id);
        if !owned {
            return Ok(false);
        }
        self.release_refresh_slot(claims.sub, session_id).await?;
        Ok(self.sessions.revoke(session_id).await?)
    }

    /// Drop expired shared-state keys and dead sessions.
    pub async fn purge_expired(&self) -> Result<PurgeReport, AuthError> {
        let shared_keys = timed(
            "shared state purge",
            self.config.store_timeout,
            self.shared.purge_expired(),
        )
        .await?;
        let sessions = self.sessions.purge_expired().await?;
        Ok(PurgeReport {
            shared_keys,
            sessions,
        })
    }

    /// Record a failed login and build the rejection to return.
    ///
    /// Bookkeeping errors turn the rejection into a server error so a broken
    /// audit trail never passes silently.
    async fn reject(
        &self,
        request: &LoginRequest,
        user_id: Option<Uuid>,
        device: &DeviceInfo,
        reason: FailureReason,
    ) -> AuthRejection {
        let recorded = async {
            self.record_attempt(request, user_id, device, Some(reason))
                .await?;
            self.lockout
                .record_source_failure(&device.source_addr)
                .await?;
            Ok::<_, AuthError>(())
        }
        .await;
        if let Err(e) = recorded {
            return e.into();
        }
        info!(reason = %reason, "login rejected");
        match reason {
            FailureReason::AccountLocked => AuthRejection::AccountLocked,
            other => AuthRejection::AuthenticationFailed(other),
        }
    }

    async fn record_attempt(
        &self,
        request: &LoginRequest,
        user_id: Option<Uuid>,
        device: &DeviceInfo,
        reason: Option<FailureReason>,
    ) -> Result<(), AuthError> {
        let attempt = LoginAttempt::new(
            self.clock.now(),
            &request.user_code,
            &request.store_code,
            user_id,
            device,
            reason,
        );
        timed(
            "attempt record",
            self.config.store_timeout,
            self.attempts.record(&attempt),
        )
        .await
    }

    /// The user's credential, provided the account still exists and is active.
    async fn active_credential(&self, user_id: Uuid) -> AuthResult<Credential> {
        let found = timed(
            "credential lookup",
            self.config.store_timeout,
            self.credentials.find_by_id(user_id),
        )
        .await?;
        match found {
            Some(credential) if credential.is_active => Ok(credential),
            _ => {
                debug!(%user_id, "account missing or inactive");
                Err(AuthRejection::UserInactive)
            }
        }
    }

    /// Clear the user's refresh slot if it holds the token of `session_id`.
    async fn release_refresh_slot(&self, user_id: Uuid, session_id: &str) -> Result<(), AuthError> {
        let Some(stored) = self.refresh_tokens.get(user_id).await? else {
            return Ok(());
        };
        let bound_here = self
            .tokens
            .verify_refresh(&stored)
            .is_none_or(|claims| claims.session_id == session_id);
        if bound_here {
            self.refresh_tokens.revoke(user_id).await?;
        }
        Ok(())
    }
}
