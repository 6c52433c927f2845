//! Authentication and session management.
//!
//! Components are plain structs wired together by [`service::AuthService`];
//! every piece of shared state sits behind a trait so tests can run against
//! in-memory doubles.

pub mod attempts;
pub mod blacklist;
pub mod credentials;
pub mod jwt;
pub mod lockout;
pub mod password;
pub mod permissions;
pub mod queries;
pub mod refresh;
pub mod service;
pub mod session;

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::error;

use crate::config::ConfigError;
use crate::models::auth::FailureReason;
use crate::store::StoreError;

/// Unexpected failures: collaborators down, signing broken, bad configuration.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("Shared store error: {0}")]
    Store(#[from] StoreError),

    #[error("Timed out during {0}")]
    Timeout(&'static str),

    #[error("Token error: {0}")]
    Token(String),

    #[error("Password hash error: {0}")]
    Hash(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Anticipated outcomes that end an authentication flow early.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthRejection {
    #[error("Account is locked, try again later")]
    AccountLocked,

    /// The reason is for audit only and is never shown to the caller.
    #[error("Invalid credentials")]
    AuthenticationFailed(FailureReason),

    #[error("Session has expired")]
    SessionExpired,

    #[error("User account is inactive")]
    UserInactive,

    #[error("Too many requests")]
    RateLimitExceeded { retry_after: Duration },

    #[error("Internal server error")]
    ServerError,
}

impl AuthRejection {
    /// HTTP-equivalent status.
    pub fn status_code(&self) -> u16 {
        match self {
            AuthRejection::AccountLocked => 423,
            AuthRejection::AuthenticationFailed(_) => 401,
            AuthRejection::SessionExpired => 401,
            AuthRejection::UserInactive => 403,
            AuthRejection::RateLimitExceeded { .. } => 429,
            AuthRejection::ServerError => 500,
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            AuthRejection::AccountLocked => "account_locked",
            AuthRejection::AuthenticationFailed(_) => "authentication_failed",
            AuthRejection::SessionExpired => "session_expired",
            AuthRejection::UserInactive => "user_inactive",
            AuthRejection::RateLimitExceeded { .. } => "rate_limit_exceeded",
            AuthRejection::ServerError => "server_error",
        }
    }
}

impl From<AuthError> for AuthRejection {
    fn from(e: AuthError) -> Self {
        error!(error = %e, detail = ?e, "unexpected authentication failure");
        AuthRejection::ServerError
    }
}

/// Result of an orchestrated authentication operation.
pub type AuthResult<T> = Result<T, AuthRejection>;

/// Run a store call under a deadline.
pub(crate) async fn timed<T, E>(
    op: &'static str,
    limit: Duration,
    fut: impl Future<Output = Result<T, E>>,
) -> Result<T, AuthError>
where
    AuthError: From<E>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(AuthError::from),
        Err(_) => Err(AuthError::Timeout(op)),
    }
}
