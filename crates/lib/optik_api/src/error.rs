//! Application error types.

use std::time::Duration;

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use optik_core::auth::AuthRejection;
use optik_core::models::auth::FailureReason;
use thiserror::Error;

use crate::models::ErrorResponse;

/// Convenience alias for handler return types.
pub type AppResult<T> = Result<T, AppError>;

/// Application-level errors with HTTP status mapping.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Session has expired")]
    SessionExpired,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Account is locked, try again later")]
    Locked,

    #[error("Too many requests")]
    RateLimited { retry_after: Duration },

    #[error("Internal server error")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, message) = match &self {
            AppError::Validation(m) => (StatusCode::BAD_REQUEST, "validation_error", m.as_str()),
            AppError::NotFound(m) => (StatusCode::NOT_FOUND, "not_found", m.as_str()),
            AppError::Unauthorized(m) => (StatusCode::UNAUTHORIZED, "unauthorized", m.as_str()),
            AppError::SessionExpired => (
                StatusCode::UNAUTHORIZED,
                "session_expired",
                "Session has expired",
            ),
            AppError::Forbidden(m) => (StatusCode::FORBIDDEN, "forbidden", m.as_str()),
            AppError::Locked => (
                StatusCode::LOCKED,
                "account_locked",
                "Account is locked, try again later",
            ),
            AppError::RateLimited { .. } => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limit_exceeded",
                "Too many requests, try again later",
            ),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "Internal server error",
            ),
        };
        let body = Json(ErrorResponse {
            error: error.to_string(),
            message: message.to_string(),
        });
        let mut response = (status, body).into_response();
        if let AppError::RateLimited { retry_after } = self {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(retry_after_secs(retry_after)));
        }
        response
    }
}

/// Whole seconds, rounded up so clients never retry early.
fn retry_after_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}

impl From<AuthRejection> for AppError {
    fn from(rejection: AuthRejection) -> Self {
        match rejection {
            AuthRejection::AccountLocked => AppError::Locked,
            AuthRejection::AuthenticationFailed(reason) => match reason {
                FailureReason::InvalidToken
                | FailureReason::TokenRevoked
                | FailureReason::RefreshTokenMismatch => {
                    AppError::Unauthorized("Invalid token".into())
                }
                FailureReason::UserNotFound
                | FailureReason::InvalidPassword
                | FailureReason::AccountLocked
                | FailureReason::AccountInactive => {
                    AppError::Unauthorized("Invalid credentials".into())
                }
            },
            AuthRejection::SessionExpired => AppError::SessionExpired,
            AuthRejection::UserInactive => AppError::Forbidden("User account is inactive".into()),
            AuthRejection::RateLimitExceeded { retry_after } => {
                AppError::RateLimited { retry_after }
            }
            AuthRejection::ServerError => AppError::Internal("authentication failure".into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejections_keep_their_status() {
        let cases = [
            (AuthRejection::AccountLocked, StatusCode::LOCKED),
            (
                AuthRejection::AuthenticationFailed(FailureReason::UserNotFound),
                StatusCode::UNAUTHORIZED,
            ),
            (AuthRejection::SessionExpired, StatusCode::UNAUTHORIZED),
            (AuthRejection::UserInactive, StatusCode::FORBIDDEN),
            (
                AuthRejection::RateLimitExceeded {
                    retry_after: Duration::from_secs(1),
                },
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (AuthRejection::ServerError, StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (rejection, status) in cases {
            assert_eq!(rejection.status_code(), status.as_u16());
            assert_eq!(AppError::from(rejection).into_response().status(), status);
        }
    }

    #[test]
    fn rate_limited_responses_carry_retry_after() {
        let response = AppError::RateLimited {
            retry_after: Duration::from_millis(2500),
        }
        .into_response();
        assert_eq!(response.headers()[RETRY_AFTER], "3");
    }

    #[test]
    fn failure_reasons_are_not_revealed() {
        let wrong_password: AppError =
            AuthRejection::AuthenticationFailed(FailureReason::InvalidPassword).into();
        let no_user: AppError =
            AuthRejection::AuthenticationFailed(FailureReason::UserNotFound).into();
        assert_eq!(wrong_password.to_string(), no_user.to_string());
    }
}
