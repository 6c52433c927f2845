//! Authentication request handlers.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Extension, State};
use axum::http::HeaderMap;
use optik_core::auth::service;
use tracing::debug;

use crate::AppState;
use crate::error::{AppError, AppResult};
use crate::middleware::auth::{AuthenticatedUser, bearer_token};
use crate::middleware::client::ClientDevice;
use crate::models::{
    LoginRequest, LoginResponse, LogoutRequest, LogoutResponse, RefreshRequest, TokenResponse,
    UserResponse,
};

/// `POST /auth/login`: authenticate with user code, store code and password.
pub async fn login_handler(
    State(state): State<AppState>,
    ClientDevice(device): ClientDevice,
    Json(body): Json<LoginRequest>,
) -> AppResult<Json<LoginResponse>> {
    let user_code = body.user_code.trim();
    let store_code = body.store_code.trim();
    if user_code.is_empty() || store_code.is_empty() || body.password.is_empty() {
        return Err(AppError::Validation(
            "userCode, storeCode and password are required".into(),
        ));
    }
    let request = service::LoginRequest {
        user_code: user_code.to_string(),
        store_code: store_code.to_string(),
        password: body.password,
    };
    let outcome = state.auth.login(&request, device).await?;
    Ok(Json(LoginResponse {
        tokens: outcome.tokens.into(),
        session_id: outcome.session_id,
        user: outcome.user.into(),
    }))
}

/// `POST /auth/refresh`: exchange a refresh token for a new token pair.
pub async fn refresh_handler(
    State(state): State<AppState>,
    Json(body): Json<RefreshRequest>,
) -> AppResult<Json<TokenResponse>> {
    let pair = state.auth.refresh(&body.refresh_token).await?;
    Ok(Json(pair.into()))
}

/// `POST /auth/logout`: revoke the bearer token and end its session.
///
/// The body is optional; `{"allSessions": true}` ends every session of the user.
pub async fn logout_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<LogoutResponse>> {
    let token = bearer_token(&headers)?;
    let request: LogoutRequest = if body.is_empty() {
        LogoutRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| {
            debug!(error = %e, "malformed logout body");
            AppError::Validation("Malformed request body".into())
        })?
    };
    state.auth.logout(token, request.all_sessions).await?;
    Ok(Json(LogoutResponse { success: true }))
}

/// `GET /auth/me`: profile of the authenticated user.
pub async fn me_handler(
    State(state): State<AppState>,
    Extension(AuthenticatedUser(claims)): Extension<AuthenticatedUser>,
) -> AppResult<Json<UserResponse>> {
    let profile = state.auth.profile(&claims).await?;
    Ok(Json(profile.into()))
}
