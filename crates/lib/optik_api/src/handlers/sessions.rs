//! Session management handlers for the authenticated user.

use axum::Json;
use axum::extract::{Extension, Path, State};
use axum::http::StatusCode;

use crate::AppState;
use crate::error::{AppError, AppResult};
use crate::middleware::auth::AuthenticatedUser;
use crate::models::SessionResponse;

/// `GET /auth/sessions`: live sessions, newest first.
pub async fn list_sessions_handler(
    State(state): State<AppState>,
    Extension(AuthenticatedUser(claims)): Extension<AuthenticatedUser>,
) -> AppResult<Json<Vec<SessionResponse>>> {
    let sessions = state.auth.list_sessions(&claims).await?;
    Ok(Json(
        sessions
            .into_iter()
            .map(|s| SessionResponse::new(s, &claims.session_id))
            .collect(),
    ))
}

/// `DELETE /auth/sessions/{id}`: end one of the caller's sessions.
pub async fn revoke_session_handler(
    State(state): State<AppState>,
    Extension(AuthenticatedUser(claims)): Extension<AuthenticatedUser>,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    if state.auth.revoke_session(&claims, &id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound("session not found".into()))
    }
}
