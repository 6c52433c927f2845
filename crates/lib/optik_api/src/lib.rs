//! # optik_api
//!
//! HTTP API library for the Optik back-office authentication service.

pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;

use std::sync::Arc;

use axum::Router;
use axum::middleware::from_fn_with_state;
use axum::routing::{delete, get, post};
use optik_core::auth::service::AuthService;
use optik_core::rate_limit::RateLimitTier;
use sqlx::PgPool;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::handlers::{auth, sessions};
use crate::middleware::rate_limit::{TierLimit, limit_by_addr, limit_by_user};

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<AuthService>,
    /// API configuration.
    pub config: ApiConfig,
}

/// Run embedded database migrations.
///
/// Delegates to `optik_core::migrate::migrate()` which owns the migration files.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    optik_core::migrate::migrate(pool).await
}

/// Builds the Axum router with all routes and shared state.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Public routes (no auth required)
    let public = Router::new()
        .route("/auth/login", post(auth::login_handler))
        .route("/auth/logout", post(auth::logout_handler));

    let refresh = Router::new()
        .route("/auth/refresh", post(auth::refresh_handler))
        .route_layer(from_fn_with_state(
            TierLimit::new(state.clone(), RateLimitTier::Refresh),
            limit_by_addr,
        ));

    // Protected routes: the gate runs first, then the per-user budget.
    let protected = Router::new()
        .route("/auth/me", get(auth::me_handler))
        .route("/auth/sessions", get(sessions::list_sessions_handler))
        .route(
            "/auth/sessions/{id}",
            delete(sessions::revoke_session_handler),
        )
        .route_layer(from_fn_with_state(
            TierLimit::new(state.clone(), RateLimitTier::AuthenticatedApi),
            limit_by_user,
        ))
        .route_layer(from_fn_with_state(
            state.clone(),
            middleware::auth::require_auth,
        ));

    Router::new()
        .merge(public)
        .merge(refresh)
        .merge(protected)
        .layer(from_fn_with_state(
            TierLimit::new(state.clone(), RateLimitTier::Api),
            limit_by_addr,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
