//! Per-tier rate limiting ahead of the handlers.
//!
//! A blocked request is answered with 429 and `Retry-After` before any
//! handler runs.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use optik_core::rate_limit::{RateLimitDecision, RateLimitTier};
use tracing::debug;

use super::auth::AuthenticatedUser;
use super::client::ClientAddr;
use crate::AppState;
use crate::error::AppError;

/// State for a rate-limit layer: which tier it spends.
#[derive(Clone)]
pub struct TierLimit {
    pub state: AppState,
    pub tier: RateLimitTier,
}

impl TierLimit {
    pub fn new(state: AppState, tier: RateLimitTier) -> Self {
        Self { state, tier }
    }

    async fn consume(&self, key: &str) -> Result<(), AppError> {
        match self.state.auth.limiter().consume(self.tier, key).await {
            RateLimitDecision::Allowed { .. } => Ok(()),
            RateLimitDecision::Blocked { retry_after } => {
                debug!(tier = %self.tier, key, "request rejected by rate limit");
                Err(AppError::RateLimited { retry_after })
            }
        }
    }
}

/// Spend one point of the tier, keyed by the caller's source address.
pub async fn limit_by_addr(
    State(limit): State<TierLimit>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let ClientAddr(addr) = ClientAddr::resolve(
        request.headers(),
        request.extensions(),
        &limit.state.config.trusted_proxies,
    );
    limit.consume(&addr).await?;
    Ok(next.run(request).await)
}

/// Spend one point of the tier, keyed by the authenticated user id.
///
/// Must run after [`super::auth::require_auth`].
pub async fn limit_by_user(
    State(limit): State<TierLimit>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let Some(AuthenticatedUser(claims)) = request.extensions().get::<AuthenticatedUser>() else {
        return Err(AppError::Unauthorized("Not authenticated".into()));
    };
    limit.consume(&claims.sub.to_string()).await?;
    Ok(next.run(request).await)
}
