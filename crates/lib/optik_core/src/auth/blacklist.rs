//! Revocation of individual access tokens before their natural expiry.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::{AuthError, timed};
use crate::clock::SharedClock;
use crate::store::{SharedStateStore, keys};

/// Tombstones for revoked access tokens.
///
/// Each entry lives exactly as long as the token it shadows would have, so
/// the blacklist never outgrows the set of still-valid tokens.
#[derive(Clone)]
pub struct TokenBlacklist {
    store: Arc<dyn SharedStateStore>,
    clock: SharedClock,
    timeout: Duration,
}

impl TokenBlacklist {
    pub fn new(store: Arc<dyn SharedStateStore>, clock: SharedClock, timeout: Duration) -> Self {
        Self {
            store,
            clock,
            timeout,
        }
    }

    /// Blacklist `token`, which expires at unix time `exp`.
    ///
    /// Returns `false` without touching the store when the token has already
    /// expired. Blacklisting twice simply refreshes the tombstone.
    pub async fn blacklist(&self, token: &str, exp: i64) -> Result<bool, AuthError> {
        let remaining = exp - self.clock.now().timestamp();
        let Ok(remaining) = u64::try_from(remaining) else {
            debug!("token already expired, nothing to blacklist");
            return Ok(false);
        };
        if remaining == 0 {
            return Ok(false);
        }
        timed(
            "blacklist write",
            self.timeout,
            self.store.set_with_ttl(
                &keys::blacklist(token),
                "1",
                Duration::from_secs(remaining),
            ),
        )
        .await?;
        Ok(true)
    }

    pub async fn is_blacklisted(&self, token: &str) -> Result<bool, AuthError> {
        timed(
            "blacklist lookup",
            self.timeout,
            self.store.exists(&keys::blacklist(token)),
        )
        .await
    }
}
