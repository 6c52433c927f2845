//! Tiered fixed-window rate limiting.
//!
//! Each tier has its own budget and key namespace. Counters live in a
//! [`SharedStateStore`]: the shared backend gives every process the same
//! view; the in-process fallback only limits the local process.
//!
//! A failing or slow store never blocks traffic. `consume` allows the request
//! and logs a warning instead.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::config::{RateLimitConfig, TierLimits};
use crate::store::{MemoryStore, SharedStateStore, StoreError, keys};

/// A named budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitTier {
    /// Keyed by source address + user code + store code.
    Login,
    /// Anonymous API traffic, keyed by source address.
    Api,
    /// Keyed by source address.
    Refresh,
    /// Keyed by source address.
    Upload,
    /// Keyed by authenticated user id.
    AuthenticatedApi,
}

impl RateLimitTier {
    /// Key namespace in the shared store.
    pub fn prefix(self) -> &'static str {
        match self {
            RateLimitTier::Login => "login_limit",
            RateLimitTier::Api => "api_limit",
            RateLimitTier::Refresh => "refresh_limit",
            RateLimitTier::Upload => "upload_limit",
            RateLimitTier::AuthenticatedApi => "auth_api_limit",
        }
    }

    fn limits(self, config: &RateLimitConfig) -> TierLimits {
        match self {
            RateLimitTier::Login => config.login,
            RateLimitTier::Api => config.api,
            RateLimitTier::Refresh => config.refresh,
            RateLimitTier::Upload => config.upload,
            RateLimitTier::AuthenticatedApi => config.authenticated_api,
        }
    }
}

impl fmt::Display for RateLimitTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Key for the login tier.
pub fn login_key(source_addr: &str, user_code: &str, store_code: &str) -> String {
    format!("{source_addr}:{user_code}:{store_code}")
}

/// Outcome of a consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed { remaining: u32 },
    Blocked { retry_after: Duration },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed { .. })
    }
}

pub struct RateLimiter {
    store: Arc<dyn SharedStateStore>,
    shared: bool,
    limits: RateLimitConfig,
    timeout: Duration,
}

impl RateLimiter {
    /// Count in a store shared by every process.
    pub fn shared(
        store: Arc<dyn SharedStateStore>,
        limits: RateLimitConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            shared: true,
            limits,
            timeout,
        }
    }

    /// Count in this process only.
    pub fn in_process(clock: SharedClock, limits: RateLimitConfig, timeout: Duration) -> Self {
        Self {
            store: Arc::new(MemoryStore::with_clock(clock)),
            shared: false,
            limits,
            timeout,
        }
    }

    /// Use the shared store when one is configured, else fall back to in-process counters.
    pub fn with_fallback(
        store: Option<Arc<dyn SharedStateStore>>,
        clock: SharedClock,
        limits: RateLimitConfig,
        timeout: Duration,
    ) -> Self {
        match store {
            Some(store) => Self::shared(store, limits, timeout),
            None => {
                warn!("no shared store for rate limiting, counting per process");
                Self::in_process(clock, limits, timeout)
            }
        }
    }

    /// Whether limits hold across processes.
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    pub fn limits(&self, tier: RateLimitTier) -> TierLimits {
        tier.limits(&self.limits)
    }

    /// Spend one point of `tier`'s budget for `key`.
    pub async fn consume(&self, tier: RateLimitTier, key: &str) -> RateLimitDecision {
        let limits = self.limits(tier);
        match tokio::time::timeout(self.timeout, self.try_consume(tier, key, limits)).await {
            Ok(Ok(decision)) => {
                if let RateLimitDecision::Blocked { retry_after } = decision {
                    debug!(%tier, key, retry_after_secs = retry_after.as_secs(), "rate limited");
                }
                decision
            }
            Ok(Err(e)) => {
                warn!(%tier, error = %e, "rate limiter store failed, allowing request");
                RateLimitDecision::Allowed {
                    remaining: limits.points,
                }
            }
            Err(_) => {
                warn!(%tier, "rate limiter store timed out, allowing request");
                RateLimitDecision::Allowed {
                    remaining: limits.points,
                }
            }
        }
    }

    async fn try_consume(
        &self,
        tier: RateLimitTier,
        key: &str,
        limits: TierLimits,
    ) -> Result<RateLimitDecision, StoreError> {
        let prefix = tier.prefix();
        let block_key = keys::rate_limit_block(prefix, key);
        if let Some(remaining) = self.store.ttl(&block_key).await? {
            return Ok(blocked(remaining));
        }

        let counter_key = keys::rate_limit(prefix, key);
        let consumed = self.store.incr(&counter_key).await?;
        if consumed == 1 {
            self.store.expire(&counter_key, limits.window).await?;
        }
        let points = i64::from(limits.points);
        if consumed <= points {
            let remaining = u32::try_from(points - consumed).unwrap_or(0);
            return Ok(RateLimitDecision::Allowed { remaining });
        }

        if !limits.block.is_zero() {
            self.store.set_with_ttl(&block_key, "1", limits.block).await?;
            warn!(%tier, key, block_secs = limits.block.as_secs(), "budget exhausted, blocking");
            return Ok(blocked(limits.block));
        }

        let retry_after = match self.store.ttl(&counter_key).await? {
            Some(ttl) => ttl,
            None => {
                // Counter lost its window (e.g. a crash between incr and expire).
                self.store.expire(&counter_key, limits.window).await?;
                limits.window
            }
        };
        Ok(blocked(retry_after))
    }
}

fn blocked(retry_after: Duration) -> RateLimitDecision {
    RateLimitDecision::Blocked {
        retry_after: retry_after.max(Duration::from_secs(1)),
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::clock::ManualClock;

    fn limits(points: u32, window_secs: u64, block_secs: u64) -> RateLimitConfig {
        let tier = TierLimits::new(
            points,
            Duration::from_secs(window_secs),
            Duration::from_secs(block_secs),
        );
        RateLimitConfig {
            login: tier,
            api: tier,
            refresh: tier,
            upload: tier,
            authenticated_api: tier,
        }
    }

    fn limiter(config: RateLimitConfig) -> (RateLimiter, ManualClock) {
        let clock = ManualClock::new();
        let limiter = RateLimiter::in_process(
            Arc::new(clock.clone()),
            config,
            Duration::from_secs(1),
        );
        (limiter, clock)
    }

    #[tokio::test]
    async fn rejects_the_call_after_the_budget_and_recovers_after_the_window() {
        let (limiter, clock) = limiter(limits(3, 60, 0));
        for expected in [2, 1, 0] {
            assert_eq!(
                limiter.consume(RateLimitTier::Api, "1.2.3.4").await,
                RateLimitDecision::Allowed {
                    remaining: expected
                }
            );
        }
        match limiter.consume(RateLimitTier::Api, "1.2.3.4").await {
            RateLimitDecision::Blocked { retry_after } => {
                assert!(retry_after > Duration::ZERO);
                assert!(retry_after <= Duration::from_secs(60));
            }
            other => panic!("expected block, got {other:?}"),
        }

        clock.advance(chrono::Duration::seconds(60));
        assert!(limiter.consume(RateLimitTier::Api, "1.2.3.4").await.is_allowed());
    }

    #[tokio::test]
    async fn exhaustion_applies_the_extended_block() {
        let (limiter, clock) = limiter(limits(1, 10, 300));
        assert!(limiter.consume(RateLimitTier::Login, "k").await.is_allowed());
        assert_eq!(
            limiter.consume(RateLimitTier::Login, "k").await,
            RateLimitDecision::Blocked {
                retry_after: Duration::from_secs(300)
            }
        );

        // The window has reset but the block has not.
        clock.advance(chrono::Duration::seconds(20));
        assert_eq!(
            limiter.consume(RateLimitTier::Login, "k").await,
            RateLimitDecision::Blocked {
                retry_after: Duration::from_secs(280)
            }
        );

        clock.advance(chrono::Duration::seconds(280));
        assert!(limiter.consume(RateLimitTier::Login, "k").await.is_allowed());
    }

    #[tokio::test]
    async fn tiers_and_keys_are_independent() {
        let (limiter, _) = limiter(limits(1, 60, 0));
        assert!(limiter.consume(RateLimitTier::Api, "a").await.is_allowed());
        assert!(!limiter.consume(RateLimitTier::Api, "a").await.is_allowed());
        assert!(limiter.consume(RateLimitTier::Api, "b").await.is_allowed());
        assert!(limiter.consume(RateLimitTier::Refresh, "a").await.is_allowed());
        assert!(limiter.consume(RateLimitTier::Upload, "a").await.is_allowed());
    }

    #[tokio::test]
    async fn shared_counters_use_the_tier_namespaces() {
        let clock = ManualClock::new();
        let store = MemoryStore::with_clock(Arc::new(clock));
        let limiter = RateLimiter::shared(
            Arc::new(store.clone()),
            limits(5, 60, 0),
            Duration::from_secs(1),
        );
        assert!(limiter.is_shared());
        limiter.consume(RateLimitTier::AuthenticatedApi, "user-1").await;
        limiter
            .consume(RateLimitTier::Login, &login_key("10.0.0.1", "U1", "S1"))
            .await;

        assert_eq!(
            store.get("auth_api_limit:user-1").await.unwrap().as_deref(),
            Some("1")
        );
        assert_eq!(
            store
                .get("login_limit:10.0.0.1:U1:S1")
                .await
                .unwrap()
                .as_deref(),
            Some("1")
        );
    }

    struct BrokenStore;

    #[async_trait]
    impl SharedStateStore for BrokenStore {
        async fn get(&self, _: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn set_with_ttl(&self, _: &str, _: &str, _: Duration) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn delete(&self, _: &str) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn exists(&self, _: &str) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn incr(&self, _: &str) -> Result<i64, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn expire(&self, _: &str, _: Duration) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn ttl(&self, _: &str) -> Result<Option<Duration>, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn purge_expired(&self) -> Result<u64, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
    }

    struct HangingStore;

    #[async_trait]
    impl SharedStateStore for HangingStore {
        async fn get(&self, _: &str) -> Result<Option<String>, StoreError> {
            std::future::pending().await
        }
        async fn set_with_ttl(&self, _: &str, _: &str, _: Duration) -> Result<(), StoreError> {
            std::future::pending().await
        }
        async fn delete(&self, _: &str) -> Result<bool, StoreError> {
            std::future::pending().await
        }
        async fn exists(&self, _: &str) -> Result<bool, StoreError> {
            std::future::pending().await
        }
        async fn incr(&self, _: &str) -> Result<i64, StoreError> {
            std::future::pending().await
        }
        async fn expire(&self, _: &str, _: Duration) -> Result<bool, StoreError> {
            std::future::pending().await
        }
        async fn ttl(&self, _: &str) -> Result<Option<Duration>, StoreError> {
            std::future::pending().await
        }
        async fn purge_expired(&self) -> Result<u64, StoreError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn store_failures_fail_open() {
        let limiter = RateLimiter::shared(
            Arc::new(BrokenStore),
            limits(1, 60, 0),
            Duration::from_secs(1),
        );
        for _ in 0..3 {
            assert!(limiter.consume(RateLimitTier::Api, "x").await.is_allowed());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn store_timeouts_fail_open() {
        let limiter = RateLimiter::shared(
            Arc::new(HangingStore),
            limits(1, 60, 0),
            Duration::from_millis(50),
        );
        assert!(limiter.consume(RateLimitTier::Refresh, "x").await.is_allowed());
    }

    #[test]
    fn fallback_is_in_process_without_a_shared_store() {
        let limiter = RateLimiter::with_fallback(
            None,
            Arc::new(ManualClock::new()),
            RateLimitConfig::default(),
            Duration::from_secs(1),
        );
        assert!(!limiter.is_shared());
        assert_eq!(limiter.limits(RateLimitTier::Login).points, 10);
    }
}
