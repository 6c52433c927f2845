//! Authentication configuration.

use std::path::PathBuf;
use std::time::Duration;

use rand::distr::Alphanumeric;
use rand::{Rng, rng};
use thiserror::Error;
use tracing::info;

/// Configuration rejected by [`AuthConfig::validate`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("access and refresh tokens must be signed with different secrets")]
    SharedSecret,

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Budget of one rate-limit tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierLimits {
    /// Consumptions allowed per window.
    pub points: u32,
    pub window: Duration,
    /// Extra block applied once the budget is exhausted. Zero blocks until the window ends.
    pub block: Duration,
}

impl TierLimits {
    pub const fn new(points: u32, window: Duration, block: Duration) -> Self {
        Self {
            points,
            window,
            block,
        }
    }
}

const FIFTEEN_MINUTES: Duration = Duration::from_secs(15 * 60);
const ONE_HOUR: Duration = Duration::from_secs(60 * 60);

/// Budgets for every rate-limit tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub login: TierLimits,
    pub api: TierLimits,
    pub refresh: TierLimits,
    pub upload: TierLimits,
    pub authenticated_api: TierLimits,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            login: TierLimits::new(10, FIFTEEN_MINUTES, FIFTEEN_MINUTES),
            api: TierLimits::new(100, FIFTEEN_MINUTES, Duration::ZERO),
            refresh: TierLimits::new(10, FIFTEEN_MINUTES, Duration::ZERO),
            upload: TierLimits::new(20, ONE_HOUR, Duration::ZERO),
            authenticated_api: TierLimits::new(1000, FIFTEEN_MINUTES, Duration::ZERO),
        }
    }
}

/// Settings for credential checks, tokens, sessions and rate limits.
#[derive(Clone, Debug)]
pub struct AuthConfig {
    pub access_secret: String,
    pub refresh_secret: String,
    pub issuer: String,
    pub audience: String,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
    pub bcrypt_cost: u32,
    /// Consecutive failures that lock an account.
    pub max_login_attempts: u32,
    pub lockout_duration: Duration,
    pub max_sessions_per_user: usize,
    /// Upper bound for every call to a networked store.
    pub store_timeout: Duration,
    pub rate_limits: RateLimitConfig,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            access_secret: String::new(),
            refresh_secret: String::new(),
            issuer: "optik-backoffice".into(),
            audience: "optik-clients".into(),
            access_ttl: FIFTEEN_MINUTES,
            refresh_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            bcrypt_cost: 10,
            max_login_attempts: 5,
            lockout_duration: Duration::from_secs(30 * 60),
            max_sessions_per_user: 3,
            store_timeout: Duration::from_secs(2),
            rate_limits: RateLimitConfig::default(),
        }
    }
}

impl AuthConfig {
    /// Reads configuration from environment variables with sensible defaults.
    ///
    /// | Variable                 | Default                              |
    /// |--------------------------|--------------------------------------|
    /// | `JWT_ACCESS_SECRET`      | generated & persisted to file        |
    /// | `JWT_REFRESH_SECRET`     | generated & persisted to file        |
    /// | `JWT_ISSUER`             | `optik-backoffice`                   |
    /// | `JWT_AUDIENCE`           | `optik-clients`                      |
    /// | `ACCESS_TOKEN_TTL_SECS`  | `900`                                |
    /// | `REFRESH_TOKEN_TTL_SECS` | `604800`                             |
    /// | `BCRYPT_COST`            | `10`                                 |
    /// | `MAX_LOGIN_ATTEMPTS`     | `5`                                  |
    /// | `LOCKOUT_DURATION_SECS`  | `1800`                               |
    /// | `MAX_SESSIONS_PER_USER`  | `3`                                  |
    /// | `STORE_TIMEOUT_MS`       | `2000`                               |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            access_secret: resolve_secret("JWT_ACCESS_SECRET", "jwt-access-secret"),
            refresh_secret: resolve_secret("JWT_REFRESH_SECRET", "jwt-refresh-secret"),
            issuer: std::env::var("JWT_ISSUER").unwrap_or(defaults.issuer),
            audience: std::env::var("JWT_AUDIENCE").unwrap_or(defaults.audience),
            access_ttl: env_secs("ACCESS_TOKEN_TTL_SECS").unwrap_or(defaults.access_ttl),
            refresh_ttl: env_secs("REFRESH_TOKEN_TTL_SECS").unwrap_or(defaults.refresh_ttl),
            bcrypt_cost: env_parse("BCRYPT_COST").unwrap_or(defaults.bcrypt_cost),
            max_login_attempts: env_parse("MAX_LOGIN_ATTEMPTS")
                .unwrap_or(defaults.max_login_attempts),
            lockout_duration: env_secs("LOCKOUT_DURATION_SECS")
                .unwrap_or(defaults.lockout_duration),
            max_sessions_per_user: env_parse("MAX_SESSIONS_PER_USER")
                .unwrap_or(defaults.max_sessions_per_user),
            store_timeout: env_parse("STORE_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.store_timeout),
            rate_limits: defaults.rate_limits,
        }
    }

    /// Check the invariants every component relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.access_secret.is_empty() {
            return Err(ConfigError::Empty("access secret"));
        }
        if self.refresh_secret.is_empty() {
            return Err(ConfigError::Empty("refresh secret"));
        }
        if self.access_secret == self.refresh_secret {
            return Err(ConfigError::SharedSecret);
        }
        if self.access_ttl.is_zero() {
            return Err(ConfigError::Zero("access token lifetime"));
        }
        if self.refresh_ttl.is_zero() {
            return Err(ConfigError::Zero("refresh token lifetime"));
        }
        if self.max_login_attempts == 0 {
            return Err(ConfigError::Zero("max login attempts"));
        }
        if self.lockout_duration.is_zero() {
            return Err(ConfigError::Zero("lockout duration"));
        }
        if self.max_sessions_per_user == 0 {
            return Err(ConfigError::Zero("max sessions per user"));
        }
        if self.store_timeout.is_zero() {
            return Err(ConfigError::Zero("store timeout"));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn env_secs(name: &str) -> Option<Duration> {
    env_parse::<u64>(name).map(Duration::from_secs)
}

/// Resolve a signing secret: env var `var` → persisted file `file_name`.
///
/// A missing file is generated (64 alphanumeric chars) and written so the
/// secret survives restarts.
pub fn resolve_secret(var: &str, file_name: &str) -> String {
    if let Ok(secret) = std::env::var(var)
        && !secret.is_empty()
    {
        return secret;
    }
    let secret_path = secret_path(file_name);
    if let Ok(existing) = std::fs::read_to_string(&secret_path) {
        let trimmed = existing.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    let secret = generate_secret();
    if let Some(parent) = secret_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let _ = std::fs::write(&secret_path, &secret);
    info!(path = %secret_path.display(), "generated new signing secret");
    secret
}

/// 64 random alphanumeric characters.
pub fn generate_secret() -> String {
    rng()
        .sample_iter(&Alphanumeric)
        .take(64)
        .map(char::from)
        .collect()
}

/// Path to a persisted secret file.
fn secret_path(file_name: &str) -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("optik")
        .join(file_name)
}
