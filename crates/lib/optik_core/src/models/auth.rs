//! Authentication domain models.
//!
//! These are internal domain models, distinct from the HTTP request and
//! response shapes (which use camelCase on the wire).

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::permissions::{Permission, Role};

/// Stored credential of a staff member at one store.
#[derive(Debug, Clone)]
pub struct Credential {
    pub user_id: Uuid,
    pub user_code: String,
    pub full_name: String,
    pub store_id: Uuid,
    pub store_code: String,
    pub role: Role,
    pub password_hash: String,
    pub is_active: bool,
    pub failed_attempts: i32,
    pub locked_until: Option<DateTime<Utc>>,
    pub last_login_at: Option<DateTime<Utc>>,
}

impl Credential {
    /// Public view of the account.
    pub fn profile(&self) -> UserProfile {
        UserProfile {
            user_id: self.user_id,
            user_code: self.user_code.clone(),
            full_name: self.full_name.clone(),
            store_id: self.store_id,
            store_code: self.store_code.clone(),
            role: self.role,
            permissions: self.role.permissions().to_vec(),
            last_login_at: self.last_login_at,
        }
    }
}

/// Account details returned by login and whoami.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: Uuid,
    pub user_code: String,
    pub full_name: String,
    pub store_id: Uuid,
    pub store_code: String,
    pub role: Role,
    pub permissions: Vec<Permission>,
    pub last_login_at: Option<DateTime<Utc>>,
}

/// Coarse device class derived from the user agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Desktop,
    Mobile,
    Tablet,
}

impl DeviceKind {
    /// Classify a user agent string. Unknown agents count as desktop.
    pub fn from_user_agent(user_agent: Option<&str>) -> Self {
        let Some(ua) = user_agent else {
            return DeviceKind::Desktop;
        };
        let ua = ua.to_ascii_lowercase();
        if ua.contains("ipad")
            || ua.contains("tablet")
            || (ua.contains("android") && !ua.contains("mobile"))
        {
            DeviceKind::Tablet
        } else if ua.contains("mobile") || ua.contains("iphone") || ua.contains("ipod") {
            DeviceKind::Mobile
        } else {
            DeviceKind::Desktop
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceKind::Desktop => "desktop",
            DeviceKind::Mobile => "mobile",
            DeviceKind::Tablet => "tablet",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "mobile" => DeviceKind::Mobile,
            "tablet" => DeviceKind::Tablet,
            _ => DeviceKind::Desktop,
        }
    }
}

/// Where a request came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub source_addr: String,
    pub user_agent: Option<String>,
    pub kind: DeviceKind,
}

impl DeviceInfo {
    pub fn new(source_addr: impl Into<String>, user_agent: Option<String>) -> Self {
        let kind = DeviceKind::from_user_agent(user_agent.as_deref());
        Self {
            source_addr: source_addr.into(),
            user_agent,
            kind,
        }
    }
}

/// A server-tracked login session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: Uuid,
    pub refresh_jti: String,
    pub device: DeviceInfo,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_active: bool,
}

impl Session {
    /// Active and not yet expired.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at > now
    }
}

/// Why a login attempt failed. Recorded for audit, never shown to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    UserNotFound,
    InvalidPassword,
    AccountLocked,
    AccountInactive,
    InvalidToken,
    TokenRevoked,
    RefreshTokenMismatch,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::UserNotFound => "USER_NOT_FOUND",
            FailureReason::InvalidPassword => "INVALID_PASSWORD",
            FailureReason::AccountLocked => "ACCOUNT_LOCKED",
            FailureReason::AccountInactive => "ACCOUNT_INACTIVE",
            FailureReason::InvalidToken => "INVALID_TOKEN",
            FailureReason::TokenRevoked => "TOKEN_REVOKED",
            FailureReason::RefreshTokenMismatch => "REFRESH_TOKEN_MISMATCH",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the append-only login audit.
#[derive(Debug, Clone, PartialEq)]
pub struct LoginAttempt {
    pub id: Uuid,
    pub attempted_at: DateTime<Utc>,
    pub user_code: String,
    pub store_code: String,
    pub user_id: Option<Uuid>,
    pub source_addr: String,
    pub user_agent: Option<String>,
    pub success: bool,
    pub failure_reason: Option<FailureReason>,
}

/// Identity a token pair is minted for.
#[derive(Debug, Clone)]
pub struct TokenSubject {
    pub user_id: Uuid,
    pub user_code: String,
    pub store_id: Uuid,
    pub role: Role,
    pub session_id: String,
}

/// Claims carried by both access and refresh tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject: user ID.
    pub sub: Uuid,
    pub user_code: String,
    pub store_id: Uuid,
    pub role: Role,
    pub permissions: Vec<Permission>,
    pub session_id: String,
    /// Unique token ID.
    pub jti: String,
    /// Issued at (unix timestamp).
    pub iat: i64,
    /// Expiry (unix timestamp).
    pub exp: i64,
    pub iss: String,
    pub aud: String,
}

/// Freshly minted access + refresh tokens.
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    /// Access token lifetime in seconds, taken from its own `exp - iat`.
    pub expires_in: i64,
    pub access_jti: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_common_user_agents() {
        let iphone = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) Mobile/15E148";
        let ipad = "Mozilla/5.0 (iPad; CPU OS 17_0 like Mac OS X)";
        let android_tablet = "Mozilla/5.0 (Linux; Android 13; SM-X700)";
        let android_phone = "Mozilla/5.0 (Linux; Android 13; Pixel 7) Mobile Safari/537.36";
        let desktop = "Mozilla/5.0 (Windows NT 10.0; Win64; x64)";

        assert_eq!(DeviceKind::from_user_agent(Some(iphone)), DeviceKind::Mobile);
        assert_eq!(DeviceKind::from_user_agent(Some(ipad)), DeviceKind::Tablet);
        assert_eq!(
            DeviceKind::from_user_agent(Some(android_tablet)),
            DeviceKind::Tablet
        );
        assert_eq!(
            DeviceKind::from_user_agent(Some(android_phone)),
            DeviceKind::Mobile
        );
        assert_eq!(DeviceKind::from_user_agent(Some(desktop)), DeviceKind::Desktop);
        assert_eq!(DeviceKind::from_user_agent(None), DeviceKind::Desktop);
    }

    #[test]
    fn failure_reasons_use_audit_tags() {
        assert_eq!(FailureReason::UserNotFound.as_str(), "USER_NOT_FOUND");
        assert_eq!(
            serde_json::to_string(&FailureReason::InvalidPassword).unwrap(),
            "\"INVALID_PASSWORD\""
        );
    }
}
