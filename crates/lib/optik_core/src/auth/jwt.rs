//! JWT token generation and verification.
//!
//! Access and refresh tokens are HS256-signed with separate secrets, so
//! holding one kind never lets a caller forge the other. Issue times and
//! expiry checks both use the injected clock, with zero leeway.

use std::time::Duration;

use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode,
};
use tracing::debug;
use uuid::Uuid;

use super::AuthError;
use crate::clock::SharedClock;
use crate::config::AuthConfig;
use crate::models::auth::{TokenClaims, TokenPair, TokenSubject};

/// Generate a unique token ID.
pub fn new_jti() -> String {
    Uuid::new_v4().to_string()
}

/// Mints and verifies access/refresh tokens.
pub struct TokenIssuer {
    access_encoding: EncodingKey,
    access_decoding: DecodingKey,
    refresh_encoding: EncodingKey,
    refresh_decoding: DecodingKey,
    access_ttl: Duration,
    refresh_ttl: Duration,
    issuer: String,
    audience: String,
    clock: SharedClock,
}

impl TokenIssuer {
    pub fn new(config: &AuthConfig, clock: SharedClock) -> Self {
        Self {
            access_encoding: EncodingKey::from_secret(config.access_secret.as_bytes()),
            access_decoding: DecodingKey::from_secret(config.access_secret.as_bytes()),
            refresh_encoding: EncodingKey::from_secret(config.refresh_secret.as_bytes()),
            refresh_decoding: DecodingKey::from_secret(config.refresh_secret.as_bytes()),
            access_ttl: config.access_ttl,
            refresh_ttl: config.refresh_ttl,
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            clock,
        }
    }

    /// Mint a fresh pair for `subject`. The refresh token carries `refresh_jti`
    /// so the session it belongs to can recognise it.
    pub fn issue_pair(
        &self,
        subject: &TokenSubject,
        refresh_jti: &str,
    ) -> Result<TokenPair, AuthError> {
        let base = TokenClaims {
            sub: subject.user_id,
            user_code: subject.user_code.clone(),
            store_id: subject.store_id,
            role: subject.role,
            permissions: subject.role.permissions().to_vec(),
            session_id: subject.session_id.clone(),
            jti: String::new(),
            iat: 0,
            exp: 0,
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
        };
        self.reissue_pair(&base, refresh_jti)
    }

    /// Mint a pair carrying `claims` forward. Only `jti`, `iat` and `exp` change.
    pub fn reissue_pair(
        &self,
        claims: &TokenClaims,
        refresh_jti: &str,
    ) -> Result<TokenPair, AuthError> {
        let (access_token, access) = self.issue_access(claims)?;
        let refresh = self.stamp(claims, refresh_jti.to_string(), self.refresh_ttl)?;
        let refresh_token = sign(&refresh, &self.refresh_encoding)?;
        Ok(TokenPair {
            access_token,
            refresh_token,
            expires_in: access.exp - access.iat,
            access_jti: access.jti,
        })
    }

    /// Sign a new access token for `claims` under a fresh `jti`.
    pub fn issue_access(&self, claims: &TokenClaims) -> Result<(String, TokenClaims), AuthError> {
        let access = self.stamp(claims, new_jti(), self.access_ttl)?;
        let token = sign(&access, &self.access_encoding)?;
        Ok((token, access))
    }

    /// Verify an access token, returning the claims on success.
    pub fn verify_access(&self, token: &str) -> Option<TokenClaims> {
        self.verify(token, &self.access_decoding, true, "access")
    }

    /// Verify a refresh token, returning the claims on success.
    pub fn verify_refresh(&self, token: &str) -> Option<TokenClaims> {
        self.verify(token, &self.refresh_decoding, true, "refresh")
    }

    /// Verify an access token's signature, issuer and audience but accept it
    /// after expiry. Used to end sessions with a token that already lapsed.
    pub fn verify_access_allow_expired(&self, token: &str) -> Option<TokenClaims> {
        self.verify(token, &self.access_decoding, false, "access")
    }

    fn stamp(
        &self,
        claims: &TokenClaims,
        jti: String,
        ttl: Duration,
    ) -> Result<TokenClaims, AuthError> {
        let ttl = i64::try_from(ttl.as_secs())
            .map_err(|_| AuthError::Token("token lifetime out of range".into()))?;
        let iat = self.clock.now().timestamp();
        Ok(TokenClaims {
            jti,
            iat,
            exp: iat + ttl,
            ..claims.clone()
        })
    }

    fn verify(
        &self,
        token: &str,
        key: &DecodingKey,
        validate_exp: bool,
        kind: &'static str,
    ) -> Option<TokenClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);
        validation.leeway = 0;
        validation.validate_exp = false;
        let claims = match decode::<TokenClaims>(token, key, &validation) {
            Ok(data) => data.claims,
            Err(e) => {
                debug!(kind, error = %e, "token rejected");
                return None;
            }
        };
        if validate_exp && claims.exp <= self.clock.now().timestamp() {
            debug!(kind, "token expired");
            return None;
        }
        Some(claims)
    }
}

fn sign(claims: &TokenClaims, key: &EncodingKey) -> Result<String, AuthError> {
    encode(&Header::new(Algorithm::HS256), claims, key)
        .map_err(|e| AuthError::Token(format!("jwt encode: {e}")))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::auth::permissions::Role;
    use crate::clock::{ManualClock, SystemClock};

    fn config() -> AuthConfig {
        AuthConfig {
            access_secret: "access-secret".into(),
            refresh_secret: "refresh-secret".into(),
            ..AuthConfig::default()
        }
    }

    fn issuer() -> TokenIssuer {
        TokenIssuer::new(&config(), Arc::new(SystemClock))
    }

    fn subject() -> TokenSubject {
        TokenSubject {
            user_id: Uuid::new_v4(),
            user_code: "U1".into(),
            store_id: Uuid::new_v4(),
            role: Role::Manager,
            session_id: "session-1".into(),
        }
    }

    #[test]
    fn issued_pair_round_trips_claims() {
        let issuer = issuer();
        let subject = subject();
        let pair = issuer.issue_pair(&subject, "refresh-jti").unwrap();

        let access = issuer.verify_access(&pair.access_token).unwrap();
        assert_eq!(access.sub, subject.user_id);
        assert_eq!(access.user_code, "U1");
        assert_eq!(access.store_id, subject.store_id);
        assert_eq!(access.role, Role::Manager);
        assert_eq!(access.permissions, Role::Manager.permissions());
        assert_eq!(access.session_id, "session-1");
        assert_eq!(access.jti, pair.access_jti);

        let refresh = issuer.verify_refresh(&pair.refresh_token).unwrap();
        assert_eq!(refresh.jti, "refresh-jti");
        assert_eq!(refresh.sub, subject.user_id);
        assert_ne!(refresh.jti, access.jti);
    }

    #[test]
    fn expires_in_reflects_the_signed_token() {
        let issuer = issuer();
        let pair = issuer.issue_pair(&subject(), "r").unwrap();
        let access = issuer.verify_access(&pair.access_token).unwrap();
        assert_eq!(pair.expires_in, access.exp - access.iat);
        assert_eq!(pair.expires_in, 15 * 60);
    }

    #[test]
    fn access_and_refresh_tokens_are_not_interchangeable() {
        let issuer = issuer();
        let pair = issuer.issue_pair(&subject(), "r").unwrap();
        assert!(issuer.verify_refresh(&pair.access_token).is_none());
        assert!(issuer.verify_access(&pair.refresh_token).is_none());
    }

    #[test]
    fn reissue_changes_only_the_token_id_and_times() {
        let issuer = issuer();
        let pair = issuer.issue_pair(&subject(), "r1").unwrap();
        let refresh = issuer.verify_refresh(&pair.refresh_token).unwrap();

        let next = issuer.reissue_pair(&refresh, "r2").unwrap();
        let before = issuer.verify_access(&pair.access_token).unwrap();
        let after = issuer.verify_access(&next.access_token).unwrap();

        assert_ne!(before.jti, after.jti);
        assert_eq!(
            TokenClaims {
                jti: String::new(),
                iat: 0,
                exp: 0,
                ..before
            },
            TokenClaims {
                jti: String::new(),
                iat: 0,
                exp: 0,
                ..after
            }
        );
    }

    #[test]
    fn rejects_wrong_issuer_audience_and_secret() {
        let issuer = issuer();
        let pair = issuer.issue_pair(&subject(), "r").unwrap();

        let other_audience = TokenIssuer::new(
            &AuthConfig {
                audience: "someone-else".into(),
                ..config()
            },
            Arc::new(SystemClock),
        );
        assert!(other_audience.verify_access(&pair.access_token).is_none());

        let other_issuer = TokenIssuer::new(
            &AuthConfig {
                issuer: "someone-else".into(),
                ..config()
            },
            Arc::new(SystemClock),
        );
        assert!(other_issuer.verify_access(&pair.access_token).is_none());

        let other_secret = TokenIssuer::new(
            &AuthConfig {
                access_secret: "different".into(),
                ..config()
            },
            Arc::new(SystemClock),
        );
        assert!(other_secret.verify_access(&pair.access_token).is_none());
        assert!(issuer.verify_access("not.a.jwt").is_none());
    }

    #[test]
    fn expired_tokens_fail_verification_but_can_be_read_for_logout() {
        let clock = ManualClock::new();
        let issuer = TokenIssuer::new(&config(), Arc::new(clock.clone()));
        let pair = issuer.issue_pair(&subject(), "r").unwrap();

        clock.advance(chrono::Duration::minutes(14));
        assert!(issuer.verify_access(&pair.access_token).is_some());

        clock.advance(chrono::Duration::minutes(1));
        assert!(issuer.verify_access(&pair.access_token).is_none());
        assert!(issuer.verify_refresh(&pair.refresh_token).is_some());
        let claims = issuer
            .verify_access_allow_expired(&pair.access_token)
            .unwrap();
        assert_eq!(claims.jti, pair.access_jti);
    }
}
