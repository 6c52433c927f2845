//! PostgreSQL adapters for credentials, login attempts and sessions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::AuthError;
use super::attempts::LoginAttemptLog;
use super::credentials::CredentialStore;
use super::session::SessionRepository;
use crate::models::auth::{Credential, DeviceInfo, DeviceKind, LoginAttempt, Session};

const CREDENTIAL_COLUMNS: &str = "u.id, u.user_code, u.full_name, u.store_id, s.code AS store_code, \
     u.role::text AS role, u.password_hash, u.is_active, u.failed_login_attempts, \
     u.locked_until, u.last_login_at";

#[derive(sqlx::FromRow)]
struct CredentialRow {
    id: Uuid,
    user_code: String,
    full_name: String,
    store_id: Uuid,
    store_code: String,
    role: String,
    password_hash: String,
    is_active: bool,
    failed_login_attempts: i32,
    locked_until: Option<DateTime<Utc>>,
    last_login_at: Option<DateTime<Utc>>,
}

impl TryFrom<CredentialRow> for Credential {
    type Error = AuthError;

    fn try_from(row: CredentialRow) -> Result<Self, Self::Error> {
        let role = row
            .role
            .parse()
            .map_err(|e| AuthError::Internal(format!("user {}: {e}", row.id)))?;
        Ok(Credential {
            user_id: row.id,
            user_code: row.user_code,
            full_name: row.full_name,
            store_id: row.store_id,
            store_code: row.store_code,
            role,
            password_hash: row.password_hash,
            is_active: row.is_active,
            failed_attempts: row.failed_login_attempts,
            locked_until: row.locked_until,
            last_login_at: row.last_login_at,
        })
    }
}

/// [`CredentialStore`] over the `users` and `stores` tables.
#[derive(Clone, Debug)]
pub struct PgCredentialStore {
    pool: PgPool,
}

impl PgCredentialStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn find_by_identity(
        &self,
        user_code: &str,
        store_code: &str,
    ) -> Result<Option<Credential>, AuthError> {
        let row = sqlx::query_as::<_, CredentialRow>(&format!(
            "SELECT {CREDENTIAL_COLUMNS} FROM users u JOIN stores s ON s.id = u.store_id \
             WHERE u.user_code = $1 AND s.code = $2"
        ))
        .bind(user_code)
        .bind(store_code)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Credential::try_from).transpose()
    }

    async fn find_by_id(&self, user_id: Uuid) -> Result<Option<Credential>, AuthError> {
        let row = sqlx::query_as::<_, CredentialRow>(&format!(
            "SELECT {CREDENTIAL_COLUMNS} FROM users u JOIN stores s ON s.id = u.store_id \
             WHERE u.id = $1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Credential::try_from).transpose()
    }

    async fn increment_failure(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<i32, AuthError> {
        let count = sqlx::query_scalar::<_, i32>(
            "UPDATE users SET \
               failed_login_attempts = CASE WHEN locked_until <= $2 THEN 1 \
                 ELSE failed_login_attempts + 1 END, \
               locked_until = CASE WHEN locked_until <= $2 THEN NULL ELSE locked_until END \
             WHERE id = $1 RETURNING failed_login_attempts",
        )
        .bind(user_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn set_lock(&self, user_id: Uuid, until: DateTime<Utc>) -> Result<(), AuthError> {
        sqlx::query("UPDATE users SET locked_until = $2 WHERE id = $1")
            .bind(user_id)
            .bind(until)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn reset_failure(&self, user_id: Uuid) -> Result<(), AuthError> {
        sqlx::query(
            "UPDATE users SET failed_login_attempts = 0, locked_until = NULL WHERE id = $1",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_last_login(&self, user_id: Uuid, at: DateTime<Utc>) -> Result<(), AuthError> {
        sqlx::query("UPDATE users SET last_login_at = $2 WHERE id = $1")
            .bind(user_id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// [`LoginAttemptLog`] over the `login_attempts` table.
#[derive(Clone, Debug)]
pub struct PgLoginAttemptLog {
    pool: PgPool,
}

impl PgLoginAttemptLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LoginAttemptLog for PgLoginAttemptLog {
    async fn record(&self, attempt: &LoginAttempt) -> Result<(), AuthError> {
        sqlx::query(
            "INSERT INTO login_attempts \
             (id, attempted_at, user_code, store_code, user_id, source_addr, user_agent, \
              success, failure_reason) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(attempt.id)
        .bind(attempt.attempted_at)
        .bind(&attempt.user_code)
        .bind(&attempt.store_code)
        .bind(attempt.user_id)
        .bind(&attempt.source_addr)
        .bind(&attempt.user_agent)
        .bind(attempt.success)
        .bind(attempt.failure_reason.map(|r| r.as_str()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    user_id: Uuid,
    refresh_jti: String,
    source_addr: String,
    user_agent: Option<String>,
    device_kind: String,
    created_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    is_active: bool,
}

impl From<SessionRow> for Session {
    fn from(row: SessionRow) -> Self {
        Session {
            id: row.id,
            user_id: row.user_id,
            refresh_jti: row.refresh_jti,
            device: DeviceInfo {
                source_addr: row.source_addr,
                user_agent: row.user_agent,
                kind: DeviceKind::parse(&row.device_kind),
            },
            created_at: row.created_at,
            last_activity_at: row.last_activity_at,
            expires_at: row.expires_at,
            is_active: row.is_active,
        }
    }
}

const SESSION_COLUMNS: &str = "id, user_id, refresh_jti, source_addr, user_agent, device_kind, \
     created_at, last_activity_at, expires_at, is_active";

/// [`SessionRepository`] over the `user_sessions` table.
#[derive(Clone, Debug)]
pub struct PgSessionRepository {
    pool: PgPool,
}

impl PgSessionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionRepository for PgSessionRepository {
    async fn insert(&self, session: &Session) -> Result<(), AuthError> {
        sqlx::query(&format!(
            "INSERT INTO user_sessions ({SESSION_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"
        ))
        .bind(&session.id)
        .bind(session.user_id)
        .bind(&session.refresh_jti)
        .bind(&session.device.source_addr)
        .bind(&session.device.user_agent)
        .bind(session.device.kind.as_str())
        .bind(session.created_at)
        .bind(session.last_activity_at)
        .bind(session.expires_at)
        .bind(session.is_active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find(&self, session_id: &str) -> Result<Option<Session>, AuthError> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM user_sessions WHERE id = $1"
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Session::from))
    }

    async fn touch(&self, session_id: &str, at: DateTime<Utc>) -> Result<(), AuthError> {
        sqlx::query("UPDATE user_sessions SET last_activity_at = $2 WHERE id = $1")
            .bind(session_id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_refresh_jti(&self, session_id: &str, jti: &str) -> Result<(), AuthError> {
        sqlx::query("UPDATE user_sessions SET refresh_jti = $2 WHERE id = $1")
            .bind(session_id)
            .bind(jti)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn deactivate(&self, session_id: &str) -> Result<bool, AuthError> {
        let result = sqlx::query(
            "UPDATE user_sessions SET is_active = FALSE WHERE id = $1 AND is_active",
        )
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn deactivate_all(
        &self,
        user_id: Uuid,
        except: Option<&str>,
    ) -> Result<u64, AuthError> {
        let result = sqlx::query(
            "UPDATE user_sessions SET is_active = FALSE \
             WHERE user_id = $1 AND is_active AND ($2::text IS NULL OR id <> $2)",
        )
        .bind(user_id)
        .bind(except)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn list_live(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<Session>, AuthError> {
        let rows = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM user_sessions \
             WHERE user_id = $1 AND is_active AND expires_at > $2 \
             ORDER BY created_at DESC, id DESC"
        ))
        .bind(user_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Session::from).collect())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, AuthError> {
        let result =
            sqlx::query("DELETE FROM user_sessions WHERE NOT is_active OR expires_at <= $1")
                .bind(now)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }
}
