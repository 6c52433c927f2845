//! Append-only audit of login attempts.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::AuthError;
use crate::models::auth::{DeviceInfo, FailureReason, LoginAttempt};

/// Sink for login attempt records. Records are never updated or deleted.
#[async_trait]
pub trait LoginAttemptLog: Send + Sync {
    async fn record(&self, attempt: &LoginAttempt) -> Result<(), AuthError>;
}

impl LoginAttempt {
    pub fn new(
        at: DateTime<Utc>,
        user_code: &str,
        store_code: &str,
        user_id: Option<Uuid>,
        device: &DeviceInfo,
        failure_reason: Option<FailureReason>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            attempted_at: at,
            user_code: user_code.to_string(),
            store_code: store_code.to_string(),
            user_id,
            source_addr: device.source_addr.clone(),
            user_agent: device.user_agent.clone(),
            success: failure_reason.is_none(),
            failure_reason,
        }
    }
}

/// Attempts kept by [`MemoryAttemptLog::new`].
pub const DEFAULT_MEMORY_ATTEMPTS: usize = 10_000;

/// In-process [`LoginAttemptLog`] holding the most recent `capacity`
/// attempts. Older records are dropped.
#[derive(Clone)]
pub struct MemoryAttemptLog {
    attempts: Arc<RwLock<VecDeque<LoginAttempt>>>,
    capacity: usize,
}

impl Default for MemoryAttemptLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MEMORY_ATTEMPTS)
    }
}

impl MemoryAttemptLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            attempts: Arc::new(RwLock::new(VecDeque::new())),
            capacity: capacity.max(1),
        }
    }

    /// Snapshot of the retained attempts, oldest first.
    pub async fn all(&self) -> Vec<LoginAttempt> {
        self.attempts.read().await.iter().cloned().collect()
    }
}

#[async_trait]
impl LoginAttemptLog for MemoryAttemptLog {
    async fn record(&self, attempt: &LoginAttempt) -> Result<(), AuthError> {
        let mut attempts = self.attempts.write().await;
        if attempts.len() == self.capacity {
            attempts.pop_front();
        }
        attempts.push_back(attempt.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn success_is_derived_from_missing_reason() {
        let log = MemoryAttemptLog::new();
        let device = DeviceInfo::new("10.0.0.5", Some("curl/8".into()));
        let now = Utc::now();

        log.record(&LoginAttempt::new(now, "U1", "S1", None, &device, None))
            .await
            .unwrap();
        log.record(&LoginAttempt::new(
            now,
            "U1",
            "S1",
            None,
            &device,
            Some(FailureReason::InvalidPassword),
        ))
        .await
        .unwrap();

        let all = log.all().await;
        assert!(all[0].success);
        assert!(!all[1].success);
        assert_eq!(all[1].failure_reason, Some(FailureReason::InvalidPassword));
        assert_eq!(all[1].source_addr, "10.0.0.5");
    }

    #[tokio::test]
    async fn keeps_only_the_most_recent_attempts() {
        let log = MemoryAttemptLog::with_capacity(3);
        let device = DeviceInfo::new("10.0.0.5", None);
        for code in ["A", "B", "C", "D", "E"] {
            log.record(&LoginAttempt::new(Utc::now(), code, "S1", None, &device, None))
                .await
                .unwrap();
        }
        let codes: Vec<String> = log.all().await.into_iter().map(|a| a.user_code).collect();
        assert_eq!(codes, ["C", "D", "E"]);
    }
}
