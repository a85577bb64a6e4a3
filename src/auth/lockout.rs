//! Failed-login tracking and lazily triggered account lockout.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::SecurityConfig;
use crate::error::StoreResult;
use crate::repository::LoginAttemptStore;

#[derive(Clone)]
pub struct LoginAttemptGuard {
    store: Arc<dyn LoginAttemptStore>,
    max_attempts: u32,
    attempt_window_secs: u64,
    lockout_duration_secs: u64,
}

impl LoginAttemptGuard {
    pub fn new(
        store: Arc<dyn LoginAttemptStore>,
        max_attempts: u32,
        attempt_window_secs: u64,
        lockout_duration_secs: u64,
    ) -> Self {
        Self {
            store,
            max_attempts,
            attempt_window_secs,
            lockout_duration_secs,
        }
    }

    pub fn from_config(store: Arc<dyn LoginAttemptStore>, security: &SecurityConfig) -> Self {
        Self::new(
            store,
            security.max_failed_login_attempts,
            security.attempt_window_secs,
            security.lockout_duration_secs,
        )
    }

    fn normalize(email: &str) -> String {
        email.trim().to_lowercase()
    }

    /// Counts one failed attempt. The window starts at the first failure.
    pub async fn record(&self, email: &str) -> StoreResult<u64> {
        let email = Self::normalize(email);
        let attempts = self
            .store
            .increment_attempts(&email, self.attempt_window_secs)
            .await?;

        debug!(
            attempts = attempts,
            max_attempts = self.max_attempts,
            "Recorded failed login attempt"
        );

        Ok(attempts)
    }

    /// Sets the lock as a side effect once the threshold has been crossed.
    /// The counter is cleared at that point so the lock ends with its TTL.
    pub async fn is_locked(&self, email: &str) -> StoreResult<bool> {
        let email = Self::normalize(email);

        if self.store.lock_exists(&email).await? {
            return Ok(true);
        }

        let attempts = self.store.attempts(&email).await?;
        if attempts < u64::from(self.max_attempts) {
            return Ok(false);
        }

        self.store
            .set_lock(&email, self.lockout_duration_secs)
            .await?;
        self.store.clear_attempts(&email).await?;

        warn!(
            attempts = attempts,
            lockout_duration_secs = self.lockout_duration_secs,
            "Account locked due to too many failed attempts"
        );

        Ok(true)
    }

    pub async fn lockout_remaining(&self, email: &str) -> StoreResult<Option<u64>> {
        self.store.lock_ttl(&Self::normalize(email)).await
    }

    /// Clears both the counter and the lock.
    pub async fn reset(&self, email: &str) -> StoreResult<()> {
        let email = Self::normalize(email);
        self.store.clear_attempts(&email).await?;
        self.store.clear_lock(&email).await
    }
}
