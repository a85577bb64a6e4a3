//! Redis adapters for sessions, login attempts and OAuth state.

mod login_attempts;
mod oauth_state;
mod sessions;

pub use login_attempts::RedisLoginAttemptStore;
pub use oauth_state::RedisOAuthStateStore;
pub use sessions::RedisSessionStore;

use async_trait::async_trait;
use deadpool_redis::{Config as RedisPoolConfig, Pool, Runtime};
use sha2::{Digest, Sha256};
use tracing::info;

use super::HealthProbe;
use crate::config::RedisConfig;
use crate::error::{StoreError, StoreResult};

pub fn create_redis_pool(config: &RedisConfig) -> StoreResult<Pool> {
    let timeout = std::time::Duration::from_secs(config.connection_timeout_secs);
    let pool = RedisPoolConfig::from_url(&config.url)
        .builder()
        .map_err(|e| StoreError::Unavailable(format!("redis config: {}", e)))?
        .max_size(config.pool_size)
        .wait_timeout(Some(timeout))
        .create_timeout(Some(timeout))
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| StoreError::Unavailable(format!("redis pool: {}", e)))?;

    info!(
        redis_url = %config.url.split('@').next_back().unwrap_or("***"),
        pool_size = config.pool_size,
        "Redis pool created"
    );

    Ok(pool)
}

/// Token values are indexed by digest so raw bearer tokens never become keys.
pub(crate) fn token_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

pub(crate) mod keys {
    use uuid::Uuid;

    use super::token_digest;

    pub const SESSION_PREFIX: &str = "session:";
    pub const ACCESS_TOKEN_PREFIX: &str = "access_token:";
    pub const REFRESH_TOKEN_PREFIX: &str = "refresh_token:";
    pub const USER_SESSIONS_PREFIX: &str = "user_sessions:";

    pub fn session(id: Uuid) -> String {
        format!("{}{}", SESSION_PREFIX, id)
    }

    pub fn access_token(token: &str) -> String {
        format!("{}{}", ACCESS_TOKEN_PREFIX, token_digest(token))
    }

    pub fn refresh_token(token: &str) -> String {
        format!("{}{}", REFRESH_TOKEN_PREFIX, token_digest(token))
    }

    pub fn user_sessions(user_id: Uuid) -> String {
        format!("{}{}", USER_SESSIONS_PREFIX, user_id)
    }

    pub fn login_attempt(email: &str) -> String {
        format!("login_attempt:{}", email)
    }

    pub fn login_lock(email: &str) -> String {
        format!("login_lock:{}", email)
    }

    pub fn oauth_state(state: &str) -> String {
        format!("oauth_state:{}", state)
    }
}

#[derive(Clone)]
pub struct RedisProbe {
    pool: Pool,
}

impl RedisProbe {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HealthProbe for RedisProbe {
    fn component(&self) -> &'static str {
        "redis"
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.pool.get().await?;
        let _pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
