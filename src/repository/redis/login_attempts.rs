use async_trait::async_trait;
use deadpool_redis::Pool;
use redis::{AsyncCommands, Script};

use super::keys;
use crate::error::StoreResult;
use crate::repository::LoginAttemptStore;

/// Increment and first-hit expiry in one round trip so a counter can never
/// be left without its window.
const INCREMENT_WITH_WINDOW: &str = r"
local attempts = redis.call('INCR', KEYS[1])
if attempts == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return attempts
";

#[derive(Clone)]
pub struct RedisLoginAttemptStore {
    pool: Pool,
    increment: Script,
}

impl RedisLoginAttemptStore {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            increment: Script::new(INCREMENT_WITH_WINDOW),
        }
    }
}

#[async_trait]
impl LoginAttemptStore for RedisLoginAttemptStore {
    async fn increment_attempts(&self, email: &str, window_secs: u64) -> StoreResult<u64> {
        let mut conn = self.pool.get().await?;
        let attempts: u64 = self
            .increment
            .key(keys::login_attempt(email))
            .arg(window_secs)
            .invoke_async(&mut conn)
            .await?;
        Ok(attempts)
    }

    async fn attempts(&self, email: &str) -> StoreResult<u64> {
        let mut conn = self.pool.get().await?;
        let attempts: Option<u64> = conn.get(keys::login_attempt(email)).await?;
        Ok(attempts.unwrap_or(0))
    }

    async fn clear_attempts(&self, email: &str) -> StoreResult<()> {
        let mut conn = self.pool.get().await?;
        conn.del::<_, ()>(keys::login_attempt(email)).await?;
        Ok(())
    }

    async fn lock_exists(&self, email: &str) -> StoreResult<bool> {
        let mut conn = self.pool.get().await?;
        Ok(conn.exists(keys::login_lock(email)).await?)
    }

    async fn set_lock(&self, email: &str, ttl_secs: u64) -> StoreResult<()> {
        let mut conn = self.pool.get().await?;
        conn.set_ex::<_, _, ()>(keys::login_lock(email), "1", ttl_secs)
            .await?;
        Ok(())
    }

    async fn lock_ttl(&self, email: &str) -> StoreResult<Option<u64>> {
        let mut conn = self.pool.get().await?;
        let ttl: i64 = conn.ttl(keys::login_lock(email)).await?;
        Ok((ttl > 0).then_some(ttl as u64))
    }

    async fn clear_lock(&self, email: &str) -> StoreResult<()> {
        let mut conn = self.pool.get().await?;
        conn.del::<_, ()>(keys::login_lock(email)).await?;
        Ok(())
    }
}
