use async_trait::async_trait;
use deadpool_redis::Pool;
use redis::AsyncCommands;

use super::keys;
use crate::error::StoreResult;
use crate::models::PendingOAuth;
use crate::repository::OAuthStateStore;

#[derive(Clone)]
pub struct RedisOAuthStateStore {
    pool: Pool,
}

impl RedisOAuthStateStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OAuthStateStore for RedisOAuthStateStore {
    async fn save(&self, state: &str, pending: &PendingOAuth, ttl_secs: u64) -> StoreResult<()> {
        let mut conn = self.pool.get().await?;
        conn.set_ex::<_, _, ()>(keys::oauth_state(state), serde_json::to_string(pending)?, ttl_secs)
            .await?;
        Ok(())
    }

    async fn take(&self, state: &str) -> StoreResult<Option<PendingOAuth>> {
        let mut conn = self.pool.get().await?;
        let raw: Option<String> = conn.get_del(keys::oauth_state(state)).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}
