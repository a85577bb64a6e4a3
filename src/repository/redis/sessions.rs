use async_trait::async_trait;
use chrono::Utc;
use deadpool_redis::{Connection, Pool};
use redis::AsyncCommands;
use tracing::{debug, warn};
use uuid::Uuid;

use super::keys;
use crate::error::StoreResult;
use crate::models::Session;
use crate::repository::SessionStore;

/// Sessions keyed by id plus three secondary indexes, each expiring with the
/// session. The four writes are sequential, not transactional; readers and
/// the maintenance sweep evict index entries whose primary record is gone.
#[derive(Clone)]
pub struct RedisSessionStore {
    pool: Pool,
}

impl RedisSessionStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> StoreResult<Connection> {
        Ok(self.pool.get().await?)
    }

    async fn load(conn: &mut Connection, id: Uuid) -> StoreResult<Option<Session>> {
        let raw: Option<String> = conn.get(keys::session(id)).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn resolve_index(&self, index_key: String) -> StoreResult<Option<Session>> {
        let mut conn = self.conn().await?;

        let raw_id: Option<String> = conn.get(&index_key).await?;
        let Some(id) = raw_id.and_then(|raw| Uuid::parse_str(&raw).ok()) else {
            return Ok(None);
        };

        let session = Self::load(&mut conn, id).await?;
        if session.is_none() {
            debug!(session_id = %id, "Evicting index entry for missing session");
            if let Err(e) = conn.del::<_, ()>(&index_key).await {
                warn!(error = %e, "Failed to evict dangling session index");
            }
        }

        Ok(session)
    }

    async fn remove_indexes(conn: &mut Connection, session: &Session) {
        if let Err(e) = conn
            .del::<_, ()>(&[
                keys::access_token(&session.access_token),
                keys::refresh_token(&session.refresh_token),
            ])
            .await
        {
            warn!(session_id = %session.id, error = %e, "Failed to delete session token indexes");
        }

        if let Err(e) = conn
            .srem::<_, _, ()>(keys::user_sessions(session.user_id), session.id.to_string())
            .await
        {
            warn!(session_id = %session.id, error = %e, "Failed to remove session from user index");
        }
    }

    async fn scan(conn: &mut Connection, pattern: &str) -> StoreResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut iter = conn.scan_match::<_, String>(pattern).await?;
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }

    async fn sweep_token_indexes(conn: &mut Connection, pattern: &str) -> StoreResult<usize> {
        let mut removed = 0;
        for index_key in Self::scan(conn, pattern).await? {
            let raw_id: Option<String> = conn.get(&index_key).await?;
            let dangling = match raw_id.and_then(|raw| Uuid::parse_str(&raw).ok()) {
                Some(id) => !conn.exists::<_, bool>(keys::session(id)).await?,
                None => true,
            };
            if dangling {
                conn.del::<_, ()>(&index_key).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn create(&self, session: &Session) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let ttl = session.ttl_secs(Utc::now());
        let id = session.id.to_string();

        conn.set_ex::<_, _, ()>(keys::session(session.id), serde_json::to_string(session)?, ttl)
            .await?;
        conn.set_ex::<_, _, ()>(keys::access_token(&session.access_token), &id, ttl)
            .await?;
        conn.set_ex::<_, _, ()>(keys::refresh_token(&session.refresh_token), &id, ttl)
            .await?;

        // Every session has the same lifetime, so the newest one expires last.
        let user_key = keys::user_sessions(session.user_id);
        conn.sadd::<_, _, ()>(&user_key, &id).await?;
        conn.expire::<_, ()>(&user_key, ttl as i64).await?;

        debug!(session_id = %session.id, user_id = %session.user_id, "Session created");
        Ok(())
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<Session>> {
        let mut conn = self.conn().await?;
        Self::load(&mut conn, id).await
    }

    async fn get_by_access_token(&self, access_token: &str) -> StoreResult<Option<Session>> {
        self.resolve_index(keys::access_token(access_token)).await
    }

    async fn get_by_refresh_token(&self, refresh_token: &str) -> StoreResult<Option<Session>> {
        self.resolve_index(keys::refresh_token(refresh_token)).await
    }

    async fn get_by_user_id(&self, user_id: Uuid) -> StoreResult<Vec<Session>> {
        let mut conn = self.conn().await?;
        let user_key = keys::user_sessions(user_id);
        let ids: Vec<String> = conn.smembers(&user_key).await?;

        let mut sessions = Vec::with_capacity(ids.len());
        for raw in ids {
            let loaded = match Uuid::parse_str(&raw) {
                Ok(id) => Self::load(&mut conn, id).await?,
                Err(_) => None,
            };
            match loaded {
                Some(session) => sessions.push(session),
                None => {
                    if let Err(e) = conn.srem::<_, _, ()>(&user_key, &raw).await {
                        warn!(error = %e, "Failed to evict expired session id from user index");
                    }
                }
            }
        }

        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    async fn delete(&self, session: &Session) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let removed: u64 = conn.del(keys::session(session.id)).await?;
        Self::remove_indexes(&mut conn, session).await;

        debug!(session_id = %session.id, removed = removed > 0, "Session deleted");
        Ok(removed > 0)
    }

    async fn delete_all_for_user(&self, user_id: Uuid) -> StoreResult<usize> {
        let sessions = self.get_by_user_id(user_id).await?;
        let mut conn = self.conn().await?;

        for session in &sessions {
            conn.del::<_, ()>(keys::session(session.id)).await?;
            Self::remove_indexes(&mut conn, session).await;
        }

        if let Err(e) = conn.del::<_, ()>(keys::user_sessions(user_id)).await {
            warn!(user_id = %user_id, error = %e, "Failed to delete user session index");
        }

        Ok(sessions.len())
    }

    async fn sweep_dangling_indexes(&self) -> StoreResult<usize> {
        let mut conn = self.conn().await?;

        let mut removed = Self::sweep_token_indexes(
            &mut conn,
            &format!("{}*", keys::ACCESS_TOKEN_PREFIX),
        )
        .await?;
        removed += Self::sweep_token_indexes(
            &mut conn,
            &format!("{}*", keys::REFRESH_TOKEN_PREFIX),
        )
        .await?;

        for user_key in Self::scan(&mut conn, &format!("{}*", keys::USER_SESSIONS_PREFIX)).await? {
            let members: Vec<String> = conn.smembers(&user_key).await?;
            for raw in members {
                let live = match Uuid::parse_str(&raw) {
                    Ok(id) => conn.exists::<_, bool>(keys::session(id)).await?,
                    Err(_) => false,
                };
                if !live {
                    conn.srem::<_, _, ()>(&user_key, &raw).await?;
                    removed += 1;
                }
            }
        }

        Ok(removed)
    }
}
