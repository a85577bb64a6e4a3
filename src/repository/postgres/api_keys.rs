use async_trait::async_trait;
use chrono::NaiveDateTime;
use diesel::prelude::*;
use uuid::Uuid;

use super::Database;
use crate::error::{StoreError, StoreResult};
use crate::models::{ApiKey, ApiKeyRow, NewApiKey};
use crate::repository::ApiKeyRepository;
use crate::schema::api_keys;

#[derive(Insertable)]
#[diesel(table_name = api_keys)]
struct ApiKeyInsert {
    workspace_id: Uuid,
    user_id: Uuid,
    name: String,
    key_prefix: String,
    key_hash: String,
    scopes: serde_json::Value,
    rate_limit: i32,
    expires_at: Option<NaiveDateTime>,
}

impl TryFrom<NewApiKey> for ApiKeyInsert {
    type Error = StoreError;

    fn try_from(key: NewApiKey) -> Result<Self, Self::Error> {
        Ok(Self {
            workspace_id: key.workspace_id,
            user_id: key.user_id,
            name: key.name,
            key_prefix: key.key_prefix,
            key_hash: key.key_hash,
            scopes: serde_json::to_value(key.scopes)?,
            rate_limit: key.rate_limit,
            expires_at: key.expires_at,
        })
    }
}

#[derive(Clone)]
pub struct PgApiKeyRepository {
    db: Database,
}

impl PgApiKeyRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ApiKeyRepository for PgApiKeyRepository {
    async fn create(&self, key: NewApiKey) -> StoreResult<ApiKey> {
        let row = ApiKeyInsert::try_from(key)?;
        self.db
            .run(move |conn| {
                diesel::insert_into(api_keys::table)
                    .values(&row)
                    .returning(ApiKeyRow::as_returning())
                    .get_result(conn)
                    .map_err(StoreError::from)
                    .and_then(ApiKey::try_from)
            })
            .await
    }

    async fn find_by_hash(&self, key_hash: &str) -> StoreResult<Option<ApiKey>> {
        let key_hash = key_hash.to_string();
        self.db
            .run(move |conn| {
                api_keys::table
                    .filter(api_keys::key_hash.eq(key_hash))
                    .select(ApiKeyRow::as_select())
                    .first(conn)
                    .optional()
                    .map_err(StoreError::from)?
                    .map(ApiKey::try_from)
                    .transpose()
            })
            .await
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<ApiKey>> {
        self.db
            .run(move |conn| {
                api_keys::table
                    .find(id)
                    .select(ApiKeyRow::as_select())
                    .first(conn)
                    .optional()
                    .map_err(StoreError::from)?
                    .map(ApiKey::try_from)
                    .transpose()
            })
            .await
    }

    async fn list_for_workspace(&self, workspace_id: Uuid) -> StoreResult<Vec<ApiKey>> {
        self.db
            .run(move |conn| {
                api_keys::table
                    .filter(api_keys::workspace_id.eq(workspace_id))
                    .order(api_keys::created_at.asc())
                    .select(ApiKeyRow::as_select())
                    .load(conn)
                    .map_err(StoreError::from)?
                    .into_iter()
                    .map(ApiKey::try_from)
                    .collect()
            })
            .await
    }

    async fn revoke(&self, id: Uuid, at: NaiveDateTime) -> StoreResult<bool> {
        self.db
            .run(move |conn| {
                diesel::update(api_keys::table.find(id))
                    .set((api_keys::active.eq(false), api_keys::revoked_at.eq(Some(at))))
                    .execute(conn)
                    .map(|rows| rows > 0)
                    .map_err(StoreError::from)
            })
            .await
    }

    async fn touch_last_used(&self, id: Uuid, at: NaiveDateTime) -> StoreResult<()> {
        self.db
            .run(move |conn| {
                diesel::update(api_keys::table.find(id))
                    .set(api_keys::last_used_at.eq(Some(at)))
                    .execute(conn)
                    .map(|_| ())
                    .map_err(StoreError::from)
            })
            .await
    }
}
