use async_trait::async_trait;
use diesel::prelude::*;
use uuid::Uuid;

use super::Database;
use crate::error::{StoreError, StoreResult};
use crate::models::{
    NewOAuthAccount, NewUser, OAuthAccount, OAuthIdentity, OAuthTokens, User, UserProfileUpdate,
};
use crate::repository::UserRepository;
use crate::schema::{oauth_accounts, users};

#[derive(Clone)]
pub struct PgUserRepository {
    db: Database,
}

impl PgUserRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl UserRepository for PgUserRepository {
    async fn create(&self, user: NewUser) -> StoreResult<User> {
        self.db
            .run(move |conn| {
                diesel::insert_into(users::table)
                    .values(&user)
                    .returning(User::as_returning())
                    .get_result(conn)
                    .map_err(StoreError::from)
            })
            .await
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<User>> {
        self.db
            .run(move |conn| {
                users::table
                    .find(id)
                    .select(User::as_select())
                    .first(conn)
                    .optional()
                    .map_err(StoreError::from)
            })
            .await
    }

    async fn find_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let email = email.to_string();
        self.db
            .run(move |conn| {
                users::table
                    .filter(users::email.eq(email))
                    .select(User::as_select())
                    .first(conn)
                    .optional()
                    .map_err(StoreError::from)
            })
            .await
    }

    async fn update_profile(
        &self,
        id: Uuid,
        update: UserProfileUpdate,
    ) -> StoreResult<Option<User>> {
        self.db
            .run(move |conn| {
                diesel::update(users::table.find(id))
                    .set((&update, users::updated_at.eq(diesel::dsl::now)))
                    .returning(User::as_returning())
                    .get_result(conn)
                    .optional()
                    .map_err(StoreError::from)
            })
            .await
    }

    async fn find_oauth_account(
        &self,
        provider: &str,
        provider_id: &str,
    ) -> StoreResult<Option<OAuthAccount>> {
        let provider = provider.to_string();
        let provider_id = provider_id.to_string();
        self.db
            .run(move |conn| {
                oauth_accounts::table
                    .filter(oauth_accounts::provider.eq(provider))
                    .filter(oauth_accounts::provider_id.eq(provider_id))
                    .select(OAuthAccount::as_select())
                    .first(conn)
                    .optional()
                    .map_err(StoreError::from)
            })
            .await
    }

    async fn create_with_oauth_account(
        &self,
        user: NewUser,
        identity: OAuthIdentity,
    ) -> StoreResult<(User, OAuthAccount)> {
        self.db
            .run(move |conn| {
                conn.transaction::<_, StoreError, _>(|conn| {
                    let user: User = diesel::insert_into(users::table)
                        .values(&user)
                        .returning(User::as_returning())
                        .get_result(conn)?;

                    let account: OAuthAccount = diesel::insert_into(oauth_accounts::table)
                        .values(&NewOAuthAccount::for_user(user.id, &identity))
                        .returning(OAuthAccount::as_returning())
                        .get_result(conn)?;

                    Ok((user, account))
                })
            })
            .await
    }

    async fn link_oauth_account(&self, account: NewOAuthAccount) -> StoreResult<OAuthAccount> {
        self.db
            .run(move |conn| {
                diesel::insert_into(oauth_accounts::table)
                    .values(&account)
                    .returning(OAuthAccount::as_returning())
                    .get_result(conn)
                    .map_err(StoreError::from)
            })
            .await
    }

    async fn update_oauth_tokens(&self, account_id: Uuid, tokens: OAuthTokens) -> StoreResult<()> {
        self.db
            .run(move |conn| {
                let target = oauth_accounts::table.find(account_id);
                let updated = match tokens.refresh_token {
                    Some(refresh_token) => diesel::update(target)
                        .set((
                            oauth_accounts::access_token.eq(Some(tokens.access_token)),
                            oauth_accounts::refresh_token.eq(Some(refresh_token)),
                            oauth_accounts::expires_at.eq(tokens.expires_at),
                            oauth_accounts::updated_at.eq(diesel::dsl::now),
                        ))
                        .execute(conn),
                    // Providers that rotate only on request keep the stored one.
                    None => diesel::update(target)
                        .set((
                            oauth_accounts::access_token.eq(Some(tokens.access_token)),
                            oauth_accounts::expires_at.eq(tokens.expires_at),
                            oauth_accounts::updated_at.eq(diesel::dsl::now),
                        ))
                        .execute(conn),
                };
                updated.map(|_| ()).map_err(StoreError::from)
            })
            .await
    }
}
