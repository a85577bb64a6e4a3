//! Persistence seams.
//!
//! Use cases depend only on these traits. `postgres` and `redis` hold the
//! production adapters, `memory` the in-process ones used by tests and local
//! runs.

pub mod memory;
pub mod postgres;
pub mod redis;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use uuid::Uuid;

use crate::error::StoreResult;
use crate::models::{
    ApiKey, NewApiKey, NewOAuthAccount, NewUser, NewUserRole, NewWorkspace, OAuthAccount,
    OAuthIdentity, OAuthTokens, PendingOAuth, Session, User, UserProfileUpdate, UserRole,
    Workspace, WorkspaceUpdate,
};

#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Fails with `StoreError::Conflict` when the email is taken.
    async fn create(&self, user: NewUser) -> StoreResult<User>;

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<User>>;

    /// `email` is expected lower-cased.
    async fn find_by_email(&self, email: &str) -> StoreResult<Option<User>>;

    async fn update_profile(
        &self,
        id: Uuid,
        update: UserProfileUpdate,
    ) -> StoreResult<Option<User>>;

    async fn find_oauth_account(
        &self,
        provider: &str,
        provider_id: &str,
    ) -> StoreResult<Option<OAuthAccount>>;

    /// Creates the user and its first linked account as one unit.
    async fn create_with_oauth_account(
        &self,
        user: NewUser,
        identity: OAuthIdentity,
    ) -> StoreResult<(User, OAuthAccount)>;

    async fn link_oauth_account(&self, account: NewOAuthAccount) -> StoreResult<OAuthAccount>;

    async fn update_oauth_tokens(&self, account_id: Uuid, tokens: OAuthTokens) -> StoreResult<()>;
}

#[async_trait]
pub trait WorkspaceRepository: Send + Sync {
    async fn create(&self, workspace: NewWorkspace) -> StoreResult<Workspace>;

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<Workspace>>;

    async fn update(&self, id: Uuid, update: WorkspaceUpdate) -> StoreResult<Option<Workspace>>;

    /// Returns whether a row was removed.
    async fn delete(&self, id: Uuid) -> StoreResult<bool>;
}

#[async_trait]
pub trait RoleRepository: Send + Sync {
    /// Plain insert; fails with `Conflict` if the membership exists.
    async fn create(&self, role: NewUserRole) -> StoreResult<UserRole>;

    /// Single composite-key lookup on `(user_id, workspace_id)`.
    async fn find(&self, user_id: Uuid, workspace_id: Uuid) -> StoreResult<Option<UserRole>>;

    /// Replaces role and custom permissions of an existing membership or creates one.
    async fn upsert(&self, role: NewUserRole) -> StoreResult<UserRole>;

    async fn delete(&self, user_id: Uuid, workspace_id: Uuid) -> StoreResult<bool>;

    async fn list_for_workspace(&self, workspace_id: Uuid) -> StoreResult<Vec<UserRole>>;
}

#[async_trait]
pub trait ApiKeyRepository: Send + Sync {
    /// Fails with `Conflict` on a prefix or hash collision.
    async fn create(&self, key: NewApiKey) -> StoreResult<ApiKey>;

    /// Looks up by hash regardless of state so callers can tell revoked from unknown.
    async fn find_by_hash(&self, key_hash: &str) -> StoreResult<Option<ApiKey>>;

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<ApiKey>>;

    async fn list_for_workspace(&self, workspace_id: Uuid) -> StoreResult<Vec<ApiKey>>;

    /// Soft delete. Returns false when the key does not exist.
    async fn revoke(&self, id: Uuid, at: NaiveDateTime) -> StoreResult<bool>;

    async fn touch_last_used(&self, id: Uuid, at: NaiveDateTime) -> StoreResult<()>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Writes the primary record and its three indexes, all expiring with the session.
    async fn create(&self, session: &Session) -> StoreResult<()>;

    async fn get(&self, id: Uuid) -> StoreResult<Option<Session>>;

    async fn get_by_access_token(&self, access_token: &str) -> StoreResult<Option<Session>>;

    async fn get_by_refresh_token(&self, refresh_token: &str) -> StoreResult<Option<Session>>;

    /// Skips ids whose primary record has already expired.
    async fn get_by_user_id(&self, user_id: Uuid) -> StoreResult<Vec<Session>>;

    /// Removing the primary record is authoritative; index cleanup is best effort.
    /// Returns whether this call removed the primary record.
    async fn delete(&self, session: &Session) -> StoreResult<bool>;

    async fn delete_all_for_user(&self, user_id: Uuid) -> StoreResult<usize>;

    /// Removes index entries that point at missing sessions. Returns the count removed.
    async fn sweep_dangling_indexes(&self) -> StoreResult<usize>;
}

#[async_trait]
pub trait LoginAttemptStore: Send + Sync {
    /// Atomic increment; the window TTL is applied on the first increment only.
    async fn increment_attempts(&self, email: &str, window_secs: u64) -> StoreResult<u64>;

    async fn attempts(&self, email: &str) -> StoreResult<u64>;

    async fn clear_attempts(&self, email: &str) -> StoreResult<()>;

    async fn lock_exists(&self, email: &str) -> StoreResult<bool>;

    async fn set_lock(&self, email: &str, ttl_secs: u64) -> StoreResult<()>;

    async fn lock_ttl(&self, email: &str) -> StoreResult<Option<u64>>;

    async fn clear_lock(&self, email: &str) -> StoreResult<()>;
}

#[async_trait]
pub trait OAuthStateStore: Send + Sync {
    async fn save(&self, state: &str, pending: &PendingOAuth, ttl_secs: u64) -> StoreResult<()>;

    /// Atomically reads and deletes, so each state can be consumed once.
    async fn take(&self, state: &str) -> StoreResult<Option<PendingOAuth>>;
}

/// Liveness probe for readiness reporting.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    fn component(&self) -> &'static str;

    async fn ping(&self) -> StoreResult<()>;
}
