//! In-process stores with emulated TTLs.
//!
//! They honour the same contracts as the Postgres and Redis adapters
//! (uniqueness conflicts, expiry, single-use state) and back the integration
//! tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    ApiKeyRepository, HealthProbe, LoginAttemptStore, OAuthStateStore, RoleRepository,
    SessionStore, UserRepository, WorkspaceRepository,
};
use crate::error::{StoreError, StoreResult};
use crate::models::{
    ApiKey, NewApiKey, NewOAuthAccount, NewUser, NewUserRole, NewWorkspace, OAuthAccount,
    OAuthIdentity, OAuthTokens, PendingOAuth, Session, User, UserProfileUpdate, UserRole,
    Workspace, WorkspaceUpdate,
};

#[derive(Default)]
struct UserTables {
    users: HashMap<Uuid, User>,
    accounts: HashMap<Uuid, OAuthAccount>,
}

impl UserTables {
    fn insert_user(&mut self, user: NewUser) -> StoreResult<User> {
        if self.users.values().any(|u| u.email == user.email) {
            return Err(StoreError::Conflict("users_email_key".to_string()));
        }

        let now = Utc::now().naive_utc();
        let user = User {
            id: Uuid::new_v4(),
            email: user.email,
            password_hash: user.password_hash,
            first_name: user.first_name,
            last_name: user.last_name,
            avatar_url: user.avatar_url,
            email_verified: user.email_verified,
            active: true,
            created_at: now,
            updated_at: now,
        };
        self.users.insert(user.id, user.clone());
        Ok(user)
    }

    fn insert_account(&mut self, account: NewOAuthAccount) -> StoreResult<OAuthAccount> {
        if !self.users.contains_key(&account.user_id) {
            return Err(StoreError::Backend(
                "oauth_accounts_user_id_fkey violated".to_string(),
            ));
        }

        if self
            .accounts
            .values()
            .any(|a| a.provider == account.provider && a.provider_id == account.provider_id)
        {
            return Err(StoreError::Conflict(
                "oauth_accounts_provider_provider_id_key".to_string(),
            ));
        }

        let now = Utc::now().naive_utc();
        let account = OAuthAccount {
            id: Uuid::new_v4(),
            user_id: account.user_id,
            provider: account.provider,
            provider_id: account.provider_id,
            email: account.email,
            access_token: account.access_token,
            refresh_token: account.refresh_token,
            expires_at: account.expires_at,
            created_at: now,
            updated_at: now,
        };
        self.accounts.insert(account.id, account.clone());
        Ok(account)
    }
}

#[derive(Default)]
pub struct MemoryUserRepository {
    inner: Mutex<UserTables>,
}

impl MemoryUserRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flips the active flag; there is no operation for it in the service surface.
    pub async fn set_active(&self, id: Uuid, active: bool) {
        if let Some(user) = self.inner.lock().await.users.get_mut(&id) {
            user.active = active;
        }
    }

    pub async fn account_count(&self) -> usize {
        self.inner.lock().await.accounts.len()
    }
}

#[async_trait]
impl UserRepository for MemoryUserRepository {
    async fn create(&self, user: NewUser) -> StoreResult<User> {
        self.inner.lock().await.insert_user(user)
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<User>> {
        Ok(self.inner.lock().await.users.get(&id).cloned())
    }

    async fn find_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        Ok(self
            .inner
            .lock()
            .await
            .users
            .values()
            .find(|u| u.email == email)
            .cloned())
    }

    async fn update_profile(
        &self,
        id: Uuid,
        update: UserProfileUpdate,
    ) -> StoreResult<Option<User>> {
        let mut tables = self.inner.lock().await;
        let Some(user) = tables.users.get_mut(&id) else {
            return Ok(None);
        };

        if let Some(first_name) = update.first_name {
            user.first_name = Some(first_name);
        }
        if let Some(last_name) = update.last_name {
            user.last_name = Some(last_name);
        }
        if let Some(avatar_url) = update.avatar_url {
            user.avatar_url = Some(avatar_url);
        }
        user.updated_at = Utc::now().naive_utc();

        Ok(Some(user.clone()))
    }

    async fn find_oauth_account(
        &self,
        provider: &str,
        provider_id: &str,
    ) -> StoreResult<Option<OAuthAccount>> {
        Ok(self
            .inner
            .lock()
            .await
            .accounts
            .values()
            .find(|a| a.provider == provider && a.provider_id == provider_id)
            .cloned())
    }

    async fn create_with_oauth_account(
        &self,
        user: NewUser,
        identity: OAuthIdentity,
    ) -> StoreResult<(User, OAuthAccount)> {
        let mut tables = self.inner.lock().await;
        let user = tables.insert_user(user)?;
        match tables.insert_account(NewOAuthAccount::for_user(user.id, &identity)) {
            Ok(account) => Ok((user, account)),
            Err(e) => {
                tables.users.remove(&user.id);
                Err(e)
            }
        }
    }

    async fn link_oauth_account(&self, account: NewOAuthAccount) -> StoreResult<OAuthAccount> {
        self.inner.lock().await.insert_account(account)
    }

    async fn update_oauth_tokens(&self, account_id: Uuid, tokens: OAuthTokens) -> StoreResult<()> {
        let mut tables = self.inner.lock().await;
        if let Some(account) = tables.accounts.get_mut(&account_id) {
            account.access_token = Some(tokens.access_token);
            if tokens.refresh_token.is_some() {
                account.refresh_token = tokens.refresh_token;
            }
            account.expires_at = tokens.expires_at;
            account.updated_at = Utc::now().naive_utc();
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryWorkspaceRepository {
    workspaces: Mutex<HashMap<Uuid, Workspace>>,
}

impl MemoryWorkspaceRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkspaceRepository for MemoryWorkspaceRepository {
    async fn create(&self, workspace: NewWorkspace) -> StoreResult<Workspace> {
        let now = Utc::now().naive_utc();
        let workspace = Workspace {
            id: Uuid::new_v4(),
            name: workspace.name,
            owner_id: workspace.owner_id,
            description: workspace.description,
            active: true,
            plan: workspace.plan,
            settings: workspace.settings,
            created_at: now,
            updated_at: now,
        };
        self.workspaces
            .lock()
            .await
            .insert(workspace.id, workspace.clone());
        Ok(workspace)
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<Workspace>> {
        Ok(self.workspaces.lock().await.get(&id).cloned())
    }

    async fn update(&self, id: Uuid, update: WorkspaceUpdate) -> StoreResult<Option<Workspace>> {
        let mut workspaces = self.workspaces.lock().await;
        let Some(workspace) = workspaces.get_mut(&id) else {
            return Ok(None);
        };

        if let Some(name) = update.name {
            workspace.name = name;
        }
        if let Some(description) = update.description {
            workspace.description = Some(description);
        }
        if let Some(plan) = update.plan {
            workspace.plan = plan;
        }
        if let Some(settings) = update.settings {
            workspace.settings = settings;
        }
        workspace.updated_at = Utc::now().naive_utc();

        Ok(Some(workspace.clone()))
    }

    async fn delete(&self, id: Uuid) -> StoreResult<bool> {
        Ok(self.workspaces.lock().await.remove(&id).is_some())
    }
}

#[derive(Default)]
pub struct MemoryRoleRepository {
    roles: Mutex<HashMap<(Uuid, Uuid), UserRole>>,
    users: Option<Arc<MemoryUserRepository>>,
}

impl MemoryRoleRepository {
    /// Accepts any user id.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects memberships for users missing from `users`, like the
    /// `user_roles.user_id` foreign key.
    pub fn with_users(users: Arc<MemoryUserRepository>) -> Self {
        Self {
            roles: Mutex::default(),
            users: Some(users),
        }
    }

    async fn check_user(&self, user_id: Uuid) -> StoreResult<()> {
        let Some(users) = &self.users else {
            return Ok(());
        };
        if users.inner.lock().await.users.contains_key(&user_id) {
            Ok(())
        } else {
            Err(StoreError::MissingReference(
                "user_roles_user_id_fkey".to_string(),
            ))
        }
    }
}

fn build_role(role: NewUserRole) -> UserRole {
    let now = Utc::now().naive_utc();
    UserRole {
        id: Uuid::new_v4(),
        user_id: role.user_id,
        workspace_id: role.workspace_id,
        role: role.role,
        permissions: role.permissions,
        created_by: role.created_by,
        created_at: now,
        updated_at: now,
    }
}

#[async_trait]
impl RoleRepository for MemoryRoleRepository {
    async fn create(&self, role: NewUserRole) -> StoreResult<UserRole> {
        self.check_user(role.user_id).await?;
        let mut roles = self.roles.lock().await;
        let key = (role.user_id, role.workspace_id);
        if roles.contains_key(&key) {
            return Err(StoreError::Conflict(
                "user_roles_user_id_workspace_id_key".to_string(),
            ));
        }
        let role = build_role(role);
        roles.insert(key, role.clone());
        Ok(role)
    }

    async fn find(&self, user_id: Uuid, workspace_id: Uuid) -> StoreResult<Option<UserRole>> {
        Ok(self.roles.lock().await.get(&(user_id, workspace_id)).cloned())
    }

    async fn upsert(&self, role: NewUserRole) -> StoreResult<UserRole> {
        let key = (role.user_id, role.workspace_id);
        if !self.roles.lock().await.contains_key(&key) {
            self.check_user(role.user_id).await?;
        }

        let mut roles = self.roles.lock().await;
        match roles.get_mut(&key) {
            Some(existing) => {
                existing.role = role.role;
                existing.permissions = role.permissions;
                existing.updated_at = Utc::now().naive_utc();
                Ok(existing.clone())
            }
            None => {
                let role = build_role(role);
                roles.insert(key, role.clone());
                Ok(role)
            }
        }
    }

    async fn delete(&self, user_id: Uuid, workspace_id: Uuid) -> StoreResult<bool> {
        Ok(self
            .roles
            .lock()
            .await
            .remove(&(user_id, workspace_id))
            .is_some())
    }

    async fn list_for_workspace(&self, workspace_id: Uuid) -> StoreResult<Vec<UserRole>> {
        let mut members: Vec<UserRole> = self
            .roles
            .lock()
            .await
            .values()
            .filter(|r| r.workspace_id == workspace_id)
            .cloned()
            .collect();
        members.sort_by_key(|r| r.created_at);
        Ok(members)
    }
}

#[derive(Default)]
pub struct MemoryApiKeyRepository {
    keys: Mutex<HashMap<Uuid, ApiKey>>,
}

impl MemoryApiKeyRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ApiKeyRepository for MemoryApiKeyRepository {
    async fn create(&self, key: NewApiKey) -> StoreResult<ApiKey> {
        let mut keys = self.keys.lock().await;
        if keys.values().any(|k| k.key_prefix == key.key_prefix) {
            return Err(StoreError::Conflict("api_keys_key_prefix_key".to_string()));
        }
        if keys.values().any(|k| k.key_hash == key.key_hash) {
            return Err(StoreError::Conflict("api_keys_key_hash_key".to_string()));
        }

        let key = ApiKey {
            id: Uuid::new_v4(),
            workspace_id: key.workspace_id,
            user_id: key.user_id,
            name: key.name,
            key_prefix: key.key_prefix,
            key_hash: key.key_hash,
            active: true,
            scopes: key.scopes,
            rate_limit: key.rate_limit,
            expires_at: key.expires_at,
            revoked_at: None,
            last_used_at: None,
            created_at: Utc::now().naive_utc(),
        };
        keys.insert(key.id, key.clone());
        Ok(key)
    }

    async fn find_by_hash(&self, key_hash: &str) -> StoreResult<Option<ApiKey>> {
        Ok(self
            .keys
            .lock()
            .await
            .values()
            .find(|k| k.key_hash == key_hash)
            .cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<ApiKey>> {
        Ok(self.keys.lock().await.get(&id).cloned())
    }

    async fn list_for_workspace(&self, workspace_id: Uuid) -> StoreResult<Vec<ApiKey>> {
        let mut keys: Vec<ApiKey> = self
            .keys
            .lock()
            .await
            .values()
            .filter(|k| k.workspace_id == workspace_id)
            .cloned()
            .collect();
        keys.sort_by_key(|k| k.created_at);
        Ok(keys)
    }

    async fn revoke(&self, id: Uuid, at: chrono::NaiveDateTime) -> StoreResult<bool> {
        let mut keys = self.keys.lock().await;
        match keys.get_mut(&id) {
            Some(key) => {
                key.active = false;
                key.revoked_at = Some(at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn touch_last_used(&self, id: Uuid, at: chrono::NaiveDateTime) -> StoreResult<()> {
        if let Some(key) = self.keys.lock().await.get_mut(&id) {
            key.last_used_at = Some(at);
        }
        Ok(())
    }
}

#[derive(Default)]
struct SessionTables {
    sessions: HashMap<Uuid, Session>,
    access_index: HashMap<String, Uuid>,
    refresh_index: HashMap<String, Uuid>,
    user_index: HashMap<Uuid, HashSet<Uuid>>,
}

impl SessionTables {
    /// Expired primaries behave as if their TTL had fired.
    fn live(&mut self, id: Uuid) -> Option<Session> {
        let now = Utc::now();
        match self.sessions.get(&id) {
            Some(session) if !session.is_expired_at(now) => Some(session.clone()),
            Some(_) => {
                self.sessions.remove(&id);
                None
            }
            None => None,
        }
    }

    fn remove_indexes(&mut self, session: &Session) {
        self.access_index.remove(&session.access_token);
        self.refresh_index.remove(&session.refresh_token);
        if let Some(ids) = self.user_index.get_mut(&session.user_id) {
            ids.remove(&session.id);
            if ids.is_empty() {
                self.user_index.remove(&session.user_id);
            }
        }
    }
}

#[derive(Default)]
pub struct MemorySessionStore {
    inner: Mutex<SessionTables>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops only the primary record, leaving the indexes behind the way an
    /// interrupted delete would.
    pub async fn forget_primary(&self, id: Uuid) {
        self.inner.lock().await.sessions.remove(&id);
    }

    pub async fn index_len(&self) -> usize {
        let tables = self.inner.lock().await;
        tables.access_index.len()
            + tables.refresh_index.len()
            + tables.user_index.values().map(HashSet::len).sum::<usize>()
    }

    pub async fn session_count(&self) -> usize {
        self.inner.lock().await.sessions.len()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, session: &Session) -> StoreResult<()> {
        let mut tables = self.inner.lock().await;
        tables.sessions.insert(session.id, session.clone());
        tables
            .access_index
            .insert(session.access_token.clone(), session.id);
        tables
            .refresh_index
            .insert(session.refresh_token.clone(), session.id);
        tables
            .user_index
            .entry(session.user_id)
            .or_default()
            .insert(session.id);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<Session>> {
        Ok(self.inner.lock().await.live(id))
    }

    async fn get_by_access_token(&self, access_token: &str) -> StoreResult<Option<Session>> {
        let mut tables = self.inner.lock().await;
        let Some(id) = tables.access_index.get(access_token).copied() else {
            return Ok(None);
        };
        let session = tables.live(id);
        if session.is_none() {
            tables.access_index.remove(access_token);
        }
        Ok(session)
    }

    async fn get_by_refresh_token(&self, refresh_token: &str) -> StoreResult<Option<Session>> {
        let mut tables = self.inner.lock().await;
        let Some(id) = tables.refresh_index.get(refresh_token).copied() else {
            return Ok(None);
        };

        // Expired sessions are still returned here so refresh can report
        // TokenExpired; only a missing primary counts as dangling.
        match tables.sessions.get(&id) {
            Some(session) => Ok(Some(session.clone())),
            None => {
                tables.refresh_index.remove(refresh_token);
                Ok(None)
            }
        }
    }

    async fn get_by_user_id(&self, user_id: Uuid) -> StoreResult<Vec<Session>> {
        let mut tables = self.inner.lock().await;
        let ids: Vec<Uuid> = tables
            .user_index
            .get(&user_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();

        let mut sessions = Vec::with_capacity(ids.len());
        for id in ids {
            match tables.live(id) {
                Some(session) => sessions.push(session),
                None => {
                    if let Some(set) = tables.user_index.get_mut(&user_id) {
                        set.remove(&id);
                    }
                }
            }
        }
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    async fn delete(&self, session: &Session) -> StoreResult<bool> {
        let mut tables = self.inner.lock().await;
        let removed = tables.sessions.remove(&session.id).is_some();
        tables.remove_indexes(session);
        Ok(removed)
    }

    async fn delete_all_for_user(&self, user_id: Uuid) -> StoreResult<usize> {
        let mut tables = self.inner.lock().await;
        let ids: Vec<Uuid> = tables
            .user_index
            .remove(&user_id)
            .map(|ids| ids.into_iter().collect())
            .unwrap_or_default();

        let mut removed = 0;
        for id in ids {
            if let Some(session) = tables.sessions.remove(&id) {
                tables.access_index.remove(&session.access_token);
                tables.refresh_index.remove(&session.refresh_token);
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn sweep_dangling_indexes(&self) -> StoreResult<usize> {
        let mut tables = self.inner.lock().await;
        let now = Utc::now();
        tables.sessions.retain(|_, s| !s.is_expired_at(now));

        let SessionTables {
            sessions,
            access_index,
            refresh_index,
            user_index,
        } = &mut *tables;

        let before = access_index.len()
            + refresh_index.len()
            + user_index.values().map(HashSet::len).sum::<usize>();

        access_index.retain(|_, id| sessions.contains_key(id));
        refresh_index.retain(|_, id| sessions.contains_key(id));
        for ids in user_index.values_mut() {
            ids.retain(|id| sessions.contains_key(id));
        }
        user_index.retain(|_, ids| !ids.is_empty());

        let after = access_index.len()
            + refresh_index.len()
            + user_index.values().map(HashSet::len).sum::<usize>();

        Ok(before - after)
    }
}

struct Expiring<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Expiring<T> {
    fn new(value: T, ttl_secs: u64) -> Self {
        Self {
            value,
            expires_at: Instant::now() + Duration::from_secs(ttl_secs),
        }
    }

    fn is_live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

#[derive(Default)]
struct AttemptTables {
    counters: HashMap<String, Expiring<u64>>,
    locks: HashMap<String, Expiring<()>>,
}

#[derive(Default)]
pub struct MemoryLoginAttemptStore {
    inner: Mutex<AttemptTables>,
}

impl MemoryLoginAttemptStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LoginAttemptStore for MemoryLoginAttemptStore {
    async fn increment_attempts(&self, email: &str, window_secs: u64) -> StoreResult<u64> {
        let mut tables = self.inner.lock().await;
        let live = tables.counters.get(email).is_some_and(Expiring::is_live);
        if !live {
            tables
                .counters
                .insert(email.to_string(), Expiring::new(0, window_secs));
        }

        let counter = tables
            .counters
            .get_mut(email)
            .ok_or_else(|| StoreError::Backend("attempt counter vanished".to_string()))?;
        counter.value += 1;
        Ok(counter.value)
    }

    async fn attempts(&self, email: &str) -> StoreResult<u64> {
        Ok(self
            .inner
            .lock()
            .await
            .counters
            .get(email)
            .filter(|c| c.is_live())
            .map(|c| c.value)
            .unwrap_or(0))
    }

    async fn clear_attempts(&self, email: &str) -> StoreResult<()> {
        self.inner.lock().await.counters.remove(email);
        Ok(())
    }

    async fn lock_exists(&self, email: &str) -> StoreResult<bool> {
        Ok(self
            .inner
            .lock()
            .await
            .locks
            .get(email)
            .is_some_and(Expiring::is_live))
    }

    async fn set_lock(&self, email: &str, ttl_secs: u64) -> StoreResult<()> {
        self.inner
            .lock()
            .await
            .locks
            .insert(email.to_string(), Expiring::new((), ttl_secs));
        Ok(())
    }

    async fn lock_ttl(&self, email: &str) -> StoreResult<Option<u64>> {
        let tables = self.inner.lock().await;
        Ok(tables.locks.get(email).filter(|l| l.is_live()).map(|l| {
            let remaining = l.expires_at.saturating_duration_since(Instant::now());
            remaining.as_millis().div_ceil(1000).max(1) as u64
        }))
    }

    async fn clear_lock(&self, email: &str) -> StoreResult<()> {
        self.inner.lock().await.locks.remove(email);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryOAuthStateStore {
    states: Mutex<HashMap<String, Expiring<PendingOAuth>>>,
}

impl MemoryOAuthStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OAuthStateStore for MemoryOAuthStateStore {
    async fn save(&self, state: &str, pending: &PendingOAuth, ttl_secs: u64) -> StoreResult<()> {
        self.states
            .lock()
            .await
            .insert(state.to_string(), Expiring::new(pending.clone(), ttl_secs));
        Ok(())
    }

    async fn take(&self, state: &str) -> StoreResult<Option<PendingOAuth>> {
        Ok(self
            .states
            .lock()
            .await
            .remove(state)
            .filter(Expiring::is_live)
            .map(|entry| entry.value))
    }
}

/// Always-healthy probe standing in for a backend.
pub struct MemoryProbe {
    component: &'static str,
}

impl MemoryProbe {
    pub fn new(component: &'static str) -> Self {
        Self { component }
    }
}

#[async_trait]
impl HealthProbe for MemoryProbe {
    fn component(&self) -> &'static str {
        self.component
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use chrono::Duration as ChronoDuration;

    fn session(user_id: Uuid, ttl_secs: i64) -> Session {
        let now = Utc::now();
        Session {
            id: Uuid::new_v4(),
            user_id,
            access_token: format!("access-{}", Uuid::new_v4()),
            refresh_token: format!("refresh-{}", Uuid::new_v4()),
            expires_at: now + ChronoDuration::seconds(ttl_secs),
            user_agent: None,
            ip_address: None,
            created_at: now,
        }
    }

    #[tokio::test]
    async fn test_session_lookup_through_every_index() {
        let store = MemorySessionStore::new();
        let user_id = Uuid::new_v4();
        let session = session(user_id, 60);
        store.create(&session).await.unwrap();

        assert_eq!(store.get(session.id).await.unwrap(), Some(session.clone()));
        assert_eq!(
            store.get_by_access_token(&session.access_token).await.unwrap(),
            Some(session.clone())
        );
        assert_eq!(
            store.get_by_refresh_token(&session.refresh_token).await.unwrap(),
            Some(session.clone())
        );
        assert_eq!(store.get_by_user_id(user_id).await.unwrap(), vec![session.clone()]);

        store.delete(&session).await.unwrap();
        assert_eq!(store.get(session.id).await.unwrap(), None);
        assert_eq!(store.index_len().await, 0);
    }

    #[tokio::test]
    async fn test_dangling_index_is_repaired_on_read() {
        let store = MemorySessionStore::new();
        let session = session(Uuid::new_v4(), 60);
        store.create(&session).await.unwrap();
        store.forget_primary(session.id).await;

        assert_eq!(
            store.get_by_access_token(&session.access_token).await.unwrap(),
            None
        );
        assert!(store.get_by_user_id(session.user_id).await.unwrap().is_empty());
        // Only the refresh index is still dangling.
        assert_eq!(store.index_len().await, 1);

        assert_eq!(store.sweep_dangling_indexes().await.unwrap(), 1);
        assert_eq!(store.index_len().await, 0);
    }

    #[tokio::test]
    async fn test_user_listing_skips_expired_sessions() {
        let store = MemorySessionStore::new();
        let user_id = Uuid::new_v4();
        let live = session(user_id, 60);
        let expired = session(user_id, -1);
        store.create(&live).await.unwrap();
        store.create(&expired).await.unwrap();

        assert_eq!(store.get_by_user_id(user_id).await.unwrap(), vec![live]);
    }

    #[tokio::test]
    async fn test_delete_all_for_user() {
        let store = MemorySessionStore::new();
        let user_id = Uuid::new_v4();
        let other = session(Uuid::new_v4(), 60);
        for _ in 0..3 {
            store.create(&session(user_id, 60)).await.unwrap();
        }
        store.create(&other).await.unwrap();

        assert_eq!(store.delete_all_for_user(user_id).await.unwrap(), 3);
        assert_eq!(store.session_count().await, 1);
        assert!(store.get(other.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_oauth_state_is_single_use() {
        let store = MemoryOAuthStateStore::new();
        let pending = PendingOAuth {
            provider: "google".to_string(),
            redirect_uri: "https://app.example.com/cb".to_string(),
            created_at: Utc::now(),
        };
        store.save("s1", &pending, 60).await.unwrap();

        assert_eq!(store.take("s1").await.unwrap(), Some(pending));
        assert_eq!(store.take("s1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_duplicate_email_conflicts() {
        let repo = MemoryUserRepository::new();
        let new_user = NewUser {
            email: "a@b.com".to_string(),
            password_hash: None,
            first_name: None,
            last_name: None,
            avatar_url: None,
            email_verified: false,
        };
        repo.create(new_user.clone()).await.unwrap();

        assert!(matches!(
            repo.create(new_user).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_memberships_require_a_known_user() {
        let users = Arc::new(MemoryUserRepository::new());
        let roles = MemoryRoleRepository::with_users(users.clone());
        let workspace_id = Uuid::new_v4();
        let membership = |user_id| NewUserRole {
            user_id,
            workspace_id,
            role: Role::Viewer,
            permissions: vec![],
            created_by: None,
        };

        let stranger = Uuid::new_v4();
        assert!(matches!(
            roles.upsert(membership(stranger)).await,
            Err(StoreError::MissingReference(_))
        ));
        assert!(matches!(
            roles.create(membership(stranger)).await,
            Err(StoreError::MissingReference(_))
        ));

        let user = users
            .create(NewUser {
                email: "member@example.com".to_string(),
                password_hash: None,
                first_name: None,
                last_name: None,
                avatar_url: None,
                email_verified: false,
            })
            .await
            .unwrap();
        assert_eq!(roles.upsert(membership(user.id)).await.unwrap().user_id, user.id);
    }

    #[tokio::test]
    async fn test_attempt_window_resets_counter() {
        let store = MemoryLoginAttemptStore::new();
        assert_eq!(store.increment_attempts("a@b.com", 60).await.unwrap(), 1);
        assert_eq!(store.increment_attempts("a@b.com", 60).await.unwrap(), 2);

        store.clear_attempts("a@b.com").await.unwrap();
        assert_eq!(store.attempts("a@b.com").await.unwrap(), 0);
    }
}
