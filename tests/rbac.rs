//! Workspace, membership and API key behaviour of the RBAC use case.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use uuid::Uuid;

use portcullis::auth::api_key::generate_api_key;
use portcullis::auth::permissions::{self, default_permissions};
use portcullis::error::{AuthError, StoreError, StoreResult};
use portcullis::models::{
    NewApiKey, NewUser, NewUserRole, NewWorkspace, Role, UserRole, Workspace, WorkspaceUpdate,
};
use portcullis::repository::memory::{
    MemoryApiKeyRepository, MemoryRoleRepository, MemoryUserRepository, MemoryWorkspaceRepository,
};
use portcullis::repository::{
    ApiKeyRepository, RoleRepository, UserRepository, WorkspaceRepository,
};
use portcullis::usecase::{
    CreateWorkspaceInput, GenerateApiKeyInput, RbacUseCase, UpdateWorkspaceInput,
};

struct Harness {
    rbac: RbacUseCase,
    api_keys: Arc<MemoryApiKeyRepository>,
}

fn harness() -> Harness {
    let api_keys = Arc::new(MemoryApiKeyRepository::new());
    let rbac = RbacUseCase::new(
        Arc::new(MemoryWorkspaceRepository::new()),
        Arc::new(MemoryRoleRepository::new()),
        api_keys.clone(),
    );
    Harness { rbac, api_keys }
}

async fn workspace(rbac: &RbacUseCase, owner: Uuid) -> Workspace {
    rbac.create_workspace(
        owner,
        CreateWorkspaceInput {
            name: "Acme".to_string(),
            description: Some("Test workspace".to_string()),
        },
    )
    .await
    .expect("workspace should be created")
}

fn key_input(workspace_id: Uuid) -> GenerateApiKeyInput {
    GenerateApiKeyInput {
        workspace_id,
        name: "ci".to_string(),
        scopes: vec!["workflow:execute".to_string()],
        rate_limit: Some(50),
        expires_at: None,
    }
}

#[tokio::test]
async fn test_permission_sets_grow_with_role() {
    let h = harness();
    let owner = Uuid::new_v4();
    let ws = workspace(&h.rbac, owner).await;

    let ladder = [Role::Viewer, Role::User, Role::Developer, Role::Admin];
    let mut members = Vec::new();
    for role in ladder {
        let member = Uuid::new_v4();
        h.rbac
            .assign_role(owner, member, ws.id, role, vec![])
            .await
            .unwrap();
        members.push((role, member));
    }

    for (i, (_, lower)) in members.iter().enumerate() {
        for (higher_role, higher) in &members[i..] {
            for permission in default_permissions(members[i].0) {
                assert!(
                    h.rbac.check_permission(*lower, ws.id, permission).await.unwrap(),
                    "{} should hold {}",
                    members[i].0,
                    permission
                );
                assert!(
                    h.rbac.check_permission(*higher, ws.id, permission).await.unwrap(),
                    "{} should hold {}",
                    higher_role,
                    permission
                );
            }
        }
    }
}

#[tokio::test]
async fn test_viewer_cannot_manage_members() {
    let h = harness();
    let owner = Uuid::new_v4();
    let viewer = Uuid::new_v4();
    let ws = workspace(&h.rbac, owner).await;
    h.rbac
        .assign_role(owner, viewer, ws.id, Role::Viewer, vec![])
        .await
        .unwrap();

    assert_eq!(h.rbac.list_members(viewer, ws.id).await.unwrap().len(), 2);

    let err = h
        .rbac
        .assign_role(viewer, Uuid::new_v4(), ws.id, Role::User, vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::InsufficientPermission(p) if p == permissions::USER_WRITE));
}

#[tokio::test]
async fn test_reassigning_role_replaces_membership() {
    let h = harness();
    let owner = Uuid::new_v4();
    let member = Uuid::new_v4();
    let ws = workspace(&h.rbac, owner).await;

    h.rbac
        .assign_role(owner, member, ws.id, Role::Developer, vec![])
        .await
        .unwrap();
    let demoted = h
        .rbac
        .assign_role(owner, member, ws.id, Role::Viewer, vec![])
        .await
        .unwrap();

    assert_eq!(demoted.role, Role::Viewer);
    assert_eq!(h.rbac.list_members(owner, ws.id).await.unwrap().len(), 2);
    assert!(!h
        .rbac
        .check_permission(member, ws.id, permissions::APIKEY_CREATE)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_owner_cannot_be_removed_or_demoted() {
    let h = harness();
    let owner = Uuid::new_v4();
    let admin = Uuid::new_v4();
    let ws = workspace(&h.rbac, owner).await;
    h.rbac
        .assign_role(owner, admin, ws.id, Role::Admin, vec![])
        .await
        .unwrap();

    let err = h.rbac.remove_user(admin, owner, ws.id).await.unwrap_err();
    assert!(matches!(err, AuthError::OwnerProtected));

    let err = h
        .rbac
        .assign_role(admin, owner, ws.id, Role::Viewer, vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::OwnerProtected));

    h.rbac.remove_user(owner, admin, ws.id).await.unwrap();
    let err = h.rbac.remove_user(owner, admin, ws.id).await.unwrap_err();
    assert!(matches!(err, AuthError::RoleNotFound));
}

#[tokio::test]
async fn test_update_workspace_requires_object_settings() {
    let h = harness();
    let owner = Uuid::new_v4();
    let ws = workspace(&h.rbac, owner).await;

    let updated = h
        .rbac
        .update_workspace(
            owner,
            ws.id,
            UpdateWorkspaceInput {
                plan: Some("Pro".to_string()),
                settings: Some(serde_json::json!({"theme": "dark"})),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.plan, "pro");
    assert_eq!(updated.name, "Acme");
    assert_eq!(updated.settings["theme"], "dark");

    let err = h
        .rbac
        .update_workspace(
            owner,
            ws.id,
            UpdateWorkspaceInput {
                settings: Some(serde_json::json!([1, 2, 3])),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::Validation(_)));
}

#[tokio::test]
async fn test_api_key_round_trip() {
    let h = harness();
    let owner = Uuid::new_v4();
    let ws = workspace(&h.rbac, owner).await;

    let issued = h.rbac.generate_api_key(owner, key_input(ws.id)).await.unwrap();
    assert!(issued.plaintext.starts_with(&issued.key.key_prefix));
    assert_ne!(issued.key.key_hash, issued.plaintext);
    assert!(!format!("{:?}", issued).contains(&issued.plaintext));

    let validated = h.rbac.validate_api_key(&issued.plaintext).await.unwrap();
    assert_eq!(validated.id, issued.key.id);
    assert_eq!(validated.rate_limit, 50);
    assert_eq!(validated.scopes, vec!["workflow:execute".to_string()]);

    let listed = h.rbac.list_api_keys(owner, ws.id).await.unwrap();
    assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn test_single_character_change_is_rejected() {
    let h = harness();
    let owner = Uuid::new_v4();
    let ws = workspace(&h.rbac, owner).await;
    let issued = h.rbac.generate_api_key(owner, key_input(ws.id)).await.unwrap();

    let mut tampered = issued.plaintext.clone();
    let last = tampered.pop().unwrap();
    tampered.push(if last == '0' { '1' } else { '0' });

    let err = h.rbac.validate_api_key(&tampered).await.unwrap_err();
    assert!(matches!(err, AuthError::ApiKeyNotFound));
}

#[tokio::test]
async fn test_revoked_key_is_reported_as_revoked() {
    let h = harness();
    let owner = Uuid::new_v4();
    let ws = workspace(&h.rbac, owner).await;
    let issued = h.rbac.generate_api_key(owner, key_input(ws.id)).await.unwrap();

    h.rbac
        .revoke_api_key(owner, ws.id, issued.key.id)
        .await
        .unwrap();

    let err = h.rbac.validate_api_key(&issued.plaintext).await.unwrap_err();
    assert!(matches!(err, AuthError::ApiKeyRevoked));
}

#[tokio::test]
async fn test_expired_key_is_reported_as_expired() {
    let h = harness();
    let owner = Uuid::new_v4();
    let ws = workspace(&h.rbac, owner).await;

    let generated = generate_api_key();
    h.api_keys
        .create(NewApiKey {
            workspace_id: ws.id,
            user_id: owner,
            name: "stale".to_string(),
            key_prefix: generated.prefix.clone(),
            key_hash: generated.hash.clone(),
            scopes: vec![],
            rate_limit: 10,
            expires_at: Some(Utc::now().naive_utc() - Duration::minutes(5)),
        })
        .await
        .unwrap();

    let err = h
        .rbac
        .validate_api_key(&generated.plaintext)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::ApiKeyExpired));
}

#[tokio::test]
async fn test_revoke_checks_workspace_of_key() {
    let h = harness();
    let owner = Uuid::new_v4();
    let ws = workspace(&h.rbac, owner).await;
    let other = workspace(&h.rbac, owner).await;
    let issued = h.rbac.generate_api_key(owner, key_input(ws.id)).await.unwrap();

    let err = h
        .rbac
        .revoke_api_key(owner, other.id, issued.key.id)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::ApiKeyNotFound));

    h.rbac.validate_api_key(&issued.plaintext).await.unwrap();
}

#[tokio::test]
async fn test_viewer_cannot_create_api_keys() {
    let h = harness();
    let owner = Uuid::new_v4();
    let viewer = Uuid::new_v4();
    let ws = workspace(&h.rbac, owner).await;
    h.rbac
        .assign_role(owner, viewer, ws.id, Role::Viewer, vec![])
        .await
        .unwrap();

    let err = h
        .rbac
        .generate_api_key(viewer, key_input(ws.id))
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::InsufficientPermission(p) if p == permissions::APIKEY_CREATE));
}

/// Records created workspace ids so a rollback can be observed.
#[derive(Default)]
struct TrackingWorkspaces {
    inner: MemoryWorkspaceRepository,
    created: Mutex<Vec<Uuid>>,
}

#[async_trait]
impl WorkspaceRepository for TrackingWorkspaces {
    async fn create(&self, workspace: NewWorkspace) -> StoreResult<Workspace> {
        let workspace = self.inner.create(workspace).await?;
        self.created.lock().unwrap().push(workspace.id);
        Ok(workspace)
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<Workspace>> {
        self.inner.find_by_id(id).await
    }

    async fn update(&self, id: Uuid, update: WorkspaceUpdate) -> StoreResult<Option<Workspace>> {
        self.inner.update(id, update).await
    }

    async fn delete(&self, id: Uuid) -> StoreResult<bool> {
        self.inner.delete(id).await
    }
}

/// Refuses every membership write.
struct BrokenRoles;

#[async_trait]
impl RoleRepository for BrokenRoles {
    async fn create(&self, _role: NewUserRole) -> StoreResult<UserRole> {
        Err(StoreError::Unavailable("roles table offline".to_string()))
    }

    async fn find(&self, _user_id: Uuid, _workspace_id: Uuid) -> StoreResult<Option<UserRole>> {
        Ok(None)
    }

    async fn upsert(&self, _role: NewUserRole) -> StoreResult<UserRole> {
        Err(StoreError::Unavailable("roles table offline".to_string()))
    }

    async fn delete(&self, _user_id: Uuid, _workspace_id: Uuid) -> StoreResult<bool> {
        Ok(false)
    }

    async fn list_for_workspace(&self, _workspace_id: Uuid) -> StoreResult<Vec<UserRole>> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn test_failed_owner_membership_rolls_back_workspace() {
    let workspaces = Arc::new(TrackingWorkspaces::default());
    let rbac = RbacUseCase::new(
        workspaces.clone(),
        Arc::new(BrokenRoles),
        Arc::new(MemoryApiKeyRepository::new()),
    );

    let err = rbac
        .create_workspace(
            Uuid::new_v4(),
            CreateWorkspaceInput {
                name: "Doomed".to_string(),
                description: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::Store(StoreError::Unavailable(_))));

    let created = workspaces.created.lock().unwrap().clone();
    assert_eq!(created.len(), 1);
    assert!(workspaces.find_by_id(created[0]).await.unwrap().is_none());
}

#[tokio::test]
async fn test_assigning_an_unknown_user_is_not_found() {
    let users = Arc::new(MemoryUserRepository::new());
    let rbac = RbacUseCase::new(
        Arc::new(MemoryWorkspaceRepository::new()),
        Arc::new(MemoryRoleRepository::with_users(users.clone())),
        Arc::new(MemoryApiKeyRepository::new()),
    );
    let owner = users
        .create(NewUser {
            email: "owner@example.com".to_string(),
            password_hash: None,
            first_name: None,
            last_name: None,
            avatar_url: None,
            email_verified: true,
        })
        .await
        .unwrap();
    let ws = workspace(&rbac, owner.id).await;

    let err = rbac
        .assign_role(owner.id, Uuid::new_v4(), ws.id, Role::Viewer, vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::UserNotFound));
    assert_eq!(rbac.list_members(owner.id, ws.id).await.unwrap().len(), 1);
}
