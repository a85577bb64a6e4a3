//! Workspaces, memberships, permission checks and API keys.

use std::sync::Arc;
use std::time::Instant;

use chrono::{NaiveDateTime, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use validator::Validate;

use crate::auth::api_key::{generate_api_key, hash_api_key, looks_like_api_key};
use crate::auth::permissions::{
    self, is_granted, APIKEY_CREATE, APIKEY_READ, APIKEY_REVOKE, USER_DELETE, USER_READ,
    USER_WRITE, WORKSPACE_READ, WORKSPACE_WRITE,
};
use crate::error::{AuthError, AuthResult, StoreError};
use crate::models::{
    ApiKey, NewApiKey, NewUserRole, NewWorkspace, Role, UserRole, Workspace, WorkspaceUpdate,
    DEFAULT_PLAN,
};
use crate::repository::{ApiKeyRepository, RoleRepository, WorkspaceRepository};
use crate::telemetry::{record_api_key_validation, record_permission_check};

const API_KEY_CREATE_ATTEMPTS: usize = 3;
const DEFAULT_API_KEY_RATE_LIMIT: i32 = 1000;
const MAX_CUSTOM_PERMISSIONS: usize = 64;

#[derive(Debug, Clone, Validate)]
pub struct CreateWorkspaceInput {
    #[validate(length(min = 1, max = 100, message = "Name must be 1-100 characters"))]
    pub name: String,
    #[validate(length(max = 1000, message = "Description is too long"))]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Validate)]
pub struct UpdateWorkspaceInput {
    #[validate(length(min = 1, max = 100, message = "Name must be 1-100 characters"))]
    pub name: Option<String>,
    #[validate(length(max = 1000, message = "Description is too long"))]
    pub description: Option<String>,
    #[validate(length(min = 1, max = 50, message = "Plan must be 1-50 characters"))]
    pub plan: Option<String>,
    pub settings: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Validate)]
pub struct GenerateApiKeyInput {
    pub workspace_id: Uuid,
    #[validate(length(min = 1, max = 100, message = "Name must be 1-100 characters"))]
    pub name: String,
    pub scopes: Vec<String>,
    #[validate(range(min = 1, message = "Rate limit must be positive"))]
    pub rate_limit: Option<i32>,
    pub expires_at: Option<NaiveDateTime>,
}

/// A freshly created key. `plaintext` is never stored and cannot be recovered.
#[derive(Clone)]
pub struct IssuedApiKey {
    pub key: ApiKey,
    pub plaintext: String,
}

impl std::fmt::Debug for IssuedApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedApiKey")
            .field("key", &self.key)
            .field("plaintext", &"<redacted>")
            .finish()
    }
}

pub struct RbacUseCase {
    workspaces: Arc<dyn WorkspaceRepository>,
    roles: Arc<dyn RoleRepository>,
    api_keys: Arc<dyn ApiKeyRepository>,
}

fn validate_permission_names(names: &[String]) -> AuthResult<()> {
    if names.len() > MAX_CUSTOM_PERMISSIONS {
        return Err(AuthError::Validation(format!(
            "at most {} permissions may be granted",
            MAX_CUSTOM_PERMISSIONS
        )));
    }
    for name in names {
        let valid = matches!(
            name.split_once(':'),
            Some((resource, action)) if !resource.is_empty() && !action.is_empty()
        ) && !name.chars().any(char::is_whitespace);
        if !valid {
            return Err(AuthError::Validation(format!(
                "permission '{}' must look like resource:action",
                name
            )));
        }
    }
    Ok(())
}

impl RbacUseCase {
    pub fn new(
        workspaces: Arc<dyn WorkspaceRepository>,
        roles: Arc<dyn RoleRepository>,
        api_keys: Arc<dyn ApiKeyRepository>,
    ) -> Self {
        Self {
            workspaces,
            roles,
            api_keys,
        }
    }

    /// Creates the workspace and the owner's admin membership. If the
    /// membership cannot be written the workspace is deleted again.
    pub async fn create_workspace(
        &self,
        owner_id: Uuid,
        input: CreateWorkspaceInput,
    ) -> AuthResult<Workspace> {
        let input = CreateWorkspaceInput {
            name: input.name.trim().to_string(),
            description: input.description,
        };
        input.validate()?;

        let workspace = self
            .workspaces
            .create(NewWorkspace {
                name: input.name,
                owner_id,
                description: input.description,
                plan: DEFAULT_PLAN.to_string(),
                settings: serde_json::json!({}),
            })
            .await?;

        let membership = NewUserRole {
            user_id: owner_id,
            workspace_id: workspace.id,
            role: Role::Admin,
            permissions: Vec::new(),
            created_by: Some(owner_id),
        };

        if let Err(e) = self.roles.create(membership).await {
            match self.workspaces.delete(workspace.id).await {
                Ok(_) => warn!(
                    workspace_id = %workspace.id,
                    error = %e,
                    "Owner membership failed, workspace rolled back"
                ),
                Err(cleanup) => error!(
                    workspace_id = %workspace.id,
                    error = %e,
                    cleanup_error = %cleanup,
                    "Owner membership failed and workspace could not be removed"
                ),
            }
            return Err(e.into());
        }

        info!(workspace_id = %workspace.id, owner_id = %owner_id, "Workspace created");
        Ok(workspace)
    }

    pub async fn get_workspace(&self, actor: Uuid, workspace_id: Uuid) -> AuthResult<Workspace> {
        let workspace = self.load_workspace(workspace_id).await?;
        self.require(actor, workspace_id, WORKSPACE_READ).await?;
        Ok(workspace)
    }

    pub async fn update_workspace(
        &self,
        actor: Uuid,
        workspace_id: Uuid,
        input: UpdateWorkspaceInput,
    ) -> AuthResult<Workspace> {
        let input = UpdateWorkspaceInput {
            name: input.name.map(|n| n.trim().to_string()),
            plan: input.plan.map(|p| p.trim().to_lowercase()),
            ..input
        };
        input.validate()?;
        if input.settings.as_ref().is_some_and(|s| !s.is_object()) {
            return Err(AuthError::Validation(
                "settings: must be a JSON object".to_string(),
            ));
        }

        let workspace = self.load_workspace(workspace_id).await?;
        self.require(actor, workspace_id, WORKSPACE_WRITE).await?;

        let update = WorkspaceUpdate {
            name: input.name,
            description: input.description,
            plan: input.plan,
            settings: input.settings,
        };
        if update.is_empty() {
            return Ok(workspace);
        }

        self.workspaces
            .update(workspace_id, update)
            .await?
            .ok_or(AuthError::WorkspaceNotFound)
    }

    /// Only the owner may delete; memberships and keys go with the workspace.
    pub async fn delete_workspace(&self, actor: Uuid, workspace_id: Uuid) -> AuthResult<()> {
        let workspace = self.load_workspace(workspace_id).await?;
        if workspace.owner_id != actor {
            return Err(AuthError::InsufficientPermission(
                permissions::WORKSPACE_DELETE.to_string(),
            ));
        }

        if !self.workspaces.delete(workspace_id).await? {
            return Err(AuthError::WorkspaceNotFound);
        }
        info!(workspace_id = %workspace_id, "Workspace deleted");
        Ok(())
    }

    /// One indexed membership lookup. Non-members are simply not granted.
    pub async fn check_permission(
        &self,
        user_id: Uuid,
        workspace_id: Uuid,
        permission: &str,
    ) -> AuthResult<bool> {
        let started = Instant::now();
        let granted = match self.roles.find(user_id, workspace_id).await? {
            Some(membership) => is_granted(membership.role, &membership.permissions, permission),
            None => false,
        };

        record_permission_check(granted, started.elapsed());
        debug!(
            user_id = %user_id,
            workspace_id = %workspace_id,
            permission = permission,
            granted = granted,
            "Permission checked"
        );

        Ok(granted)
    }

    pub async fn assign_role(
        &self,
        actor: Uuid,
        target: Uuid,
        workspace_id: Uuid,
        role: Role,
        custom_permissions: Vec<String>,
    ) -> AuthResult<UserRole> {
        validate_permission_names(&custom_permissions)?;

        let workspace = self.load_workspace(workspace_id).await?;
        self.require(actor, workspace_id, USER_WRITE).await?;

        if target == workspace.owner_id && role != Role::Admin {
            return Err(AuthError::OwnerProtected);
        }

        let membership = self
            .roles
            .upsert(NewUserRole {
                user_id: target,
                workspace_id,
                role,
                permissions: custom_permissions,
                created_by: Some(actor),
            })
            .await
            .map_err(|e| match e {
                StoreError::MissingReference(_) => AuthError::UserNotFound,
                other => other.into(),
            })?;

        info!(
            workspace_id = %workspace_id,
            user_id = %target,
            role = %role,
            assigned_by = %actor,
            "Role assigned"
        );
        Ok(membership)
    }

    /// The owner check runs before the permission check so that no caller,
    /// however privileged, can remove the owner.
    pub async fn remove_user(&self, actor: Uuid, target: Uuid, workspace_id: Uuid) -> AuthResult<()> {
        let workspace = self.load_workspace(workspace_id).await?;
        if target == workspace.owner_id {
            return Err(AuthError::OwnerProtected);
        }

        self.require(actor, workspace_id, USER_DELETE).await?;

        if !self.roles.delete(target, workspace_id).await? {
            return Err(AuthError::RoleNotFound);
        }
        info!(workspace_id = %workspace_id, user_id = %target, removed_by = %actor, "Member removed");
        Ok(())
    }

    pub async fn list_members(&self, actor: Uuid, workspace_id: Uuid) -> AuthResult<Vec<UserRole>> {
        self.load_workspace(workspace_id).await?;
        self.require(actor, workspace_id, USER_READ).await?;
        Ok(self.roles.list_for_workspace(workspace_id).await?)
    }

    /// Retries on a prefix or hash collision with a fresh secret.
    pub async fn generate_api_key(
        &self,
        actor: Uuid,
        input: GenerateApiKeyInput,
    ) -> AuthResult<IssuedApiKey> {
        let input = GenerateApiKeyInput {
            name: input.name.trim().to_string(),
            ..input
        };
        input.validate()?;
        validate_permission_names(&input.scopes)?;
        if input
            .expires_at
            .is_some_and(|expires_at| expires_at <= Utc::now().naive_utc())
        {
            return Err(AuthError::Validation(
                "expires_at: must be in the future".to_string(),
            ));
        }

        self.load_workspace(input.workspace_id).await?;
        self.require(actor, input.workspace_id, APIKEY_CREATE).await?;

        for attempt in 1..=API_KEY_CREATE_ATTEMPTS {
            let generated = generate_api_key();
            let new_key = NewApiKey {
                workspace_id: input.workspace_id,
                user_id: actor,
                name: input.name.clone(),
                key_prefix: generated.prefix.clone(),
                key_hash: generated.hash.clone(),
                scopes: input.scopes.clone(),
                rate_limit: input.rate_limit.unwrap_or(DEFAULT_API_KEY_RATE_LIMIT),
                expires_at: input.expires_at,
            };

            match self.api_keys.create(new_key).await {
                Ok(key) => {
                    info!(
                        api_key_id = %key.id,
                        workspace_id = %key.workspace_id,
                        prefix = %key.key_prefix,
                        "API key created"
                    );
                    return Ok(IssuedApiKey {
                        key,
                        plaintext: generated.plaintext,
                    });
                }
                Err(StoreError::Conflict(constraint)) => {
                    warn!(attempt = attempt, constraint = %constraint, "API key collision, regenerating");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(AuthError::Internal(
            "failed to allocate a unique api key".to_string(),
        ))
    }

    /// Resolves a presented key. Revoked and expired keys are reported as such.
    pub async fn validate_api_key(&self, plaintext: &str) -> AuthResult<ApiKey> {
        let plaintext = plaintext.trim();
        if !looks_like_api_key(plaintext) {
            record_api_key_validation("not_found");
            return Err(AuthError::ApiKeyNotFound);
        }

        let Some(key) = self.api_keys.find_by_hash(&hash_api_key(plaintext)).await? else {
            record_api_key_validation("not_found");
            return Err(AuthError::ApiKeyNotFound);
        };

        let now = Utc::now().naive_utc();
        if key.is_revoked() {
            record_api_key_validation("revoked");
            return Err(AuthError::ApiKeyRevoked);
        }
        if key.is_expired_at(now) {
            record_api_key_validation("expired");
            return Err(AuthError::ApiKeyExpired);
        }

        let repo = Arc::clone(&self.api_keys);
        let key_id = key.id;
        tokio::spawn(async move {
            if let Err(e) = repo.touch_last_used(key_id, now).await {
                warn!(api_key_id = %key_id, error = %e, "Failed to record API key use");
            }
        });

        record_api_key_validation("valid");
        Ok(key)
    }

    pub async fn revoke_api_key(
        &self,
        actor: Uuid,
        workspace_id: Uuid,
        key_id: Uuid,
    ) -> AuthResult<()> {
        self.require(actor, workspace_id, APIKEY_REVOKE).await?;

        match self.api_keys.find_by_id(key_id).await? {
            Some(key) if key.workspace_id == workspace_id => {}
            _ => return Err(AuthError::ApiKeyNotFound),
        }

        if !self
            .api_keys
            .revoke(key_id, Utc::now().naive_utc())
            .await?
        {
            return Err(AuthError::ApiKeyNotFound);
        }
        info!(api_key_id = %key_id, workspace_id = %workspace_id, revoked_by = %actor, "API key revoked");
        Ok(())
    }

    pub async fn list_api_keys(&self, actor: Uuid, workspace_id: Uuid) -> AuthResult<Vec<ApiKey>> {
        self.require(actor, workspace_id, APIKEY_READ).await?;
        Ok(self.api_keys.list_for_workspace(workspace_id).await?)
    }

    async fn load_workspace(&self, workspace_id: Uuid) -> AuthResult<Workspace> {
        self.workspaces
            .find_by_id(workspace_id)
            .await?
            .ok_or(AuthError::WorkspaceNotFound)
    }

    async fn require(&self, user_id: Uuid, workspace_id: Uuid, permission: &str) -> AuthResult<()> {
        if self.check_permission(user_id, workspace_id, permission).await? {
            Ok(())
        } else {
            Err(AuthError::InsufficientPermission(permission.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::{
        MemoryApiKeyRepository, MemoryRoleRepository, MemoryWorkspaceRepository,
    };

    fn use_case() -> RbacUseCase {
        RbacUseCase::new(
            Arc::new(MemoryWorkspaceRepository::new()),
            Arc::new(MemoryRoleRepository::new()),
            Arc::new(MemoryApiKeyRepository::new()),
        )
    }

    fn workspace_input(name: &str) -> CreateWorkspaceInput {
        CreateWorkspaceInput {
            name: name.to_string(),
            description: None,
        }
    }

    #[test]
    fn test_permission_name_shape() {
        assert!(validate_permission_names(&["workflow:read".to_string()]).is_ok());
        assert!(validate_permission_names(&["workflow".to_string()]).is_err());
        assert!(validate_permission_names(&[":read".to_string()]).is_err());
        assert!(validate_permission_names(&["work flow:read".to_string()]).is_err());
    }

    #[tokio::test]
    async fn test_owner_gets_admin_membership() {
        let rbac = use_case();
        let owner = Uuid::new_v4();
        let workspace = rbac
            .create_workspace(owner, workspace_input("  Acme  "))
            .await
            .unwrap();

        assert_eq!(workspace.name, "Acme");
        assert_eq!(workspace.plan, DEFAULT_PLAN);
        assert!(rbac
            .check_permission(owner, workspace.id, permissions::WORKSPACE_DELETE)
            .await
            .unwrap());

        let members = rbac.list_members(owner, workspace.id).await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].role, Role::Admin);
    }

    #[tokio::test]
    async fn test_empty_workspace_name_rejected() {
        let rbac = use_case();
        let err = rbac
            .create_workspace(Uuid::new_v4(), workspace_input("   "))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Validation(_)));
    }

    #[tokio::test]
    async fn test_non_member_is_not_granted() {
        let rbac = use_case();
        let owner = Uuid::new_v4();
        let workspace = rbac
            .create_workspace(owner, workspace_input("Acme"))
            .await
            .unwrap();

        let stranger = Uuid::new_v4();
        assert!(!rbac
            .check_permission(stranger, workspace.id, WORKSPACE_READ)
            .await
            .unwrap());
        let err = rbac
            .get_workspace(stranger, workspace.id)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InsufficientPermission(p) if p == WORKSPACE_READ));
    }

    #[tokio::test]
    async fn test_custom_permission_extends_role() {
        let rbac = use_case();
        let owner = Uuid::new_v4();
        let viewer = Uuid::new_v4();
        let workspace = rbac
            .create_workspace(owner, workspace_input("Acme"))
            .await
            .unwrap();

        rbac.assign_role(
            owner,
            viewer,
            workspace.id,
            Role::Viewer,
            vec![permissions::WORKFLOW_EXECUTE.to_string()],
        )
        .await
        .unwrap();

        assert!(rbac
            .check_permission(viewer, workspace.id, permissions::WORKFLOW_EXECUTE)
            .await
            .unwrap());
        assert!(!rbac
            .check_permission(viewer, workspace.id, permissions::WORKFLOW_WRITE)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_only_owner_deletes_workspace() {
        let rbac = use_case();
        let owner = Uuid::new_v4();
        let admin = Uuid::new_v4();
        let workspace = rbac
            .create_workspace(owner, workspace_input("Acme"))
            .await
            .unwrap();
        rbac.assign_role(owner, admin, workspace.id, Role::Admin, vec![])
            .await
            .unwrap();

        let err = rbac.delete_workspace(admin, workspace.id).await.unwrap_err();
        assert!(matches!(err, AuthError::InsufficientPermission(_)));

        rbac.delete_workspace(owner, workspace.id).await.unwrap();
        let err = rbac.get_workspace(owner, workspace.id).await.unwrap_err();
        assert!(matches!(err, AuthError::WorkspaceNotFound));
    }

    #[tokio::test]
    async fn test_expired_key_reported_as_expired_at_creation() {
        let rbac = use_case();
        let owner = Uuid::new_v4();
        let workspace = rbac
            .create_workspace(owner, workspace_input("Acme"))
            .await
            .unwrap();

        let err = rbac
            .generate_api_key(
                owner,
                GenerateApiKeyInput {
                    workspace_id: workspace.id,
                    name: "ci".to_string(),
                    scopes: vec![],
                    rate_limit: None,
                    expires_at: Some(Utc::now().naive_utc() - chrono::Duration::hours(1)),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Validation(_)));
    }

    #[tokio::test]
    async fn test_malformed_key_is_not_found() {
        let rbac = use_case();
        let err = rbac.validate_api_key("definitely-not-a-key").await.unwrap_err();
        assert!(matches!(err, AuthError::ApiKeyNotFound));
    }
}
