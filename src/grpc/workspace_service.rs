//! gRPC WorkspaceService implementation. The acting user is whoever the
//! bearer token in the request metadata belongs to.

use std::sync::Arc;

use chrono::DateTime;
use tonic::{Request, Response, Status};
use tracing::instrument;
use uuid::Uuid;

use super::proto::workspace_service_server::WorkspaceService;
use super::proto::{
    ApiKeyResponse, AssignRoleRequest, CheckPermissionRequest, CheckPermissionResponse,
    CreateWorkspaceRequest, DeleteWorkspaceRequest, DeleteWorkspaceResponse,
    GenerateApiKeyRequest, GenerateApiKeyResponse, GetWorkspaceRequest, ListApiKeysRequest,
    ListApiKeysResponse, ListMembersRequest, ListMembersResponse, MemberResponse,
    RemoveUserRequest, RemoveUserResponse, RevokeApiKeyRequest, RevokeApiKeyResponse,
    UpdateWorkspaceRequest, ValidateApiKeyRequest, WorkspaceResponse,
};
use super::{bearer_token, non_empty, parse_uuid};
use crate::error::AuthError;
use crate::models::Role;
use crate::usecase::{
    AuthUseCase, CreateWorkspaceInput, GenerateApiKeyInput, RbacUseCase, UpdateWorkspaceInput,
};

pub struct WorkspaceServiceImpl {
    auth: Arc<AuthUseCase>,
    rbac: Arc<RbacUseCase>,
}

impl WorkspaceServiceImpl {
    pub fn new(auth: Arc<AuthUseCase>, rbac: Arc<RbacUseCase>) -> Self {
        Self { auth, rbac }
    }

    #[allow(clippy::result_large_err)]
    fn actor<T>(&self, request: &Request<T>) -> Result<Uuid, Status> {
        let token = bearer_token(request)
            .ok_or_else(|| Status::unauthenticated("Missing bearer token"))?;
        Ok(self.auth.validate_token(&token)?)
    }
}

#[tonic::async_trait]
impl WorkspaceService for WorkspaceServiceImpl {
    #[instrument(skip(self, request))]
    async fn create_workspace(
        &self,
        request: Request<CreateWorkspaceRequest>,
    ) -> Result<Response<WorkspaceResponse>, Status> {
        let actor = self.actor(&request)?;
        let req = request.into_inner();

        let workspace = self
            .rbac
            .create_workspace(
                actor,
                CreateWorkspaceInput {
                    name: req.name,
                    description: non_empty(req.description),
                },
            )
            .await?;

        Ok(Response::new(WorkspaceResponse {
            workspace: Some(workspace.into()),
        }))
    }

    #[instrument(skip(self, request))]
    async fn get_workspace(
        &self,
        request: Request<GetWorkspaceRequest>,
    ) -> Result<Response<WorkspaceResponse>, Status> {
        let actor = self.actor(&request)?;
        let workspace_id = parse_uuid("workspace_id", &request.get_ref().workspace_id)?;

        let workspace = self.rbac.get_workspace(actor, workspace_id).await?;
        Ok(Response::new(WorkspaceResponse {
            workspace: Some(workspace.into()),
        }))
    }

    #[instrument(skip(self, request))]
    async fn update_workspace(
        &self,
        request: Request<UpdateWorkspaceRequest>,
    ) -> Result<Response<WorkspaceResponse>, Status> {
        let actor = self.actor(&request)?;
        let req = request.into_inner();
        let workspace_id = parse_uuid("workspace_id", &req.workspace_id)?;

        let settings = req
            .settings_json
            .map(|raw| serde_json::from_str::<serde_json::Value>(&raw))
            .transpose()
            .map_err(|e| AuthError::Validation(format!("settings_json: {}", e)))?;

        let workspace = self
            .rbac
            .update_workspace(
                actor,
                workspace_id,
                UpdateWorkspaceInput {
                    name: req.name,
                    description: req.description,
                    plan: req.plan,
                    settings,
                },
            )
            .await?;

        Ok(Response::new(WorkspaceResponse {
            workspace: Some(workspace.into()),
        }))
    }

    #[instrument(skip(self, request))]
    async fn delete_workspace(
        &self,
        request: Request<DeleteWorkspaceRequest>,
    ) -> Result<Response<DeleteWorkspaceResponse>, Status> {
        let actor = self.actor(&request)?;
        let workspace_id = parse_uuid("workspace_id", &request.get_ref().workspace_id)?;

        self.rbac.delete_workspace(actor, workspace_id).await?;
        Ok(Response::new(DeleteWorkspaceResponse { success: true }))
    }

    /// Answers for any user; callers are trusted services.
    #[instrument(skip(self, request), fields(permission = %request.get_ref().permission))]
    async fn check_permission(
        &self,
        request: Request<CheckPermissionRequest>,
    ) -> Result<Response<CheckPermissionResponse>, Status> {
        let req = request.into_inner();
        let user_id = parse_uuid("user_id", &req.user_id)?;
        let workspace_id = parse_uuid("workspace_id", &req.workspace_id)?;

        let allowed = self
            .rbac
            .check_permission(user_id, workspace_id, req.permission.trim())
            .await?;

        Ok(Response::new(CheckPermissionResponse { allowed }))
    }

    #[instrument(skip(self, request))]
    async fn assign_role(
        &self,
        request: Request<AssignRoleRequest>,
    ) -> Result<Response<MemberResponse>, Status> {
        let actor = self.actor(&request)?;
        let req = request.into_inner();
        let target = parse_uuid("target_user_id", &req.target_user_id)?;
        let workspace_id = parse_uuid("workspace_id", &req.workspace_id)?;
        let role: Role = req
            .role
            .parse()
            .map_err(|e| AuthError::Validation(format!("role: {}", e)))?;

        let member = self
            .rbac
            .assign_role(actor, target, workspace_id, role, req.custom_permissions)
            .await?;

        Ok(Response::new(MemberResponse {
            member: Some(member.into()),
        }))
    }

    #[instrument(skip(self, request))]
    async fn remove_user_from_workspace(
        &self,
        request: Request<RemoveUserRequest>,
    ) -> Result<Response<RemoveUserResponse>, Status> {
        let actor = self.actor(&request)?;
        let req = request.into_inner();
        let target = parse_uuid("target_user_id", &req.target_user_id)?;
        let workspace_id = parse_uuid("workspace_id", &req.workspace_id)?;

        self.rbac.remove_user(actor, target, workspace_id).await?;
        Ok(Response::new(RemoveUserResponse { success: true }))
    }

    #[instrument(skip(self, request))]
    async fn list_members(
        &self,
        request: Request<ListMembersRequest>,
    ) -> Result<Response<ListMembersResponse>, Status> {
        let actor = self.actor(&request)?;
        let workspace_id = parse_uuid("workspace_id", &request.get_ref().workspace_id)?;

        let members = self.rbac.list_members(actor, workspace_id).await?;
        Ok(Response::new(ListMembersResponse {
            members: members.into_iter().map(Into::into).collect(),
        }))
    }

    #[instrument(skip(self, request))]
    async fn generate_api_key(
        &self,
        request: Request<GenerateApiKeyRequest>,
    ) -> Result<Response<GenerateApiKeyResponse>, Status> {
        let actor = self.actor(&request)?;
        let req = request.into_inner();
        let workspace_id = parse_uuid("workspace_id", &req.workspace_id)?;

        let expires_at = req
            .expires_at
            .map(|secs| {
                DateTime::from_timestamp(secs, 0)
                    .map(|at| at.naive_utc())
                    .ok_or_else(|| AuthError::Validation("expires_at: out of range".to_string()))
            })
            .transpose()?;

        let issued = self
            .rbac
            .generate_api_key(
                actor,
                GenerateApiKeyInput {
                    workspace_id,
                    name: req.name,
                    scopes: req.scopes,
                    rate_limit: (req.rate_limit != 0).then_some(req.rate_limit),
                    expires_at,
                },
            )
            .await?;

        Ok(Response::new(GenerateApiKeyResponse {
            api_key: Some(issued.key.into()),
            plaintext_key: issued.plaintext,
        }))
    }

    #[instrument(skip(self, request))]
    async fn validate_api_key(
        &self,
        request: Request<ValidateApiKeyRequest>,
    ) -> Result<Response<ApiKeyResponse>, Status> {
        let req = request.into_inner();
        let key = self.rbac.validate_api_key(&req.key).await?;

        Ok(Response::new(ApiKeyResponse {
            api_key: Some(key.into()),
        }))
    }

    #[instrument(skip(self, request))]
    async fn revoke_api_key(
        &self,
        request: Request<RevokeApiKeyRequest>,
    ) -> Result<Response<RevokeApiKeyResponse>, Status> {
        let actor = self.actor(&request)?;
        let req = request.into_inner();
        let workspace_id = parse_uuid("workspace_id", &req.workspace_id)?;
        let key_id = parse_uuid("key_id", &req.key_id)?;

        self.rbac.revoke_api_key(actor, workspace_id, key_id).await?;
        Ok(Response::new(RevokeApiKeyResponse { success: true }))
    }

    #[instrument(skip(self, request))]
    async fn list_api_keys(
        &self,
        request: Request<ListApiKeysRequest>,
    ) -> Result<Response<ListApiKeysResponse>, Status> {
        let actor = self.actor(&request)?;
        let workspace_id = parse_uuid("workspace_id", &request.get_ref().workspace_id)?;

        let keys = self.rbac.list_api_keys(actor, workspace_id).await?;
        Ok(Response::new(ListApiKeysResponse {
            api_keys: keys.into_iter().map(Into::into).collect(),
        }))
    }
}
