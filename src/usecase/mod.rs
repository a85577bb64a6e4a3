//! Application logic behind the gRPC services. Storage is reached only
//! through the traits in [`crate::repository`].

pub mod auth;
pub mod rbac;

pub use auth::{AuthUseCase, LoginOutcome, OAuthCompletion, OAuthStart, ProfileInput, RegisterInput};
pub use rbac::{
    CreateWorkspaceInput, GenerateApiKeyInput, IssuedApiKey, RbacUseCase, UpdateWorkspaceInput,
};
