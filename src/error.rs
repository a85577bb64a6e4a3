//! Error taxonomy shared by the stores, use cases and the service boundary.

use thiserror::Error;
use tonic::Status;
use tracing::error;

use crate::auth::password::PasswordPolicyError;
use crate::oauth::OAuthError;

pub type StoreResult<T> = Result<T, StoreError>;
pub type AuthResult<T> = Result<T, AuthError>;

/// Failures raised by the relational and key-value adapters.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    /// Pool exhausted, backend unreachable or call timed out. Retryable.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("unique constraint violated: {0}")]
    Conflict(String),
    /// A foreign key points at a row that does not exist.
    #[error("referenced row missing: {0}")]
    MissingReference(String),
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("stored value could not be decoded: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<diesel::result::Error> for StoreError {
    fn from(e: diesel::result::Error) -> Self {
        use diesel::result::{DatabaseErrorKind, Error as DieselError};

        match e {
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
                StoreError::Conflict(
                    info.constraint_name()
                        .map(str::to_string)
                        .unwrap_or_else(|| info.message().to_string()),
                )
            }
            DieselError::DatabaseError(DatabaseErrorKind::ForeignKeyViolation, info) => {
                StoreError::MissingReference(
                    info.constraint_name()
                        .map(str::to_string)
                        .unwrap_or_else(|| info.message().to_string()),
                )
            }
            DieselError::DatabaseError(DatabaseErrorKind::ClosedConnection, info) => {
                StoreError::Unavailable(info.message().to_string())
            }
            DieselError::DatabaseError(_, info) if info.message().contains("statement timeout") => {
                StoreError::Unavailable(info.message().to_string())
            }
            DieselError::DeserializationError(e) => StoreError::Serialization(e.to_string()),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error() || e.is_timeout() || e.is_connection_dropped() {
            StoreError::Unavailable(e.to_string())
        } else {
            StoreError::Backend(e.to_string())
        }
    }
}

impl From<deadpool_redis::PoolError> for StoreError {
    fn from(e: deadpool_redis::PoolError) -> Self {
        StoreError::Unavailable(format!("redis pool: {}", e))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("account is locked, try again in {retry_after_secs} seconds")]
    AccountLocked { retry_after_secs: u64 },
    #[error("account is inactive")]
    AccountInactive,
    #[error("user not found")]
    UserNotFound,
    #[error("user already exists")]
    UserExists,
    #[error("invalid token")]
    InvalidToken,
    #[error("token expired")]
    TokenExpired,
    #[error("insufficient permission: {0}")]
    InsufficientPermission(String),
    #[error("workspace not found")]
    WorkspaceNotFound,
    #[error("user is not a member of this workspace")]
    RoleNotFound,
    #[error("the workspace owner cannot be removed or demoted")]
    OwnerProtected,
    #[error("api key not found")]
    ApiKeyNotFound,
    #[error("api key has been revoked")]
    ApiKeyRevoked,
    #[error("api key has expired")]
    ApiKeyExpired,
    #[error("validation error: {0}")]
    Validation(String),
    #[error(transparent)]
    PasswordPolicy(#[from] PasswordPolicyError),
    #[error(transparent)]
    OAuth(#[from] OAuthError),
    #[error("invalid or expired oauth state")]
    InvalidOAuthState,
    #[error("failed to reach store: {0}")]
    Store(#[from] StoreError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl AuthError {
    pub fn internal(context: &str, e: impl std::fmt::Display) -> Self {
        AuthError::Internal(format!("failed to {}: {}", context, e))
    }

    /// Stable machine-readable code for error envelopes and metrics.
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::InvalidCredentials => "INVALID_CREDENTIALS",
            AuthError::AccountLocked { .. } => "ACCOUNT_LOCKED",
            AuthError::AccountInactive => "ACCOUNT_INACTIVE",
            AuthError::UserNotFound => "USER_NOT_FOUND",
            AuthError::UserExists => "USER_EXISTS",
            AuthError::InvalidToken => "INVALID_TOKEN",
            AuthError::TokenExpired => "TOKEN_EXPIRED",
            AuthError::InsufficientPermission(_) => "INSUFFICIENT_PERMISSION",
            AuthError::WorkspaceNotFound => "WORKSPACE_NOT_FOUND",
            AuthError::RoleNotFound => "ROLE_NOT_FOUND",
            AuthError::OwnerProtected => "OWNER_PROTECTED",
            AuthError::ApiKeyNotFound => "API_KEY_NOT_FOUND",
            AuthError::ApiKeyRevoked => "API_KEY_REVOKED",
            AuthError::ApiKeyExpired => "API_KEY_EXPIRED",
            AuthError::Validation(_) => "VALIDATION_ERROR",
            AuthError::PasswordPolicy(_) => "PASSWORD_POLICY_VIOLATION",
            AuthError::OAuth(e) => e.code(),
            AuthError::InvalidOAuthState => "INVALID_OAUTH_STATE",
            AuthError::Store(e) if e.is_retryable() => "STORE_UNAVAILABLE",
            AuthError::Store(_) => "STORE_ERROR",
            AuthError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Message safe to hand to clients.
    pub fn public_message(&self) -> String {
        match self {
            AuthError::Store(e) if e.is_retryable() => {
                "Service temporarily unavailable, retry later".to_string()
            }
            AuthError::Store(_) | AuthError::Internal(_) => "Internal error".to_string(),
            AuthError::OAuth(e) => e.message.clone(),
            other => other.to_string(),
        }
    }
}

/// Failures while wiring the process together.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
    #[error("failed to connect store: {0}")]
    Store(#[from] StoreError),
    #[error("failed to configure authentication: {0}")]
    Auth(#[from] AuthError),
    #[error("failed to configure oauth providers: {0}")]
    OAuth(#[from] OAuthError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("server error: {0}")]
    Serve(String),
}

impl From<validator::ValidationErrors> for AuthError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let mut fields: Vec<String> = errors
            .field_errors()
            .into_iter()
            .map(|(field, errs)| {
                let message = errs
                    .first()
                    .and_then(|e| e.message.as_ref())
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| "is invalid".to_string());
                format!("{}: {}", field, message)
            })
            .collect();
        fields.sort();
        AuthError::Validation(fields.join(", "))
    }
}

impl From<AuthError> for Status {
    fn from(e: AuthError) -> Self {
        let message = e.public_message();
        match &e {
            AuthError::InvalidCredentials | AuthError::InvalidToken | AuthError::TokenExpired => {
                Status::unauthenticated(message)
            }
            AuthError::AccountLocked { .. }
            | AuthError::AccountInactive
            | AuthError::InsufficientPermission(_) => Status::permission_denied(message),
            AuthError::UserNotFound
            | AuthError::WorkspaceNotFound
            | AuthError::RoleNotFound
            | AuthError::ApiKeyNotFound => Status::not_found(message),
            AuthError::UserExists => Status::already_exists(message),
            AuthError::ApiKeyRevoked | AuthError::ApiKeyExpired => {
                Status::unauthenticated(message)
            }
            AuthError::OwnerProtected => Status::failed_precondition(message),
            AuthError::Validation(_) | AuthError::PasswordPolicy(_) => {
                Status::invalid_argument(message)
            }
            AuthError::OAuth(_) | AuthError::InvalidOAuthState => {
                Status::failed_precondition(message)
            }
            AuthError::Store(store) if store.is_retryable() => {
                error!(error = %store, "Store unavailable");
                Status::unavailable(message)
            }
            AuthError::Store(_) | AuthError::Internal(_) => {
                error!(error = %e, "Internal error");
                Status::internal(message)
            }
        }
    }
}
