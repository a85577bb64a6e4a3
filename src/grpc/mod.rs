//! gRPC boundary: request decoding, caller identification and error mapping.

pub mod auth_service;
mod convert;
pub mod workspace_service;

pub mod proto {
    tonic::include_proto!("portcullis.v1");
}

pub use auth_service::AuthServiceImpl;
pub use workspace_service::WorkspaceServiceImpl;

use std::net::IpAddr;

use tonic::{Request, Status};
use uuid::Uuid;

use crate::error::AuthError;
use crate::models::ClientInfo;
use proto::ErrorEnvelope;

const MAX_USER_AGENT_LEN: usize = 512;

pub(crate) fn peer_ip<T>(request: &Request<T>) -> Option<IpAddr> {
    request.remote_addr().map(|addr| addr.ip())
}

pub(crate) fn client_info<T>(request: &Request<T>) -> ClientInfo {
    let user_agent = request
        .metadata()
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .map(|ua| ua.chars().take(MAX_USER_AGENT_LEN).collect());

    ClientInfo {
        user_agent,
        ip_address: peer_ip(request).map(|ip| ip.to_string()),
    }
}

/// Extracts the token from `authorization: Bearer <token>`.
pub(crate) fn bearer_token<T>(request: &Request<T>) -> Option<String> {
    let value = request.metadata().get("authorization")?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    (scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty())
        .then(|| token.trim().to_string())
}

pub(crate) fn parse_uuid(field: &str, value: &str) -> Result<Uuid, AuthError> {
    Uuid::parse_str(value.trim())
        .map_err(|_| AuthError::Validation(format!("{}: must be a UUID", field)))
}

pub(crate) fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

pub(crate) fn envelope(e: &AuthError) -> ErrorEnvelope {
    ErrorEnvelope {
        code: e.code().to_string(),
        message: e.public_message(),
    }
}

/// Domain failures travel in the response envelope; store and internal
/// failures stay transport errors so clients can retry them.
pub(crate) fn envelope_or_status(e: AuthError) -> Result<ErrorEnvelope, Status> {
    match e {
        AuthError::Store(_) | AuthError::Internal(_) => Err(e.into()),
        other => Ok(envelope(&other)),
    }
}
