//! Static role to default-permission table.
//!
//! Each role's default set contains every permission of the roles below it:
//! admin ⊇ developer ⊇ user ⊇ viewer. Custom grants stored on a membership
//! are additive on top of these defaults.

use crate::models::Role;

pub const WORKSPACE_READ: &str = "workspace:read";
pub const WORKSPACE_WRITE: &str = "workspace:write";
pub const WORKSPACE_DELETE: &str = "workspace:delete";
pub const USER_READ: &str = "user:read";
pub const USER_WRITE: &str = "user:write";
pub const USER_DELETE: &str = "user:delete";
pub const APIKEY_READ: &str = "apikey:read";
pub const APIKEY_CREATE: &str = "apikey:create";
pub const APIKEY_REVOKE: &str = "apikey:revoke";
pub const WORKFLOW_READ: &str = "workflow:read";
pub const WORKFLOW_WRITE: &str = "workflow:write";
pub const WORKFLOW_EXECUTE: &str = "workflow:execute";
pub const WORKFLOW_DELETE: &str = "workflow:delete";
pub const INTEGRATION_READ: &str = "integration:read";
pub const INTEGRATION_WRITE: &str = "integration:write";
pub const INTEGRATION_DELETE: &str = "integration:delete";

const VIEWER: &[&str] = &[
    WORKSPACE_READ,
    USER_READ,
    APIKEY_READ,
    WORKFLOW_READ,
    INTEGRATION_READ,
];

const USER: &[&str] = &[
    WORKSPACE_READ,
    USER_READ,
    APIKEY_READ,
    WORKFLOW_READ,
    INTEGRATION_READ,
    WORKFLOW_WRITE,
    WORKFLOW_EXECUTE,
];

const DEVELOPER: &[&str] = &[
    WORKSPACE_READ,
    USER_READ,
    APIKEY_READ,
    WORKFLOW_READ,
    INTEGRATION_READ,
    WORKFLOW_WRITE,
    WORKFLOW_EXECUTE,
    WORKFLOW_DELETE,
    INTEGRATION_WRITE,
    INTEGRATION_DELETE,
    APIKEY_CREATE,
    APIKEY_REVOKE,
];

const ADMIN: &[&str] = &[
    WORKSPACE_READ,
    USER_READ,
    APIKEY_READ,
    WORKFLOW_READ,
    INTEGRATION_READ,
    WORKFLOW_WRITE,
    WORKFLOW_EXECUTE,
    WORKFLOW_DELETE,
    INTEGRATION_WRITE,
    INTEGRATION_DELETE,
    APIKEY_CREATE,
    APIKEY_REVOKE,
    WORKSPACE_WRITE,
    WORKSPACE_DELETE,
    USER_WRITE,
    USER_DELETE,
];

pub fn default_permissions(role: Role) -> &'static [&'static str] {
    match role {
        Role::Admin => ADMIN,
        Role::Developer => DEVELOPER,
        Role::User => USER,
        Role::Viewer => VIEWER,
    }
}

pub fn is_granted(role: Role, custom: &[String], permission: &str) -> bool {
    custom.iter().any(|p| p == permission) || default_permissions(role).contains(&permission)
}
