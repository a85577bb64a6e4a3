use chrono::NaiveDateTime;

use super::proto;
use crate::models::{ApiKey, Session, User, UserRole, Workspace};

fn epoch(at: NaiveDateTime) -> i64 {
    at.and_utc().timestamp()
}

fn epoch_or_zero(at: Option<NaiveDateTime>) -> i64 {
    at.map(epoch).unwrap_or(0)
}

impl From<User> for proto::User {
    fn from(user: User) -> Self {
        Self {
            id: user.id.to_string(),
            email: user.email,
            first_name: user.first_name.unwrap_or_default(),
            last_name: user.last_name.unwrap_or_default(),
            avatar_url: user.avatar_url.unwrap_or_default(),
            email_verified: user.email_verified,
            active: user.active,
            created_at: epoch(user.created_at),
            updated_at: epoch(user.updated_at),
        }
    }
}

impl From<Session> for proto::Session {
    fn from(session: Session) -> Self {
        Self {
            id: session.id.to_string(),
            user_agent: session.user_agent.unwrap_or_default(),
            ip_address: session.ip_address.unwrap_or_default(),
            created_at: session.created_at.timestamp(),
            expires_at: session.expires_at.timestamp(),
        }
    }
}

impl From<Workspace> for proto::Workspace {
    fn from(workspace: Workspace) -> Self {
        Self {
            id: workspace.id.to_string(),
            name: workspace.name,
            owner_id: workspace.owner_id.to_string(),
            description: workspace.description.unwrap_or_default(),
            active: workspace.active,
            plan: workspace.plan,
            settings_json: workspace.settings.to_string(),
            created_at: epoch(workspace.created_at),
            updated_at: epoch(workspace.updated_at),
        }
    }
}

impl From<UserRole> for proto::Member {
    fn from(role: UserRole) -> Self {
        Self {
            user_id: role.user_id.to_string(),
            workspace_id: role.workspace_id.to_string(),
            role: role.role.to_string(),
            permissions: role.permissions,
            created_by: role.created_by.map(|id| id.to_string()).unwrap_or_default(),
        }
    }
}

impl From<ApiKey> for proto::ApiKey {
    fn from(key: ApiKey) -> Self {
        Self {
            id: key.id.to_string(),
            workspace_id: key.workspace_id.to_string(),
            user_id: key.user_id.to_string(),
            name: key.name,
            key_prefix: key.key_prefix,
            active: key.active,
            scopes: key.scopes,
            rate_limit: key.rate_limit,
            expires_at: epoch_or_zero(key.expires_at),
            revoked_at: epoch_or_zero(key.revoked_at),
            last_used_at: epoch_or_zero(key.last_used_at),
            created_at: epoch(key.created_at),
        }
    }
}
