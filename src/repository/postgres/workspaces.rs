use async_trait::async_trait;
use diesel::prelude::*;
use diesel::upsert::excluded;
use uuid::Uuid;

use super::Database;
use crate::error::{StoreError, StoreResult};
use crate::models::{NewUserRole, NewWorkspace, UserRole, UserRoleRow, Workspace, WorkspaceUpdate};
use crate::repository::{RoleRepository, WorkspaceRepository};
use crate::schema::{user_roles, workspaces};

#[derive(Clone)]
pub struct PgWorkspaceRepository {
    db: Database,
}

impl PgWorkspaceRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl WorkspaceRepository for PgWorkspaceRepository {
    async fn create(&self, workspace: NewWorkspace) -> StoreResult<Workspace> {
        self.db
            .run(move |conn| {
                diesel::insert_into(workspaces::table)
                    .values(&workspace)
                    .returning(Workspace::as_returning())
                    .get_result(conn)
                    .map_err(StoreError::from)
            })
            .await
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<Workspace>> {
        self.db
            .run(move |conn| {
                workspaces::table
                    .find(id)
                    .select(Workspace::as_select())
                    .first(conn)
                    .optional()
                    .map_err(StoreError::from)
            })
            .await
    }

    async fn update(&self, id: Uuid, update: WorkspaceUpdate) -> StoreResult<Option<Workspace>> {
        self.db
            .run(move |conn| {
                diesel::update(workspaces::table.find(id))
                    .set((&update, workspaces::updated_at.eq(diesel::dsl::now)))
                    .returning(Workspace::as_returning())
                    .get_result(conn)
                    .optional()
                    .map_err(StoreError::from)
            })
            .await
    }

    async fn delete(&self, id: Uuid) -> StoreResult<bool> {
        self.db
            .run(move |conn| {
                diesel::delete(workspaces::table.find(id))
                    .execute(conn)
                    .map(|rows| rows > 0)
                    .map_err(StoreError::from)
            })
            .await
    }
}

#[derive(Insertable)]
#[diesel(table_name = user_roles)]
struct UserRoleInsert {
    user_id: Uuid,
    workspace_id: Uuid,
    role: String,
    permissions: serde_json::Value,
    created_by: Option<Uuid>,
}

impl TryFrom<NewUserRole> for UserRoleInsert {
    type Error = StoreError;

    fn try_from(role: NewUserRole) -> Result<Self, Self::Error> {
        Ok(Self {
            user_id: role.user_id,
            workspace_id: role.workspace_id,
            role: role.role.as_str().to_string(),
            permissions: serde_json::to_value(role.permissions)?,
            created_by: role.created_by,
        })
    }
}

#[derive(Clone)]
pub struct PgRoleRepository {
    db: Database,
}

impl PgRoleRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl RoleRepository for PgRoleRepository {
    async fn create(&self, role: NewUserRole) -> StoreResult<UserRole> {
        let row = UserRoleInsert::try_from(role)?;
        self.db
            .run(move |conn| {
                diesel::insert_into(user_roles::table)
                    .values(&row)
                    .returning(UserRoleRow::as_returning())
                    .get_result(conn)
                    .map_err(StoreError::from)
                    .and_then(UserRole::try_from)
            })
            .await
    }

    async fn find(&self, user_id: Uuid, workspace_id: Uuid) -> StoreResult<Option<UserRole>> {
        self.db
            .run(move |conn| {
                user_roles::table
                    .filter(user_roles::user_id.eq(user_id))
                    .filter(user_roles::workspace_id.eq(workspace_id))
                    .select(UserRoleRow::as_select())
                    .first(conn)
                    .optional()
                    .map_err(StoreError::from)?
                    .map(UserRole::try_from)
                    .transpose()
            })
            .await
    }

    async fn upsert(&self, role: NewUserRole) -> StoreResult<UserRole> {
        let row = UserRoleInsert::try_from(role)?;
        self.db
            .run(move |conn| {
                diesel::insert_into(user_roles::table)
                    .values(&row)
                    .on_conflict((user_roles::user_id, user_roles::workspace_id))
                    .do_update()
                    .set((
                        user_roles::role.eq(excluded(user_roles::role)),
                        user_roles::permissions.eq(excluded(user_roles::permissions)),
                        user_roles::updated_at.eq(diesel::dsl::now),
                    ))
                    .returning(UserRoleRow::as_returning())
                    .get_result(conn)
                    .map_err(StoreError::from)
                    .and_then(UserRole::try_from)
            })
            .await
    }

    async fn delete(&self, user_id: Uuid, workspace_id: Uuid) -> StoreResult<bool> {
        self.db
            .run(move |conn| {
                diesel::delete(
                    user_roles::table
                        .filter(user_roles::user_id.eq(user_id))
                        .filter(user_roles::workspace_id.eq(workspace_id)),
                )
                .execute(conn)
                .map(|rows| rows > 0)
                .map_err(StoreError::from)
            })
            .await
    }

    async fn list_for_workspace(&self, workspace_id: Uuid) -> StoreResult<Vec<UserRole>> {
        self.db
            .run(move |conn| {
                user_roles::table
                    .filter(user_roles::workspace_id.eq(workspace_id))
                    .order(user_roles::created_at.asc())
                    .select(UserRoleRow::as_select())
                    .load(conn)
                    .map_err(StoreError::from)?
                    .into_iter()
                    .map(UserRole::try_from)
                    .collect()
            })
            .await
    }
}
