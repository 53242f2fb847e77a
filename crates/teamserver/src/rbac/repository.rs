//! RBAC repository: workspaces, roles and user/role bindings.

use std::collections::BTreeSet;

use sqlx::SqlitePool;
use tracing::{debug, instrument};

use super::models::{Role, RoleRow, Workspace, decode_permissions};
use crate::db::ensure_workspace_on;
use crate::error::{StorageContext, StorageError};

#[derive(Debug, Clone)]
pub struct RbacRepository {
    pool: SqlitePool,
}

impl RbacRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Lookup-or-insert a workspace by name and return its id.
    #[instrument(skip(self))]
    pub async fn ensure_workspace(&self, name: &str) -> Result<i64, StorageError> {
        ensure_workspace_on(&self.pool, name)
            .await
            .context("ensuring workspace")
    }

    #[instrument(skip(self))]
    pub async fn workspace(&self, name: &str) -> Result<Option<Workspace>, StorageError> {
        sqlx::query_as::<_, Workspace>(
            "SELECT id, name, active, created_at FROM workspaces WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .context("fetching workspace")
    }

    pub async fn workspace_by_id(&self, id: i64) -> Result<Option<Workspace>, StorageError> {
        sqlx::query_as::<_, Workspace>(
            "SELECT id, name, active, created_at FROM workspaces WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching workspace by id")
    }

    pub async fn list_workspaces(&self) -> Result<Vec<Workspace>, StorageError> {
        sqlx::query_as::<_, Workspace>(
            "SELECT id, name, active, created_at FROM workspaces ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .context("listing workspaces")
    }

    /// Create a role or replace its permission set wholesale.
    #[instrument(skip(self, permissions))]
    pub async fn upsert_role<I, S>(&self, name: &str, permissions: I) -> Result<Role, StorageError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let permissions: BTreeSet<String> = permissions.into_iter().map(Into::into).collect();
        let encoded = serde_json::to_string(&permissions).map_err(|e| StorageError::Corrupt {
            column: "roles.permissions",
            detail: e.to_string(),
        })?;
        debug!(count = permissions.len(), "Upserting role");

        sqlx::query(
            r#"
            INSERT INTO roles (name, permissions) VALUES (?, ?)
            ON CONFLICT(name) DO UPDATE SET permissions = excluded.permissions
            "#,
        )
        .bind(name)
        .bind(encoded)
        .execute(&self.pool)
        .await
        .context("upserting role")?;

        Ok(Role {
            name: name.to_owned(),
            permissions,
        })
    }

    pub async fn role(&self, name: &str) -> Result<Option<Role>, StorageError> {
        sqlx::query_as::<_, RoleRow>("SELECT name, permissions FROM roles WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .context("fetching role")?
            .map(Role::try_from)
            .transpose()
    }

    pub async fn list_roles(&self) -> Result<Vec<Role>, StorageError> {
        sqlx::query_as::<_, RoleRow>("SELECT name, permissions FROM roles ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .context("listing roles")?
            .into_iter()
            .map(Role::try_from)
            .collect()
    }

    /// Bind a role to a user in a workspace. Binding twice is a no-op.
    ///
    /// A missing user, role or workspace is a foreign key violation.
    #[instrument(skip(self))]
    pub async fn assign_role(
        &self,
        user_id: i64,
        role_name: &str,
        workspace_id: i64,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO user_roles (user_id, role_name, workspace_id) VALUES (?, ?, ?)
            ON CONFLICT(user_id, role_name, workspace_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(role_name)
        .bind(workspace_id)
        .execute(&self.pool)
        .await
        .context("assigning role")?;

        Ok(())
    }

    /// Remove a binding. Returns whether it existed.
    #[instrument(skip(self))]
    pub async fn unassign_role(
        &self,
        user_id: i64,
        role_name: &str,
        workspace_id: i64,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "DELETE FROM user_roles WHERE user_id = ? AND role_name = ? AND workspace_id = ?",
        )
        .bind(user_id)
        .bind(role_name)
        .bind(workspace_id)
        .execute(&self.pool)
        .await
        .context("unassigning role")?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn user_roles(
        &self,
        user_id: i64,
        workspace_id: i64,
    ) -> Result<Vec<String>, StorageError> {
        sqlx::query_scalar(
            r#"
            SELECT role_name FROM user_roles
            WHERE user_id = ? AND workspace_id = ?
            ORDER BY role_name
            "#,
        )
        .bind(user_id)
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await
        .context("listing user roles")
    }

    /// Union of permissions across every role bound in the workspace.
    #[instrument(skip(self))]
    pub async fn permissions(
        &self,
        user_id: i64,
        workspace_id: i64,
    ) -> Result<BTreeSet<String>, StorageError> {
        let rows: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT r.permissions
            FROM user_roles ur
            JOIN roles r ON r.name = ur.role_name
            WHERE ur.user_id = ? AND ur.workspace_id = ?
            "#,
        )
        .bind(user_id)
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await
        .context("loading permissions")?;

        let mut set = BTreeSet::new();
        for raw in rows {
            set.extend(decode_permissions(&raw)?);
        }
        Ok(set)
    }
}
