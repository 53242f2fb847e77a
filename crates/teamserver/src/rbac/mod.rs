//! Workspace-scoped role based access control.
//!
//! Permissions are plain strings. A user's effective set in a workspace is
//! the union of every role bound to them in that workspace, and nothing
//! carries over between workspaces.

mod models;
mod repository;

use std::collections::BTreeSet;

use thiserror::Error;
use tracing::debug;

use crate::error::StorageError;

pub use models::{Role, Workspace};
pub use repository::RbacRepository;

/// Permission names understood by the server.
pub mod permissions {
    pub const AUDIT_READ: &str = "audit.read";
    pub const CHAT_SEND: &str = "chat.send";
    pub const OPERATORS_LIST: &str = "operators.list";
    pub const OPERATORS_KICK: &str = "operators.kick";
    pub const AGENTS_READ: &str = "agents.read";
    pub const AGENTS_INTERACT: &str = "agents.interact";
    pub const LISTENERS_MANAGE: &str = "listeners.manage";
    pub const ROLES_MANAGE: &str = "roles.manage";

    pub const ALL: &[&str] = &[
        AUDIT_READ,
        CHAT_SEND,
        OPERATORS_LIST,
        OPERATORS_KICK,
        AGENTS_READ,
        AGENTS_INTERACT,
        LISTENERS_MANAGE,
        ROLES_MANAGE,
    ];
}

#[derive(Debug, Error)]
pub enum AuthorizationError {
    /// Only the missing permission is reported, never the caller's set.
    #[error("permission denied: {permission}")]
    Forbidden { permission: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone)]
pub struct RbacService {
    repo: RbacRepository,
}

impl RbacService {
    pub fn new(repo: RbacRepository) -> Self {
        Self { repo }
    }

    pub fn repository(&self) -> &RbacRepository {
        &self.repo
    }

    pub async fn effective_permissions(
        &self,
        user_id: i64,
        workspace_id: i64,
    ) -> Result<BTreeSet<String>, StorageError> {
        self.repo.permissions(user_id, workspace_id).await
    }

    pub async fn authorize(
        &self,
        user_id: i64,
        workspace_id: i64,
        permission: &str,
    ) -> Result<bool, StorageError> {
        let allowed = self
            .effective_permissions(user_id, workspace_id)
            .await?
            .contains(permission);
        debug!(user_id, workspace_id, permission, allowed, "Authorization check");
        Ok(allowed)
    }

    pub async fn require(
        &self,
        user_id: i64,
        workspace_id: i64,
        permission: &str,
    ) -> Result<(), AuthorizationError> {
        if self.authorize(user_id, workspace_id, permission).await? {
            Ok(())
        } else {
            Err(AuthorizationError::Forbidden {
                permission: permission.to_owned(),
            })
        }
    }
}
