//! RBAC data models.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::error::StorageError;

/// Tenancy boundary. Created idempotently by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Workspace {
    pub id: i64,
    pub name: String,
    pub active: bool,
    pub created_at: String,
}

/// Named set of permission strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    pub permissions: BTreeSet<String>,
}

#[derive(Debug, FromRow)]
pub(super) struct RoleRow {
    pub name: String,
    pub permissions: String,
}

impl TryFrom<RoleRow> for Role {
    type Error = StorageError;

    fn try_from(row: RoleRow) -> Result<Self, Self::Error> {
        Ok(Self {
            permissions: decode_permissions(&row.permissions)?,
            name: row.name,
        })
    }
}

pub(super) fn decode_permissions(raw: &str) -> Result<BTreeSet<String>, StorageError> {
    serde_json::from_str(raw).map_err(|e| StorageError::Corrupt {
        column: "roles.permissions",
        detail: e.to_string(),
    })
}
