//! Session data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::db::parse_timestamp;
use crate::error::StorageError;
use crate::user::User;

/// A stored operator session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    pub user_id: i64,
    pub workspace_id: i64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// What the caller gets back after logging in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuedSession {
    pub id: String,
    pub user_id: i64,
    pub workspace_id: i64,
    pub expires_at: DateTime<Utc>,
}

/// A session token resolved to its owner.
#[derive(Debug, Clone)]
pub struct ResolvedSession {
    pub user: User,
    pub session: Session,
}

impl ResolvedSession {
    pub fn workspace_id(&self) -> i64 {
        self.session.workspace_id
    }
}

/// Row of the session/user join.
#[derive(Debug, FromRow)]
pub(super) struct SessionRow {
    pub id: String,
    pub workspace_id: i64,
    pub created_at: String,
    pub expires_at: String,
    pub user_id: i64,
    pub username: String,
    pub password_hash: Option<String>,
    pub sso_token: Option<String>,
    pub user_created_at: String,
}

impl TryFrom<SessionRow> for ResolvedSession {
    type Error = StorageError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        let session = Session {
            id: row.id,
            user_id: row.user_id,
            workspace_id: row.workspace_id,
            created_at: parse_timestamp("sessions.created_at", &row.created_at)?,
            expires_at: parse_timestamp("sessions.expires_at", &row.expires_at)?,
        };
        let user = User {
            id: row.user_id,
            username: row.username,
            password_hash: row.password_hash,
            sso_token: row.sso_token,
            created_at: row.user_created_at,
        };
        Ok(Self { user, session })
    }
}
