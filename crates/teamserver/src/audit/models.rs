//! Audit data models.

use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use sqlx::FromRow;
use teamserver_protocol::{AuditEvent as AuditSubEvent, Envelope, EventCategory, payload};

use crate::db::parse_timestamp;
use crate::error::StorageError;

/// Username recorded for events raised by the server itself.
pub const SYSTEM_ACTOR: &str = "teamserver";

/// Who performed an audited action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: i64,
    pub username: String,
}

impl Actor {
    pub fn new(user_id: i64, username: impl Into<String>) -> Self {
        Self {
            user_id,
            username: username.into(),
        }
    }

    /// The server acting on its own behalf (id 0).
    pub fn system() -> Self {
        Self::new(0, SYSTEM_ACTOR)
    }
}

/// One immutable row of the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEvent {
    pub id: i64,
    pub user_id: i64,
    pub username: String,
    pub workspace_id: i64,
    pub action: String,
    pub target: String,
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl AuditEvent {
    /// The envelope broadcast for this row, live or replayed.
    pub fn to_envelope(&self) -> Envelope {
        Envelope::at(
            EventCategory::Audit,
            AuditSubEvent::Append,
            payload! {
                "User" => self.username,
                "Action" => self.action,
                "Target" => self.target,
                "Metadata" => self.metadata,
            },
            &self.created_at.with_timezone(&Local),
        )
    }
}

#[derive(Debug, FromRow)]
pub(super) struct AuditRow {
    pub id: i64,
    pub user_id: i64,
    pub username: String,
    pub workspace_id: i64,
    pub action: String,
    pub target: String,
    pub metadata: String,
    pub created_at: String,
}

impl TryFrom<AuditRow> for AuditEvent {
    type Error = StorageError;

    fn try_from(row: AuditRow) -> Result<Self, Self::Error> {
        let metadata = match serde_json::from_str::<Value>(&row.metadata) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                return Err(StorageError::Corrupt {
                    column: "audit_events.metadata",
                    detail: format!("expected object, found {other}"),
                });
            }
            Err(e) => {
                return Err(StorageError::Corrupt {
                    column: "audit_events.metadata",
                    detail: e.to_string(),
                });
            }
        };

        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            username: row.username,
            workspace_id: row.workspace_id,
            action: row.action,
            target: row.target,
            metadata,
            created_at: parse_timestamp("audit_events.created_at", &row.created_at)?,
        })
    }
}
