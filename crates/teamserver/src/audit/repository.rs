//! Audit repository. Insert and read only.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::SqlitePool;
use tracing::{instrument, warn};

use super::models::{AuditEvent, AuditRow, SYSTEM_ACTOR};
use crate::db::format_timestamp;
use crate::error::{StorageContext, StorageError};

#[derive(Debug, Clone)]
pub struct AuditRepository {
    pool: SqlitePool,
}

impl AuditRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append one event and return its id.
    ///
    /// Metadata that fails to serialize is stored as `{}`.
    #[instrument(skip(self, metadata))]
    pub async fn add(
        &self,
        user_id: i64,
        workspace_id: i64,
        action: &str,
        target: &str,
        metadata: &Map<String, Value>,
        created_at: DateTime<Utc>,
    ) -> Result<i64, StorageError> {
        let encoded = serde_json::to_string(metadata).unwrap_or_else(|e| {
            warn!(error = %e, "Audit metadata not serializable; storing empty object");
            "{}".to_string()
        });

        sqlx::query_scalar(
            r#"
            INSERT INTO audit_events (user_id, workspace_id, action, target, metadata, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(user_id)
        .bind(workspace_id)
        .bind(action)
        .bind(target)
        .bind(encoded)
        .bind(format_timestamp(created_at))
        .fetch_one(&self.pool)
        .await
        .context("adding audit event")
    }

    /// Most recent events of a workspace first.
    #[instrument(skip(self))]
    pub async fn list(&self, workspace_id: i64, limit: u32) -> Result<Vec<AuditEvent>, StorageError> {
        sqlx::query_as::<_, AuditRow>(
            r#"
            SELECT a.id, a.user_id, COALESCE(u.username, ?) AS username, a.workspace_id,
                   a.action, a.target, a.metadata, a.created_at
            FROM audit_events a
            LEFT JOIN users u ON u.id = a.user_id
            WHERE a.workspace_id = ?
            ORDER BY a.id DESC
            LIMIT ?
            "#,
        )
        .bind(SYSTEM_ACTOR)
        .bind(workspace_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .context("listing audit events")?
        .into_iter()
        .map(AuditEvent::try_from)
        .collect()
    }
}
