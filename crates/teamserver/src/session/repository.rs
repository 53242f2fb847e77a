//! Session repository for database operations.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::instrument;

use super::models::{ResolvedSession, Session, SessionRow};
use crate::db::format_timestamp;
use crate::error::{StorageContext, StorageError};

/// Repository for session database operations.
#[derive(Debug, Clone)]
pub struct SessionRepository {
    pool: SqlitePool,
}

impl SessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[instrument(skip(self, session), fields(user_id = session.user_id, workspace_id = session.workspace_id))]
    pub async fn save(&self, session: &Session) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO sessions (id, user_id, workspace_id, created_at, expires_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(session.user_id)
        .bind(session.workspace_id)
        .bind(format_timestamp(session.created_at))
        .bind(format_timestamp(session.expires_at))
        .execute(&self.pool)
        .await
        .context("saving session")?;

        Ok(())
    }

    /// Look up a session and its owner in one query. Expiry is not checked.
    #[instrument(skip_all)]
    pub async fn resolve(&self, id: &str) -> Result<Option<ResolvedSession>, StorageError> {
        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT s.id, s.workspace_id, s.created_at, s.expires_at,
                   u.id AS user_id, u.username, u.password_hash, u.sso_token,
                   u.created_at AS user_created_at
            FROM sessions s
            JOIN users u ON u.id = s.user_id
            WHERE s.id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("resolving session")?;

        row.map(ResolvedSession::try_from).transpose()
    }

    /// Delete one session. Returns whether it existed.
    #[instrument(skip_all)]
    pub async fn delete(&self, id: &str) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("deleting session")?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete every session with `expires_at <= now`.
    #[instrument(skip(self))]
    pub async fn delete_stale(&self, now: DateTime<Utc>) -> Result<u64, StorageError> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= ?")
            .bind(format_timestamp(now))
            .execute(&self.pool)
            .await
            .context("deleting stale sessions")?;

        Ok(result.rows_affected())
    }

    /// Delete every session owned by a user.
    #[instrument(skip(self))]
    pub async fn delete_for_user(&self, user_id: i64) -> Result<u64, StorageError> {
        let result = sqlx::query("DELETE FROM sessions WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .context("deleting user sessions")?;

        Ok(result.rows_affected())
    }

    pub async fn count(&self) -> Result<i64, StorageError> {
        sqlx::query_scalar("SELECT COUNT(*) FROM sessions")
            .fetch_one(&self.pool)
            .await
            .context("counting sessions")
    }
}
