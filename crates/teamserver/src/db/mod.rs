//! Database module: connection pool, schema migrations and time helpers.

mod migrations;

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::info;

use crate::error::StorageError;

pub use migrations::{CURRENT_SCHEMA_VERSION, DEFAULT_WORKSPACE, MigrationError};
pub(crate) use migrations::ensure_workspace_on;

/// Errors opening the database.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("creating database directory {}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("connecting to database")]
    Connect(#[source] sqlx::Error),

    #[error(transparent)]
    Migration(#[from] MigrationError),
}

/// Database connection pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the database at `path` and bring its schema up to date.
    pub async fn new(path: &Path, max_connections: u32) -> Result<Self, DatabaseError> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|source| DatabaseError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(DatabaseError::Connect)?;

        let db = Self { pool };
        let version = db.apply_migrations().await?;
        info!(path = %path.display(), schema_version = version, "database ready");

        Ok(db)
    }

    /// Create an in-memory database (for testing).
    pub async fn in_memory() -> Result<Self, DatabaseError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(DatabaseError::Connect)?
            .foreign_keys(true);

        // Every connection to `:memory:` is a separate database, so keep
        // exactly one alive for the lifetime of the pool.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(DatabaseError::Connect)?;

        let db = Self { pool };
        db.apply_migrations().await?;

        Ok(db)
    }

    /// Apply pending schema migrations. Safe to call repeatedly.
    pub async fn apply_migrations(&self) -> Result<u32, MigrationError> {
        migrations::apply_migrations(&self.pool).await
    }

    /// Current `SchemaVersion` recorded in the meta table.
    pub async fn schema_version(&self) -> Result<u32, MigrationError> {
        migrations::schema_version(&self.pool).await
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Format a timestamp the way every table stores it.
///
/// Fixed width UTC with milliseconds, so lexical order matches time order.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Current time in storage format.
pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

/// Parse a stored timestamp.
pub fn parse_timestamp(column: &'static str, value: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StorageError::Corrupt {
            column,
            detail: format!("{value:?}: {e}"),
        })
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_timestamp_is_fixed_width_and_ordered() {
        let early = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let late = early + chrono::TimeDelta::milliseconds(1500);

        let a = format_timestamp(early);
        let b = format_timestamp(late);
        assert_eq!(a, "2024-01-02T03:04:05.000Z");
        assert_eq!(a.len(), b.len());
        assert!(a < b);
        assert_eq!(parse_timestamp("created_at", &b).unwrap(), late);
    }

    #[test]
    fn test_parse_timestamp_reports_column() {
        let err = parse_timestamp("expires_at", "yesterday").unwrap_err();
        assert!(err.to_string().starts_with("corrupt expires_at value"));
    }

    #[tokio::test]
    async fn test_file_database_is_created_and_migrated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("teamserver.db");

        let db = Database::new(&path, 4).await.unwrap();
        assert!(path.exists());
        assert_eq!(db.schema_version().await.unwrap(), CURRENT_SCHEMA_VERSION);
    }
}
