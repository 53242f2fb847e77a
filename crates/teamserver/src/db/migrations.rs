//! Schema migrations.
//!
//! The schema version lives in `meta['SchemaVersion']` (absent means 0).
//! Each step runs in its own transaction together with the version bump, so
//! a crash between steps leaves the store at the last completed version and
//! the next start resumes from there.

use sqlx::sqlite::SqlitePool;
use sqlx::SqliteExecutor;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Name of the workspace that exists before any RBAC operation runs.
pub const DEFAULT_WORKSPACE: &str = "default";

/// Highest schema version this build knows how to produce.
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

const SCHEMA_VERSION_KEY: &str = "SchemaVersion";

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("reading or creating the meta table")]
    Meta(#[source] sqlx::Error),

    #[error("invalid SchemaVersion value {0:?}")]
    InvalidVersion(String),

    #[error("database schema version {found} is newer than supported version {supported}")]
    Unsupported { found: u32, supported: u32 },

    #[error("applying migration to version {version}")]
    Step {
        version: u32,
        #[source]
        source: sqlx::Error,
    },
}

struct Migration {
    version: u32,
    description: &'static str,
    statements: &'static [&'static str],
    seeds_default_workspace: bool,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "core tables",
        statements: &[
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                password_hash TEXT,
                sso_token TEXT,
                created_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS roles (
                name TEXT PRIMARY KEY,
                permissions TEXT NOT NULL DEFAULT '[]'
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS workspaces (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS user_roles (
                user_id INTEGER NOT NULL REFERENCES users(id),
                role_name TEXT NOT NULL REFERENCES roles(name) ON DELETE CASCADE,
                workspace_id INTEGER NOT NULL REFERENCES workspaces(id),
                PRIMARY KEY (user_id, role_name, workspace_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS audit_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                workspace_id INTEGER NOT NULL,
                action TEXT NOT NULL,
                target TEXT NOT NULL DEFAULT '',
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL REFERENCES users(id),
                workspace_id INTEGER NOT NULL REFERENCES workspaces(id),
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            )
            "#,
        ],
        seeds_default_workspace: true,
    },
    Migration {
        version: 2,
        description: "lookup indexes and append-only audit trail",
        statements: &[
            "CREATE INDEX IF NOT EXISTS idx_audit_events_workspace ON audit_events(workspace_id, id)",
            "CREATE INDEX IF NOT EXISTS idx_sessions_expires_at ON sessions(expires_at)",
            "CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id)",
            r#"
            CREATE TRIGGER IF NOT EXISTS audit_events_no_update
            BEFORE UPDATE ON audit_events
            BEGIN
                SELECT RAISE(ABORT, 'audit events are append-only');
            END
            "#,
            r#"
            CREATE TRIGGER IF NOT EXISTS audit_events_no_delete
            BEFORE DELETE ON audit_events
            BEGIN
                SELECT RAISE(ABORT, 'audit events are append-only');
            END
            "#,
        ],
        seeds_default_workspace: false,
    },
];

/// Bring the schema up to [`CURRENT_SCHEMA_VERSION`], returning the final version.
#[instrument(skip(pool))]
pub(crate) async fn apply_migrations(pool: &SqlitePool) -> Result<u32, MigrationError> {
    sqlx::query("CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)")
        .execute(pool)
        .await
        .map_err(MigrationError::Meta)?;

    let start = schema_version(pool).await?;
    if start > CURRENT_SCHEMA_VERSION {
        return Err(MigrationError::Unsupported {
            found: start,
            supported: CURRENT_SCHEMA_VERSION,
        });
    }

    let mut version = start;
    for migration in MIGRATIONS.iter().filter(|m| m.version > start) {
        apply_step(pool, migration)
            .await
            .map_err(|source| MigrationError::Step {
                version: migration.version,
                source,
            })?;
        version = migration.version;
        info!(
            version,
            description = migration.description,
            "applied schema migration"
        );
    }

    debug!(version, "schema up to date");
    Ok(version)
}

async fn apply_step(pool: &SqlitePool, migration: &Migration) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    for statement in migration.statements {
        sqlx::query(statement).execute(&mut *tx).await?;
    }

    if migration.seeds_default_workspace {
        ensure_workspace_on(&mut *tx, DEFAULT_WORKSPACE).await?;
    }

    sqlx::query(
        "INSERT INTO meta (key, value) VALUES (?, ?) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(SCHEMA_VERSION_KEY)
    .bind(migration.version.to_string())
    .execute(&mut *tx)
    .await?;

    tx.commit().await
}

/// Read the recorded schema version (0 when the key is absent).
pub(crate) async fn schema_version(pool: &SqlitePool) -> Result<u32, MigrationError> {
    let value: Option<String> = sqlx::query_scalar("SELECT value FROM meta WHERE key = ?")
        .bind(SCHEMA_VERSION_KEY)
        .fetch_optional(pool)
        .await
        .map_err(MigrationError::Meta)?;

    match value {
        None => Ok(0),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| MigrationError::InvalidVersion(raw)),
    }
}

/// Lookup-or-insert a workspace by name in a single statement.
///
/// Concurrent callers race on the unique `name` index; the loser's insert
/// turns into a no-op update and both get the same id back.
pub(crate) async fn ensure_workspace_on<'e, E>(executor: E, name: &str) -> Result<i64, sqlx::Error>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query_scalar(
        "INSERT INTO workspaces (name, active, created_at) VALUES (?, 1, ?) \
         ON CONFLICT(name) DO UPDATE SET name = excluded.name \
         RETURNING id",
    )
    .bind(name)
    .bind(super::now_timestamp())
    .fetch_one(executor)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    async fn table_count(pool: &SqlitePool, name: &str) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(name)
            .fetch_one(pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let db = Database::in_memory().await.unwrap();
        assert_eq!(db.schema_version().await.unwrap(), CURRENT_SCHEMA_VERSION);

        assert_eq!(db.apply_migrations().await.unwrap(), CURRENT_SCHEMA_VERSION);
        assert_eq!(db.schema_version().await.unwrap(), CURRENT_SCHEMA_VERSION);

        let defaults: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM workspaces WHERE name = ?")
            .bind(DEFAULT_WORKSPACE)
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(defaults, 1);

        for table in [
            "meta",
            "users",
            "roles",
            "workspaces",
            "user_roles",
            "audit_events",
            "sessions",
        ] {
            assert_eq!(table_count(db.pool(), table).await, 1, "missing {table}");
        }
    }

    #[tokio::test]
    async fn test_resume_does_not_rerun_completed_steps() {
        let db = Database::in_memory().await.unwrap();
        let pool = db.pool();

        // Simulate a store that recorded step 1 but lost its tables: step 1
        // must not run again, so step 2 fails on the missing audit table.
        for table in ["user_roles", "sessions", "audit_events", "users", "roles", "workspaces"] {
            sqlx::query(&format!("DROP TABLE {table}"))
                .execute(pool)
                .await
                .unwrap();
        }
        sqlx::query("UPDATE meta SET value = '1' WHERE key = 'SchemaVersion'")
            .execute(pool)
            .await
            .unwrap();

        let err = db.apply_migrations().await.unwrap_err();
        assert!(matches!(err, MigrationError::Step { version: 2, .. }));
        assert_eq!(db.schema_version().await.unwrap(), 1);
        assert_eq!(table_count(pool, "users").await, 0);
    }

    #[tokio::test]
    async fn test_resume_from_partial_version() {
        let db = Database::in_memory().await.unwrap();
        let pool = db.pool();

        sqlx::query("DROP INDEX idx_audit_events_workspace")
            .execute(pool)
            .await
            .unwrap();
        sqlx::query("UPDATE meta SET value = '1' WHERE key = 'SchemaVersion'")
            .execute(pool)
            .await
            .unwrap();

        assert_eq!(db.apply_migrations().await.unwrap(), 2);
        let index: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = 'idx_audit_events_workspace'",
        )
        .fetch_one(pool)
        .await
        .unwrap();
        assert_eq!(index, 1);
    }

    #[tokio::test]
    async fn test_newer_schema_is_rejected() {
        let db = Database::in_memory().await.unwrap();
        sqlx::query("UPDATE meta SET value = '99' WHERE key = 'SchemaVersion'")
            .execute(db.pool())
            .await
            .unwrap();

        let err = db.apply_migrations().await.unwrap_err();
        assert!(matches!(
            err,
            MigrationError::Unsupported {
                found: 99,
                supported: CURRENT_SCHEMA_VERSION
            }
        ));
    }

    #[tokio::test]
    async fn test_garbage_version_is_rejected() {
        let db = Database::in_memory().await.unwrap();
        sqlx::query("UPDATE meta SET value = 'two' WHERE key = 'SchemaVersion'")
            .execute(db.pool())
            .await
            .unwrap();

        assert!(matches!(
            db.apply_migrations().await,
            Err(MigrationError::InvalidVersion(v)) if v == "two"
        ));
    }

    #[tokio::test]
    async fn test_audit_rows_are_immutable() {
        let db = Database::in_memory().await.unwrap();
        let pool = db.pool();

        sqlx::query(
            "INSERT INTO audit_events (user_id, workspace_id, action, target, metadata, created_at) \
             VALUES (0, 1, 'test', '', '{}', '2024-01-01T00:00:00.000Z')",
        )
        .execute(pool)
        .await
        .unwrap();

        let update = sqlx::query("UPDATE audit_events SET action = 'tampered'")
            .execute(pool)
            .await;
        assert!(update.unwrap_err().to_string().contains("append-only"));

        let delete = sqlx::query("DELETE FROM audit_events").execute(pool).await;
        assert!(delete.unwrap_err().to_string().contains("append-only"));

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM audit_events")
            .fetch_one(pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
