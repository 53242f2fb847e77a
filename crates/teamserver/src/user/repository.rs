//! User repository for database operations.

use sqlx::SqlitePool;
use tracing::{debug, instrument};

use super::models::User;
use crate::db::now_timestamp;
use crate::error::{StorageContext, StorageError};

/// Repository for user database operations.
#[derive(Debug, Clone)]
pub struct UserRepository {
    pool: SqlitePool,
}

impl UserRepository {
    /// Create a new user repository.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or update a user by username.
    ///
    /// `None` leaves the stored value untouched, so a first insert without a
    /// hash yields an SSO-only account and later saves never clear secrets.
    #[instrument(skip(self, password_hash, sso_token))]
    pub async fn save(
        &self,
        username: &str,
        password_hash: Option<&str>,
        sso_token: Option<&str>,
    ) -> Result<User, StorageError> {
        debug!(
            set_password = password_hash.is_some(),
            set_sso = sso_token.is_some(),
            "Saving user"
        );

        sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (username, password_hash, sso_token, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(username) DO UPDATE SET
                password_hash = COALESCE(excluded.password_hash, users.password_hash),
                sso_token = COALESCE(excluded.sso_token, users.sso_token)
            RETURNING id, username, password_hash, sso_token, created_at
            "#,
        )
        .bind(username)
        .bind(password_hash)
        .bind(sso_token)
        .bind(now_timestamp())
        .fetch_one(&self.pool)
        .await
        .context("saving user")
    }

    /// Get a user by username.
    #[instrument(skip(self))]
    pub async fn get_by_username(&self, username: &str) -> Result<Option<User>, StorageError> {
        sqlx::query_as::<_, User>(
            r#"
            SELECT id, username, password_hash, sso_token, created_at
            FROM users
            WHERE username = ?
            "#,
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await
        .context("fetching user by username")
    }

    /// Get a user by ID.
    #[instrument(skip(self))]
    pub async fn get(&self, id: i64) -> Result<Option<User>, StorageError> {
        sqlx::query_as::<_, User>(
            r#"
            SELECT id, username, password_hash, sso_token, created_at
            FROM users
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching user")
    }

    /// List all users ordered by username.
    #[instrument(skip(self))]
    pub async fn list(&self) -> Result<Vec<User>, StorageError> {
        sqlx::query_as::<_, User>(
            r#"
            SELECT id, username, password_hash, sso_token, created_at
            FROM users
            ORDER BY username
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("listing users")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    async fn repo() -> UserRepository {
        let db = Database::in_memory().await.unwrap();
        UserRepository::new(db.pool().clone())
    }

    #[tokio::test]
    async fn test_save_without_fields_preserves_secrets() {
        let repo = repo().await;

        let first = repo.save("alice", None, Some("sso-tok")).await.unwrap();
        assert!(first.is_sso_only());
        assert_eq!(first.sso_token.as_deref(), Some("sso-tok"));

        let hashed = repo.save("alice", Some("$2b$04$digest"), None).await.unwrap();
        assert_eq!(hashed.id, first.id);
        assert_eq!(hashed.password_hash.as_deref(), Some("$2b$04$digest"));
        assert_eq!(hashed.sso_token.as_deref(), Some("sso-tok"));

        let again = repo.save("alice", None, None).await.unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.created_at, first.created_at);
        assert_eq!(again.password_hash.as_deref(), Some("$2b$04$digest"));
        assert_eq!(again.sso_token.as_deref(), Some("sso-tok"));
    }

    #[tokio::test]
    async fn test_lookups() {
        let repo = repo().await;
        let bob = repo.save("bob", Some("x"), None).await.unwrap();
        repo.save("alice", Some("y"), None).await.unwrap();

        assert_eq!(repo.get(bob.id).await.unwrap(), Some(bob.clone()));
        assert_eq!(repo.get_by_username("bob").await.unwrap(), Some(bob));
        assert!(repo.get_by_username("carol").await.unwrap().is_none());
        assert!(repo.get(9999).await.unwrap().is_none());

        let names: Vec<_> = repo
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|u| u.username)
            .collect();
        assert_eq!(names, vec!["alice", "bob"]);
    }
}
