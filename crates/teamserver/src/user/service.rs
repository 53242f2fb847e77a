//! User service: credential verification and account management.

use std::sync::Arc;

use subtle::ConstantTimeEq;
use tracing::{info, instrument, warn};

use super::models::User;
use super::repository::UserRepository;
use crate::auth::{AuthError, Credentials, PasswordHasher};
use crate::error::StorageError;
use crate::session::SessionRepository;

/// Service for operator identity operations.
#[derive(Debug, Clone)]
pub struct UserService {
    repo: UserRepository,
    sessions: SessionRepository,
    hasher: Arc<dyn PasswordHasher>,
}

impl UserService {
    pub fn new(
        repo: UserRepository,
        sessions: SessionRepository,
        hasher: Arc<dyn PasswordHasher>,
    ) -> Self {
        Self {
            repo,
            sessions,
            hasher,
        }
    }

    pub fn repository(&self) -> &UserRepository {
        &self.repo
    }

    /// Verify presented credentials.
    pub async fn verify(&self, credentials: &Credentials) -> Result<User, AuthError> {
        match credentials {
            Credentials::Password { username, secret } => {
                self.authenticate(username, secret).await
            }
            Credentials::Sso { username, token } => self.authenticate_sso(username, token).await,
        }
    }

    /// Verify a username and password.
    ///
    /// An unknown user, a wrong password and an SSO-only account all yield
    /// [`AuthError::InvalidCredentials`].
    #[instrument(skip(self, secret))]
    pub async fn authenticate(&self, username: &str, secret: &str) -> Result<User, AuthError> {
        let Some(user) = self.repo.get_by_username(username).await? else {
            return Err(AuthError::InvalidCredentials);
        };

        let Some(digest) = user.password_hash.clone() else {
            // SSO-only account: password login fails closed.
            return Err(AuthError::InvalidCredentials);
        };

        let hasher = Arc::clone(&self.hasher);
        let secret = secret.to_owned();
        let ok = tokio::task::spawn_blocking(move || hasher.verify(&digest, &secret))
            .await
            .map_err(|e| AuthError::Internal(format!("password verification task failed: {e}")))?;

        if !ok {
            return Err(AuthError::InvalidCredentials);
        }
        Ok(user)
    }

    /// Verify a username and SSO token.
    #[instrument(skip(self, token))]
    pub async fn authenticate_sso(&self, username: &str, token: &str) -> Result<User, AuthError> {
        let user = self
            .repo
            .get_by_username(username)
            .await?
            .ok_or(AuthError::InvalidCredentials)?;

        match user.sso_token.as_deref() {
            Some(stored)
                if !token.is_empty() && bool::from(stored.as_bytes().ct_eq(token.as_bytes())) =>
            {
                Ok(user)
            }
            _ => Err(AuthError::InvalidCredentials),
        }
    }

    /// Hash a secret on a blocking worker.
    pub async fn hash_secret(&self, secret: &str) -> Result<String, AuthError> {
        let hasher = Arc::clone(&self.hasher);
        let secret = secret.to_owned();
        tokio::task::spawn_blocking(move || hasher.hash(&secret))
            .await
            .map_err(|e| AuthError::Internal(format!("password hashing task failed: {e}")))?
            .map_err(|e| AuthError::Internal(e.to_string()))
    }

    /// Set (or reset) a user's password and revoke all of their sessions.
    ///
    /// Creates the user when it does not exist yet.
    #[instrument(skip(self, secret))]
    pub async fn set_password(&self, username: &str, secret: &str) -> Result<User, AuthError> {
        let digest = self.hash_secret(secret).await?;
        let user = self.repo.save(username, Some(&digest), None).await?;
        let revoked = self.sessions.delete_for_user(user.id).await?;
        info!(user_id = user.id, revoked, "Password updated");
        Ok(user)
    }

    /// Create or update an operator from plaintext or pre-hashed material.
    #[instrument(skip_all, fields(username = %username))]
    pub async fn save_operator(
        &self,
        username: &str,
        password: Option<&str>,
        password_hash: Option<&str>,
        sso_token: Option<&str>,
    ) -> Result<User, AuthError> {
        let digest = match (password, password_hash) {
            (Some(secret), _) => {
                if password_hash.is_some() {
                    warn!("Both password and password_hash configured; using password");
                }
                Some(self.hash_secret(secret).await?)
            }
            (None, Some(hash)) => Some(hash.to_owned()),
            (None, None) => None,
        };

        Ok(self.repo.save(username, digest.as_deref(), sso_token).await?)
    }

    pub async fn get(&self, id: i64) -> Result<Option<User>, StorageError> {
        self.repo.get(id).await
    }

    pub async fn get_by_username(&self, username: &str) -> Result<Option<User>, StorageError> {
        self.repo.get_by_username(username).await
    }

    pub async fn list(&self) -> Result<Vec<User>, StorageError> {
        self.repo.list().await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::auth::BcryptHasher;
    use crate::db::Database;
    use crate::session::SessionManager;

    async fn service() -> (Database, UserService) {
        let db = Database::in_memory().await.unwrap();
        let service = UserService::new(
            UserRepository::new(db.pool().clone()),
            SessionRepository::new(db.pool().clone()),
            Arc::new(BcryptHasher::new(4)),
        );
        (db, service)
    }

    #[tokio::test]
    async fn test_password_login() {
        let (_db, service) = service().await;
        service.set_password("alice", "hunter2").await.unwrap();

        let user = service.authenticate("alice", "hunter2").await.unwrap();
        assert_eq!(user.username, "alice");

        assert!(matches!(
            service.authenticate("alice", "wrong").await,
            Err(AuthError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn test_unknown_user_and_bad_password_look_the_same() {
        let (_db, service) = service().await;
        service.set_password("alice", "hunter2").await.unwrap();

        let unknown = service.authenticate("mallory", "hunter2").await.unwrap_err();
        let wrong = service.authenticate("alice", "nope").await.unwrap_err();
        assert_eq!(unknown.to_string(), wrong.to_string());
        assert_eq!(unknown.error_code(), wrong.error_code());
    }

    #[tokio::test]
    async fn test_sso_only_account_rejects_password() {
        let (_db, service) = service().await;
        service
            .save_operator("bob", None, None, Some("sso-tok"))
            .await
            .unwrap();

        assert!(matches!(
            service.authenticate("bob", "").await,
            Err(AuthError::InvalidCredentials)
        ));
        assert!(matches!(
            service.authenticate("bob", "sso-tok").await,
            Err(AuthError::InvalidCredentials)
        ));

        let user = service
            .verify(&Credentials::sso("bob", "sso-tok"))
            .await
            .unwrap();
        assert!(user.is_sso_only());
        assert!(service.authenticate_sso("bob", "other").await.is_err());
        assert!(service.authenticate_sso("bob", "").await.is_err());
    }

    #[tokio::test]
    async fn test_sso_token_must_match_exactly() {
        let (_db, service) = service().await;
        service
            .save_operator("dave", None, None, Some("sso-token"))
            .await
            .unwrap();

        for attempt in ["sso-toke", "sso-token2", "sso-tokem", "SSO-TOKEN"] {
            assert!(
                matches!(
                    service.authenticate_sso("dave", attempt).await,
                    Err(AuthError::InvalidCredentials)
                ),
                "{attempt} accepted"
            );
        }
        assert_eq!(
            service.authenticate_sso("dave", "sso-token").await.unwrap().username,
            "dave"
        );
    }

    #[tokio::test]
    async fn test_sso_requires_stored_token() {
        let (_db, service) = service().await;
        service.set_password("carol", "pw").await.unwrap();
        assert!(matches!(
            service.authenticate_sso("carol", "").await,
            Err(AuthError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn test_pre_hashed_operator() {
        let (_db, service) = service().await;
        let digest = BcryptHasher::new(4).hash("s3cret").unwrap();
        service
            .save_operator("dave", None, Some(&digest), None)
            .await
            .unwrap();
        assert!(service.authenticate("dave", "s3cret").await.is_ok());
    }

    #[tokio::test]
    async fn test_set_password_revokes_sessions() {
        let (db, service) = service().await;
        let alice = service.set_password("alice", "old").await.unwrap();

        let sessions = SessionManager::new(
            SessionRepository::new(db.pool().clone()),
            Duration::from_secs(3600),
        );
        let ws: i64 = sqlx::query_scalar("SELECT id FROM workspaces WHERE name = 'default'")
            .fetch_one(db.pool())
            .await
            .unwrap();
        let issued = sessions.create(alice.id, ws, None).await.unwrap();
        assert!(sessions.resolve(&issued.id).await.is_ok());

        service.set_password("alice", "new").await.unwrap();
        assert!(matches!(
            sessions.resolve(&issued.id).await,
            Err(AuthError::SessionNotFound)
        ));
        assert!(service.authenticate("alice", "old").await.is_err());
        assert!(service.authenticate("alice", "new").await.is_ok());
    }
}
