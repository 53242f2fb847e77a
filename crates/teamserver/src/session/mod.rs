//! Session management.
//!
//! Sessions are opaque bearer tokens bound to one user and one workspace.
//! Expiry is checked on every resolve; sweeping only reclaims rows.

mod models;
mod repository;

use std::time::Duration;

use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use rand::TryRngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::auth::AuthError;
use crate::error::StorageError;

pub use models::{IssuedSession, ResolvedSession, Session};
pub use repository::SessionRepository;

/// Bytes of entropy in a session token (hex encoded on the wire).
pub const SESSION_TOKEN_BYTES: usize = 32;

/// What a kick does besides dropping the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KickPolicy {
    /// Drop the connection and delete its session.
    #[default]
    RevokeSession,
    /// Drop the connection only; the token stays valid until expiry.
    DropConnection,
}

impl std::fmt::Display for KickPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KickPolicy::RevokeSession => write!(f, "revoke_session"),
            KickPolicy::DropConnection => write!(f, "drop_connection"),
        }
    }
}

/// Issues, resolves and revokes sessions.
#[derive(Debug, Clone)]
pub struct SessionManager {
    repo: SessionRepository,
    default_ttl: Duration,
}

impl SessionManager {
    pub fn new(repo: SessionRepository, default_ttl: Duration) -> Self {
        Self { repo, default_ttl }
    }

    pub fn repository(&self) -> &SessionRepository {
        &self.repo
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Issue a new session for `user_id` in `workspace_id`.
    #[instrument(skip(self))]
    pub async fn create(
        &self,
        user_id: i64,
        workspace_id: i64,
        ttl: Option<Duration>,
    ) -> Result<IssuedSession, AuthError> {
        let ttl = ttl.unwrap_or(self.default_ttl);
        // Stored with millisecond precision; keep the returned value identical.
        let created_at = Utc::now().trunc_subsecs(3);
        let expires_at = TimeDelta::from_std(ttl)
            .ok()
            .and_then(|ttl| created_at.checked_add_signed(ttl))
            .ok_or_else(|| AuthError::Internal(format!("session ttl {ttl:?} out of range")))?;

        let session = Session {
            id: generate_token()?,
            user_id,
            workspace_id,
            created_at,
            expires_at,
        };
        self.repo.save(&session).await?;
        debug!(expires_at = %expires_at, "Session created");

        Ok(IssuedSession {
            id: session.id,
            user_id,
            workspace_id,
            expires_at,
        })
    }

    /// Resolve a token to its owner and workspace.
    pub async fn resolve(&self, id: &str) -> Result<ResolvedSession, AuthError> {
        self.resolve_at(id, Utc::now()).await
    }

    /// Resolve as of `now`. Expiry is decided here, not by the sweeper.
    pub async fn resolve_at(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<ResolvedSession, AuthError> {
        let resolved = self
            .repo
            .resolve(id)
            .await?
            .ok_or(AuthError::SessionNotFound)?;

        if resolved.session.is_expired_at(now) {
            return Err(AuthError::SessionExpired);
        }
        Ok(resolved)
    }

    /// Delete a session immediately. Open connections are not touched.
    pub async fn revoke(&self, id: &str) -> Result<bool, StorageError> {
        self.repo.delete(id).await
    }

    /// Delete every session of a user.
    pub async fn revoke_user(&self, user_id: i64) -> Result<u64, StorageError> {
        self.repo.delete_for_user(user_id).await
    }

    /// Delete sessions that have expired as of now.
    pub async fn sweep(&self) -> Result<u64, StorageError> {
        self.repo.delete_stale(Utc::now()).await
    }

    /// Best-effort sweep on the login path; failures only log.
    pub async fn sweep_lazily(&self) {
        match self.sweep().await {
            Ok(0) => {}
            Ok(n) => debug!(removed = n, "Swept expired sessions"),
            Err(e) => warn!(error = %e, "Lazy session sweep failed"),
        }
    }

    /// Run the sweep on a timer until `shutdown` fires.
    pub fn spawn_sweeper(&self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;

            info!(interval_secs = interval.as_secs(), "Session sweeper started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => match manager.sweep().await {
                        Ok(0) => {}
                        Ok(n) => info!(removed = n, "Swept expired sessions"),
                        Err(e) => warn!(error = %e, "Session sweep failed"),
                    },
                }
            }
            debug!("Session sweeper stopped");
        })
    }
}

fn generate_token() -> Result<String, AuthError> {
    let mut bytes = [0u8; SESSION_TOKEN_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| AuthError::Internal(format!("OS random source failed: {e}")))?;
    Ok(hex::encode(bytes))
}
