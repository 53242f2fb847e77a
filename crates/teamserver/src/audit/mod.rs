//! Append-only audit trail.
//!
//! Every audited action becomes one `audit_events` row and one
//! `Audit.Append` envelope. Rows are committed and envelopes enqueued under
//! a single lock, so operators see events in commit order.

mod models;
mod repository;

use std::sync::Arc;

use chrono::{SubsecRound, Utc};
use serde_json::{Map, Value};
use teamserver_protocol::Envelope;
use tokio::sync::Mutex;
use tracing::debug;

use crate::broadcast::EventQueue;
use crate::error::StorageError;

pub use models::{Actor, AuditEvent, SYSTEM_ACTOR};
pub use repository::AuditRepository;

/// Actions recorded by the server.
pub mod actions {
    pub const OPERATOR_LOGIN: &str = "operator.login";
    pub const OPERATOR_CONNECT: &str = "operator.connect";
    pub const OPERATOR_DISCONNECT: &str = "operator.disconnect";
    pub const OPERATOR_KICK: &str = "operator.kick";
    pub const CHAT_MESSAGE: &str = "chat.message";
    pub const SESSION_REVOKE: &str = "session.revoke";
    pub const AUTHORIZATION_DENIED: &str = "authorization.denied";
    pub const AGENT_NEW: &str = "agent.new";
    pub const AGENT_REMOVE: &str = "agent.remove";
}

#[derive(Clone)]
pub struct AuditLogger {
    repo: AuditRepository,
    queue: Option<EventQueue>,
    order: Arc<Mutex<()>>,
}

impl AuditLogger {
    /// Logger that also publishes each event to the broadcast queue.
    pub fn new(repo: AuditRepository, queue: EventQueue) -> Self {
        Self {
            repo,
            queue: Some(queue),
            order: Arc::new(Mutex::new(())),
        }
    }

    /// Logger that only persists (CLI tools, tests).
    pub fn detached(repo: AuditRepository) -> Self {
        Self {
            repo,
            queue: None,
            order: Arc::new(Mutex::new(())),
        }
    }

    pub fn repository(&self) -> &AuditRepository {
        &self.repo
    }

    /// Persist an event and return its envelope.
    ///
    /// When attached to a queue the envelope is also published to
    /// `workspace_id` before the ordering lock is released.
    pub async fn log(
        &self,
        actor: &Actor,
        workspace_id: i64,
        action: &str,
        target: &str,
        metadata: Map<String, Value>,
    ) -> Result<Envelope, StorageError> {
        let _order = self.order.lock().await;

        let created_at = Utc::now().trunc_subsecs(3);
        let id = self
            .repo
            .add(
                actor.user_id,
                workspace_id,
                action,
                target,
                &metadata,
                created_at,
            )
            .await?;

        let event = AuditEvent {
            id,
            user_id: actor.user_id,
            username: actor.username.clone(),
            workspace_id,
            action: action.to_owned(),
            target: target.to_owned(),
            metadata,
            created_at,
        };
        let envelope = event.to_envelope();
        debug!(id, workspace_id, action, user = %actor.username, "Audit event recorded");

        if let Some(queue) = &self.queue {
            queue.publish(workspace_id, envelope.clone());
        }
        Ok(envelope)
    }

    /// Most recent events first.
    pub async fn history(&self, workspace_id: i64, limit: u32) -> Result<Vec<AuditEvent>, StorageError> {
        self.repo.list(workspace_id, limit).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use teamserver_protocol::{AuditEvent as AuditSubEvent, EventCategory, payload};

    use super::*;
    use crate::db::{DEFAULT_WORKSPACE, Database};
    use crate::user::UserRepository;

    async fn setup() -> (Database, AuditLogger, i64, Actor) {
        let db = Database::in_memory().await.unwrap();
        let alice = UserRepository::new(db.pool().clone())
            .save("alice", Some("digest"), None)
            .await
            .unwrap();
        let ws: i64 = sqlx::query_scalar("SELECT id FROM workspaces WHERE name = ?")
            .bind(DEFAULT_WORKSPACE)
            .fetch_one(db.pool())
            .await
            .unwrap();
        let logger = AuditLogger::detached(AuditRepository::new(db.pool().clone()));
        (db, logger, ws, Actor::new(alice.id, "alice"))
    }

    #[tokio::test]
    async fn test_add_then_list_returns_it_first() {
        let (_db, logger, ws, alice) = setup().await;
        let metadata = payload! {
            "ClientID" => "c-1",
            "Nested" => json!({ "list": [1, 2.5, null, "x"], "flag": true }),
        };

        logger
            .log(&alice, ws, "operator.login", "alice", payload! {})
            .await
            .unwrap();
        logger
            .log(&alice, ws, "operator.kick", "bob", metadata.clone())
            .await
            .unwrap();

        let events = logger.history(ws, 10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, "operator.kick");
        assert_eq!(events[0].target, "bob");
        assert_eq!(events[0].username, "alice");
        assert_eq!(events[0].metadata, metadata);
        assert!(events[0].id > events[1].id);

        assert_eq!(logger.history(ws, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_float_metadata_is_stored_exactly() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let (_db, logger, ws, alice) = setup().await;
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut metadata = Map::new();
        while metadata.len() < 2_000 {
            let value = f64::from_bits(rng.random::<u64>());
            if value.is_finite() {
                metadata.insert(format!("k{}", metadata.len()), json!(value));
            }
        }
        metadata.insert("third".into(), json!(0.1 + 0.2));
        metadata.insert("tiny".into(), json!(f64::MIN_POSITIVE));
        metadata.insert("huge".into(), json!(f64::MAX));

        logger
            .log(&alice, ws, "agent.new", "a1", metadata.clone())
            .await
            .unwrap();

        let stored = &logger.history(ws, 1).await.unwrap()[0].metadata;
        let changed: Vec<_> = metadata
            .iter()
            .filter(|(key, value)| stored.get(*key) != Some(*value))
            .map(|(key, _)| key.as_str())
            .collect();
        assert!(changed.is_empty(), "metadata changed for {changed:?}");
    }

    #[tokio::test]
    async fn test_replay_matches_live_envelope() {
        let (_db, logger, ws, alice) = setup().await;
        let live = logger
            .log(&alice, ws, "session.revoke", "abc", payload! { "Reason" => "test" })
            .await
            .unwrap();

        let replayed = logger.history(ws, 1).await.unwrap()[0].to_envelope();
        assert_eq!(live, replayed);
        assert_eq!(live.category(), EventCategory::Audit);
        assert_eq!(live.sub_event::<AuditSubEvent>().unwrap(), AuditSubEvent::Append);
        assert_eq!(live.info("User"), Some(&json!("alice")));
        assert_eq!(live.info("Metadata"), Some(&json!({ "Reason": "test" })));
    }

    #[tokio::test]
    async fn test_system_actor_and_workspace_isolation() {
        let (db, logger, ws, _) = setup().await;
        let other: i64 = crate::db::ensure_workspace_on(db.pool(), "other").await.unwrap();

        logger
            .log(&Actor::system(), other, "agent.new", "a1", Map::new())
            .await
            .unwrap();

        assert!(logger.history(ws, 10).await.unwrap().is_empty());
        let events = logger.history(other, 10).await.unwrap();
        assert_eq!(events[0].username, SYSTEM_ACTOR);
        assert_eq!(events[0].user_id, 0);
    }
}
