//! The teamserver core.
//!
//! [`Teamserver`] owns the registries, services and dispatcher and exposes
//! the operations the transport layer drives: login, connection handshake,
//! frame handling, kick, revocation and agent lifecycle events.

mod handler;
mod messages;

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use teamserver_protocol::{AgentEvent, ChatEvent, Envelope, EventCategory, payload};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::audit::{Actor, AuditLogger, AuditRepository, actions};
use crate::auth::{AuthError, Credentials, PasswordHasher};
use crate::broadcast::{Broadcaster, EventQueue, spawn_dispatcher};
use crate::config::AppConfig;
use crate::db::{DEFAULT_WORKSPACE, Database};
use crate::error::StorageError;
use crate::ports::WebhookSink;
use crate::rbac::{RbacRepository, RbacService, Workspace};
use crate::registry::{
    AgentCheckin, AgentRegistry, ClientTransport, ConnectedAgent, ConnectedClient,
    OperatorRegistry,
};
use crate::session::{
    IssuedSession, KickPolicy, ResolvedSession, SessionManager, SessionRepository,
};
use crate::user::{User, UserRepository, UserService};

pub use handler::FrameError;
pub use messages::{AuditHistoryRequest, ChatMessage, KickRequest, LoginInit, TokenInit};

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// Result of a successful login.
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub user: User,
    pub workspace: Workspace,
    pub session: IssuedSession,
}

/// Point-in-time counters for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStats {
    pub operators: usize,
    pub agents: usize,
    pub started_at: DateTime<Utc>,
}

pub struct Teamserver {
    db: Database,
    users: UserService,
    rbac: RbacService,
    sessions: SessionManager,
    audit: AuditLogger,
    operators: Arc<OperatorRegistry>,
    agents: AgentRegistry,
    broadcaster: Broadcaster,
    queue: EventQueue,
    webhook: Arc<dyn WebhookSink>,
    kick_policy: KickPolicy,
    started_at: DateTime<Utc>,
}

impl Teamserver {
    /// Wire up services, seed configured state and start background tasks.
    ///
    /// Background tasks stop when `shutdown` is cancelled.
    pub async fn start(
        db: Database,
        config: &AppConfig,
        hasher: Arc<dyn PasswordHasher>,
        webhook: Arc<dyn WebhookSink>,
        shutdown: CancellationToken,
    ) -> Result<Arc<Self>, BootstrapError> {
        let pool = db.pool().clone();
        let session_repo = SessionRepository::new(pool.clone());
        let users = UserService::new(
            UserRepository::new(pool.clone()),
            session_repo.clone(),
            hasher,
        );
        let rbac = RbacService::new(RbacRepository::new(pool.clone()));
        let sessions = SessionManager::new(session_repo, config.sessions.ttl());

        let operators = Arc::new(OperatorRegistry::new());
        let broadcaster = Broadcaster::new(Arc::clone(&operators), config.broadcast.write_timeout());
        let (queue, _dispatcher) = spawn_dispatcher(broadcaster.clone(), shutdown.clone());
        let audit = AuditLogger::new(AuditRepository::new(pool), queue.clone());

        let server = Self {
            db,
            users,
            rbac,
            sessions,
            audit,
            operators,
            agents: AgentRegistry::new(),
            broadcaster,
            queue,
            webhook,
            kick_policy: config.sessions.kick_policy,
            started_at: Utc::now(),
        };
        server.bootstrap(config).await?;

        if let Some(interval) = config.sessions.sweep_interval() {
            server.sessions.spawn_sweeper(interval, shutdown);
        }

        Ok(Arc::new(server))
    }

    /// Upsert configured roles, workspaces and operators.
    #[instrument(skip_all)]
    async fn bootstrap(&self, config: &AppConfig) -> Result<(), BootstrapError> {
        let rbac = self.rbac.repository();

        for (name, permissions) in &config.roles {
            rbac.upsert_role(name, permissions.iter().map(String::as_str))
                .await?;
        }
        for name in &config.workspaces {
            rbac.ensure_workspace(name).await?;
        }

        for operator in &config.operators {
            let user = self
                .users
                .save_operator(
                    &operator.username,
                    operator.password.as_deref(),
                    operator.password_hash.as_deref(),
                    operator.sso_token.as_deref(),
                )
                .await?;
            for (workspace, roles) in &operator.roles {
                let workspace_id = rbac.ensure_workspace(workspace).await?;
                for role in roles {
                    rbac.assign_role(user.id, role, workspace_id).await?;
                }
            }
        }

        info!(
            roles = config.roles.len(),
            workspaces = config.workspaces.len(),
            operators = config.operators.len(),
            "Bootstrap complete"
        );
        Ok(())
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn users(&self) -> &UserService {
        &self.users
    }

    pub fn rbac(&self) -> &RbacService {
        &self.rbac
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    pub fn operators(&self) -> &Arc<OperatorRegistry> {
        &self.operators
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    pub fn kick_policy(&self) -> KickPolicy {
        self.kick_policy
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            operators: self.operators.len(),
            agents: self.agents.len(),
            started_at: self.started_at,
        }
    }

    /// Verify credentials and issue a session in `workspace` (default if `None`).
    ///
    /// An unknown or inactive workspace fails like bad credentials.
    #[instrument(skip(self, credentials), fields(username = %credentials.username(), method = credentials.method()))]
    pub async fn login(
        &self,
        credentials: &Credentials,
        workspace: Option<&str>,
    ) -> Result<LoginOutcome, AuthError> {
        self.sessions.sweep_lazily().await;

        let user = match self.users.verify(credentials).await {
            Ok(user) => user,
            Err(e) => {
                warn!(error = %e, "Login rejected");
                return Err(e);
            }
        };

        let name = workspace.unwrap_or(DEFAULT_WORKSPACE);
        let workspace = match self.rbac.repository().workspace(name).await? {
            Some(ws) if ws.active => ws,
            _ => {
                warn!(workspace = name, "Login to unknown or inactive workspace");
                return Err(AuthError::InvalidCredentials);
            }
        };

        let session = self.sessions.create(user.id, workspace.id, None).await?;
        if let Err(e) = self
            .audit
            .log(
                &Actor::new(user.id, &user.username),
                workspace.id,
                actions::OPERATOR_LOGIN,
                &user.username,
                payload! { "Method" => credentials.method() },
            )
            .await
        {
            // An unaudited login must not leave a usable token behind.
            if let Err(revoke_err) = self.sessions.revoke(&session.id).await {
                warn!(error = %revoke_err, "Failed to revoke unaudited session");
            }
            return Err(e.into());
        }
        info!(user_id = user.id, workspace = %workspace.name, "Operator logged in");

        Ok(LoginOutcome {
            user,
            workspace,
            session,
        })
    }

    /// Resolve a session token to its owner and workspace.
    ///
    /// A session whose workspace has since been deactivated resolves like
    /// an unknown token.
    pub async fn resolve_session(
        &self,
        token: &str,
    ) -> Result<(ResolvedSession, Workspace), AuthError> {
        // Resolve before sweeping so an expired token reports as expired.
        let resolved = self.sessions.resolve(token).await;
        self.sessions.sweep_lazily().await;
        let resolved = resolved?;

        match self
            .rbac
            .repository()
            .workspace_by_id(resolved.workspace_id())
            .await?
        {
            Some(workspace) if workspace.active => Ok((resolved, workspace)),
            _ => {
                warn!(
                    workspace_id = resolved.workspace_id(),
                    "Session for unknown or inactive workspace"
                );
                Err(AuthError::SessionNotFound)
            }
        }
    }

    /// Register a freshly accepted connection as an unauthenticated client.
    pub fn accept(
        &self,
        transport: Box<dyn ClientTransport>,
        remote_addr: Option<SocketAddr>,
    ) -> Arc<ConnectedClient> {
        let client = Arc::new(ConnectedClient::new(transport, remote_addr));
        if !self.operators.insert(Arc::clone(&client)) {
            warn!(client_id = %client.id(), "Client id collision; connection will not receive events");
        }
        debug!(client_id = %client.id(), remote_addr = ?remote_addr, "Connection accepted");
        client
    }

    /// Forget a client whose connection ended. The session stays valid.
    pub async fn disconnect(&self, client: &Arc<ConnectedClient>) {
        if !self.operators.remove_client(client) {
            // Already kicked or evicted.
            return;
        }
        let Some(binding) = client.binding().filter(|_| client.is_authenticated()) else {
            debug!(client_id = %client.id(), "Unauthenticated connection closed");
            return;
        };

        self.queue.publish(
            binding.workspace_id,
            Envelope::new(
                EventCategory::Chat,
                ChatEvent::UserDisconnected,
                payload! { "User" => binding.username },
            ),
        );
        if let Err(e) = self
            .audit
            .log(
                &Actor::new(binding.user_id, &binding.username),
                binding.workspace_id,
                actions::OPERATOR_DISCONNECT,
                &binding.username,
                payload! { "ClientID" => client.id() },
            )
            .await
        {
            warn!(client_id = %client.id(), error = %e, "Failed to audit disconnect");
        }
        info!(client_id = %client.id(), user = %binding.username, "Operator disconnected");
    }

    /// Drop another operator's connection in the same workspace.
    ///
    /// With [`KickPolicy::RevokeSession`] the target's session is deleted as
    /// well. Returns false when no such client is connected there.
    #[instrument(skip(self, actor), fields(actor = %actor.username))]
    pub async fn kick(
        &self,
        actor: &Actor,
        workspace_id: i64,
        client_id: &str,
    ) -> Result<bool, StorageError> {
        let Some(target) = self.operators.get(client_id) else {
            return Ok(false);
        };
        let Some(binding) = target
            .binding()
            .filter(|b| target.is_authenticated() && b.workspace_id == workspace_id)
        else {
            return Ok(false);
        };

        self.operators.remove_client(&target);
        if let Err(e) = target.close().await {
            debug!(client_id, error = %e, "Close of kicked client failed");
        }

        let revoked = match self.kick_policy {
            KickPolicy::RevokeSession => self.sessions.revoke(&binding.session_id).await?,
            KickPolicy::DropConnection => false,
        };

        self.queue.publish(
            workspace_id,
            Envelope::new(
                EventCategory::Chat,
                ChatEvent::UserDisconnected,
                payload! { "User" => binding.username },
            ),
        );
        self.audit
            .log(
                actor,
                workspace_id,
                actions::OPERATOR_KICK,
                &binding.username,
                payload! {
                    "ClientID" => client_id,
                    "Policy" => self.kick_policy.to_string(),
                    "SessionRevoked" => revoked,
                },
            )
            .await?;
        info!(client_id, target = %binding.username, policy = %self.kick_policy, "Operator kicked");
        Ok(true)
    }

    /// Delete a session. Connections already using it stay open.
    pub async fn revoke_session(
        &self,
        actor: &Actor,
        workspace_id: i64,
        session_id: &str,
    ) -> Result<bool, StorageError> {
        let revoked = self.sessions.revoke(session_id).await?;
        if revoked {
            self.audit
                .log(actor, workspace_id, actions::SESSION_REVOKE, "", payload! {})
                .await?;
        }
        Ok(revoked)
    }

    /// Record an agent check-in and announce it.
    ///
    /// A first check-in raises `Agent.New` (also handed to the webhook sink);
    /// later ones raise `Agent.Checkin`.
    pub async fn agent_checkin(
        &self,
        workspace_id: i64,
        checkin: AgentCheckin,
    ) -> Result<Arc<ConnectedAgent>, StorageError> {
        let (agent, is_new) = self
            .agents
            .register(ConnectedAgent::new(workspace_id, checkin));

        if !is_new {
            self.queue.publish(
                agent.workspace_id(),
                Envelope::new(
                    EventCategory::Agent,
                    AgentEvent::Checkin,
                    payload! {
                        "AgentID" => agent.id(),
                        "LastSeen" => agent.last_seen().to_rfc3339(),
                    },
                ),
            );
            return Ok(agent);
        }

        let envelope = Envelope::new(
            EventCategory::Agent,
            AgentEvent::New,
            messages::to_info(agent.checkin()),
        );
        self.queue.publish(agent.workspace_id(), envelope.clone());
        self.webhook.deliver(&envelope).await;
        self.audit
            .log(
                &Actor::system(),
                agent.workspace_id(),
                actions::AGENT_NEW,
                agent.id(),
                payload! {
                    "Hostname" => agent.checkin().hostname,
                    "Username" => agent.checkin().username,
                },
            )
            .await?;
        Ok(agent)
    }

    /// Relay agent output to the agent's workspace. False for unknown agents.
    pub fn agent_output(&self, agent_id: &str, output: &str) -> bool {
        let Some(agent) = self.agents.get(agent_id) else {
            return false;
        };
        agent.touch();
        self.queue.publish(
            agent.workspace_id(),
            Envelope::new(
                EventCategory::Agent,
                AgentEvent::Output,
                payload! { "AgentID" => agent_id, "Output" => output },
            ),
        );
        true
    }

    pub async fn agent_remove(&self, agent_id: &str) -> Result<bool, StorageError> {
        let Some(agent) = self.agents.remove(agent_id) else {
            return Ok(false);
        };
        self.queue.publish(
            agent.workspace_id(),
            Envelope::new(
                EventCategory::Agent,
                AgentEvent::Remove,
                payload! { "AgentID" => agent_id },
            ),
        );
        self.audit
            .log(
                &Actor::system(),
                agent.workspace_id(),
                actions::AGENT_REMOVE,
                agent_id,
                payload! {},
            )
            .await?;
        Ok(true)
    }

    /// Queue an envelope for every authenticated operator in the workspace.
    pub fn broadcast(&self, workspace_id: i64, envelope: Envelope) {
        self.queue.publish(workspace_id, envelope);
    }

    /// Wait until every queued envelope has been delivered.
    pub async fn flush(&self) {
        self.queue.flush().await;
    }
}
