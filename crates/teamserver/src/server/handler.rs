//! Handling of frames received from operator connections.

use std::sync::Arc;

use teamserver_protocol::{
    ChatEvent, Envelope, EventCategory, InitConnectionEvent, ProtocolError, TeamserverEvent,
    payload,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::Teamserver;
use super::messages::{AuditHistoryRequest, ChatMessage, KickRequest, LoginInit, TokenInit};
use crate::audit::{Actor, actions};
use crate::auth::{AuthError, Credentials};
use crate::error::StorageError;
use crate::rbac::permissions;
use crate::registry::{ClientBinding, ConnectedClient};

/// Replay size when `Teamserver.AuditHistory` carries no limit.
pub const DEFAULT_HISTORY_LIMIT: u32 = 100;
/// Upper bound on one replay.
pub const MAX_HISTORY_LIMIT: u32 = 1_000;

/// Message sent back on a failed handshake, whatever the cause.
const AUTH_FAILED_MESSAGE: &str = "authentication failed";

#[derive(Debug, Error)]
pub enum FrameError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("client is not authenticated")]
    NotAuthenticated,
}

impl FrameError {
    /// Whether the connection must be dropped after this error.
    pub fn closes_connection(&self) -> bool {
        !matches!(self, FrameError::Storage(_))
    }
}

impl Teamserver {
    /// Handle one text frame from `client`.
    ///
    /// The first frame of a connection must complete the handshake. An
    /// error for which [`FrameError::closes_connection`] holds means the
    /// caller should stop reading and disconnect.
    pub async fn handle_frame(
        &self,
        client: &Arc<ConnectedClient>,
        frame: &str,
    ) -> Result<(), FrameError> {
        let envelope = Envelope::from_frame(frame)?;

        if !client.is_authenticated() {
            return self.authenticate_client(client, &envelope).await.map(|_| ());
        }
        let binding = client.binding().ok_or(FrameError::NotAuthenticated)?;

        match envelope.category() {
            EventCategory::Chat => match envelope.sub_event::<ChatEvent>()? {
                ChatEvent::NewMessage => self.handle_chat(client, &binding, &envelope).await,
                other => Err(unexpected(format!("Chat.{other:?} from an operator"))),
            },
            EventCategory::Teamserver => match envelope.sub_event::<TeamserverEvent>()? {
                TeamserverEvent::AuditHistory => {
                    self.handle_audit_history(client, &binding, &envelope).await
                }
                TeamserverEvent::Kick => self.handle_kick(client, &binding, &envelope).await,
                other => Err(unexpected(format!("Teamserver.{other:?} from an operator"))),
            },
            EventCategory::InitConnection => Err(unexpected("handshake repeated".into())),
            other => Err(unexpected(format!("{other} events from an operator"))),
        }
    }

    /// Run the `InitConnection` handshake.
    ///
    /// On failure the client gets `InitConnection.Error` with a generic
    /// message and is removed and closed.
    pub async fn authenticate_client(
        &self,
        client: &Arc<ConnectedClient>,
        envelope: &Envelope,
    ) -> Result<ClientBinding, FrameError> {
        match self.establish(client, envelope).await {
            Ok(binding) => Ok(binding),
            Err(e) => {
                warn!(client_id = %client.id(), remote_addr = ?client.remote_addr(), error = %e, "Handshake failed");
                let reply = Envelope::new(
                    EventCategory::InitConnection,
                    InitConnectionEvent::Error,
                    payload! { "Message" => AUTH_FAILED_MESSAGE },
                );
                if let Err(send_err) = client.send_envelope(&reply).await {
                    debug!(client_id = %client.id(), error = %send_err, "Could not deliver handshake error");
                }
                self.operators.remove_client(client);
                let _ = client.close().await;
                Err(e)
            }
        }
    }

    async fn establish(
        &self,
        client: &Arc<ConnectedClient>,
        envelope: &Envelope,
    ) -> Result<ClientBinding, FrameError> {
        if envelope.category() != EventCategory::InitConnection {
            return Err(FrameError::NotAuthenticated);
        }

        let binding = match envelope.sub_event::<InitConnectionEvent>()? {
            InitConnectionEvent::Token => {
                let init: TokenInit = envelope.info_as("InitConnection.Token")?;
                let (resolved, workspace) = self.resolve_session(&init.token).await?;
                ClientBinding {
                    user_id: resolved.user.id,
                    username: resolved.user.username,
                    session_id: resolved.session.id,
                    workspace_id: workspace.id,
                    workspace: workspace.name,
                    client_version: init.version,
                }
            }
            InitConnectionEvent::Login => {
                let init: LoginInit = envelope.info_as("InitConnection.Login")?;
                let credentials = match (init.password, init.sso_token) {
                    (Some(secret), _) => Credentials::password(init.user, secret),
                    (None, Some(token)) => Credentials::sso(init.user, token),
                    (None, None) => {
                        return Err(ProtocolError::InvalidInfo {
                            context: "InitConnection.Login",
                            reason: "missing Password or SSOToken".into(),
                        }
                        .into());
                    }
                };
                let outcome = self.login(&credentials, init.workspace.as_deref()).await?;
                ClientBinding {
                    user_id: outcome.user.id,
                    username: outcome.user.username,
                    session_id: outcome.session.id,
                    workspace_id: outcome.workspace.id,
                    workspace: outcome.workspace.name,
                    client_version: init.version,
                }
            }
            other => return Err(unexpected(format!("InitConnection.{other:?} from a client"))),
        };

        // Reply before promoting so no broadcast can overtake the handshake.
        let reply = Envelope::new(
            EventCategory::InitConnection,
            InitConnectionEvent::Success,
            payload! {
                "Token" => binding.session_id,
                "User" => binding.username,
                "Workspace" => binding.workspace,
                "WorkspaceID" => binding.workspace_id,
                "ClientID" => client.id(),
            },
        );
        client
            .send_envelope(&reply)
            .await
            .map_err(|e| ProtocolError::Unexpected(format!("handshake reply failed: {e}")))?;
        client.promote(binding.clone());

        self.queue.publish(
            binding.workspace_id,
            Envelope::new(
                EventCategory::Chat,
                ChatEvent::NewUser,
                payload! { "User" => binding.username },
            ),
        );
        if let Err(e) = self
            .audit
            .log(
                &actor_of(&binding),
                binding.workspace_id,
                actions::OPERATOR_CONNECT,
                &binding.username,
                payload! {
                    "ClientID" => client.id(),
                    "Version" => binding.client_version,
                    "RemoteAddr" => client.remote_addr().map(|a| a.to_string()),
                },
            )
            .await
        {
            warn!(client_id = %client.id(), error = %e, "Failed to audit connect");
        }

        info!(client_id = %client.id(), user = %binding.username, workspace = %binding.workspace, "Operator connected");
        Ok(binding)
    }

    async fn handle_chat(
        &self,
        client: &Arc<ConnectedClient>,
        binding: &ClientBinding,
        envelope: &Envelope,
    ) -> Result<(), FrameError> {
        let message: ChatMessage = envelope.info_as("Chat.NewMessage")?;
        if !self.permit(client, binding, permissions::CHAT_SEND).await? {
            return Ok(());
        }

        self.audit
            .log(
                &actor_of(binding),
                binding.workspace_id,
                actions::CHAT_MESSAGE,
                "",
                payload! { "Message" => message.message },
            )
            .await?;
        self.queue.publish(
            binding.workspace_id,
            Envelope::new(
                EventCategory::Chat,
                ChatEvent::NewMessage,
                payload! { "User" => binding.username, "Message" => message.message },
            ),
        );
        Ok(())
    }

    async fn handle_audit_history(
        &self,
        client: &Arc<ConnectedClient>,
        binding: &ClientBinding,
        envelope: &Envelope,
    ) -> Result<(), FrameError> {
        let request: AuditHistoryRequest = envelope.info_as("Teamserver.AuditHistory")?;
        if !self.permit(client, binding, permissions::AUDIT_READ).await? {
            return Ok(());
        }

        let limit = request
            .limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .clamp(1, MAX_HISTORY_LIMIT);
        let events = self.audit.history(binding.workspace_id, limit).await?;
        debug!(client_id = %client.id(), count = events.len(), "Replaying audit history");

        // Oldest first, as if received live.
        for event in events.iter().rev() {
            if !self.broadcaster.send_to(client, &event.to_envelope()).await {
                break;
            }
        }
        Ok(())
    }

    async fn handle_kick(
        &self,
        client: &Arc<ConnectedClient>,
        binding: &ClientBinding,
        envelope: &Envelope,
    ) -> Result<(), FrameError> {
        let request: KickRequest = envelope.info_as("Teamserver.Kick")?;
        if !self.permit(client, binding, permissions::OPERATORS_KICK).await? {
            return Ok(());
        }

        let kicked = self
            .kick(&actor_of(binding), binding.workspace_id, &request.client_id)
            .await?;
        self.broadcaster
            .send_to(
                client,
                &Envelope::new(
                    EventCategory::Teamserver,
                    TeamserverEvent::Kick,
                    payload! { "ClientID" => request.client_id, "Kicked" => kicked },
                ),
            )
            .await;
        Ok(())
    }

    /// Check a permission; on refusal audit it and reply `Teamserver.Refused`.
    async fn permit(
        &self,
        client: &Arc<ConnectedClient>,
        binding: &ClientBinding,
        permission: &str,
    ) -> Result<bool, FrameError> {
        if self
            .rbac
            .authorize(binding.user_id, binding.workspace_id, permission)
            .await?
        {
            return Ok(true);
        }

        self.audit
            .log(
                &actor_of(binding),
                binding.workspace_id,
                actions::AUTHORIZATION_DENIED,
                permission,
                payload! { "ClientID" => client.id() },
            )
            .await?;
        self.broadcaster
            .send_to(
                client,
                &Envelope::new(
                    EventCategory::Teamserver,
                    TeamserverEvent::Refused,
                    payload! { "Permission" => permission },
                ),
            )
            .await;
        Ok(false)
    }
}

fn actor_of(binding: &ClientBinding) -> Actor {
    Actor::new(binding.user_id, binding.username.clone())
}

fn unexpected(detail: String) -> FrameError {
    FrameError::Protocol(ProtocolError::Unexpected(detail))
}
