//! A connected operator.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use teamserver_protocol::Envelope;
use tokio::sync::Mutex;

use super::transport::{ClientTransport, TransportError};

/// Identity attached to a client once it has authenticated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientBinding {
    pub user_id: i64,
    pub username: String,
    pub session_id: String,
    pub workspace_id: i64,
    pub workspace: String,
    pub client_version: Option<String>,
}

/// One operator connection.
///
/// Created unauthenticated on accept and promoted after the handshake.
/// Every write to the transport holds `transport` for its full duration.
pub struct ConnectedClient {
    id: String,
    remote_addr: Option<SocketAddr>,
    connected_at: DateTime<Utc>,
    authenticated: AtomicBool,
    binding: RwLock<Option<ClientBinding>>,
    transport: Mutex<Box<dyn ClientTransport>>,
}

impl ConnectedClient {
    pub fn new(transport: Box<dyn ClientTransport>, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            remote_addr,
            connected_at: Utc::now(),
            authenticated: AtomicBool::new(false),
            binding: RwLock::new(None),
            transport: Mutex::new(transport),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    /// Attach an identity and mark the client authenticated.
    pub fn promote(&self, binding: ClientBinding) {
        *self.binding.write().unwrap_or_else(PoisonError::into_inner) = Some(binding);
        self.authenticated.store(true, Ordering::Release);
    }

    pub fn binding(&self) -> Option<ClientBinding> {
        self.binding
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Workspace the client receives broadcasts for, once authenticated.
    pub fn workspace_id(&self) -> Option<i64> {
        if !self.is_authenticated() {
            return None;
        }
        self.binding
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|b| b.workspace_id)
    }

    pub fn username(&self) -> Option<String> {
        self.binding
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|b| b.username.clone())
    }

    pub async fn send_frame(&self, frame: &str) -> Result<(), TransportError> {
        let mut transport = self.transport.lock().await;
        transport.send(frame).await
    }

    pub async fn send_envelope(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let frame = envelope.to_frame()?;
        self.send_frame(&frame).await
    }

    pub async fn close(&self) -> Result<(), TransportError> {
        let mut transport = self.transport.lock().await;
        transport.close().await
    }
}

impl std::fmt::Debug for ConnectedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectedClient")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("authenticated", &self.is_authenticated())
            .field("binding", &self.binding())
            .finish_non_exhaustive()
    }
}
