//! The write side of an operator connection.

use async_trait::async_trait;
use teamserver_protocol::ProtocolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("write timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Io(String),

    #[error("encoding frame: {0}")]
    Encode(#[from] ProtocolError),
}

/// Sink for text frames addressed to one operator.
///
/// Callers serialize access through the owning client's lock, so
/// implementations never see concurrent calls.
#[async_trait]
pub trait ClientTransport: Send {
    async fn send(&mut self, frame: &str) -> Result<(), TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}
