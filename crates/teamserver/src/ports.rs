//! Outbound capability ports.
//!
//! The password hashing port lives in [`crate::auth`]; this module holds the
//! ports whose real implementations live outside the server.

use async_trait::async_trait;
use teamserver_protocol::Envelope;
use tracing::info;

/// Receives envelopes that should leave the server (new agents, etc).
///
/// Delivery is fire-and-forget from the caller's point of view.
#[async_trait]
pub trait WebhookSink: Send + Sync {
    async fn deliver(&self, envelope: &Envelope);
}

/// Default sink: records the event in the log and does nothing else.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogWebhook;

#[async_trait]
impl WebhookSink for LogWebhook {
    async fn deliver(&self, envelope: &Envelope) {
        info!(
            event = %envelope.category(),
            sub_event = envelope.body.sub_event,
            "Webhook event (no sink configured)"
        );
    }
}
