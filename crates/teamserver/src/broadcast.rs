//! Fan-out of envelopes to connected operators.
//!
//! [`Broadcaster`] delivers one envelope to every authenticated client of a
//! workspace. [`EventQueue`] feeds a single dispatcher task so envelopes go
//! out strictly in the order they were published.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use teamserver_protocol::Envelope;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::registry::{ConnectedClient, OperatorRegistry, TransportError};

/// Outcome of one broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Client ids removed because their write failed or timed out.
    pub evicted: Vec<String>,
}

#[derive(Clone)]
pub struct Broadcaster {
    operators: Arc<OperatorRegistry>,
    write_timeout: Duration,
}

impl Broadcaster {
    pub fn new(operators: Arc<OperatorRegistry>, write_timeout: Duration) -> Self {
        Self {
            operators,
            write_timeout,
        }
    }

    pub fn operators(&self) -> &Arc<OperatorRegistry> {
        &self.operators
    }

    /// Deliver `envelope` to every authenticated client in `workspace_id`.
    ///
    /// The envelope is serialized once. Writes to distinct clients run
    /// concurrently; a failing client is removed and closed without
    /// affecting the others. There is no retry.
    pub async fn broadcast(&self, workspace_id: i64, envelope: &Envelope) -> BroadcastReport {
        let frame = match envelope.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                error!(error = %e, workspace_id, "Failed to encode envelope; dropping broadcast");
                return BroadcastReport::default();
            }
        };

        let recipients = self.operators.authenticated_in(workspace_id);
        if recipients.is_empty() {
            return BroadcastReport::default();
        }

        let writes = recipients.iter().map(|client| {
            let frame = frame.as_str();
            async move { (client, self.write(client, frame).await) }
        });

        let mut report = BroadcastReport::default();
        for (client, result) in join_all(writes).await {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(client_id = %client.id(), workspace_id, error = %e, "Dropping client after failed write");
                    self.evict(client).await;
                    report.evicted.push(client.id().to_owned());
                }
            }
        }

        debug!(
            workspace_id,
            event = %envelope.category(),
            delivered = report.delivered,
            evicted = report.evicted.len(),
            "Broadcast complete"
        );
        report
    }

    /// Deliver to a single client with the same failure handling.
    pub async fn send_to(&self, client: &Arc<ConnectedClient>, envelope: &Envelope) -> bool {
        let result = match envelope.to_frame() {
            Ok(frame) => self.write(client, &frame).await,
            Err(e) => Err(TransportError::from(e)),
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(client_id = %client.id(), error = %e, "Dropping client after failed write");
                self.evict(client).await;
                false
            }
        }
    }

    async fn write(&self, client: &ConnectedClient, frame: &str) -> Result<(), TransportError> {
        match tokio::time::timeout(self.write_timeout, client.send_frame(frame)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn evict(&self, client: &Arc<ConnectedClient>) {
        self.operators.remove_client(client);
        if let Ok(Err(e)) = tokio::time::timeout(self.write_timeout, client.close()).await {
            debug!(client_id = %client.id(), error = %e, "Close after failed write also failed");
        }
    }
}

enum Dispatch {
    Envelope {
        workspace_id: i64,
        envelope: Envelope,
    },
    Flush(oneshot::Sender<()>),
}

/// Handle for publishing envelopes to the dispatcher task.
#[derive(Clone)]
pub struct EventQueue {
    tx: mpsc::UnboundedSender<Dispatch>,
}

impl EventQueue {
    /// Enqueue an envelope for `workspace_id`. Never blocks.
    pub fn publish(&self, workspace_id: i64, envelope: Envelope) {
        if self
            .tx
            .send(Dispatch::Envelope {
                workspace_id,
                envelope,
            })
            .is_err()
        {
            warn!(workspace_id, "Dispatcher stopped; dropping event");
        }
    }

    /// Wait until everything published before this call has been delivered.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Dispatch::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

/// Start the dispatcher. It runs until `shutdown` fires or every queue handle is dropped.
///
/// Envelopes are delivered one at a time, so a client that stops reading
/// delays everything queued behind it. That delay is at most twice
/// `write_timeout` (the write, then the close) and is paid once, since the
/// client is evicted before the next envelope goes out.
pub fn spawn_dispatcher(
    broadcaster: Broadcaster,
    shutdown: CancellationToken,
) -> (EventQueue, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel();

    let handle = tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = rx.recv() => next,
            };
            match next {
                Some(Dispatch::Envelope {
                    workspace_id,
                    envelope,
                }) => {
                    broadcaster.broadcast(workspace_id, &envelope).await;
                }
                Some(Dispatch::Flush(done)) => {
                    let _ = done.send(());
                }
                None => break,
            }
        }
        debug!("Event dispatcher stopped");
    });

    (EventQueue { tx }, handle)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use teamserver_protocol::{ChatEvent, EventCategory, payload};

    use super::*;
    use crate::registry::testing::{ChannelTransport, FailingTransport, StalledTransport};
    use crate::registry::{ClientBinding, ClientTransport};

    fn bound(transport: Box<dyn ClientTransport>, workspace_id: i64) -> Arc<ConnectedClient> {
        let client = Arc::new(ConnectedClient::new(transport, None));
        client.promote(ClientBinding {
            user_id: 1,
            username: "op".into(),
            session_id: "s".into(),
            workspace_id,
            workspace: "default".into(),
            client_version: None,
        });
        client
    }

    fn message(text: &str) -> Envelope {
        Envelope::new(
            EventCategory::Chat,
            ChatEvent::NewMessage,
            payload! { "User" => "op", "Message" => text },
        )
    }

    #[tokio::test]
    async fn test_one_failing_client_among_hundred() {
        let operators = Arc::new(OperatorRegistry::new());
        let broadcaster = Broadcaster::new(Arc::clone(&operators), Duration::from_secs(1));

        let mut receivers = Vec::new();
        let failing_closed = Arc::new(AtomicBool::new(false));
        let mut failing_id = String::new();
        for i in 0..100 {
            if i == 42 {
                let client = bound(
                    Box::new(FailingTransport {
                        closed: Arc::clone(&failing_closed),
                    }),
                    1,
                );
                failing_id = client.id().to_owned();
                operators.insert(client);
            } else {
                let (transport, rx, _) = ChannelTransport::new();
                operators.insert(bound(Box::new(transport), 1));
                receivers.push(rx);
            }
        }

        let report = broadcaster.broadcast(1, &message("hi")).await;
        assert_eq!(report.delivered, 99);
        assert_eq!(report.evicted, vec![failing_id.clone()]);
        assert!(!operators.contains(&failing_id));
        assert_eq!(operators.len(), 99);
        assert!(failing_closed.load(Ordering::Acquire));

        for rx in &mut receivers {
            let frame = rx.try_recv().unwrap();
            let envelope = Envelope::from_frame(&frame).unwrap();
            assert_eq!(envelope.info("Message").and_then(|v| v.as_str()), Some("hi"));
        }
    }

    #[tokio::test]
    async fn test_workspace_and_auth_scoping() {
        let operators = Arc::new(OperatorRegistry::new());
        let broadcaster = Broadcaster::new(Arc::clone(&operators), Duration::from_secs(1));

        let (t1, mut in_scope, _) = ChannelTransport::new();
        let (t2, mut other_ws, _) = ChannelTransport::new();
        let (t3, mut pending, _) = ChannelTransport::new();
        operators.insert(bound(Box::new(t1), 1));
        operators.insert(bound(Box::new(t2), 2));
        operators.insert(Arc::new(ConnectedClient::new(Box::new(t3), None)));

        let report = broadcaster.broadcast(1, &message("scoped")).await;
        assert_eq!(report.delivered, 1);
        assert!(in_scope.try_recv().is_ok());
        assert!(other_ws.try_recv().is_err());
        assert!(pending.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_slow_client_times_out() {
        let operators = Arc::new(OperatorRegistry::new());
        let broadcaster = Broadcaster::new(Arc::clone(&operators), Duration::from_millis(50));

        let slow = bound(
            Box::new(StalledTransport {
                delay: Duration::from_secs(30),
            }),
            1,
        );
        let (fast_transport, mut fast_rx, _) = ChannelTransport::new();
        operators.insert(Arc::clone(&slow));
        operators.insert(bound(Box::new(fast_transport), 1));

        let started = std::time::Instant::now();
        let report = broadcaster.broadcast(1, &message("tick")).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(report.delivered, 1);
        assert_eq!(report.evicted, vec![slow.id().to_owned()]);
        assert!(fast_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_stalled_client_delays_dispatch_once() {
        let operators = Arc::new(OperatorRegistry::new());
        let slow = bound(
            Box::new(StalledTransport {
                delay: Duration::from_secs(30),
            }),
            1,
        );
        let (transport, mut rx, _) = ChannelTransport::new();
        operators.insert(Arc::clone(&slow));
        operators.insert(bound(Box::new(transport), 1));

        let shutdown = CancellationToken::new();
        let (queue, _handle) = spawn_dispatcher(
            Broadcaster::new(Arc::clone(&operators), Duration::from_millis(100)),
            shutdown.clone(),
        );

        let started = std::time::Instant::now();
        for i in 0..20 {
            queue.publish(1, message(&i.to_string()));
        }
        queue.flush().await;

        // One timeout for the stalled write, not one per envelope.
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!operators.contains(slow.id()));
        for i in 0..20 {
            let envelope = Envelope::from_frame(&rx.try_recv().unwrap()).unwrap();
            assert_eq!(envelope.info("Message").unwrap(), &i.to_string());
        }
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_dispatcher_preserves_order() {
        let operators = Arc::new(OperatorRegistry::new());
        let (transport, mut rx, _) = ChannelTransport::new();
        operators.insert(bound(Box::new(transport), 1));

        let shutdown = CancellationToken::new();
        let (queue, handle) = spawn_dispatcher(
            Broadcaster::new(Arc::clone(&operators), Duration::from_secs(1)),
            shutdown.clone(),
        );

        for i in 0..50 {
            queue.publish(1, message(&i.to_string()));
        }
        queue.flush().await;

        for i in 0..50 {
            let envelope = Envelope::from_frame(&rx.try_recv().unwrap()).unwrap();
            assert_eq!(envelope.info("Message").unwrap(), &i.to_string());
        }

        shutdown.cancel();
        handle.await.unwrap();
        // Publishing after shutdown is dropped, not a panic.
        queue.publish(1, message("late"));
        queue.flush().await;
    }
}
