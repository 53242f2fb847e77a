//! WebSocket transport for operator connections.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Extension,
    extract::{
        ConnectInfo, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};

use super::state::AppState;
use crate::registry::{ClientTransport, TransportError};
use crate::server::Teamserver;

/// Write half of an operator WebSocket.
pub struct WsTransport {
    sink: SplitSink<WebSocket, Message>,
}

impl WsTransport {
    pub fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl ClientTransport for WsTransport {
    async fn send(&mut self, frame: &str) -> Result<(), TransportError> {
        self.sink
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.sink
            .close()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }
}

/// WebSocket upgrade handler.
///
/// GET /ws
pub async fn ws_handler(
    State(state): State<AppState>,
    connect_info: Option<Extension<ConnectInfo<SocketAddr>>>,
    ws: WebSocketUpgrade,
) -> Response {
    let remote_addr = connect_info.map(|Extension(ConnectInfo(addr))| addr);
    debug!("WebSocket upgrade request from {:?}", remote_addr);

    let server = Arc::clone(&state.server);
    ws.on_upgrade(move |socket| handle_ws_connection(socket, server, remote_addr))
}

/// Drive one operator connection until it closes, is kicked or misbehaves.
async fn handle_ws_connection(
    socket: WebSocket,
    server: Arc<Teamserver>,
    remote_addr: Option<SocketAddr>,
) {
    let (sender, mut receiver) = socket.split();
    let client = server.accept(Box::new(WsTransport::new(sender)), remote_addr);
    let client_id = client.id().to_owned();

    while let Some(msg_result) = receiver.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                if let Err(e) = server.handle_frame(&client, text.as_str()).await {
                    if e.closes_connection() {
                        warn!("Dropping client {}: {}", client_id, e);
                        break;
                    }
                    error!("Failed to handle frame from client {}: {}", client_id, e);
                }
                // Kicked or evicted while we were handling the frame.
                if !server.operators().contains(&client_id) {
                    break;
                }
            }
            Ok(Message::Binary(_)) => {
                debug!("Received binary message from client {}, ignoring", client_id);
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                info!("Client {} closed WebSocket connection", client_id);
                break;
            }
            Err(e) => {
                warn!("WebSocket error for client {}: {}", client_id, e);
                break;
            }
        }
    }

    server.disconnect(&client).await;
    let _ = client.close().await;
}
