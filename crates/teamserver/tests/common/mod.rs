//! Test utilities and common setup.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use teamserver::Teamserver;
use teamserver::api::{AppState, create_router};
use teamserver::auth::BcryptHasher;
use teamserver::config::{AppConfig, OperatorConfig};
use teamserver::db::Database;
use teamserver::ports::LogWebhook;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

fn operator(username: &str, password: &str, workspace: &str, role: &str) -> OperatorConfig {
    OperatorConfig {
        username: username.to_string(),
        password: Some(password.to_string()),
        roles: BTreeMap::from([(workspace.to_string(), vec![role.to_string()])]),
        ..Default::default()
    }
}

/// Config with three operators in `default` and one in `red`.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.workspaces = vec!["default".to_string(), "red".to_string()];
    config.sessions.sweep_interval_secs = 0;
    config.broadcast.write_timeout_ms = 1_000;
    config.operators = vec![
        operator("alice", "alicepassword", "default", "admin"),
        operator("bob", "bobpassword", "default", "operator"),
        operator("carol", "carolpassword", "default", "observer"),
        operator("dave", "davepassword", "red", "admin"),
    ];
    config
}

pub async fn test_server(shutdown: CancellationToken) -> Arc<Teamserver> {
    let db = Database::in_memory().await.expect("in-memory database");
    Teamserver::start(
        db,
        &test_config(),
        Arc::new(BcryptHasher::new(4)),
        Arc::new(LogWebhook),
        shutdown,
    )
    .await
    .expect("start teamserver")
}

/// Router for request-level tests.
pub async fn test_app() -> Router {
    create_router(AppState::new(test_server(CancellationToken::new()).await))
}

/// A server listening on an ephemeral port.
pub struct RunningServer {
    pub addr: SocketAddr,
    pub server: Arc<Teamserver>,
    pub shutdown: CancellationToken,
}

impl RunningServer {
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub async fn spawn_server() -> RunningServer {
    let shutdown = CancellationToken::new();
    let server = test_server(shutdown.clone()).await;
    let app = create_router(AppState::new(Arc::clone(&server)));

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let stop = shutdown.clone();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { stop.cancelled().await })
        .await
        .expect("serve");
    });

    RunningServer {
        addr,
        server,
        shutdown,
    }
}
