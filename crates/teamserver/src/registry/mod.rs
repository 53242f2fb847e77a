//! Registries of connected operators and agents.
//!
//! Both maps are sharded (`DashMap`), so lookups and inserts for different
//! ids never contend on one global lock. Entries are `Arc`s: callers clone
//! what they need and release the shard before doing any I/O.

mod agent;
mod client;
mod transport;

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::{debug, info};

pub use agent::{AgentCheckin, ConnectedAgent};
pub use client::{ClientBinding, ConnectedClient};
pub use transport::{ClientTransport, TransportError};

/// Operators by client id.
#[derive(Default)]
pub struct OperatorRegistry {
    clients: DashMap<String, Arc<ConnectedClient>>,
}

impl OperatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert unless a client with the same id is already present.
    pub fn insert(&self, client: Arc<ConnectedClient>) -> bool {
        match self.clients.entry(client.id().to_owned()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                debug!("Registered client {}", client.id());
                slot.insert(client);
                true
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<ConnectedClient>> {
        self.clients.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.clients.contains_key(id)
    }

    pub fn remove(&self, id: &str) -> Option<Arc<ConnectedClient>> {
        let removed = self.clients.remove(id).map(|(_, client)| client);
        if removed.is_some() {
            debug!("Unregistered client {}", id);
        }
        removed
    }

    /// Remove `client` only if the entry under its id is that same client.
    pub fn remove_client(&self, client: &Arc<ConnectedClient>) -> bool {
        self.clients
            .remove_if(client.id(), |_, current| Arc::ptr_eq(current, client))
            .is_some()
    }

    pub fn snapshot(&self) -> Vec<Arc<ConnectedClient>> {
        self.clients
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Authenticated clients scoped to a workspace.
    pub fn authenticated_in(&self, workspace_id: i64) -> Vec<Arc<ConnectedClient>> {
        self.clients
            .iter()
            .filter(|entry| entry.value().workspace_id() == Some(workspace_id))
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

/// Agents by agent id.
#[derive(Default)]
pub struct AgentRegistry {
    agents: DashMap<String, Arc<ConnectedAgent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new agent, or refresh the existing one.
    ///
    /// Returns the registered agent and whether it was newly inserted.
    pub fn register(&self, agent: ConnectedAgent) -> (Arc<ConnectedAgent>, bool) {
        match self.agents.entry(agent.id().to_owned()) {
            Entry::Occupied(existing) => {
                existing.get().touch();
                (Arc::clone(existing.get()), false)
            }
            Entry::Vacant(slot) => {
                info!(
                    "Agent {} checked in from {}",
                    agent.id(),
                    agent.checkin().hostname
                );
                let agent = Arc::new(agent);
                slot.insert(Arc::clone(&agent));
                (agent, true)
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<ConnectedAgent>> {
        self.agents.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Update last-seen. Returns false for an unknown agent.
    pub fn touch(&self, id: &str) -> bool {
        match self.agents.get(id) {
            Some(agent) => {
                agent.touch();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, id: &str) -> Option<Arc<ConnectedAgent>> {
        self.agents.remove(id).map(|(_, agent)| agent)
    }

    pub fn snapshot(&self) -> Vec<Arc<ConnectedAgent>> {
        self.agents
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn in_workspace(&self, workspace_id: i64) -> Vec<Arc<ConnectedAgent>> {
        self.agents
            .iter()
            .filter(|entry| entry.value().workspace_id() == workspace_id)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory transports standing in for sockets.

    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::{ClientTransport, TransportError};

    /// Forwards frames to a channel.
    pub struct ChannelTransport {
        tx: mpsc::UnboundedSender<String>,
        closed: Arc<AtomicBool>,
    }

    impl ChannelTransport {
        pub fn new() -> (Self, mpsc::UnboundedReceiver<String>, Arc<AtomicBool>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let closed = Arc::new(AtomicBool::new(false));
            (
                Self {
                    tx,
                    closed: Arc::clone(&closed),
                },
                rx,
                closed,
            )
        }
    }

    #[async_trait]
    impl ClientTransport for ChannelTransport {
        async fn send(&mut self, frame: &str) -> Result<(), TransportError> {
            if self.closed.load(Ordering::Acquire) {
                return Err(TransportError::Closed);
            }
            self.tx
                .send(frame.to_owned())
                .map_err(|_| TransportError::Closed)
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            self.closed.store(true, Ordering::Release);
            Ok(())
        }
    }

    /// Every write fails.
    pub struct FailingTransport {
        pub closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ClientTransport for FailingTransport {
        async fn send(&mut self, _frame: &str) -> Result<(), TransportError> {
            Err(TransportError::Io("broken pipe".into()))
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            self.closed.store(true, Ordering::Release);
            Ok(())
        }
    }

    /// Every write stalls for `delay`.
    pub struct StalledTransport {
        pub delay: Duration,
    }

    #[async_trait]
    impl ClientTransport for StalledTransport {
        async fn send(&mut self, _frame: &str) -> Result<(), TransportError> {
            tokio::time::sleep(self.delay).await;
            Ok(())
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::testing::ChannelTransport;
    use super::*;

    fn client() -> Arc<ConnectedClient> {
        let (transport, _rx, _) = ChannelTransport::new();
        Arc::new(ConnectedClient::new(Box::new(transport), None))
    }

    fn binding(workspace_id: i64) -> ClientBinding {
        ClientBinding {
            user_id: 1,
            username: "alice".into(),
            session_id: "s".into(),
            workspace_id,
            workspace: "default".into(),
            client_version: None,
        }
    }

    fn checkin(id: &str) -> AgentCheckin {
        AgentCheckin {
            agent_id: id.into(),
            hostname: "WS01".into(),
            username: "bob".into(),
            domain: None,
            internal_ip: None,
            process_name: "explorer.exe".into(),
            process_pid: 4242,
            process_arch: "x64".into(),
            os_version: "Windows 10".into(),
        }
    }

    #[test]
    fn test_insert_if_absent() {
        let registry = OperatorRegistry::new();
        let a = client();
        assert!(registry.insert(Arc::clone(&a)));
        assert!(!registry.insert(Arc::clone(&a)));
        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.get(a.id()).unwrap(), &a));
        assert!(registry.remove(a.id()).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_authenticated_in_filters_scope() {
        let registry = OperatorRegistry::new();
        let pending = client();
        let red = client();
        let blue = client();
        red.promote(binding(1));
        blue.promote(binding(2));
        for c in [&pending, &red, &blue] {
            registry.insert(Arc::clone(c));
        }

        let scoped = registry.authenticated_in(1);
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].id(), red.id());
        assert_eq!(pending.workspace_id(), None);
        assert_eq!(registry.snapshot().len(), 3);
    }

    #[test]
    fn test_remove_client_only_removes_same_instance() {
        let registry = OperatorRegistry::new();
        let a = client();
        registry.insert(Arc::clone(&a));
        assert!(registry.remove_client(&a));
        assert!(!registry.remove_client(&a));
    }

    #[tokio::test]
    async fn test_client_writes_reach_transport() {
        let (transport, mut rx, closed) = ChannelTransport::new();
        let client = ConnectedClient::new(Box::new(transport), None);
        client.send_frame("hello").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "hello");

        client.close().await.unwrap();
        assert!(closed.load(Ordering::Acquire));
        assert!(matches!(
            client.send_frame("late").await,
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn test_agent_register_and_touch() {
        let registry = AgentRegistry::new();
        let (agent, inserted) = registry.register(ConnectedAgent::new(1, checkin("a1")));
        assert!(inserted);
        let first = agent.last_seen();

        let (again, inserted) = registry.register(ConnectedAgent::new(1, checkin("a1")));
        assert!(!inserted);
        assert!(Arc::ptr_eq(&agent, &again));
        assert!(again.last_seen() >= first);

        assert!(registry.touch("a1"));
        assert!(!registry.touch("nope"));
        assert_eq!(registry.in_workspace(1).len(), 1);
        assert!(registry.in_workspace(2).is_empty());
        assert!(registry.remove("a1").is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_checkin_wire_names() {
        let value = serde_json::to_value(checkin("a1")).unwrap();
        assert_eq!(value["AgentID"], "a1");
        assert_eq!(value["ProcessPID"], 4242);
        assert_eq!(value["OSVersion"], "Windows 10");
    }
}
