//! Live-connection bookkeeping for graceful shutdown.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Where a [`ClientConnection`] currently is in the request lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Reading,
    Tunneling,
    Intercepting,
    UpgradedWs,
    Closed,
}

/// A tracked client socket, from accept to close.
pub struct ClientConnection {
    pub id: u64,
    pub peer_addr: SocketAddr,
    phase: Mutex<ConnectionPhase>,
    closed: Arc<Notify>,
}

impl ClientConnection {
    #[must_use]
    pub fn phase(&self) -> ConnectionPhase {
        *self.phase.lock().expect("client connection phase mutex poisoned")
    }

    pub fn set_phase(&self, phase: ConnectionPhase) {
        *self.phase.lock().expect("client connection phase mutex poisoned") = phase;
    }

    /// Marks the connection closed and wakes anything awaiting force-close.
    pub fn mark_closed(&self) {
        self.set_phase(ConnectionPhase::Closed);
        self.closed.notify_waiters();
    }

    /// Resolves once [`Self::mark_closed`] is called, or immediately if
    /// already closed.
    pub async fn wait_closed(&self) {
        if self.phase() == ConnectionPhase::Closed {
            return;
        }
        self.closed.notified().await;
    }
}

/// A tracked upstream socket, kept separate so CONNECT tunnels and
/// keep-alive HTTPS pools can be torn down independently on shutdown.
pub struct UpstreamConnection {
    pub id: u64,
    pub target_host: String,
    pub target_port: u16,
    pub keep_alive: bool,
    closed: Arc<Notify>,
}

impl UpstreamConnection {
    pub fn mark_closed(&self) {
        self.closed.notify_waiters();
    }

    pub async fn wait_closed(&self) {
        self.closed.notified().await;
    }
}

/// Tracks all live client and upstream connections so the proxy can force
/// them closed on shutdown. Keys are monotonically increasing; removal is
/// triggered by the socket's own close event, not polled.
#[derive(Default)]
pub struct SocketRegistry {
    next_id: AtomicU64,
    clients: Mutex<std::collections::HashMap<u64, Arc<ClientConnection>>>,
    upstreams: Mutex<std::collections::HashMap<u64, Arc<UpstreamConnection>>>,
}

impl SocketRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers a newly-accepted client socket, returning its tracked handle.
    pub fn register_client(&self, peer_addr: SocketAddr) -> Arc<ClientConnection> {
        let conn = Arc::new(ClientConnection {
            id: self.next_id(),
            peer_addr,
            phase: Mutex::new(ConnectionPhase::Reading),
            closed: Arc::new(Notify::new()),
        });
        self.clients
            .lock()
            .expect("client registry mutex poisoned")
            .insert(conn.id, Arc::clone(&conn));
        conn
    }

    /// Removes a client connection from the registry (does not close it;
    /// callers close the socket themselves and then call this).
    pub fn remove_client(&self, id: u64) {
        if let Some(conn) = self
            .clients
            .lock()
            .expect("client registry mutex poisoned")
            .remove(&id)
        {
            conn.mark_closed();
        }
    }

    /// Registers an upstream connection.
    pub fn register_upstream(
        &self,
        target_host: impl Into<String>,
        target_port: u16,
        keep_alive: bool,
    ) -> Arc<UpstreamConnection> {
        let conn = Arc::new(UpstreamConnection {
            id: self.next_id(),
            target_host: target_host.into(),
            target_port,
            keep_alive,
            closed: Arc::new(Notify::new()),
        });
        self.upstreams
            .lock()
            .expect("upstream registry mutex poisoned")
            .insert(conn.id, Arc::clone(&conn));
        conn
    }

    pub fn remove_upstream(&self, id: u64) {
        if let Some(conn) = self
            .upstreams
            .lock()
            .expect("upstream registry mutex poisoned")
            .remove(&id)
        {
            conn.mark_closed();
        }
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.lock().expect("client registry mutex poisoned").len()
    }

    #[must_use]
    pub fn upstream_count(&self) -> usize {
        self.upstreams
            .lock()
            .expect("upstream registry mutex poisoned")
            .len()
    }

    /// Force-destroys every tracked upstream connection. Snapshots the map
    /// before notifying so removals racing in from closing sockets cannot
    /// invalidate the iteration.
    pub fn destroy_all_upstreams(&self) {
        let snapshot: Vec<_> = self
            .upstreams
            .lock()
            .expect("upstream registry mutex poisoned")
            .values()
            .cloned()
            .collect();
        for conn in snapshot {
            conn.mark_closed();
        }
        self.upstreams
            .lock()
            .expect("upstream registry mutex poisoned")
            .clear();
    }

    /// Force-destroys every tracked client connection.
    pub fn destroy_all_clients(&self) {
        let snapshot: Vec<_> = self
            .clients
            .lock()
            .expect("client registry mutex poisoned")
            .values()
            .cloned()
            .collect();
        for conn in snapshot {
            conn.mark_closed();
        }
        self.clients
            .lock()
            .expect("client registry mutex poisoned")
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn register_and_remove_client() {
        let registry = SocketRegistry::new();
        let conn = registry.register_client(addr());
        assert_eq!(registry.client_count(), 1);
        registry.remove_client(conn.id);
        assert_eq!(registry.client_count(), 0);
        assert_eq!(conn.phase(), ConnectionPhase::Closed);
    }

    #[test]
    fn ids_are_monotonic_across_kinds() {
        let registry = SocketRegistry::new();
        let client = registry.register_client(addr());
        let upstream = registry.register_upstream("example.invalid", 443, true);
        assert!(upstream.id > client.id);
    }

    #[test]
    fn destroy_all_clears_registry_and_marks_closed() {
        let registry = SocketRegistry::new();
        let a = registry.register_client(addr());
        let b = registry.register_client(addr());
        registry.destroy_all_clients();
        assert_eq!(registry.client_count(), 0);
        assert_eq!(a.phase(), ConnectionPhase::Closed);
        assert_eq!(b.phase(), ConnectionPhase::Closed);
    }

    #[tokio::test]
    async fn wait_closed_resolves_after_mark_closed() {
        let registry = SocketRegistry::new();
        let conn = registry.register_client(addr());
        let waiter = Arc::clone(&conn);
        let handle = tokio::spawn(async move {
            waiter.wait_closed().await;
        });
        registry.remove_client(conn.id);
        handle.await.expect("wait task");
    }

    #[test]
    fn destroy_all_upstreams_snapshot_is_safe_against_concurrent_removal() {
        let registry = Arc::new(SocketRegistry::new());
        let a = registry.register_upstream("a.invalid", 80, false);
        let _b = registry.register_upstream("b.invalid", 80, false);
        // simulate a concurrent close racing the shutdown sweep
        registry.remove_upstream(a.id);
        registry.destroy_all_upstreams();
        assert_eq!(registry.upstream_count(), 0);
    }
}
