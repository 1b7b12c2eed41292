//! Ephemeral, per-hostname local TLS listeners used to terminate
//! intercepted CONNECT tunnels.

use crate::cert_cache::CertCache;
use crate::error::ProxyError;
use rustls::ServerConfig;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

/// Minimum idle duration before a listener is eligible for teardown, per
/// the ≥60s recommendation.
pub const MIN_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

type ConnHandler =
    Arc<dyn Fn(TlsStream<TcpStream>, String) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// A live local TLS listener dedicated to one hostname.
struct MitmListener {
    addr: SocketAddr,
    ref_count: AtomicUsize,
    idle_since: Mutex<Option<Instant>>,
    shutdown: Arc<Notify>,
}

impl MitmListener {
    fn touch_busy(&self) {
        self.ref_count.fetch_add(1, Ordering::SeqCst);
        *self.idle_since.lock().expect("idle_since mutex poisoned") = None;
    }

    fn release(&self) {
        let remaining = self.ref_count.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 {
            *self.idle_since.lock().expect("idle_since mutex poisoned") = Some(Instant::now());
        }
    }

    fn idle_for(&self) -> Option<Duration> {
        self.idle_since
            .lock()
            .expect("idle_since mutex poisoned")
            .map(|since| since.elapsed())
    }
}

/// Spins up and tracks one ephemeral TLS listener per hostname, each
/// presenting the leaf minted by the [`CertCache`] for that hostname.
///
/// One listener per hostname (rather than a single SNI-dispatching
/// listener) trades file descriptors for a simpler accept loop; both
/// satisfy the ≤1-live-listener-per-hostname invariant.
pub struct MitmServerPool {
    cert_cache: Arc<CertCache>,
    handler: ConnHandler,
    idle_timeout: Duration,
    listeners: Mutex<HashMap<String, Arc<MitmListener>>>,
}

impl MitmServerPool {
    #[must_use]
    pub fn new(cert_cache: Arc<CertCache>, idle_timeout: Duration, handler: ConnHandler) -> Self {
        Self {
            cert_cache,
            handler,
            idle_timeout,
            listeners: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the address of a listener ready to accept a TLS handshake
    /// presenting the leaf for `hostname`, spinning one up if absent.
    pub async fn get_listener(&self, hostname: &str) -> Result<SocketAddr, ProxyError> {
        if let Some(existing) = self
            .listeners
            .lock()
            .expect("listeners mutex poisoned")
            .get(hostname)
            .cloned()
        {
            existing.touch_busy();
            return Ok(existing.addr);
        }

        let leaf = self.cert_cache.get(hostname)?;
        let server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(leaf.chain.clone(), leaf.key_der.clone_key())
            .map_err(|err| {
                ProxyError::CertIssueFailed(format!("build tls config for {hostname}: {err}"))
            })?;
        let acceptor = TlsAcceptor::from(Arc::new(server_config));

        let tcp_listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|err| ProxyError::CaUnavailable(format!("bind mitm listener: {err}")))?;
        let addr = tcp_listener
            .local_addr()
            .map_err(|err| ProxyError::CaUnavailable(format!("mitm listener addr: {err}")))?;

        let listener = Arc::new(MitmListener {
            addr,
            ref_count: AtomicUsize::new(1),
            idle_since: Mutex::new(None),
            shutdown: Arc::new(Notify::new()),
        });

        self.listeners
            .lock()
            .expect("listeners mutex poisoned")
            .insert(hostname.to_owned(), Arc::clone(&listener));

        let shutdown = Arc::clone(&listener.shutdown);
        let handler = Arc::clone(&self.handler);
        let hostname_owned = hostname.to_owned();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown.notified() => break,
                    accepted = tcp_listener.accept() => {
                        let Ok((stream, _peer)) = accepted else { break };
                        let acceptor = acceptor.clone();
                        let handler = Arc::clone(&handler);
                        let hostname = hostname_owned.clone();
                        tokio::spawn(async move {
                            match acceptor.accept(stream).await {
                                Ok(tls_stream) => handler(tls_stream, hostname).await,
                                Err(err) => warn!(%hostname, %err, "mitm tls handshake failed"),
                            }
                        });
                    }
                }
            }
            debug!(hostname = %hostname_owned, "mitm listener accept loop stopped");
        });

        Ok(addr)
    }

    /// Marks the listener for `hostname` as no longer in active use by one
    /// caller. Idle-only listeners become eligible for the sweep.
    pub fn release(&self, hostname: &str) {
        if let Some(listener) = self.listeners.lock().expect("listeners mutex poisoned").get(hostname) {
            listener.release();
        }
    }

    /// Tears down listeners that have been idle past the configured
    /// timeout. Intended to run periodically from a background task.
    pub fn sweep_idle(&self) {
        let mut listeners = self.listeners.lock().expect("listeners mutex poisoned");
        listeners.retain(|hostname, listener| {
            let expired = listener
                .idle_for()
                .is_some_and(|idle| idle >= self.idle_timeout);
            if expired {
                listener.shutdown.notify_waiters();
                debug!(%hostname, "tore down idle mitm listener");
            }
            !expired
        });
    }

    /// Tears down every listener unconditionally. Called on proxy close.
    pub fn shutdown_all(&self) {
        let mut listeners = self.listeners.lock().expect("listeners mutex poisoned");
        for listener in listeners.values() {
            listener.shutdown.notify_waiters();
        }
        listeners.clear();
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().expect("listeners mutex poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::CaStore;
    use crate::config::CaSubject;

    fn cache() -> Arc<CertCache> {
        let dir = std::env::temp_dir().join(format!(
            "anyproxy-mitm-test-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        let store = CaStore::new(&dir);
        let root = store.generate(&CaSubject::default(), false).expect("generate root");
        Arc::new(CertCache::new(Arc::new(root)))
    }

    fn noop_handler() -> ConnHandler {
        Arc::new(|_stream, _hostname| Box::pin(async {}))
    }

    #[tokio::test]
    async fn get_listener_reuses_existing_entry() {
        let pool = MitmServerPool::new(cache(), Duration::from_secs(60), noop_handler());
        let first = pool.get_listener("upstream.invalid").await.expect("first listener");
        let second = pool.get_listener("upstream.invalid").await.expect("second listener");
        assert_eq!(first, second);
        assert_eq!(pool.listener_count(), 1);
    }

    #[tokio::test]
    async fn distinct_hostnames_get_distinct_listeners() {
        let pool = MitmServerPool::new(cache(), Duration::from_secs(60), noop_handler());
        let a = pool.get_listener("a.invalid").await.expect("listener a");
        let b = pool.get_listener("b.invalid").await.expect("listener b");
        assert_ne!(a, b);
        assert_eq!(pool.listener_count(), 2);
    }

    #[tokio::test]
    async fn shutdown_all_clears_pool() {
        let pool = MitmServerPool::new(cache(), Duration::from_secs(60), noop_handler());
        pool.get_listener("upstream.invalid").await.expect("listener");
        pool.shutdown_all();
        assert_eq!(pool.listener_count(), 0);
    }

    #[tokio::test]
    async fn sweep_idle_leaves_busy_listeners_alone() {
        let pool = MitmServerPool::new(cache(), Duration::from_secs(60), noop_handler());
        pool.get_listener("upstream.invalid").await.expect("listener");
        pool.sweep_idle();
        assert_eq!(pool.listener_count(), 1, "ref_count starts at 1, never idle until release");
    }

    #[tokio::test]
    async fn released_listener_becomes_idle_and_is_swept() {
        let pool = MitmServerPool::new(cache(), Duration::from_millis(1), noop_handler());
        pool.get_listener("upstream.invalid").await.expect("listener");
        pool.release("upstream.invalid");
        tokio::time::sleep(Duration::from_millis(5)).await;
        pool.sweep_idle();
        assert_eq!(pool.listener_count(), 0);
    }
}
