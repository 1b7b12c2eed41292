//! Proxy startup/shutdown sequencing and the `INIT -> READY -> CLOSED`
//! state machine.

use crate::ca::CaStore;
use crate::cert_cache::CertCache;
use crate::config::{ListenerKind, ProxyConfig};
use crate::dispatcher::{self, ClientRegistryLayer, MitmOrigin, ProxyState};
use crate::error::ProxyError;
use crate::mitm::MitmServerPool;
use crate::recorder::{NullRecorder, Recorder};
use crate::registry::SocketRegistry;
use crate::rule::{NoopRule, Rule};
use rama::Context;
use rama::http::layer::upgrade::UpgradeLayer;
use rama::http::matcher::{HeaderMatcher, MethodMatcher};
use rama::http::server::HttpServer;
use rama::http::{header, HeaderValue};
use rama::layer::ConsumeErrLayer;
use rama::rt::Executor;
use rama::service::service_fn;
use rama::tcp::server::TcpListener as RamaTcpListener;
use rama::Layer;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

/// `INIT -> READY -> CLOSED`, enforced strictly: `start` is only legal from
/// `INIT`, `close` only from `READY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyStatus {
    Init,
    Ready,
    Closed,
}

impl From<u8> for ProxyStatus {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Init,
            1 => Self::Ready,
            _ => Self::Closed,
        }
    }
}

/// Owns the Socket Registry, MITM Pool, and Cert Cache, and drives the
/// proxy through its lifecycle. Never panics on a startup/shutdown error:
/// failures are returned, not thrown.
pub struct ProxyLifecycle {
    config: ProxyConfig,
    rule: Arc<dyn Rule>,
    recorder: Arc<dyn Recorder>,
    status: AtomicU8,
    registry: Arc<SocketRegistry>,
    cert_cache: Option<Arc<CertCache>>,
    mitm_pool: Option<Arc<MitmServerPool>>,
}

impl ProxyLifecycle {
    #[must_use]
    pub fn new(config: ProxyConfig) -> Self {
        Self::with_collaborators(config, Arc::new(NoopRule), Arc::new(NullRecorder))
    }

    #[must_use]
    pub fn with_collaborators(
        config: ProxyConfig,
        rule: Arc<dyn Rule>,
        recorder: Arc<dyn Recorder>,
    ) -> Self {
        Self {
            config,
            rule,
            recorder,
            status: AtomicU8::new(ProxyStatus::Init as u8),
            registry: Arc::new(SocketRegistry::new()),
            cert_cache: None,
            mitm_pool: None,
        }
    }

    #[must_use]
    pub fn status(&self) -> ProxyStatus {
        ProxyStatus::from(self.status.load(Ordering::SeqCst))
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<SocketRegistry> {
        &self.registry
    }

    /// Validates configuration, acquires the root CA and proxy's own
    /// leaf (when `type=https`), binds the outer server, and transitions
    /// to `READY`. Legal only from `INIT`.
    pub async fn start(&mut self, shutdown: &rama::graceful::Shutdown) -> Result<(), ProxyError> {
        if self.status() != ProxyStatus::Init {
            return Err(ProxyError::ConfigInvalid(
                "start is only legal from INIT".to_owned(),
            ));
        }

        self.config.validate(true)?;

        let ca_store = CaStore::new(&self.config.ca_dir);
        if self.config.force_proxy_https && !ca_store.exists() {
            return Err(ProxyError::CaUnavailable(
                "forceProxyHttps requires an existing root CA".to_owned(),
            ));
        }

        let root = if ca_store.exists() {
            ca_store.load()?
        } else {
            ca_store.generate(&self.config.ca_subject, false)?
        };
        let cert_cache = Arc::new(CertCache::new(Arc::new(root)));

        if matches!(self.config.kind, ListenerKind::Https) {
            let hostname = self.config.hostname.as_deref().ok_or_else(|| {
                ProxyError::ConfigInvalid("type=https requires hostname".to_owned())
            })?;
            cert_cache.get(hostname)?;
        }

        // The MITM pool's accept handler re-enters `on_request`, which needs
        // the same `ProxyState` the outer listener uses. The pool is built
        // before that state exists (the state embeds the pool), so the
        // handler closes over this cell and the state is published into it
        // right after construction.
        let mitm_state_cell: Arc<std::sync::OnceLock<ProxyState>> = Arc::new(std::sync::OnceLock::new());

        let mitm_pool = Arc::new(MitmServerPool::new(
            Arc::clone(&cert_cache),
            self.config.mitm_idle_timeout,
            Arc::new({
                let mitm_state_cell = Arc::clone(&mitm_state_cell);
                move |tls_stream, hostname: String| {
                    let mitm_state_cell = Arc::clone(&mitm_state_cell);
                    Box::pin(async move {
                        let Some(state) = mitm_state_cell.get() else {
                            warn!(%hostname, "mitm listener accepted before state was published");
                            return;
                        };
                        let service =
                            HttpServer::auto(Executor::new()).service(service_fn(dispatcher::on_request));
                        let mut ctx = Context::with_state(state.clone());
                        // §4.4: hand the decrypted stream back as if it were a
                        // plain-HTTP connection, except isHttps/hostname are
                        // injected since the origin-form request line carries
                        // neither.
                        ctx.insert(MitmOrigin { hostname: hostname.clone() });
                        if let Err(err) = rama::Service::serve(&service, ctx, tls_stream).await {
                            warn!(%hostname, %err, "mitm connection handling failed");
                        }
                    })
                }
            }),
        ));

        let local_hosts: Vec<String> = std::iter::once(format!(
            "{}:{}",
            self.config.bind.ip(),
            self.config.bind.port()
        ))
        .chain(self.config.local_hosts.iter().cloned())
        .collect();

        let state = ProxyState {
            local_hosts: Arc::new(local_hosts),
            force_proxy_https: self.config.force_proxy_https,
            cert_cache: Arc::clone(&cert_cache),
            mitm_pool: Arc::clone(&mitm_pool),
            registry: Arc::clone(&self.registry),
            rule: Arc::clone(&self.rule),
            recorder: Arc::clone(&self.recorder),
            request_ids: Arc::new(AtomicU64::new(0)),
        };
        let _ = mitm_state_cell.set(state.clone());

        let bind_addr = self.config.bind;

        let tcp_service = match RamaTcpListener::build_with_state(state)
            .bind(bind_addr)
            .await
        {
            Ok(service) => service,
            Err(err) => {
                error!(%err, %bind_addr, "failed to bind proxy port");
                return Err(ProxyError::CaUnavailable(format!("bind {bind_addr}: {err}")));
            }
        };

        shutdown.spawn_task_fn({
            let mitm_pool = Arc::clone(&mitm_pool);
            let mitm_idle_timeout = self.config.mitm_idle_timeout;
            async move |guard| {
                // §3: idle MITM listeners are destroyed on a timer, not just
                // when the proxy closes.
                let sweep_guard = guard.clone();
                let sweep_pool = Arc::clone(&mitm_pool);
                guard.spawn_task(async move {
                    let mut ticker = tokio::time::interval(mitm_idle_timeout);
                    ticker.tick().await;
                    loop {
                        tokio::select! {
                            _ = sweep_guard.cancelled() => break,
                            _ = ticker.tick() => sweep_pool.sweep_idle(),
                        }
                    }
                });

                let exec = Executor::graceful(guard.clone());
                let http_service = HttpServer::auto(exec).service(
                    (
                        UpgradeLayer::new(
                            MethodMatcher::CONNECT,
                            service_fn(dispatcher::connect_accept),
                            service_fn(dispatcher::connect_proxy),
                        ),
                        UpgradeLayer::new(
                            MethodMatcher::GET.and(HeaderMatcher::contains(
                                header::UPGRADE,
                                HeaderValue::from_static("websocket"),
                            )),
                            service_fn(dispatcher::ws_accept),
                            service_fn(dispatcher::ws_proxy),
                        ),
                    )
                        .into_layer(service_fn(dispatcher::on_request)),
                );
                let http_service = ClientRegistryLayer.layer(http_service);
                let http_service = (ConsumeErrLayer::default(),).into_layer(http_service);
                tcp_service.serve_graceful(guard, http_service).await;
            }
        });

        self.cert_cache = Some(cert_cache);
        self.mitm_pool = Some(mitm_pool);
        self.status.store(ProxyStatus::Ready as u8, Ordering::SeqCst);
        info!(%bind_addr, "proxy ready");
        Ok(())
    }

    /// Tears down all tracked connections and the MITM pool, then
    /// transitions to `CLOSED`. Legal only from `READY`; never panics.
    pub fn close(&mut self) -> Result<(), ProxyError> {
        if self.status() != ProxyStatus::Ready {
            return Err(ProxyError::ConfigInvalid(
                "close is only legal from READY".to_owned(),
            ));
        }

        self.registry.destroy_all_upstreams();
        if let Some(pool) = &self.mitm_pool {
            pool.shutdown_all();
        }
        self.registry.destroy_all_clients();

        self.status.store(ProxyStatus::Closed as u8, Ordering::SeqCst);
        info!("proxy closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CaSubject;
    use std::net::SocketAddr;
    use std::time::Duration;

    fn base_config(dir: std::path::PathBuf) -> ProxyConfig {
        ProxyConfig {
            bind: "127.0.0.1:0".parse::<SocketAddr>().unwrap(),
            kind: ListenerKind::Http,
            hostname: None,
            ca_dir: dir,
            ca_subject: CaSubject::default(),
            local_hosts: vec![],
            force_proxy_https: false,
            mitm_idle_timeout: Duration::from_secs(60),
            upstream_idle_timeout: Duration::from_secs(120),
            recorder_required: false,
        }
    }

    #[test]
    fn fresh_lifecycle_starts_in_init() {
        let dir = std::env::temp_dir().join("anyproxy-lifecycle-test-init");
        let lifecycle = ProxyLifecycle::new(base_config(dir));
        assert_eq!(lifecycle.status(), ProxyStatus::Init);
    }

    #[test]
    fn close_before_start_is_rejected() {
        let dir = std::env::temp_dir().join("anyproxy-lifecycle-test-close-early");
        let mut lifecycle = ProxyLifecycle::new(base_config(dir));
        assert!(lifecycle.close().is_err());
        assert_eq!(lifecycle.status(), ProxyStatus::Init);
    }
}
