//! The CONNECT/upgrade/plain-HTTP state machine.
//!
//! Three entry points are wired onto the outer proxy port: [`on_request`]
//! for every parsed HTTP request (plain proxying and requests re-entering
//! from a MITM listener alike), and the CONNECT/WebSocket upgrade pair
//! registered via [`rama`]'s [`UpgradeLayer`].

use crate::cert_cache::CertCache;
use crate::error::ProxyError;
use crate::mitm::MitmServerPool;
use crate::recorder::{Recorder, RequestRecord};
use crate::registry::SocketRegistry;
use crate::rule::{ExchangeCtx, Rule};
use rama::Context;
use rama::Layer;
use rama::error::{BoxError, OpaqueError};
use rama::http::client::EasyHttpWebClient;
use rama::http::dep::http_body_util::BodyExt as _;
use rama::http::layer::upgrade::Upgraded;
use rama::http::{Body, HeaderValue, IntoResponse, Request, Response, StatusCode, header};
use rama::net::stream::SocketInfo;
use rama::service::Service;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::io::{copy_bidirectional, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{info, warn};

/// Shared, cloneable state threaded through the outer proxy port's
/// [`Context`].
#[derive(Clone)]
pub struct ProxyState {
    pub local_hosts: Arc<Vec<String>>,
    pub force_proxy_https: bool,
    pub cert_cache: Arc<CertCache>,
    pub mitm_pool: Arc<MitmServerPool>,
    pub registry: Arc<SocketRegistry>,
    pub rule: Arc<dyn Rule>,
    pub recorder: Arc<dyn Recorder>,
    pub request_ids: Arc<AtomicU64>,
}

impl ProxyState {
    fn next_request_id(&self) -> u64 {
        self.request_ids.fetch_add(1, Ordering::Relaxed)
    }
}

pub type Ctx = Context<ProxyState>;

/// Marker injected into a freshly built [`Context`] when a request is
/// re-entering `on_request` from a MITM listener's decrypted stream: the
/// request line carries an origin-form path (`GET /x`), so `isHttps` and
/// the hostname cannot be recovered from the request itself and must be
/// supplied by whoever terminated the TLS connection.
#[derive(Clone)]
pub struct MitmOrigin {
    pub hostname: String,
}

/// Registers every accepted client socket into the [`SocketRegistry`] for
/// the duration of the connection, removing it once the inner service
/// returns (normally or on error).
#[derive(Debug, Clone, Default)]
pub struct ClientRegistryLayer;

#[derive(Debug, Clone)]
pub struct ClientRegistryService<S>(S);

impl<S> Layer<S> for ClientRegistryLayer {
    type Service = ClientRegistryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ClientRegistryService(inner)
    }
}

impl<S> Service<ProxyState, TcpStream> for ClientRegistryService<S>
where
    S: Service<ProxyState, TcpStream, Error: Into<BoxError>>,
{
    type Response = S::Response;
    type Error = BoxError;

    async fn serve(
        &self,
        ctx: Ctx,
        stream: TcpStream,
    ) -> Result<Self::Response, Self::Error> {
        let registry = Arc::clone(&ctx.state().registry);
        let peer_addr = ctx
            .get::<SocketInfo>()
            .map(|info| *info.peer_addr())
            .ok_or_else(|| OpaqueError::from_display("no socket info found").into_boxed())?;
        let conn = registry.register_client(peer_addr);
        let result = self.0.serve(ctx, stream).await.map_err(Into::into);
        registry.remove_client(conn.id);
        result
    }
}

/// Carries the CONNECT decision from `connect_accept` to `connect_proxy`
/// through the request [`Context`]'s extensions.
#[derive(Clone)]
struct ConnectTarget {
    host: String,
    port: u16,
    intercept: bool,
}

/// Splits a `host:port` authority, defaulting the port when absent.
///
/// Bracketed IPv6 literals (`[::1]:443`) are recognized; a bare IPv6
/// literal without brackets is ambiguous with `host:port` and is treated
/// as a parse error, matching how CONNECT targets are written in practice.
pub fn parse_host_port(authority: &str, default_port: u16) -> Result<(String, u16), ProxyError> {
    let authority = authority.trim();
    if authority.is_empty() {
        return Err(ProxyError::ProtocolViolation("empty authority".to_owned()));
    }

    if let Some(rest) = authority.strip_prefix('[') {
        let Some(end) = rest.find(']') else {
            return Err(ProxyError::ProtocolViolation(format!(
                "unterminated IPv6 literal in {authority}"
            )));
        };
        let host = format!("[{}]", &rest[..end]);
        let tail = &rest[end + 1..];
        let port = match tail.strip_prefix(':') {
            Some(port_str) => port_str
                .parse()
                .map_err(|_| ProxyError::ProtocolViolation(format!("bad port in {authority}")))?,
            None if tail.is_empty() => default_port,
            None => {
                return Err(ProxyError::ProtocolViolation(format!(
                    "unexpected trailer in {authority}"
                )))
            }
        };
        return Ok((host, port));
    }

    match authority.rsplit_once(':') {
        Some((host, port_str)) if !host.is_empty() => {
            let port = port_str
                .parse()
                .map_err(|_| ProxyError::ProtocolViolation(format!("bad port in {authority}")))?;
            Ok((host.to_owned(), port))
        }
        _ => Ok((authority.to_owned(), default_port)),
    }
}

/// Normalizes a `(host, port)` pair into the canonical `host:port` string
/// used to compare against `localHosts`, scheme-aware per the redesign
/// note: IP-literal hosts are not special-cased to a fixed port, the
/// scheme's default port is used like any other host.
#[must_use]
pub fn normalize_authority(host: &str, port: Option<u16>, is_https: bool) -> String {
    let default_port = if is_https { 443 } else { 80 };
    format!("{}:{}", host, port.unwrap_or(default_port))
}

/// True if `host:port` (already normalized) names one of the proxy's own
/// listening addresses.
#[must_use]
pub fn matches_local_hosts(normalized: &str, local_hosts: &[String]) -> bool {
    local_hosts.iter().any(|candidate| candidate == normalized)
}

/// Resolves the forward target for a plain-HTTP proxy request: absolute-URI
/// authority takes precedence over the `Host` header; if both are absent,
/// the request is malformed.
///
/// When `mitm_origin` is set (the request is re-entering from a MITM
/// listener's decrypted stream), the hostname and `isHttps = true` it
/// carries override whatever the origin-form request line would otherwise
/// resolve to; only the port is still read from the request/Host header,
/// defaulting to 443.
pub fn resolve_forward_target(
    req: &Request,
    mitm_origin: Option<&MitmOrigin>,
) -> Result<(String, u16, bool), ProxyError> {
    if let Some(origin) = mitm_origin {
        let port = req
            .uri()
            .authority()
            .and_then(|authority| parse_host_port(authority.as_str(), 443).ok())
            .or_else(|| {
                req.headers()
                    .get(header::HOST)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| parse_host_port(value, 443).ok())
            })
            .map_or(443, |(_, port)| port);
        return Ok((origin.hostname.clone(), port, true));
    }

    let is_https = req.uri().scheme_str() == Some("https");
    if let Some(authority) = req.uri().authority() {
        let (host, port) = parse_host_port(authority.as_str(), if is_https { 443 } else { 80 })?;
        return Ok((host, port, is_https));
    }

    let host_header = req
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok());
    match host_header {
        Some(value) => {
            let (host, port) = parse_host_port(value, 80)?;
            Ok((host, port, is_https))
        }
        None => Err(ProxyError::ProtocolViolation(
            "no absolute-URI authority and no Host header".to_owned(),
        )),
    }
}

/// `onRequest`: fires for every parsed HTTP request on the outer proxy
/// port, both plain and re-entering from a MITM listener.
///
/// A request re-entering from a MITM listener carries a [`MitmOrigin`] in
/// the context, injected by the listener's accept handler: it overrides
/// the resolved hostname and forces `isHttps = true`, since the origin-form
/// request line the MITM socket sees (`GET /x`) carries neither.
pub async fn on_request(ctx: Ctx, req: Request) -> Result<Response, Infallible> {
    let state = ctx.state().clone();
    let mitm_origin = ctx.get::<MitmOrigin>().cloned();

    let (host, port, is_https) = match resolve_forward_target(&req, mitm_origin.as_ref()) {
        Ok(target) => target,
        Err(err) => return Ok(protocol_error_response(&err)),
    };
    let normalized = normalize_authority(&host, Some(port), is_https);

    if matches_local_hosts(&normalized, &state.local_hosts) {
        return Ok(local_hosts_response());
    }

    let client_addr = ctx
        .get::<SocketInfo>()
        .map(|info| *info.peer_addr())
        .unwrap_or_else(|| ([0, 0, 0, 0], 0).into());
    let exchange_ctx = ExchangeCtx {
        client_addr,
        is_https,
        hostname: Some(host.as_str()),
    };

    let req = state.rule.before_send_request(&exchange_ctx, req).await;

    let request_id = state.next_request_id();
    let record = RequestRecord {
        id: request_id,
        method: req.method().to_string(),
        url: format!(
            "{}://{}{}",
            if is_https { "https" } else { "http" },
            normalized,
            req.uri().path()
        ),
        status: None,
        is_https,
        started_at: OffsetDateTime::now_utc(),
    };
    state.recorder.emit_update(&record);

    let client = EasyHttpWebClient::default();
    match client.serve(ctx.clone(), req).await {
        Ok(resp) => {
            let resp = state.rule.before_send_response(&exchange_ctx, resp).await;
            Ok(record_response(&state, request_id, record, resp).await)
        }
        Err(err) => {
            let proxy_err = ProxyError::UpstreamConnectFailed(Box::new(std::io::Error::other(
                err.to_string(),
            )));
            if let Some(resp) = state.rule.on_error(&exchange_ctx, &proxy_err).await {
                return Ok(resp);
            }
            Ok(error_response(&proxy_err))
        }
    }
}

fn local_hosts_response() -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .body(Body::from("anyproxy"))
        .unwrap_or_else(|_| StatusCode::OK.into_response())
}

/// Emits the completed [`RequestRecord`] (now with a status) and the
/// response body to the [`Recorder`], then hands the response back with its
/// body intact. The body is buffered once to hand a complete chunk to
/// `emit_update_body`; for a core with no real backend this is simpler than
/// tee-ing a live stream and costs nothing a null recorder will ever notice.
async fn record_response(
    state: &ProxyState,
    request_id: u64,
    mut record: RequestRecord,
    resp: Response,
) -> Response {
    record.status = Some(resp.status().as_u16());
    state.recorder.emit_update(&record);

    let (parts, body) = resp.into_parts();
    let body_bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => Default::default(),
    };
    state.recorder.emit_update_body(request_id, &body_bytes);
    Response::from_parts(parts, Body::from(body_bytes))
}

fn protocol_error_response(err: &ProxyError) -> Response {
    Response::builder()
        .status(StatusCode::BAD_REQUEST)
        .body(Body::from(err.to_string()))
        .unwrap_or_else(|_| StatusCode::BAD_REQUEST.into_response())
}

fn error_response(err: &ProxyError) -> Response {
    let status = err.status_code().unwrap_or(StatusCode::BAD_GATEWAY);
    Response::builder()
        .status(status)
        .body(Body::from(err.to_string()))
        .unwrap_or_else(|_| status.into_response())
}

/// `onConnect` accept half: parses the target, applies the loop-block and
/// intercept-decision tie-breaks, and replies `200 Connection Established`.
pub async fn connect_accept(
    mut ctx: Ctx,
    req: Request,
) -> Result<(Response, Ctx, Request), Response> {
    let authority = req.uri().to_string();
    let (host, port) = match parse_host_port(&authority, 443) {
        Ok(target) => target,
        Err(err) => {
            warn!(%err, "malformed CONNECT target");
            return Err(StatusCode::BAD_REQUEST.into_response());
        }
    };

    let state = ctx.state().clone();
    let normalized = normalize_authority(&host, Some(port), true);
    if matches_local_hosts(&normalized, &state.local_hosts) {
        warn!(%host, port, "blocked CONNECT loop to the proxy itself");
        return Err(StatusCode::BAD_REQUEST.into_response());
    }

    let intercept = if state.force_proxy_https {
        warn!("forceProxyHttps is set; ignoring any beforeDealHttpsRequest hook");
        true
    } else {
        state.rule.before_deal_https_request(&host, port).await.intercept
    };

    info!(%host, port, intercept, "accepted CONNECT");
    ctx.insert(ConnectTarget { host, port, intercept });

    Ok((StatusCode::OK.into_response(), ctx, req))
}

/// `onConnect` proxy half: either tunnels the raw bytes to the upstream
/// unmodified, or splices the client into the per-hostname MITM listener.
pub async fn connect_proxy(ctx: Ctx, mut upgraded: Upgraded) -> Result<(), Infallible> {
    let state = ctx.state().clone();
    let Some(target) = ctx.get::<ConnectTarget>().cloned() else {
        warn!("connect_proxy invoked without a recorded target; dropping connection");
        return Ok(());
    };

    if target.intercept {
        let addr = match state.mitm_pool.get_listener(&target.host).await {
            Ok(addr) => addr,
            Err(err) => {
                warn!(host = %target.host, %err, "failed to obtain mitm listener");
                let _ = upgraded.shutdown().await;
                return Ok(());
            }
        };
        splice_into(&mut upgraded, addr).await;
        state.mitm_pool.release(&target.host);
    } else {
        let upstream = state.registry.register_upstream(&target.host, target.port, false);
        match TcpStream::connect((target.host.as_str(), target.port)).await {
            Ok(mut stream) => {
                let _ = copy_bidirectional(&mut upgraded, &mut stream).await;
            }
            Err(err) => {
                warn!(host = %target.host, port = target.port, %err, "tunnel connect failed");
                let _ = upgraded.shutdown().await;
            }
        }
        state.registry.remove_upstream(upstream.id);
    }

    Ok(())
}

async fn splice_into(upgraded: &mut Upgraded, mitm_addr: SocketAddr) {
    match TcpStream::connect(mitm_addr).await {
        Ok(mut stream) => {
            let _ = copy_bidirectional(upgraded, &mut stream).await;
        }
        Err(err) => {
            warn!(%mitm_addr, %err, "failed to dial local mitm listener");
            let _ = upgraded.shutdown().await;
        }
    }
}

/// WebSocket upgrade matcher: a `GET` request carrying `Upgrade: websocket`.
#[must_use]
pub fn is_websocket_upgrade(req: &Request) -> bool {
    req.headers()
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("websocket"))
}

/// `onUpgrade` accept half: validates the target resolves like a normal
/// plain-HTTP proxy request would.
pub async fn ws_accept(mut ctx: Ctx, req: Request) -> Result<(Response, Ctx, Request), Response> {
    let mitm_origin = ctx.get::<MitmOrigin>().cloned();
    let (host, port, is_https) = match resolve_forward_target(&req, mitm_origin.as_ref()) {
        Ok(target) => target,
        Err(err) => return Err(protocol_error_response(&err)),
    };
    ctx.insert(ConnectTarget {
        host,
        port,
        intercept: is_https,
    });

    let mut resp = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .body(Body::empty())
        .unwrap_or_else(|_| StatusCode::SWITCHING_PROTOCOLS.into_response());
    resp.headers_mut()
        .insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    resp.headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
    Ok((resp, ctx, req))
}

/// `onUpgrade` proxy half: bridges raw bytes between the client and a
/// freshly dialed upstream socket once the WebSocket handshake completed.
///
/// Frame-level rewriting via the Rule's WebSocket hooks is not performed;
/// only the raw byte stream is bridged bidirectionally.
pub async fn ws_proxy(ctx: Ctx, mut upgraded: Upgraded) -> Result<(), Infallible> {
    let Some(target) = ctx.get::<ConnectTarget>().cloned() else {
        return Ok(());
    };

    match TcpStream::connect((target.host.as_str(), target.port)).await {
        Ok(mut stream) => {
            let _ = copy_bidirectional(&mut upgraded, &mut stream).await;
        }
        Err(err) => {
            warn!(host = %target.host, port = target.port, %err, "websocket upstream connect failed");
            let _ = upgraded.shutdown().await;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_host_port_splits_explicit_port() {
        assert_eq!(
            parse_host_port("upstream.invalid:8443", 443).unwrap(),
            ("upstream.invalid".to_owned(), 8443)
        );
    }

    #[test]
    fn parse_host_port_defaults_when_absent() {
        assert_eq!(
            parse_host_port("upstream.invalid", 443).unwrap(),
            ("upstream.invalid".to_owned(), 443)
        );
    }

    #[test]
    fn parse_host_port_handles_ipv6_literal() {
        assert_eq!(
            parse_host_port("[::1]:8080", 80).unwrap(),
            ("[::1]".to_owned(), 8080)
        );
        assert_eq!(
            parse_host_port("[::1]", 80).unwrap(),
            ("[::1]".to_owned(), 80)
        );
    }

    #[test]
    fn parse_host_port_rejects_empty() {
        assert!(parse_host_port("", 80).is_err());
    }

    #[test]
    fn normalize_authority_uses_scheme_default_port() {
        assert_eq!(
            normalize_authority("proxy.local", None, true),
            "proxy.local:443"
        );
        assert_eq!(
            normalize_authority("proxy.local", None, false),
            "proxy.local:80"
        );
    }

    #[test]
    fn normalize_authority_does_not_special_case_ip_literals() {
        // Redesign note: IP literals get the scheme's default port like any
        // other host, not a hardcoded :80 regardless of scheme.
        assert_eq!(normalize_authority("127.0.0.1", None, true), "127.0.0.1:443");
    }

    #[test]
    fn matches_local_hosts_is_exact() {
        let hosts = vec!["127.0.0.1:8001".to_owned(), "proxy.local:8001".to_owned()];
        assert!(matches_local_hosts("127.0.0.1:8001", &hosts));
        assert!(!matches_local_hosts("127.0.0.1:8002", &hosts));
    }

    #[test]
    fn resolve_forward_target_prefers_absolute_uri() {
        let req = Request::builder()
            .uri("http://example.invalid:8080/path")
            .header(header::HOST, "other.invalid")
            .body(Body::empty())
            .unwrap();
        let (host, port, is_https) = resolve_forward_target(&req, None).unwrap();
        assert_eq!(host, "example.invalid");
        assert_eq!(port, 8080);
        assert!(!is_https);
    }

    #[test]
    fn resolve_forward_target_falls_back_to_host_header() {
        let req = Request::builder()
            .uri("/path")
            .header(header::HOST, "example.invalid:9090")
            .body(Body::empty())
            .unwrap();
        let (host, port, _) = resolve_forward_target(&req, None).unwrap();
        assert_eq!(host, "example.invalid");
        assert_eq!(port, 9090);
    }

    #[test]
    fn resolve_forward_target_errors_without_either() {
        let req = Request::builder().uri("/path").body(Body::empty()).unwrap();
        assert!(resolve_forward_target(&req, None).is_err());
    }

    #[test]
    fn resolve_forward_target_honors_mitm_origin_override() {
        let req = Request::builder().uri("/path").body(Body::empty()).unwrap();
        let origin = MitmOrigin {
            hostname: "upstream.invalid".to_owned(),
        };
        let (host, port, is_https) = resolve_forward_target(&req, Some(&origin)).unwrap();
        assert_eq!(host, "upstream.invalid");
        assert_eq!(port, 443);
        assert!(is_https, "mitm re-entry is always treated as https");
    }

    #[test]
    fn is_websocket_upgrade_detects_header() {
        let req = Request::builder()
            .header(header::UPGRADE, "websocket")
            .body(Body::empty())
            .unwrap();
        assert!(is_websocket_upgrade(&req));

        let plain = Request::builder().body(Body::empty()).unwrap();
        assert!(!is_websocket_upgrade(&plain));
    }
}
