//! The Rule collaborator: externally supplied hooks invoked at well-defined
//! points in request/response processing. The core depends only on this
//! trait, never on a concrete policy implementation.

use rama::http::{Request, Response};
use std::net::SocketAddr;

/// A borrowed view of an in-flight request/response exchange, passed to
/// Rule hooks. Hooks must not retain it past the callback.
pub struct ExchangeCtx<'a> {
    pub client_addr: SocketAddr,
    pub is_https: bool,
    pub hostname: Option<&'a str>,
}

/// Decision returned by [`Rule::before_deal_https_request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterceptDecision {
    pub intercept: bool,
}

/// Hooks an embedding application may supply to observe or rewrite traffic.
///
/// Every method has a default no-op/pass-through implementation, so a
/// caller can override only the hooks it cares about. All hooks are async
/// so they may suspend arbitrarily; the dispatcher must not let a slow hook
/// stall unrelated connections.
pub trait Rule: Send + Sync {
    /// Label used for logging; defaults to a fixed string.
    fn summary(&self) -> String {
        "default rule".to_owned()
    }

    /// May rewrite method/URL/headers/body before the upstream request is sent.
    fn before_send_request(
        &self,
        _ctx: &ExchangeCtx<'_>,
        req: Request,
    ) -> impl Future<Output = Request> + Send {
        async move { req }
    }

    /// May rewrite the response before it is streamed to the client.
    fn before_send_response(
        &self,
        _ctx: &ExchangeCtx<'_>,
        resp: Response,
    ) -> impl Future<Output = Response> + Send {
        async move { resp }
    }

    /// Decides whether a CONNECT target should be intercepted (MITM'd) or
    /// tunneled opaquely. Ignored entirely when the proxy is configured with
    /// `forceProxyHttps = true`.
    fn before_deal_https_request(
        &self,
        _host: &str,
        _port: u16,
    ) -> impl Future<Output = InterceptDecision> + Send {
        async move { InterceptDecision { intercept: false } }
    }

    /// Synthesizes a response on upstream failure; returning `None` leaves
    /// the dispatcher's default status-code mapping in place.
    fn on_error(
        &self,
        _ctx: &ExchangeCtx<'_>,
        _err: &crate::error::ProxyError,
    ) -> impl Future<Output = Option<Response>> + Send {
        async move { None }
    }

    /// Observability hook for a failed CONNECT/tunnel attempt.
    fn on_connect_error(&self, _host: &str, _port: u16, _err: &crate::error::ProxyError) {}
}

/// The pass-through rule: never intercepts, never rewrites, logs nothing.
/// Used when no Rule collaborator is supplied.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRule;

impl Rule for NoopRule {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_rule_never_intercepts() {
        let rule = NoopRule;
        let decision = rule.before_deal_https_request("upstream.invalid", 443).await;
        assert!(!decision.intercept);
    }

    #[test]
    fn noop_rule_has_a_summary() {
        assert_eq!(NoopRule.summary(), "default rule");
    }
}
