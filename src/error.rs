//! Error types surfaced by the proxy core.

use rama::error::BoxError;
use std::fmt;

/// The error kinds the core can surface, per the error-handling design.
#[derive(Debug)]
pub enum ProxyError {
    /// Missing port/hostname/recorder, bad throttle, force-https without a CA.
    ConfigInvalid(String),
    /// Root CA files are missing when required.
    CaUnavailable(String),
    /// Leaf signing failed; the cache entry for the hostname is discarded.
    CertIssueFailed(String),
    /// DNS/TCP/TLS handshake error reaching the origin.
    UpstreamConnectFailed(BoxError),
    /// No bytes received from upstream within the configured timeout.
    UpstreamTimeout,
    /// The client socket died mid-request; the upstream request is cancelled.
    ClientAborted,
    /// Malformed start-line or headers on the inbound connection.
    ProtocolViolation(String),
    /// A CONNECT (or absolute-URI) target resolved back to the proxy itself.
    LocalLoopBlocked,
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfigInvalid(msg) => write!(f, "invalid configuration: {msg}"),
            Self::CaUnavailable(msg) => write!(f, "root CA unavailable: {msg}"),
            Self::CertIssueFailed(msg) => write!(f, "leaf certificate issuance failed: {msg}"),
            Self::UpstreamConnectFailed(err) => write!(f, "upstream connect failed: {err}"),
            Self::UpstreamTimeout => write!(f, "upstream timed out"),
            Self::ClientAborted => write!(f, "client aborted the request"),
            Self::ProtocolViolation(msg) => write!(f, "protocol violation: {msg}"),
            Self::LocalLoopBlocked => write!(f, "CONNECT target is the proxy itself"),
        }
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::UpstreamConnectFailed(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl ProxyError {
    /// Status code this error maps to when written back to the client,
    /// per the error-handling table. `None` means the connection is
    /// simply dropped (no response is safe to send).
    #[must_use]
    pub fn status_code(&self) -> Option<rama::http::StatusCode> {
        use rama::http::StatusCode;
        match self {
            Self::CertIssueFailed(_) => Some(StatusCode::BAD_GATEWAY),
            Self::UpstreamConnectFailed(_) => Some(StatusCode::BAD_GATEWAY),
            Self::UpstreamTimeout => Some(StatusCode::GATEWAY_TIMEOUT),
            Self::ProtocolViolation(_) => Some(StatusCode::BAD_REQUEST),
            Self::LocalLoopBlocked => Some(StatusCode::BAD_REQUEST),
            Self::ClientAborted => None,
            Self::ConfigInvalid(_) | Self::CaUnavailable(_) => None,
        }
    }
}

/// Wraps a terminal error with the process exit code a CLI host should use.
///
/// Exit-code semantics: 0 clean close, 1 startup validation failure, 2 bind failure.
#[derive(Debug)]
pub struct ErrorWithExitCode {
    code: i32,
    error: BoxError,
}

impl ErrorWithExitCode {
    #[must_use]
    pub fn new(code: i32, error: impl Into<BoxError>) -> Self {
        Self {
            code,
            error: error.into(),
        }
    }

    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.code
    }
}

impl fmt::Display for ErrorWithExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.error)
    }
}

impl std::error::Error for ErrorWithExitCode {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.error.source()
    }
}
