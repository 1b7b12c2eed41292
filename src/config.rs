//! Proxy configuration and the startup validation rules.

use crate::error::ProxyError;
use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

/// Whether the outer proxy listener speaks plain HTTP or terminates TLS itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    Http,
    Https,
}

/// Subject fields used when minting the root CA, per §4.1.
#[derive(Debug, Clone)]
pub struct CaSubject {
    pub common_name: String,
    pub country: String,
    pub organization: String,
    pub state: String,
    pub organizational_unit: String,
}

impl Default for CaSubject {
    fn default() -> Self {
        Self {
            common_name: "AnyProxy".to_owned(),
            country: "US".to_owned(),
            organization: "AnyProxy".to_owned(),
            state: "CA".to_owned(),
            organizational_unit: "AnyProxy".to_owned(),
        }
    }
}

/// Static configuration for one proxy instance.
///
/// Validated once by [`ProxyConfig::validate`] before the proxy lifecycle
/// is allowed to start.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address the outer proxy listener binds to.
    pub bind: SocketAddr,
    /// Whether the outer listener is plain HTTP or HTTPS.
    pub kind: ListenerKind,
    /// Required when `kind == Https`: the hostname the proxy's own
    /// leaf certificate is issued for.
    pub hostname: Option<String>,
    /// Base directory the root CA key/cert are persisted under.
    pub ca_dir: PathBuf,
    /// Subject fields used when minting the root CA.
    pub ca_subject: CaSubject,
    /// Addresses/hostnames considered "the proxy itself" for loop detection
    /// and for routing to the embedded local application handler.
    pub local_hosts: Vec<String>,
    /// When set, every CONNECT is intercepted and `beforeDealHttpsRequest`
    /// is never consulted (logged as a configuration conflict, not an error).
    pub force_proxy_https: bool,
    /// Idle timeout before an unused MITM listener is torn down.
    pub mitm_idle_timeout: Duration,
    /// Idle timeout before an unused upstream keep-alive connection is torn down.
    pub upstream_idle_timeout: Duration,
    /// Whether a recorder collaborator is required to be non-null.
    pub recorder_required: bool,
}

impl ProxyConfig {
    /// Default base directory for persisted CA material: `$HOME/.anyproxy/certificates`.
    #[must_use]
    pub fn default_ca_dir() -> PathBuf {
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);
        home.join(".anyproxy").join("certificates")
    }

    /// Runs the fatal-at-start validation rules from §4.7.
    pub fn validate(&self, recorder_present: bool) -> Result<(), ProxyError> {
        if self.bind.port() == 0 {
            return Err(ProxyError::ConfigInvalid(
                "port is required and must be > 0".to_owned(),
            ));
        }

        if self.kind == ListenerKind::Https && self.hostname.is_none() {
            return Err(ProxyError::ConfigInvalid(
                "type=https requires a hostname".to_owned(),
            ));
        }

        if self.force_proxy_https && !ca_files_exist(&self.ca_dir) {
            return Err(ProxyError::ConfigInvalid(
                "forceProxyHttps=true requires an existing root CA".to_owned(),
            ));
        }

        if self.recorder_required && !recorder_present {
            return Err(ProxyError::ConfigInvalid(
                "a recorder collaborator must be supplied, or explicitly permitted as null"
                    .to_owned(),
            ));
        }

        Ok(())
    }
}

fn ca_files_exist(dir: &Path) -> bool {
    dir.join("rootCA.key").is_file() && dir.join("rootCA.crt").is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> ProxyConfig {
        ProxyConfig {
            bind: "127.0.0.1:8080".parse().unwrap(),
            kind: ListenerKind::Http,
            hostname: None,
            ca_dir: std::env::temp_dir().join("anyproxy-test-missing-ca"),
            ca_subject: CaSubject::default(),
            local_hosts: vec!["127.0.0.1".to_owned()],
            force_proxy_https: false,
            mitm_idle_timeout: Duration::from_secs(60),
            upstream_idle_timeout: Duration::from_secs(120),
            recorder_required: false,
        }
    }

    #[test]
    fn rejects_zero_port() {
        let mut cfg = base_config();
        cfg.bind = "127.0.0.1:0".parse().unwrap();
        assert!(matches!(
            cfg.validate(true),
            Err(ProxyError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn https_without_hostname_is_fatal() {
        let mut cfg = base_config();
        cfg.kind = ListenerKind::Https;
        assert!(matches!(
            cfg.validate(true),
            Err(ProxyError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn force_https_without_ca_is_fatal() {
        let mut cfg = base_config();
        cfg.force_proxy_https = true;
        assert!(matches!(
            cfg.validate(true),
            Err(ProxyError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn missing_recorder_is_fatal_when_required() {
        let mut cfg = base_config();
        cfg.recorder_required = true;
        assert!(matches!(
            cfg.validate(false),
            Err(ProxyError::ConfigInvalid(_))
        ));
        assert!(cfg.validate(true).is_ok());
    }

    #[test]
    fn valid_http_config_passes() {
        let cfg = base_config();
        assert!(cfg.validate(true).is_ok());
    }
}
