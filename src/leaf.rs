//! Per-hostname leaf certificate issuance, signed by the root CA.

use crate::ca::RootCa;
use crate::error::ProxyError;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, Ia5String, KeyPair,
    KeyUsagePurpose, SanType,
};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::net::IpAddr;
use std::str::FromStr;
use time::{Duration as TimeDuration, OffsetDateTime};

/// The macOS Safari cap on leaf certificate validity.
const MAX_LEAF_VALIDITY_DAYS: i64 = 825;

/// A short-lived, per-hostname server certificate minted for MITM interception.
///
/// Owned by the cert cache; its lifetime equals the cache entry's.
#[derive(Clone)]
pub struct LeafCert {
    pub hostname: String,
    pub chain: Vec<CertificateDer<'static>>,
    pub key_der: PrivateKeyDer<'static>,
    pub sans: Vec<String>,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
    pub issued_at: OffsetDateTime,
}

/// Signs leaf certificates under a root CA.
pub struct LeafIssuer<'a> {
    root: &'a RootCa,
}

impl<'a> LeafIssuer<'a> {
    #[must_use]
    pub fn new(root: &'a RootCa) -> Self {
        Self { root }
    }

    /// Signs a fresh leaf certificate for `hostname`.
    ///
    /// Rejects an empty hostname or one that fails RFC 1035 labeling rules.
    /// `SubjectAltName` always contains `DNS:hostname`, plus `IP:hostname`
    /// when the hostname parses as an IP literal.
    pub fn sign(&self, hostname: &str) -> Result<LeafCert, ProxyError> {
        validate_hostname(hostname)?;

        let mut params = CertificateParams::default();

        let ip_literal = IpAddr::from_str(hostname).ok();
        let mut sans = Vec::with_capacity(2);
        if let Some(ip) = ip_literal {
            params.subject_alt_names.push(SanType::IpAddress(ip));
            sans.push(ip.to_string());
        }
        let dns_name = Ia5String::try_from(hostname).map_err(|_| {
            ProxyError::CertIssueFailed(format!("{hostname} is not a valid DNS SAN"))
        })?;
        params.subject_alt_names.push(SanType::DnsName(dns_name));
        sans.push(hostname.to_owned());

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, hostname);
        params.distinguished_name = dn;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let now = OffsetDateTime::now_utc();
        let not_before = now.checked_sub(TimeDuration::days(1)).unwrap_or(now);
        let not_after = now
            .checked_add(TimeDuration::days(MAX_LEAF_VALIDITY_DAYS))
            .unwrap_or(now);
        params.not_before = not_before;
        params.not_after = not_after;

        let key_pair = KeyPair::generate()
            .map_err(|err| ProxyError::CertIssueFailed(format!("generate leaf key: {err}")))?;
        let certificate = params
            .signed_by(&key_pair, &self.root.certificate, &self.root.key_pair)
            .map_err(|err| ProxyError::CertIssueFailed(format!("sign leaf cert: {err}")))?;

        let chain = vec![
            certificate.der().clone(),
            self.root.certificate.der().clone(),
        ];
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

        Ok(LeafCert {
            hostname: hostname.to_owned(),
            chain,
            key_der,
            sans,
            not_before,
            not_after,
            issued_at: now,
        })
    }
}

/// Empty-string-safe RFC 1035 label check (relaxed: accepts dotted labels
/// and IP literals, rejects whitespace/control bytes and empty input).
fn validate_hostname(hostname: &str) -> Result<(), ProxyError> {
    if hostname.is_empty() {
        return Err(ProxyError::CertIssueFailed(
            "hostname must not be empty".to_owned(),
        ));
    }
    if hostname.len() > 253 {
        return Err(ProxyError::CertIssueFailed(format!(
            "{hostname} exceeds the maximum DNS name length"
        )));
    }
    if IpAddr::from_str(hostname).is_ok() {
        return Ok(());
    }
    let valid = hostname
        .split('.')
        .all(|label| is_valid_label(label));
    if valid {
        Ok(())
    } else {
        Err(ProxyError::CertIssueFailed(format!(
            "{hostname} is not a valid RFC 1035 hostname"
        )))
    }
}

fn is_valid_label(label: &str) -> bool {
    if label.is_empty() || label.len() > 63 {
        return false;
    }
    let bytes = label.as_bytes();
    let starts_ok = bytes[0].is_ascii_alphanumeric();
    let ends_ok = bytes[bytes.len() - 1].is_ascii_alphanumeric();
    let body_ok = bytes
        .iter()
        .all(|byte| byte.is_ascii_alphanumeric() || *byte == b'-' || *byte == b'_');
    starts_ok && ends_ok && body_ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CaSubject;
    use crate::ca::CaStore;
    use x509_parser::prelude::*;

    fn root() -> crate::ca::RootCa {
        let dir = std::env::temp_dir().join(format!(
            "anyproxy-leaf-test-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        let store = CaStore::new(&dir);
        store.generate(&CaSubject::default(), false).expect("generate root")
    }

    #[test]
    fn rejects_empty_hostname() {
        let root = root();
        let issuer = LeafIssuer::new(&root);
        assert!(issuer.sign("").is_err());
    }

    #[test]
    fn issues_leaf_with_expected_properties() {
        let root = root();
        let issuer = LeafIssuer::new(&root);
        let leaf = issuer.sign("upstream.invalid").expect("sign leaf");

        assert_eq!(leaf.hostname, "upstream.invalid");
        assert!(leaf.sans.iter().any(|san| san == "upstream.invalid"));

        let now = OffsetDateTime::now_utc();
        assert!(leaf.not_before <= now);
        assert!(leaf.not_after > now);
        assert!(leaf.not_after - leaf.not_before <= TimeDuration::days(MAX_LEAF_VALIDITY_DAYS + 1));

        let (_, leaf_x509) = X509Certificate::from_der(leaf.chain[0].as_ref()).expect("parse leaf der");
        let (_, root_x509) =
            X509Certificate::from_der(root.certificate.der().as_ref()).expect("parse root der");
        assert_eq!(leaf_x509.issuer(), root_x509.subject());
        assert!(leaf_x509.verify_signature(Some(root_x509.public_key())).is_ok());
    }

    #[test]
    fn accepts_ip_literal_hostname() {
        let root = root();
        let issuer = LeafIssuer::new(&root);
        let leaf = issuer.sign("127.0.0.1").expect("sign leaf for ip literal");
        assert!(leaf.sans.iter().any(|san| san == "127.0.0.1"));
    }
}
