//! The local certificate authority: root key/cert persistence and trust lookup.

mod trust;

pub use trust::Trust;

use crate::config::CaSubject;
use crate::error::ProxyError;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};
use std::path::{Path, PathBuf};
use time::{Duration as TimeDuration, OffsetDateTime};

const KEY_FILE: &str = "rootCA.key";
const CERT_FILE: &str = "rootCA.crt";

/// The long-lived root CA: its key material, certificate, and validity window.
///
/// Created once per installation directory and immutable afterwards; see
/// [`CaStore::generate`] for the only way to (re)create it.
pub struct RootCa {
    pub certificate: Certificate,
    pub key_pair: KeyPair,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl RootCa {
    #[must_use]
    pub fn cert_pem(&self) -> String {
        self.certificate.pem()
    }
}

/// Owns the on-disk root CA for one installation directory.
pub struct CaStore {
    dir: PathBuf,
}

impl CaStore {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn root_path(&self) -> (PathBuf, PathBuf) {
        (self.dir.join(KEY_FILE), self.dir.join(CERT_FILE))
    }

    /// True iff both the root key and root certificate files are present.
    #[must_use]
    pub fn exists(&self) -> bool {
        let (key_path, cert_path) = self.root_path();
        key_path.is_file() && cert_path.is_file()
    }

    /// Loads the persisted root CA from disk.
    pub fn load(&self) -> Result<RootCa, ProxyError> {
        let (key_path, cert_path) = self.root_path();
        if !self.exists() {
            return Err(ProxyError::CaUnavailable(format!(
                "no root CA found under {}",
                self.dir.display()
            )));
        }

        let key_pem = std::fs::read_to_string(&key_path)
            .map_err(|err| ProxyError::CaUnavailable(format!("read {}: {err}", key_path.display())))?;
        let cert_pem = std::fs::read_to_string(&cert_path)
            .map_err(|err| ProxyError::CaUnavailable(format!("read {}: {err}", cert_path.display())))?;

        let key_pair = KeyPair::from_pem(&key_pem)
            .map_err(|err| ProxyError::CaUnavailable(format!("parse root key: {err}")))?;
        let params = CertificateParams::from_ca_cert_pem(&cert_pem)
            .map_err(|err| ProxyError::CaUnavailable(format!("parse root cert: {err}")))?;
        let not_before = params.not_before;
        let not_after = params.not_after;
        let certificate = params
            .self_signed(&key_pair)
            .map_err(|err| ProxyError::CaUnavailable(format!("reconstruct root cert: {err}")))?;

        Ok(RootCa {
            certificate,
            key_pair,
            not_before,
            not_after,
            cert_path,
            key_path,
        })
    }

    /// Creates a self-signed root CA under the configured directory.
    ///
    /// Fails if files already exist and `overwrite` is `false`. Generation
    /// is guarded only by this flag, not by a lock: concurrent generators
    /// racing each other is a user error, not something the core defends
    /// against.
    pub fn generate(&self, subject: &CaSubject, overwrite: bool) -> Result<RootCa, ProxyError> {
        let (key_path, cert_path) = self.root_path();
        if self.exists() && !overwrite {
            return Err(ProxyError::ConfigInvalid(format!(
                "root CA already exists under {} (pass overwrite=true to replace it)",
                self.dir.display()
            )));
        }

        std::fs::create_dir_all(&self.dir).map_err(|err| {
            ProxyError::CaUnavailable(format!("create {}: {err}", self.dir.display()))
        })?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, subject.common_name.clone());
        dn.push(DnType::CountryName, subject.country.clone());
        dn.push(DnType::OrganizationName, subject.organization.clone());
        dn.push(DnType::StateOrProvinceName, subject.state.clone());
        dn.push(
            DnType::OrganizationalUnitName,
            subject.organizational_unit.clone(),
        );

        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let now = OffsetDateTime::now_utc();
        let not_before = now.checked_sub(TimeDuration::days(1)).unwrap_or(now);
        // 10 years, comfortably over the >=10y validity requirement.
        let not_after = now
            .checked_add(TimeDuration::days(365 * 10 + 2))
            .unwrap_or(now);
        params.not_before = not_before;
        params.not_after = not_after;

        let key_pair =
            KeyPair::generate().map_err(|err| ProxyError::CaUnavailable(err.to_string()))?;
        let certificate = params
            .self_signed(&key_pair)
            .map_err(|err| ProxyError::CaUnavailable(err.to_string()))?;

        std::fs::write(&key_path, key_pair.serialize_pem())
            .map_err(|err| ProxyError::CaUnavailable(format!("write {}: {err}", key_path.display())))?;
        std::fs::write(&cert_path, certificate.pem())
            .map_err(|err| ProxyError::CaUnavailable(format!("write {}: {err}", cert_path.display())))?;

        Ok(RootCa {
            certificate,
            key_pair,
            not_before,
            not_after,
            cert_path,
            key_path,
        })
    }

    /// Tri-state trust lookup for the root CA certificate, per platform.
    pub fn is_trusted(&self, dir: &Path) -> Trust {
        trust::is_trusted(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exists_is_false_for_fresh_dir() {
        let dir = std::env::temp_dir().join(format!("anyproxy-ca-test-{}", std::process::id()));
        let store = CaStore::new(&dir);
        assert!(!store.exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn generate_then_exists_then_reject_overwrite() {
        let dir = std::env::temp_dir().join(format!(
            "anyproxy-ca-test-gen-{}-{}",
            std::process::id(),
            line!()
        ));
        let store = CaStore::new(&dir);
        let subject = CaSubject::default();

        let first = store.generate(&subject, false).expect("first generate");
        assert!(store.exists());

        let pem_before = std::fs::read_to_string(first.cert_path.clone()).unwrap();

        let err = store
            .generate(&subject, false)
            .expect_err("second generate without overwrite must fail");
        assert!(matches!(err, ProxyError::ConfigInvalid(_)));

        let pem_after = std::fs::read_to_string(&first.cert_path).unwrap();
        assert_eq!(pem_before, pem_after, "cert on disk must be byte-identical");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn generated_root_has_sane_validity_window() {
        let dir = std::env::temp_dir().join(format!(
            "anyproxy-ca-test-validity-{}-{}",
            std::process::id(),
            line!()
        ));
        let store = CaStore::new(&dir);
        let root = store.generate(&CaSubject::default(), false).expect("generate");

        let now = OffsetDateTime::now_utc();
        assert!(root.not_before <= now);
        assert!(root.not_after > now + TimeDuration::days(365 * 9));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn load_round_trips_generated_root() {
        let dir = std::env::temp_dir().join(format!(
            "anyproxy-ca-test-roundtrip-{}-{}",
            std::process::id(),
            line!()
        ));
        let store = CaStore::new(&dir);
        let generated = store.generate(&CaSubject::default(), false).expect("generate");
        let loaded = store.load().expect("load");
        assert_eq!(generated.cert_pem(), loaded.cert_pem());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
