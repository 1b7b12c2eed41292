//! OS trust-store lookup for the root CA certificate.

use std::path::Path;

/// Whether the root CA certificate is trusted by the OS, per §4.1.
///
/// Windows has no reliable non-interactive query, so it always reports
/// [`Trust::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trust {
    Trusted,
    NotTrusted,
    Unknown,
}

#[cfg(target_os = "macos")]
pub fn is_trusted(dir: &Path) -> Trust {
    use sha1::{Digest, Sha1};

    let cert_path = dir.join("rootCA.crt");
    let Ok(der) = std::fs::read(&cert_path) else {
        return Trust::NotTrusted;
    };
    let der = match rustls_pemfile::certs(&mut der.as_slice()).next() {
        Some(Ok(cert)) => cert.to_vec(),
        _ => return Trust::NotTrusted,
    };
    let fingerprint = hex_lower(&Sha1::digest(&der));

    // `security find-certificate` lists certs in the keychain by SHA-1 hash;
    // a non-interactive, read-only query avoids linking against Security.framework.
    let output = std::process::Command::new("security")
        .args(["find-certificate", "-a", "-Z", "/Library/Keychains/System.keychain"])
        .output();

    match output {
        Ok(out) if out.status.success() => {
            let text = String::from_utf8_lossy(&out.stdout).to_ascii_lowercase();
            if text.contains(&fingerprint) {
                Trust::Trusted
            } else {
                Trust::NotTrusted
            }
        }
        Ok(_) => Trust::NotTrusted,
        Err(_) => Trust::Unknown,
    }
}

#[cfg(target_os = "macos")]
fn hex_lower(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(target_os = "linux")]
pub fn is_trusted(dir: &Path) -> Trust {
    const BUNDLE_PATHS: &[&str] = &[
        "/etc/ssl/certs/ca-certificates.crt",
        "/etc/pki/tls/certs/ca-bundle.crt",
        "/etc/ssl/ca-bundle.pem",
        "/etc/pki/tls/cacert.pem",
    ];

    let cert_path = dir.join("rootCA.crt");
    let Ok(needle) = std::fs::read_to_string(&cert_path) else {
        return Trust::NotTrusted;
    };
    let needle = needle.trim();

    for bundle in BUNDLE_PATHS {
        if let Ok(contents) = std::fs::read_to_string(bundle)
            && contents.contains(needle)
        {
            return Trust::Trusted;
        }
    }
    Trust::NotTrusted
}

#[cfg(target_os = "windows")]
pub fn is_trusted(_dir: &Path) -> Trust {
    Trust::Unknown
}

#[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
pub fn is_trusted(_dir: &Path) -> Trust {
    Trust::Unknown
}
