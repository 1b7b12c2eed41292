//! Hostname -> leaf certificate cache with single-flight issuance.

use crate::ca::RootCa;
use crate::error::ProxyError;
use crate::leaf::{LeafCert, LeafIssuer};
use moka::sync::Cache;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

/// Entries are evicted once less than this much validity remains, forcing
/// the next `get` to re-issue.
const EVICT_BEFORE_EXPIRY: Duration = Duration::from_secs(60 * 60);

/// Hostname -> [`LeafCert`] cache, guaranteeing at most one concurrent
/// issuance per hostname. Concurrent callers for the same hostname observe
/// the single in-flight issuance and all receive the same result.
///
/// Wildcard matching is never performed: the cache key is the literal
/// hostname from SNI or the CONNECT target.
pub struct CertCache {
    root: Arc<RootCa>,
    entries: Cache<String, Arc<LeafCert>>,
}

impl CertCache {
    #[must_use]
    pub fn new(root: Arc<RootCa>) -> Self {
        Self {
            root,
            // `moka`'s TTL is a blunt per-entry expiry measured from insertion;
            // we additionally check remaining validity on read so certs issued
            // with a shorter-than-825-day window still get evicted correctly.
            entries: Cache::builder()
                .time_to_live(Duration::from_secs(60 * 60 * 24 * 800))
                .build(),
        }
    }

    /// Returns the cached leaf for `hostname`, issuing one if absent or
    /// expiring soon. Concurrent callers for the same hostname block on
    /// the same issuance (moka's `try_get_with` is single-flight per key).
    pub fn get(&self, hostname: &str) -> Result<Arc<LeafCert>, ProxyError> {
        if let Some(existing) = self.entries.get(hostname)
            && !is_near_expiry(&existing)
        {
            return Ok(existing);
        }

        let root = Arc::clone(&self.root);
        let hostname_owned = hostname.to_owned();
        let result: Result<Arc<LeafCert>, Arc<ProxyError>> =
            self.entries.try_get_with(hostname_owned.clone(), move || {
                let issuer = LeafIssuer::new(&root);
                issuer.sign(&hostname_owned).map(Arc::new)
            });

        match result {
            Ok(leaf) if is_near_expiry(&leaf) => {
                // Stale entry slipped through a race with the TTL sweep; force
                // a fresh issuance rather than serve something about to expire.
                self.entries.invalidate(hostname);
                let root = Arc::clone(&self.root);
                let hostname_owned = hostname.to_owned();
                self.entries
                    .try_get_with(hostname_owned.clone(), move || {
                        let issuer = LeafIssuer::new(&root);
                        issuer.sign(&hostname_owned).map(Arc::new)
                    })
                    .map_err(unwrap_issue_error)
            }
            Ok(leaf) => Ok(leaf),
            Err(err) => {
                // failed entries must not linger: remove so the next caller retries.
                self.entries.invalidate(hostname);
                Err(unwrap_issue_error(err))
            }
        }
    }

    /// Removes a hostname's cached leaf, if any.
    pub fn invalidate(&self, hostname: &str) {
        self.entries.invalidate(hostname);
    }
}

fn unwrap_issue_error(err: Arc<ProxyError>) -> ProxyError {
    match Arc::try_unwrap(err) {
        Ok(err) => err,
        Err(shared) => ProxyError::CertIssueFailed(shared.to_string()),
    }
}

fn is_near_expiry(leaf: &LeafCert) -> bool {
    let remaining = leaf.not_after - OffsetDateTime::now_utc();
    remaining < time::Duration::seconds(EVICT_BEFORE_EXPIRY.as_secs() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::CaStore;
    use crate::config::CaSubject;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    fn new_cache() -> CertCache {
        let dir = std::env::temp_dir().join(format!(
            "anyproxy-cache-test-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        let store = CaStore::new(&dir);
        let root = store.generate(&CaSubject::default(), false).expect("generate root");
        CertCache::new(Arc::new(root))
    }

    #[test]
    fn get_issues_and_caches() {
        let cache = new_cache();
        let first = cache.get("example.invalid").expect("first get");
        let second = cache.get("example.invalid").expect("second get");
        assert!(Arc::ptr_eq(&first, &second), "second get must hit the cache");
    }

    #[test]
    fn single_flight_under_concurrency() {
        let cache = Arc::new(new_cache());
        const N: usize = 16;
        let barrier = Arc::new(Barrier::new(N));
        let mut handles = Vec::with_capacity(N);

        for _ in 0..N {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            handles.push(std::thread::spawn(move || {
                barrier.wait();
                cache.get("concurrent.invalid").expect("concurrent get")
            }));
        }

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let first = &results[0];
        for leaf in &results {
            assert!(Arc::ptr_eq(first, leaf), "all callers must see the same LeafCert");
        }
    }

    #[test]
    fn different_hostnames_are_independent() {
        let cache = new_cache();
        let a = cache.get("a.invalid").expect("get a");
        let b = cache.get("b.invalid").expect("get b");
        assert_ne!(a.hostname, b.hostname);
    }

    #[test]
    fn invalidate_forces_reissue() {
        let cache = new_cache();
        let first = cache.get("rotate.invalid").expect("first get");
        cache.invalidate("rotate.invalid");
        let second = cache.get("rotate.invalid").expect("second get");
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn rejects_invalid_hostname_and_does_not_poison_cache() {
        let cache = new_cache();
        assert!(cache.get("").is_err());
        // a later valid call must still succeed
        assert!(cache.get("valid.invalid").is_ok());
    }

    #[allow(dead_code)]
    fn silence_unused(_: &AtomicUsize) {}
}
