// ledger-gateway-rs/src/cache.rs
//
// Short-TTL read cache for evaluate results with single-flight coalescing.
//
// One in-flight upstream call per key: concurrent callers for the same
// (function, args) await a shared OnceCell, so N arrivals inside the TTL
// window cost exactly one round trip. The namespace is the cache instance,
// which the gateway scopes per channel.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::OnceCell;

use crate::LedgerError;

#[derive(Clone)]
struct Entry {
    cell: Arc<OnceCell<Vec<u8>>>,
    created: Instant,
}

pub struct EvaluateCache {
    ttl: Duration,
    entries: DashMap<String, Entry>,
}

impl EvaluateCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    pub fn cache_key(function: &str, args: &[String]) -> String {
        let mut key = String::from(function);
        for arg in args {
            key.push('\u{1f}');
            key.push_str(arg);
        }
        key
    }

    /// Look up `key`, or run `fetch` exactly once for all concurrent callers.
    ///
    /// Failed fetches are not cached: the OnceCell stays empty, so the next
    /// caller retries upstream.
    pub async fn get_or_fetch<F, Fut>(&self, key: String, fetch: F) -> Result<Vec<u8>, LedgerError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Vec<u8>, LedgerError>>,
    {
        // Take the cell out of the map guard before awaiting on it.
        let cell = {
            let mut entry = self.entries.entry(key).or_insert_with(|| Entry {
                cell: Arc::new(OnceCell::new()),
                created: Instant::now(),
            });
            if entry.created.elapsed() > self.ttl && entry.cell.initialized() {
                *entry = Entry {
                    cell: Arc::new(OnceCell::new()),
                    created: Instant::now(),
                };
            }
            Arc::clone(&entry.cell)
        };
        cell.get_or_try_init(|| fetch()).await.cloned()
    }

    /// Drop entries whose key contains `fragment`. Used on access-change
    /// events so revocation is visible without waiting out the TTL.
    pub fn invalidate_containing(&self, fragment: &str) {
        self.entries.retain(|key, _| !key.contains(fragment));
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn concurrent_callers_share_one_fetch() {
        let cache = Arc::new(EvaluateCache::new(Duration::from_secs(1)));
        let upstream = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let cache = Arc::clone(&cache);
            let upstream = Arc::clone(&upstream);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch("GetContractInfo".to_string(), || async move {
                        upstream.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(b"info".to_vec())
                    })
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), b"info");
        }
        assert_eq!(upstream.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_entry_refetches() {
        let cache = EvaluateCache::new(Duration::from_millis(10));
        let upstream = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let upstream = Arc::clone(&upstream);
            cache
                .get_or_fetch("k".to_string(), || async move {
                    upstream.fetch_add(1, Ordering::SeqCst);
                    Ok(b"v".to_vec())
                })
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert_eq!(upstream.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_fetch_is_not_cached() {
        let cache = EvaluateCache::new(Duration::from_secs(1));
        let upstream = Arc::new(AtomicUsize::new(0));

        let u = Arc::clone(&upstream);
        let first: Result<Vec<u8>, _> = cache
            .get_or_fetch("k".to_string(), || async move {
                u.fetch_add(1, Ordering::SeqCst);
                Err(LedgerError::ChaincodeError("boom".into()))
            })
            .await;
        assert!(first.is_err());

        let u = Arc::clone(&upstream);
        let second = cache
            .get_or_fetch("k".to_string(), || async move {
                u.fetch_add(1, Ordering::SeqCst);
                Ok(b"ok".to_vec())
            })
            .await
            .unwrap();
        assert_eq!(second, b"ok");
        assert_eq!(upstream.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalidation_by_fragment() {
        let cache = EvaluateCache::new(Duration::from_secs(10));
        for key in ["CheckAccess\u{1f}r1\u{1f}u1", "CheckAccess\u{1f}r2\u{1f}u1"] {
            cache
                .get_or_fetch(key.to_string(), || async { Ok(b"true".to_vec()) })
                .await
                .unwrap();
        }
        assert_eq!(cache.len(), 2);
        cache.invalidate_containing("r1");
        assert_eq!(cache.len(), 1);
    }
}
