//! Leaf cache with LRU eviction and single-flight issuance coalescing
//! (spec.md §3 "Leaf cache", §4.1 steps 2-4, §5 "Shared resources").

use std::collections::HashMap;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::RwLock;
use tokio::sync::{Mutex as AsyncMutex, OnceCell};

use crate::ca::leaf::CachedLeaf;
use crate::error::ProxyError;

const DEFAULT_CAPACITY: usize = 2048;

type PendingResult = Result<Arc<CachedLeaf>, Arc<ProxyError>>;
type Pending = Arc<OnceCell<PendingResult>>;

/// An LRU-bounded leaf cache keyed by normalized hostname, with a
/// single-flight coordinator ensuring at-most-one concurrent build per key
/// (spec.md P2).
pub struct LeafCache {
    entries: RwLock<LruCache<String, Arc<CachedLeaf>>>,
    pending: AsyncMutex<HashMap<String, Pending>>,
}

impl LeafCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = std::num::NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            entries: RwLock::new(LruCache::new(capacity)),
            pending: AsyncMutex::new(HashMap::new()),
        }
    }

    pub fn default_capacity() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }

    /// Returns the cached leaf for `key`, or runs `build` exactly once
    /// across all concurrent callers sharing `key` and publishes the
    /// result. Failures are never cached (spec.md §4.1 "Failure semantics").
    pub async fn get_or_issue<F>(&self, key: &str, build: F) -> Result<Arc<CachedLeaf>, ProxyError>
    where
        F: FnOnce() -> Result<CachedLeaf, ProxyError>,
    {
        if let Some(hit) = self.entries.write().get(key).cloned() {
            return Ok(hit);
        }

        let cell = {
            let mut pending = self.pending.lock().await;
            pending.entry(key.to_string()).or_insert_with(|| Arc::new(OnceCell::new())).clone()
        };

        let result = cell
            .get_or_init(|| async {
                match build() {
                    Ok(leaf) => Ok(Arc::new(leaf)),
                    Err(e) => Err(Arc::new(e)),
                }
            })
            .await
            .clone();

        // The winner (and only the winner, since this runs unconditionally
        // but is idempotent) removes the pending entry once the build has
        // settled, so a future cache miss on the same key starts a fresh
        // single-flight round rather than reusing a resolved OnceCell.
        {
            let mut pending = self.pending.lock().await;
            if let Some(existing) = pending.get(key) {
                if Arc::ptr_eq(existing, &cell) {
                    pending.remove(key);
                }
            }
        }

        match result {
            Ok(leaf) => {
                self.entries.write().put(key.to_string(), leaf.clone());
                Ok(leaf)
            }
            Err(e) => Err(ProxyError::CertIssuanceFailed(e.to_string())),
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fake_leaf() -> CachedLeaf {
        CachedLeaf {
            chain: vec![],
            key_der: Arc::new(rustls_pki_types::PrivatePkcs8KeyDer::from(vec![0u8; 1])),
        }
    }

    #[tokio::test]
    async fn second_call_returns_same_object() {
        let cache = LeafCache::default_capacity();
        let first = cache.get_or_issue("example.org", || Ok(fake_leaf())).await.unwrap();
        let second = cache.get_or_issue("example.org", || panic!("should not rebuild")).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn concurrent_callers_single_flight() {
        let cache = Arc::new(LeafCache::default_capacity());
        let build_count = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let cache = cache.clone();
            let build_count = build_count.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_issue("concurrent.test", || {
                        build_count.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(std::time::Duration::from_millis(5));
                        Ok(fake_leaf())
                    })
                    .await
                    .unwrap()
            }));
        }

        let mut results = Vec::new();
        for h in handles {
            results.push(h.await.unwrap());
        }

        assert_eq!(build_count.load(Ordering::SeqCst), 1);
        for r in &results[1..] {
            assert!(Arc::ptr_eq(&results[0], r));
        }
    }

    #[tokio::test]
    async fn failed_build_is_not_cached() {
        let cache = LeafCache::default_capacity();
        let first = cache
            .get_or_issue("broken.test", || Err(ProxyError::CertIssuanceFailed("boom".into())))
            .await;
        assert!(first.is_err());
        assert_eq!(cache.len(), 0);

        let second = cache.get_or_issue("broken.test", || Ok(fake_leaf())).await;
        assert!(second.is_ok());
    }
}
