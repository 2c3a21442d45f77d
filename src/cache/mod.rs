//! In-memory response cache
//!
//! Byte-budgeted LRU map from canonical request URIs to opaque response
//! blobs, with single-flight coordination for in-progress fills: the
//! first lookup of a missing key becomes the producer, concurrent
//! lookups wait for it, and on an abandoned fill exactly one waiter is
//! promoted to the next producer.
//!
//! The cache-wide lock is held only for map and list manipulation, never
//! across I/O; waiting happens on a per-fill watch channel outside the
//! lock.

use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Default cache budget (64 MiB).
pub const DEFAULT_CAPACITY_BYTES: usize = 64 * 1024 * 1024;

/// Largest single response the cache will hold.
pub const DEFAULT_MAX_ENTRY_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FillState {
    Pending,
    Resolved,
}

struct CacheEntry {
    bytes: Bytes,
}

struct Inner {
    entries: LruCache<String, CacheEntry>,
    size_sum: usize,
    pending: HashMap<String, watch::Receiver<FillState>>,
}

/// Result of a cache lookup.
pub enum Lookup {
    /// Cached response bytes; recency updated
    Hit(Bytes),
    /// Another task is producing this key; wait and retry
    Pending(WaitHandle),
    /// Caller is now the designated producer for this key
    Miss(FillHandle),
}

/// Waiter on an in-flight fill.
pub struct WaitHandle {
    rx: watch::Receiver<FillState>,
}

impl WaitHandle {
    /// Block until the producer resolves the fill, then re-lookup.
    pub async fn wait(mut self) {
        // A closed channel means the producer is gone, which resolves the
        // wait just as well.
        let _ = self.rx.wait_for(|state| *state == FillState::Resolved).await;
    }
}

/// A producer's claim on a cache key. Must be resolved by [`complete`] or
/// [`abandon`]; dropping an unresolved handle abandons, so a cancelled
/// handler cannot strand its waiters.
///
/// [`complete`]: FillHandle::complete
/// [`abandon`]: FillHandle::abandon
pub struct FillHandle {
    key: String,
    cache: Arc<ResponseCache>,
    tx: watch::Sender<FillState>,
    resolved: bool,
}

impl FillHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Insert the response and wake waiters.
    pub fn complete(mut self, bytes: Bytes) {
        self.cache.insert(&self.key, bytes);
        self.finish();
    }

    /// Give up the fill without inserting; waiters retry and one becomes
    /// the next producer.
    pub fn abandon(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if self.resolved {
            return;
        }
        self.resolved = true;
        self.cache.clear_pending(&self.key);
        let _ = self.tx.send(FillState::Resolved);
    }
}

impl Drop for FillHandle {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Byte-budgeted LRU response cache with single-flight fills.
pub struct ResponseCache {
    inner: Mutex<Inner>,
    capacity_bytes: usize,
    max_entry_bytes: usize,
}

impl ResponseCache {
    pub fn new(capacity_bytes: usize, max_entry_bytes: usize) -> Arc<Self> {
        Arc::new(ResponseCache {
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                size_sum: 0,
                pending: HashMap::new(),
            }),
            capacity_bytes,
            max_entry_bytes: max_entry_bytes.min(capacity_bytes),
        })
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(DEFAULT_CAPACITY_BYTES, DEFAULT_MAX_ENTRY_BYTES)
    }

    pub fn max_entry_bytes(&self) -> usize {
        self.max_entry_bytes
    }

    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }

    /// Look up a key. A hit updates recency; a miss claims the key for
    /// this caller; a key with an in-flight fill returns a waiter.
    pub fn lookup(self: &Arc<Self>, key: &str) -> Lookup {
        let mut inner = self.inner.lock();

        if let Some(entry) = inner.entries.get(key) {
            return Lookup::Hit(entry.bytes.clone());
        }

        if let Some(rx) = inner.pending.get(key) {
            return Lookup::Pending(WaitHandle { rx: rx.clone() });
        }

        let (tx, rx) = watch::channel(FillState::Pending);
        inner.pending.insert(key.to_string(), rx);
        Lookup::Miss(FillHandle {
            key: key.to_string(),
            cache: Arc::clone(self),
            tx,
            resolved: false,
        })
    }

    /// Recency bump without copying the entry out.
    pub fn touch(&self, key: &str) {
        let mut inner = self.inner.lock();
        let _ = inner.entries.get(key);
    }

    pub fn entry_count(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn size_bytes(&self) -> usize {
        self.inner.lock().size_sum
    }

    fn insert(&self, key: &str, bytes: Bytes) {
        let size = bytes.len();
        if size > self.max_entry_bytes || size > self.capacity_bytes {
            debug!("cache entry for {} too large ({} bytes), skipped", key, size);
            return;
        }

        let mut inner = self.inner.lock();

        if let Some(old) = inner.entries.pop(key) {
            inner.size_sum -= old.bytes.len();
        }

        while inner.size_sum + size > self.capacity_bytes {
            match inner.entries.pop_lru() {
                Some((evicted, entry)) => {
                    inner.size_sum -= entry.bytes.len();
                    debug!("cache evicted {} ({} bytes)", evicted, entry.bytes.len());
                }
                None => break,
            }
        }

        inner.size_sum += size;
        inner.entries.put(key.to_string(), CacheEntry { bytes });
    }

    fn clear_pending(&self, key: &str) {
        self.inner.lock().pending.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(len: usize) -> Bytes {
        Bytes::from(vec![b'x'; len])
    }

    fn fill(cache: &Arc<ResponseCache>, key: &str, len: usize) {
        match cache.lookup(key) {
            Lookup::Miss(handle) => handle.complete(blob(len)),
            _ => panic!("expected miss for {}", key),
        }
    }

    #[test]
    fn test_hit_after_complete() {
        let cache = ResponseCache::new(1024, 1024);
        fill(&cache, "http://h:80/x", 10);

        match cache.lookup("http://h:80/x") {
            Lookup::Hit(bytes) => assert_eq!(bytes.len(), 10),
            _ => panic!("expected hit"),
        }
        assert_eq!(cache.entry_count(), 1);
        assert_eq!(cache.size_bytes(), 10);
    }

    #[test]
    fn test_byte_budget_invariant() {
        let cache = ResponseCache::new(100, 100);
        for i in 0..20 {
            fill(&cache, &format!("k{}", i), 30);
            assert!(cache.size_bytes() <= 100);
        }
        // 100 / 30 leaves room for three entries.
        assert_eq!(cache.entry_count(), 3);
    }

    #[test]
    fn test_lru_eviction_order() {
        let cache = ResponseCache::new(100, 100);
        fill(&cache, "a", 40);
        fill(&cache, "b", 40);

        // Touch "a" so "b" is now least recently used.
        cache.touch("a");
        fill(&cache, "c", 40);

        assert!(matches!(cache.lookup("a"), Lookup::Hit(_)));
        assert!(matches!(cache.lookup("c"), Lookup::Hit(_)));
        match cache.lookup("b") {
            Lookup::Miss(handle) => handle.abandon(),
            _ => panic!("expected b evicted"),
        }
    }

    #[test]
    fn test_oversized_entry_never_inserted() {
        let cache = ResponseCache::new(1024, 64);
        match cache.lookup("big") {
            Lookup::Miss(handle) => handle.complete(blob(65)),
            _ => panic!("expected miss"),
        }
        assert_eq!(cache.entry_count(), 0);
        assert!(matches!(cache.lookup("big"), Lookup::Miss(_)));
    }

    #[test]
    fn test_abandon_leaves_no_entry() {
        let cache = ResponseCache::new(1024, 1024);
        match cache.lookup("k") {
            Lookup::Miss(handle) => handle.abandon(),
            _ => panic!("expected miss"),
        }
        assert!(matches!(cache.lookup("k"), Lookup::Miss(_)));
        assert_eq!(cache.size_bytes(), 0);
    }

    #[tokio::test]
    async fn test_single_flight_waiters_observe_completion() {
        let cache = ResponseCache::new(1024, 1024);

        let producer = match cache.lookup("k") {
            Lookup::Miss(handle) => handle,
            _ => panic!("expected miss"),
        };

        // Concurrent lookups all receive Pending while the fill is open.
        let mut waiters = Vec::new();
        for _ in 0..4 {
            match cache.lookup("k") {
                Lookup::Pending(w) => waiters.push(w),
                _ => panic!("expected pending"),
            }
        }

        let tasks: Vec<_> = waiters
            .into_iter()
            .map(|w| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move {
                    w.wait().await;
                    matches!(cache.lookup("k"), Lookup::Hit(_))
                })
            })
            .collect();

        producer.complete(blob(8));

        for task in tasks {
            assert!(task.await.unwrap(), "waiter should observe hit");
        }
    }

    #[tokio::test]
    async fn test_abandoned_fill_promotes_one_waiter() {
        let cache = ResponseCache::new(1024, 1024);

        let producer = match cache.lookup("k") {
            Lookup::Miss(handle) => handle,
            _ => panic!("expected miss"),
        };
        let waiter = match cache.lookup("k") {
            Lookup::Pending(w) => w,
            _ => panic!("expected pending"),
        };

        producer.abandon();
        waiter.wait().await;

        // The waiter retries and becomes the next (serial) producer;
        // further lookups wait on it.
        let next = cache.lookup("k");
        assert!(matches!(next, Lookup::Miss(_)));
        assert!(matches!(cache.lookup("k"), Lookup::Pending(_)));
    }

    #[tokio::test]
    async fn test_dropped_handle_abandons() {
        let cache = ResponseCache::new(1024, 1024);

        let producer = match cache.lookup("k") {
            Lookup::Miss(handle) => handle,
            _ => panic!("expected miss"),
        };
        let waiter = match cache.lookup("k") {
            Lookup::Pending(w) => w,
            _ => panic!("expected pending"),
        };

        drop(producer);
        waiter.wait().await;
        assert!(matches!(cache.lookup("k"), Lookup::Miss(_)));
    }

    #[test]
    fn test_reinsert_replaces_size() {
        let cache = ResponseCache::new(100, 100);
        fill(&cache, "k", 60);
        cache.insert("k", blob(80));
        assert_eq!(cache.size_bytes(), 80);
        assert_eq!(cache.entry_count(), 1);
    }
}
