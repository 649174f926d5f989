/// LRU session store
///
/// Maps SessionId to a shared session handle under a reader/writer lock.
/// Lookups take the read lock; only the LRU link update and structural
/// mutations (insert, evict, remove) take the write lock. A session is
/// bound to one in-flight batch at a time, so the per-handle mutex is
/// uncontended in steady state.
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::pool::SessionPool;
use super::{KvSession, ModelShape, SessionId};
use crate::config::CacheConfig;
use crate::error::{VulcanError, VulcanResult};
use crate::metrics::MetricsSink;

/// Shared handle to a stored session.
///
/// The byte size is recorded at creation so the store never needs the
/// session mutex for accounting; a long-running generation holding the
/// lock cannot stall eviction.
pub struct SessionHandle {
    bytes: usize,
    inner: Mutex<Box<dyn KvSession + Send>>,
}

impl SessionHandle {
    pub fn lock(&self) -> MutexGuard<'_, Box<dyn KvSession + Send>> {
        self.inner.lock()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

/// Point-in-time store statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub sessions: usize,
    pub total_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub budget_violations: u64,
}

struct StoreInner {
    map: HashMap<SessionId, Arc<SessionHandle>>,
    order: VecDeque<SessionId>,
    total_bytes: usize,
}

impl StoreInner {
    fn move_to_back(&mut self, id: &SessionId) {
        if let Some(idx) = self.order.iter().position(|s| s == id) {
            self.order.remove(idx);
            self.order.push_back(*id);
        }
    }
}

pub struct KvCacheStore {
    config: CacheConfig,
    pool: SessionPool,
    metrics: Arc<dyn MetricsSink>,
    inner: RwLock<StoreInner>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    budget_violations: AtomicU64,
}

impl KvCacheStore {
    pub fn new(config: CacheConfig, metrics: Arc<dyn MetricsSink>) -> VulcanResult<Self> {
        config.validate()?;
        let pool = SessionPool::new(config.pool_retain_per_shape);
        Ok(Self {
            config,
            pool,
            metrics,
            inner: RwLock::new(StoreInner {
                map: HashMap::new(),
                order: VecDeque::new(),
                total_bytes: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            budget_violations: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Look up a session, refreshing its recency on hit.
    pub fn try_get(&self, id: &SessionId) -> Option<Arc<SessionHandle>> {
        let found = self.inner.read().map.get(id).cloned();
        match found {
            Some(handle) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.inner.write().move_to_back(id);
                Some(handle)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Fetch an existing session or create one, evicting from the LRU tail
    /// until both the session-count and byte caps hold.
    ///
    /// An existing entry whose shape or capacity differs from the request is
    /// a hard error; sessions are never silently recreated.
    pub fn get_or_create(
        &self,
        id: SessionId,
        shape: ModelShape,
        max_tokens: usize,
    ) -> VulcanResult<Arc<SessionHandle>> {
        if let Some(handle) = self.try_get(&id) {
            let guard = handle.lock();
            if guard.shape() != shape || guard.max_tokens() != max_tokens {
                return Err(VulcanError::Validation(format!(
                    "session {} exists with shape {:?}/{} tokens, requested {:?}/{}",
                    id,
                    guard.shape(),
                    guard.max_tokens(),
                    shape,
                    max_tokens
                )));
            }
            drop(guard);
            return Ok(handle);
        }

        let session = self.pool.rent(shape, max_tokens, self.config.precision)?;
        let new_bytes = session.bytes();
        if new_bytes > self.config.max_bytes_total {
            return Err(VulcanError::ResourceLimit(format!(
                "session of {} bytes exceeds the store cap of {}",
                new_bytes, self.config.max_bytes_total
            )));
        }

        let mut inner = self.inner.write();
        // Lost race with a concurrent creator: use theirs
        if let Some(handle) = inner.map.get(&id).cloned() {
            inner.move_to_back(&id);
            self.pool.give_back(session);
            return Ok(handle);
        }

        while inner.map.len() >= self.config.max_sessions
            || inner.total_bytes + new_bytes > self.config.max_bytes_total
        {
            let Some(victim) = inner.order.pop_front() else {
                break;
            };
            self.evict_locked(&mut inner, &victim);
        }

        let handle = Arc::new(SessionHandle {
            bytes: new_bytes,
            inner: Mutex::new(session),
        });
        inner.map.insert(id, handle.clone());
        inner.order.push_back(id);
        inner.total_bytes += new_bytes;
        debug!(session = %id, bytes = new_bytes, "session created");
        Ok(handle)
    }

    fn evict_locked(&self, inner: &mut StoreInner, id: &SessionId) {
        let Some(handle) = inner.map.remove(id) else {
            return;
        };
        let freed = handle.bytes();
        inner.total_bytes = inner.total_bytes.saturating_sub(freed);
        self.evictions.fetch_add(1, Ordering::Relaxed);
        self.metrics.session_evicted(freed);
        debug!(session = %id, freed, "session evicted");

        // Return pooled buffers only when nothing else holds the handle;
        // an in-flight batch keeps its clone alive until it finishes.
        match Arc::try_unwrap(handle) {
            Ok(sole) => self.pool.give_back(sole.inner.into_inner()),
            Err(_) => warn!(session = %id, "evicted session still referenced"),
        }
    }

    /// Refresh recency without fetching.
    pub fn touch(&self, id: &SessionId) -> bool {
        let mut inner = self.inner.write();
        let known = inner.map.contains_key(id);
        if known {
            inner.move_to_back(id);
        }
        known
    }

    /// Remove a session, releasing its buffers to the pool.
    pub fn remove(&self, id: &SessionId) -> bool {
        let mut inner = self.inner.write();
        let Some(handle) = inner.map.remove(id) else {
            return false;
        };
        if let Some(idx) = inner.order.iter().position(|s| s == id) {
            inner.order.remove(idx);
        }
        let freed = handle.bytes();
        inner.total_bytes = inner.total_bytes.saturating_sub(freed);
        if let Ok(sole) = Arc::try_unwrap(handle) {
            self.pool.give_back(sole.inner.into_inner());
        }
        true
    }

    /// Drop every session and release all pooled buffers.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        for (_, handle) in inner.map.drain() {
            if let Ok(sole) = Arc::try_unwrap(handle) {
                self.pool.give_back(sole.inner.into_inner());
            }
        }
        inner.order.clear();
        inner.total_bytes = 0;
    }

    /// Shut down: drop sessions and retained pool instances.
    pub fn shutdown(&self) {
        self.clear();
        self.pool.clear();
    }

    /// Record a per-session budget violation observed by a caller.
    pub fn note_budget_violation(&self, requested: usize, max: usize) {
        self.budget_violations.fetch_add(1, Ordering::Relaxed);
        self.metrics.budget_exceeded(requested, max);
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.read();
        CacheStats {
            sessions: inner.map.len(),
            total_bytes: inner.total_bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            budget_violations: self.budget_violations.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{CountingMetrics, NullMetrics};

    fn shape() -> ModelShape {
        ModelShape {
            layers: 1,
            kv_heads: 1,
            head_dim: 4,
        }
    }

    fn store_with(max_sessions: usize, max_bytes_total: usize) -> KvCacheStore {
        let config = CacheConfig {
            max_sessions,
            max_bytes_total,
            max_bytes_per_session: max_bytes_total,
            max_seq_len: 8,
            ..CacheConfig::default()
        };
        KvCacheStore::new(config, Arc::new(NullMetrics)).unwrap()
    }

    #[test]
    fn test_miss_then_create_then_hit() {
        let store = store_with(4, 1 << 20);
        let id = SessionId::new();
        assert!(store.try_get(&id).is_none());

        store.get_or_create(id, shape(), 8).unwrap();
        assert!(store.try_get(&id).is_some());

        let stats = store.stats();
        assert_eq!(stats.sessions, 1);
        assert!(stats.hits >= 1);
        assert!(stats.misses >= 1);
    }

    #[test]
    fn test_shape_mismatch_is_hard_error() {
        let store = store_with(4, 1 << 20);
        let id = SessionId::new();
        store.get_or_create(id, shape(), 8).unwrap();
        let other = ModelShape {
            layers: 2,
            kv_heads: 1,
            head_dim: 4,
        };
        assert!(store.get_or_create(id, other, 8).is_err());
        assert!(store.get_or_create(id, shape(), 4).is_err());
        // The original session survives the failed request
        assert!(store.try_get(&id).is_some());
    }

    #[test]
    fn test_session_cap_evicts_least_recent() {
        let store = store_with(2, 1 << 20);
        let a = SessionId::new();
        let b = SessionId::new();
        let c = SessionId::new();

        store.get_or_create(a, shape(), 8).unwrap();
        store.get_or_create(b, shape(), 8).unwrap();
        // Touch a so b is least-recent
        store.touch(&a);
        store.get_or_create(c, shape(), 8).unwrap();

        assert!(store.try_get(&a).is_some());
        assert!(store.try_get(&b).is_none());
        assert!(store.try_get(&c).is_some());
        assert_eq!(store.stats().evictions, 1);
        assert_eq!(store.stats().sessions, 2);
    }

    #[test]
    fn test_byte_cap_respected_after_eviction() {
        // Each session: 1 layer * 8 tokens * 4 dim * 2 bufs * 4 bytes = 256
        let store = store_with(16, 600);
        for _ in 0..4 {
            store.get_or_create(SessionId::new(), shape(), 8).unwrap();
        }
        let stats = store.stats();
        assert!(stats.total_bytes <= 600, "{}", stats.total_bytes);
        assert!(stats.evictions >= 2);
    }

    #[test]
    fn test_eviction_emits_metrics() {
        let metrics = CountingMetrics::new();
        let config = CacheConfig {
            max_sessions: 1,
            max_bytes_total: 1 << 20,
            max_bytes_per_session: 1 << 20,
            ..CacheConfig::default()
        };
        let store = KvCacheStore::new(config, metrics.clone()).unwrap();
        store.get_or_create(SessionId::new(), shape(), 8).unwrap();
        store.get_or_create(SessionId::new(), shape(), 8).unwrap();
        assert_eq!(metrics.evictions.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.bytes_freed.load(Ordering::Relaxed), 256);
    }

    #[test]
    fn test_remove_and_clear() {
        let store = store_with(4, 1 << 20);
        let id = SessionId::new();
        store.get_or_create(id, shape(), 8).unwrap();
        assert!(store.remove(&id));
        assert!(!store.remove(&id));
        assert_eq!(store.stats().sessions, 0);
        assert_eq!(store.stats().total_bytes, 0);

        store.get_or_create(SessionId::new(), shape(), 8).unwrap();
        store.clear();
        assert_eq!(store.stats().sessions, 0);
    }

    #[test]
    fn test_oversized_session_rejected() {
        let store = store_with(4, 100);
        let err = store.get_or_create(SessionId::new(), shape(), 8).unwrap_err();
        assert!(matches!(err, VulcanError::ResourceLimit(_)));
    }

    #[test]
    fn test_budget_violation_counter() {
        let metrics = CountingMetrics::new();
        let store = KvCacheStore::new(CacheConfig::default(), metrics.clone()).unwrap();
        store.note_budget_violation(1024, 512);
        assert_eq!(store.stats().budget_violations, 1);
        assert_eq!(metrics.budget_violations.load(Ordering::Relaxed), 1);
    }
}
