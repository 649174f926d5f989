/// Per-shape session pool
///
/// Rents pre-sized sessions keyed by (shape, max_tokens, precision).
/// Returned sessions are reset — token count zeroed, memory left as-is —
/// and reused by the next rent for the same key. Retention per key is
/// bounded; surplus returns are simply dropped.
use parking_lot::Mutex;
use std::collections::HashMap;

use super::{KvCacheSession, KvSession, ModelShape, QuantizedKvSession};
use crate::config::CachePrecision;
use crate::error::VulcanResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PoolKey {
    shape: ModelShape,
    max_tokens: usize,
    precision: CachePrecision,
}

pub struct SessionPool {
    retain_per_key: usize,
    shelves: Mutex<HashMap<PoolKey, Vec<Box<dyn KvSession + Send>>>>,
}

impl SessionPool {
    pub fn new(retain_per_key: usize) -> Self {
        Self {
            retain_per_key,
            shelves: Mutex::new(HashMap::new()),
        }
    }

    /// Rent a session, reusing a pooled instance when one is available.
    pub fn rent(
        &self,
        shape: ModelShape,
        max_tokens: usize,
        precision: CachePrecision,
    ) -> VulcanResult<Box<dyn KvSession + Send>> {
        let key = PoolKey {
            shape,
            max_tokens,
            precision,
        };
        if let Some(session) = self
            .shelves
            .lock()
            .get_mut(&key)
            .and_then(|shelf| shelf.pop())
        {
            return Ok(session);
        }

        let session: Box<dyn KvSession + Send> = match precision {
            CachePrecision::F32 => Box::new(KvCacheSession::new(shape, max_tokens)),
            CachePrecision::F16 | CachePrecision::Int8 => {
                Box::new(QuantizedKvSession::new(shape, max_tokens, precision)?)
            }
        };
        Ok(session)
    }

    /// Return a session for reuse. The session is reset; no memory clearing.
    pub fn give_back(&self, mut session: Box<dyn KvSession + Send>) {
        session.reset();
        let key = PoolKey {
            shape: session.shape(),
            max_tokens: session.max_tokens(),
            precision: session.precision(),
        };
        let mut shelves = self.shelves.lock();
        let shelf = shelves.entry(key).or_default();
        if shelf.len() < self.retain_per_key {
            shelf.push(session);
        }
    }

    /// Drop every retained session.
    pub fn clear(&self) {
        self.shelves.lock().clear();
    }

    /// Retained sessions across all keys.
    pub fn retained(&self) -> usize {
        self.shelves.lock().values().map(|s| s.len()).sum()
    }
}
