/// Content-addressed prompt prefix sharing
///
/// Prompts that open with the same token sequence share one cached copy of
/// the per-layer K/V computed during prefill. Prefixes are addressed by the
/// SHA-256 of the first up-to-64 token ids. Reference counts are atomic;
/// only prefixes with zero references are eligible for LRU eviction.
use dashmap::DashMap;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use super::KvSession;
use crate::error::{VulcanError, VulcanResult};

/// Longest prefix considered for sharing.
pub const MAX_PREFIX_TOKENS: usize = 64;

type PrefixHash = [u8; 32];

/// Per-layer K/V rows for a cached prefix, `tokens * row_width` floats each.
struct PrefixKv {
    keys: Vec<Vec<f32>>,
    values: Vec<Vec<f32>>,
}

pub struct SharedPrefix {
    hash: PrefixHash,
    tokens: Vec<u32>,
    refs: AtomicUsize,
    /// Millis since registry start; drives LRU among unreferenced entries.
    last_used: AtomicU64,
    cached: Mutex<Option<PrefixKv>>,
}

impl SharedPrefix {
    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }

    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    pub fn has_cached_kv(&self) -> bool {
        self.cached.lock().is_some()
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }

    /// Store per-layer K/V rows captured after a prefill. First writer wins.
    pub fn store_kv(&self, keys: Vec<Vec<f32>>, values: Vec<Vec<f32>>) -> VulcanResult<()> {
        if keys.len() != values.len() {
            return Err(VulcanError::ShapeMismatch {
                expected: keys.len(),
                actual: values.len(),
            });
        }
        let mut cached = self.cached.lock();
        if cached.is_none() {
            *cached = Some(PrefixKv { keys, values });
        }
        Ok(())
    }

    /// Stage the cached K/V into an empty session, covering positions
    /// `0..tokens.len()`. Returns the number of positions restored. The
    /// caller commits.
    pub fn apply_to_session(&self, session: &mut dyn KvSession) -> VulcanResult<usize> {
        let cached = self.cached.lock();
        let Some(kv) = cached.as_ref() else {
            return Ok(0);
        };
        if session.committed_tokens() != 0 || session.staged_tokens() != 0 {
            return Err(VulcanError::Internal(
                "prefix restore requires an empty session".to_string(),
            ));
        }
        let shape = session.shape();
        if kv.keys.len() != shape.layers {
            return Err(VulcanError::ShapeMismatch {
                expected: shape.layers,
                actual: kv.keys.len(),
            });
        }

        let width = shape.row_width();
        let n_tokens = self.tokens.len();
        for layer in 0..shape.layers {
            let k_layer = &kv.keys[layer];
            let v_layer = &kv.values[layer];
            if k_layer.len() != n_tokens * width || v_layer.len() != n_tokens * width {
                return Err(VulcanError::ShapeMismatch {
                    expected: n_tokens * width,
                    actual: k_layer.len().min(v_layer.len()),
                });
            }
            for pos in 0..n_tokens {
                session.stage_kv(
                    layer,
                    pos,
                    &k_layer[pos * width..(pos + 1) * width],
                    &v_layer[pos * width..(pos + 1) * width],
                )?;
            }
        }
        Ok(n_tokens)
    }
}

/// Hash of the sharing-relevant prompt head.
pub fn prefix_hash(tokens: &[u32]) -> PrefixHash {
    let head = &tokens[..tokens.len().min(MAX_PREFIX_TOKENS)];
    let mut hasher = Sha256::new();
    for token in head {
        hasher.update(token.to_le_bytes());
    }
    hasher.finalize().into()
}

pub struct PrefixRegistry {
    map: DashMap<PrefixHash, Arc<SharedPrefix>>,
    capacity: usize,
    epoch: Instant,
}

impl PrefixRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            map: DashMap::new(),
            capacity,
            epoch: Instant::now(),
        }
    }

    fn now_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Attach to the prefix for `tokens`, creating it on first sight. The
    /// reference count is incremented; callers must `detach` when done.
    pub fn attach(&self, tokens: &[u32]) -> Arc<SharedPrefix> {
        let head_len = tokens.len().min(MAX_PREFIX_TOKENS);
        let hash = prefix_hash(tokens);
        let entry = self
            .map
            .entry(hash)
            .or_insert_with(|| {
                debug!(prefix = %hex::encode(hash), tokens = head_len, "prefix created");
                Arc::new(SharedPrefix {
                    hash,
                    tokens: tokens[..head_len].to_vec(),
                    refs: AtomicUsize::new(0),
                    last_used: AtomicU64::new(0),
                    cached: Mutex::new(None),
                })
            })
            .clone();
        entry.refs.fetch_add(1, Ordering::AcqRel);
        entry.last_used.store(self.now_millis(), Ordering::Release);

        if self.map.len() > self.capacity {
            self.evict_unreferenced();
        }
        entry
    }

    /// Release one reference.
    pub fn detach(&self, prefix: &SharedPrefix) {
        prefix.refs.fetch_sub(1, Ordering::AcqRel);
        prefix.last_used.store(self.now_millis(), Ordering::Release);
    }

    /// Evict least-recently-used entries with zero references until the
    /// registry fits its capacity.
    fn evict_unreferenced(&self) {
        while self.map.len() > self.capacity {
            let mut victim: Option<(PrefixHash, u64)> = None;
            for entry in self.map.iter() {
                if entry.value().ref_count() != 0 {
                    continue;
                }
                let used = entry.value().last_used.load(Ordering::Acquire);
                if victim.map(|(_, best)| used < best).unwrap_or(true) {
                    victim = Some((*entry.key(), used));
                }
            }
            let Some((hash, _)) = victim else {
                // Everything is referenced; nothing can go
                return;
            };
            // Re-check under the entry lock: a racing attach wins
            if self
                .map
                .remove_if(&hash, |_, prefix| prefix.ref_count() == 0)
                .is_none()
            {
                return;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&self) {
        self.map.clear();
    }
}
