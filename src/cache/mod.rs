/// KV-cache subsystem
///
/// Per-session caches of post-RoPE keys and values with strict byte budgets,
/// an LRU store with global caps, a per-shape session pool, optional
/// FP16/INT8 storage, and content-addressed prompt prefix sharing.
pub mod budget;
pub mod pool;
pub mod prefix;
pub mod quantized;
pub mod session;
pub mod store;

pub use budget::KvCacheBudgetPolicy;
pub use pool::SessionPool;
pub use prefix::{PrefixRegistry, SharedPrefix};
pub use quantized::QuantizedKvSession;
pub use session::KvCacheSession;
pub use store::{CacheStats, KvCacheStore, SessionHandle};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::VulcanResult;

/// Cache layout class: identical shapes can share pooled buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelShape {
    pub layers: usize,
    pub kv_heads: usize,
    pub head_dim: usize,
}

impl ModelShape {
    /// Floats cached per token position (K and V counted separately).
    pub fn row_width(&self) -> usize {
        self.kv_heads * self.head_dim
    }

    /// Total cached elements for `n_tokens` positions, K plus V.
    pub fn elements(&self, n_tokens: usize) -> usize {
        2 * self.layers * n_tokens * self.row_width()
    }
}

/// Opaque identifier of a generation session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Storage interface shared by the f32 and quantized session variants.
///
/// Writes are transactional: `stage_kv` places K/V for positions at or past
/// the committed count, `commit_tokens` atomically advances the visible
/// count, and `discard_staged` abandons everything staged since the last
/// commit. Reads address positions below `committed + staged`; the forward
/// pass that staged them is the only reader of uncommitted rows. Memory at
/// positions at or past that bound is undefined and never readable.
pub trait KvSession: Send {
    fn shape(&self) -> ModelShape;
    fn max_tokens(&self) -> usize;

    /// Committed (externally visible) token count.
    fn committed_tokens(&self) -> usize;

    /// Tokens staged since the last commit.
    fn staged_tokens(&self) -> usize;

    /// Stage K and V rows (each `shape().row_width()` floats, K already
    /// rotated) for `pos`.
    fn stage_kv(&mut self, layer: usize, pos: usize, k: &[f32], v: &[f32]) -> VulcanResult<()>;

    /// Atomically advance the committed count by `n` staged tokens.
    fn commit_tokens(&mut self, n: usize) -> VulcanResult<()>;

    /// Drop staged-but-uncommitted tokens, restoring the pre-stage state.
    fn discard_staged(&mut self);

    /// Read one head's key row into `out` (`head_dim` floats), dequantizing
    /// if necessary.
    fn key_row(&self, layer: usize, pos: usize, head: usize, out: &mut [f32]) -> VulcanResult<()>;

    /// Read one head's value row into `out`.
    fn value_row(&self, layer: usize, pos: usize, head: usize, out: &mut [f32])
        -> VulcanResult<()>;

    /// Keep only the trailing `keep_last` committed tokens, shifting both
    /// buffers in place.
    fn sliding_window(&mut self, keep_last: usize) -> VulcanResult<()>;

    /// Reset to empty. Buffer contents need not be cleared.
    fn reset(&mut self);

    /// Bytes held by the K/V storage (metadata excluded).
    fn bytes(&self) -> usize;

    /// Storage precision of this session.
    fn precision(&self) -> crate::config::CachePrecision;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_shape_sizes() {
        let shape = ModelShape {
            layers: 2,
            kv_heads: 4,
            head_dim: 8,
        };
        assert_eq!(shape.row_width(), 32);
        assert_eq!(shape.elements(10), 2 * 2 * 10 * 32);
    }

    #[test]
    fn test_session_ids_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
    }
}
