/// Contiguous f32 KV-cache session
///
/// Owns two flat buffers sized `layers * max_tokens * kv_heads * head_dim`
/// for keys and values. Strides from innermost out: head_dim, kv_head,
/// position, layer, so one (layer, position, head) row is contiguous and
/// SIMD-friendly. Keys are stored post-RoPE; the cache is attention-ready.
use super::{KvSession, ModelShape};
use crate::config::CachePrecision;
use crate::error::{VulcanError, VulcanResult};

pub struct KvCacheSession {
    shape: ModelShape,
    max_tokens: usize,
    committed: usize,
    staged: usize,
    keys: Vec<f32>,
    values: Vec<f32>,
}

impl KvCacheSession {
    pub fn new(shape: ModelShape, max_tokens: usize) -> Self {
        let capacity = shape.layers * max_tokens * shape.row_width();
        Self {
            shape,
            max_tokens,
            committed: 0,
            staged: 0,
            keys: vec![0.0; capacity],
            values: vec![0.0; capacity],
        }
    }

    #[inline]
    fn offset(&self, layer: usize, pos: usize, head: usize) -> usize {
        ((layer * self.max_tokens + pos) * self.shape.kv_heads + head) * self.shape.head_dim
    }

    fn check_read(&self, layer: usize, pos: usize, head: usize) -> VulcanResult<()> {
        if layer >= self.shape.layers {
            return Err(VulcanError::Validation(format!(
                "layer {} out of bounds for {} layers",
                layer, self.shape.layers
            )));
        }
        if head >= self.shape.kv_heads {
            return Err(VulcanError::Validation(format!(
                "kv head {} out of bounds for {} heads",
                head, self.shape.kv_heads
            )));
        }
        if pos >= self.committed + self.staged {
            return Err(VulcanError::Validation(format!(
                "position {} beyond visible count {}",
                pos,
                self.committed + self.staged
            )));
        }
        Ok(())
    }
}

impl KvSession for KvCacheSession {
    fn shape(&self) -> ModelShape {
        self.shape
    }

    fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    fn committed_tokens(&self) -> usize {
        self.committed
    }

    fn staged_tokens(&self) -> usize {
        self.staged
    }

    fn stage_kv(&mut self, layer: usize, pos: usize, k: &[f32], v: &[f32]) -> VulcanResult<()> {
        let width = self.shape.row_width();
        if k.len() != width || v.len() != width {
            return Err(VulcanError::ShapeMismatch {
                expected: width,
                actual: k.len().min(v.len()),
            });
        }
        if layer >= self.shape.layers {
            return Err(VulcanError::Validation(format!(
                "layer {} out of bounds for {} layers",
                layer, self.shape.layers
            )));
        }
        if pos < self.committed {
            return Err(VulcanError::Internal(format!(
                "staging position {} below committed count {}",
                pos, self.committed
            )));
        }
        if pos >= self.max_tokens {
            return Err(VulcanError::OutOfBudget {
                requested: self.shape.elements(pos + 1 - self.committed) * 4,
                available: self.shape.elements(self.max_tokens - self.committed) * 4,
                max: self.shape.elements(self.max_tokens) * 4,
            });
        }

        let start = self.offset(layer, pos, 0);
        self.keys[start..start + width].copy_from_slice(k);
        self.values[start..start + width].copy_from_slice(v);
        self.staged = self.staged.max(pos + 1 - self.committed);
        Ok(())
    }

    fn commit_tokens(&mut self, n: usize) -> VulcanResult<()> {
        if n > self.staged {
            return Err(VulcanError::Internal(format!(
                "committing {} tokens but only {} are staged",
                n, self.staged
            )));
        }
        self.committed += n;
        self.staged -= n;
        Ok(())
    }

    fn discard_staged(&mut self) {
        self.staged = 0;
    }

    fn key_row(&self, layer: usize, pos: usize, head: usize, out: &mut [f32]) -> VulcanResult<()> {
        self.check_read(layer, pos, head)?;
        if out.len() != self.shape.head_dim {
            return Err(VulcanError::ShapeMismatch {
                expected: self.shape.head_dim,
                actual: out.len(),
            });
        }
        let start = self.offset(layer, pos, head);
        out.copy_from_slice(&self.keys[start..start + self.shape.head_dim]);
        Ok(())
    }

    fn value_row(
        &self,
        layer: usize,
        pos: usize,
        head: usize,
        out: &mut [f32],
    ) -> VulcanResult<()> {
        self.check_read(layer, pos, head)?;
        if out.len() != self.shape.head_dim {
            return Err(VulcanError::ShapeMismatch {
                expected: self.shape.head_dim,
                actual: out.len(),
            });
        }
        let start = self.offset(layer, pos, head);
        out.copy_from_slice(&self.values[start..start + self.shape.head_dim]);
        Ok(())
    }

    fn sliding_window(&mut self, keep_last: usize) -> VulcanResult<()> {
        if keep_last >= self.committed {
            return Ok(());
        }
        let width = self.shape.row_width();
        let drop = self.committed - keep_last;
        for layer in 0..self.shape.layers {
            let layer_start = layer * self.max_tokens * width;
            let src = layer_start + drop * width;
            let dst = layer_start;
            let len = keep_last * width;
            self.keys.copy_within(src..src + len, dst);
            self.values.copy_within(src..src + len, dst);
        }
        self.committed = keep_last;
        self.staged = 0;
        Ok(())
    }

    fn reset(&mut self) {
        self.committed = 0;
        self.staged = 0;
    }

    fn bytes(&self) -> usize {
        (self.keys.len() + self.values.len()) * std::mem::size_of::<f32>()
    }

    fn precision(&self) -> CachePrecision {
        CachePrecision::F32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape() -> ModelShape {
        ModelShape {
            layers: 2,
            kv_heads: 2,
            head_dim: 4,
        }
    }

    fn row(base: f32) -> Vec<f32> {
        (0..8).map(|i| base + i as f32).collect()
    }

    #[test]
    fn test_stage_commit_read_cycle() {
        let mut session = KvCacheSession::new(shape(), 8);
        for layer in 0..2 {
            session.stage_kv(layer, 0, &row(10.0), &row(20.0)).unwrap();
        }
        assert_eq!(session.committed_tokens(), 0);
        assert_eq!(session.staged_tokens(), 1);

        session.commit_tokens(1).unwrap();
        assert_eq!(session.committed_tokens(), 1);

        let mut out = vec![0.0; 4];
        session.key_row(0, 0, 1, &mut out).unwrap();
        assert_eq!(out, vec![14.0, 15.0, 16.0, 17.0]);
        session.value_row(1, 0, 0, &mut out).unwrap();
        assert_eq!(out, vec![20.0, 21.0, 22.0, 23.0]);
    }

    #[test]
    fn test_commit_counts_accumulate() {
        let mut session = KvCacheSession::new(shape(), 8);
        for pos in 0..3 {
            session.stage_kv(0, pos, &row(0.0), &row(0.0)).unwrap();
        }
        session.commit_tokens(3).unwrap();
        for pos in 3..5 {
            session.stage_kv(0, pos, &row(0.0), &row(0.0)).unwrap();
        }
        session.commit_tokens(2).unwrap();
        assert_eq!(session.committed_tokens(), 5);
    }

    #[test]
    fn test_read_beyond_count_rejected() {
        let mut session = KvCacheSession::new(shape(), 8);
        session.stage_kv(0, 0, &row(0.0), &row(0.0)).unwrap();
        session.commit_tokens(1).unwrap();
        let mut out = vec![0.0; 4];
        assert!(session.key_row(0, 1, 0, &mut out).is_err());
    }

    #[test]
    fn test_staged_reads_allowed_before_commit() {
        let mut session = KvCacheSession::new(shape(), 8);
        session.stage_kv(0, 0, &row(1.0), &row(2.0)).unwrap();
        let mut out = vec![0.0; 4];
        session.key_row(0, 0, 0, &mut out).unwrap();
        assert_eq!(out, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_discard_staged_restores_prior_state() {
        let mut session = KvCacheSession::new(shape(), 8);
        session.stage_kv(0, 0, &row(1.0), &row(1.0)).unwrap();
        session.commit_tokens(1).unwrap();
        session.stage_kv(0, 1, &row(9.0), &row(9.0)).unwrap();
        session.discard_staged();
        assert_eq!(session.committed_tokens(), 1);
        let mut out = vec![0.0; 4];
        assert!(session.key_row(0, 1, 0, &mut out).is_err());
    }

    #[test]
    fn test_stage_past_capacity_is_out_of_budget() {
        let mut session = KvCacheSession::new(shape(), 2);
        for pos in 0..2 {
            session.stage_kv(0, pos, &row(0.0), &row(0.0)).unwrap();
        }
        session.commit_tokens(2).unwrap();
        let err = session.stage_kv(0, 2, &row(0.0), &row(0.0)).unwrap_err();
        assert!(matches!(err, VulcanError::OutOfBudget { .. }));
    }

    #[test]
    fn test_over_commit_is_internal_error() {
        let mut session = KvCacheSession::new(shape(), 4);
        session.stage_kv(0, 0, &row(0.0), &row(0.0)).unwrap();
        assert!(matches!(
            session.commit_tokens(2).unwrap_err(),
            VulcanError::Internal(_)
        ));
    }

    #[test]
    fn test_sliding_window_keeps_trailing_tokens() {
        let mut session = KvCacheSession::new(shape(), 8);
        for pos in 0..4 {
            for layer in 0..2 {
                session
                    .stage_kv(layer, pos, &row(pos as f32 * 100.0), &row(pos as f32 * 100.0))
                    .unwrap();
            }
        }
        session.commit_tokens(4).unwrap();
        session.sliding_window(2).unwrap();
        assert_eq!(session.committed_tokens(), 2);

        // Old position 2 is now position 0
        let mut out = vec![0.0; 4];
        session.key_row(0, 0, 0, &mut out).unwrap();
        assert_eq!(out, vec![200.0, 201.0, 202.0, 203.0]);
        session.key_row(1, 1, 0, &mut out).unwrap();
        assert_eq!(out, vec![300.0, 301.0, 302.0, 303.0]);
    }

    #[test]
    fn test_reset_clears_counts_not_memory() {
        let mut session = KvCacheSession::new(shape(), 4);
        session.stage_kv(0, 0, &row(5.0), &row(5.0)).unwrap();
        session.commit_tokens(1).unwrap();
        session.reset();
        assert_eq!(session.committed_tokens(), 0);
        let mut out = vec![0.0; 4];
        assert!(session.key_row(0, 0, 0, &mut out).is_err());
    }

    #[test]
    fn test_bytes_accounting() {
        let session = KvCacheSession::new(shape(), 8);
        // 2 layers * 8 tokens * 8 row width * 2 buffers * 4 bytes
        assert_eq!(session.bytes(), 2 * 8 * 8 * 2 * 4);
    }
}
