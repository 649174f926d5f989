/// Quantized KV-cache session (FP16 and INT8 variants)
///
/// Stores K and V in half precision (2x memory reduction) or as 8-bit
/// affine-quantized bytes (4x). INT8 keeps one (scale, offset) pair per
/// (layer, position) for K and V each, computed from the row's min/max at
/// write time so the full 0..255 range is used. The attention path
/// dequantizes per step into a caller scratch buffer before the dot
/// product, never in bulk.
use half::f16;

use super::{KvSession, ModelShape};
use crate::config::CachePrecision;
use crate::error::{VulcanError, VulcanResult};

enum QuantStore {
    F16 {
        keys: Vec<u16>,
        values: Vec<u16>,
    },
    Int8 {
        keys: Vec<u8>,
        values: Vec<u8>,
        /// One (scale, offset) per (layer, position), K then V planes.
        k_scales: Vec<f32>,
        k_offsets: Vec<f32>,
        v_scales: Vec<f32>,
        v_offsets: Vec<f32>,
    },
}

pub struct QuantizedKvSession {
    shape: ModelShape,
    max_tokens: usize,
    committed: usize,
    staged: usize,
    store: QuantStore,
}

#[inline]
fn quantize_row_u8(src: &[f32], dst: &mut [u8]) -> (f32, f32) {
    let min = src.iter().copied().fold(f32::INFINITY, f32::min);
    let max = src.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let scale = (max - min) / 255.0;
    if scale == 0.0 {
        dst.fill(0);
        return (0.0, min);
    }
    let inv = 1.0 / scale;
    for (d, &x) in dst.iter_mut().zip(src.iter()) {
        *d = ((x - min) * inv).round().clamp(0.0, 255.0) as u8;
    }
    (scale, min)
}

impl QuantizedKvSession {
    pub fn new(shape: ModelShape, max_tokens: usize, precision: CachePrecision) -> VulcanResult<Self> {
        let capacity = shape.layers * max_tokens * shape.row_width();
        let store = match precision {
            CachePrecision::F16 => QuantStore::F16 {
                keys: vec![0; capacity],
                values: vec![0; capacity],
            },
            CachePrecision::Int8 => {
                let params = shape.layers * max_tokens;
                QuantStore::Int8 {
                    keys: vec![0; capacity],
                    values: vec![0; capacity],
                    k_scales: vec![0.0; params],
                    k_offsets: vec![0.0; params],
                    v_scales: vec![0.0; params],
                    v_offsets: vec![0.0; params],
                }
            }
            CachePrecision::F32 => {
                return Err(VulcanError::Validation(
                    "use KvCacheSession for f32 storage".to_string(),
                ))
            }
        };
        Ok(Self {
            shape,
            max_tokens,
            committed: 0,
            staged: 0,
            store,
        })
    }

    #[inline]
    fn row_offset(&self, layer: usize, pos: usize) -> usize {
        (layer * self.max_tokens + pos) * self.shape.row_width()
    }

    #[inline]
    fn param_offset(&self, layer: usize, pos: usize) -> usize {
        layer * self.max_tokens + pos
    }

    fn check_read(&self, layer: usize, pos: usize, head: usize) -> VulcanResult<()> {
        if layer >= self.shape.layers || head >= self.shape.kv_heads {
            return Err(VulcanError::Validation(format!(
                "layer {layer}/head {head} out of bounds"
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

    fn read_head(
        &self,
        layer: usize,
        pos: usize,
        head: usize,
        out: &mut [f32],
        read_values: bool,
    ) -> VulcanResult<()> {
        self.check_read(layer, pos, head)?;
        let hd = self.shape.head_dim;
        if out.len() != hd {
            return Err(VulcanError::ShapeMismatch {
                expected: hd,
                actual: out.len(),
            });
        }
        let start = self.row_offset(layer, pos) + head * hd;
        match &self.store {
            QuantStore::F16 { keys, values } => {
                let src = if read_values { values } else { keys };
                for (o, &bits) in out.iter_mut().zip(src[start..start + hd].iter()) {
                    *o = f16::from_bits(bits).to_f32();
                }
            }
            QuantStore::Int8 {
                keys,
                values,
                k_scales,
                k_offsets,
                v_scales,
                v_offsets,
            } => {
                let p = self.param_offset(layer, pos);
                let (src, scale, offset) = if read_values {
                    (values, v_scales[p], v_offsets[p])
                } else {
                    (keys, k_scales[p], k_offsets[p])
                };
                for (o, &q) in out.iter_mut().zip(src[start..start + hd].iter()) {
                    *o = q as f32 * scale + offset;
                }
            }
        }
        Ok(())
    }
}

impl KvSession for QuantizedKvSession {
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
        let bpe = self.precision().bytes_per_element();
        if pos >= self.max_tokens {
            return Err(VulcanError::OutOfBudget {
                requested: self.shape.elements(pos + 1 - self.committed) * bpe,
                available: self.shape.elements(self.max_tokens - self.committed) * bpe,
                max: self.shape.elements(self.max_tokens) * bpe,
            });
        }

        let start = self.row_offset(layer, pos);
        let param = self.param_offset(layer, pos);
        match &mut self.store {
            QuantStore::F16 { keys, values } => {
                for (dst, &x) in keys[start..start + width].iter_mut().zip(k.iter()) {
                    *dst = f16::from_f32(x).to_bits();
                }
                for (dst, &x) in values[start..start + width].iter_mut().zip(v.iter()) {
                    *dst = f16::from_f32(x).to_bits();
                }
            }
            QuantStore::Int8 {
                keys,
                values,
                k_scales,
                k_offsets,
                v_scales,
                v_offsets,
            } => {
                let (scale, offset) = quantize_row_u8(k, &mut keys[start..start + width]);
                k_scales[param] = scale;
                k_offsets[param] = offset;
                let (scale, offset) = quantize_row_u8(v, &mut values[start..start + width]);
                v_scales[param] = scale;
                v_offsets[param] = offset;
            }
        }
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
        self.read_head(layer, pos, head, out, false)
    }

    fn value_row(
        &self,
        layer: usize,
        pos: usize,
        head: usize,
        out: &mut [f32],
    ) -> VulcanResult<()> {
        self.read_head(layer, pos, head, out, true)
    }

    fn sliding_window(&mut self, keep_last: usize) -> VulcanResult<()> {
        if keep_last >= self.committed {
            return Ok(());
        }
        let width = self.shape.row_width();
        let drop = self.committed - keep_last;
        for layer in 0..self.shape.layers {
            let data_start = layer * self.max_tokens * width;
            let src = data_start + drop * width;
            let len = keep_last * width;
            let param_start = layer * self.max_tokens;
            match &mut self.store {
                QuantStore::F16 { keys, values } => {
                    keys.copy_within(src..src + len, data_start);
                    values.copy_within(src..src + len, data_start);
                }
                QuantStore::Int8 {
                    keys,
                    values,
                    k_scales,
                    k_offsets,
                    v_scales,
                    v_offsets,
                } => {
                    keys.copy_within(src..src + len, data_start);
                    values.copy_within(src..src + len, data_start);
                    let p_src = param_start + drop;
                    for plane in [k_scales, k_offsets, v_scales, v_offsets] {
                        plane.copy_within(p_src..p_src + keep_last, param_start);
                    }
                }
            }
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
        match &self.store {
            QuantStore::F16 { keys, values } => (keys.len() + values.len()) * 2,
            QuantStore::Int8 {
                keys,
                values,
                k_scales,
                ..
            } => keys.len() + values.len() + k_scales.len() * 4 * 4,
        }
    }

    fn precision(&self) -> CachePrecision {
        match &self.store {
            QuantStore::F16 { .. } => CachePrecision::F16,
            QuantStore::Int8 { .. } => CachePrecision::Int8,
        }
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

    fn ramp_row(base: f32) -> Vec<f32> {
        (0..8).map(|i| base + i as f32 * 0.5).collect()
    }

    #[test]
    fn test_f16_round_trip_is_close() {
        let mut session = QuantizedKvSession::new(shape(), 4, CachePrecision::F16).unwrap();
        session.stage_kv(0, 0, &ramp_row(1.0), &ramp_row(-2.0)).unwrap();
        session.commit_tokens(1).unwrap();

        let mut out = vec![0.0; 4];
        session.key_row(0, 0, 0, &mut out).unwrap();
        for (i, v) in out.iter().enumerate() {
            assert!((v - (1.0 + i as f32 * 0.5)).abs() < 1e-2);
        }
    }

    #[test]
    fn test_int8_round_trip_uses_full_range() {
        let mut session = QuantizedKvSession::new(shape(), 4, CachePrecision::Int8).unwrap();
        let k = ramp_row(0.0);
        session.stage_kv(0, 0, &k, &ramp_row(10.0)).unwrap();
        session.commit_tokens(1).unwrap();

        let mut out = vec![0.0; 4];
        session.key_row(0, 0, 0, &mut out).unwrap();
        // Row range is 3.5; worst-case error is half a step of range/255
        for (i, v) in out.iter().enumerate() {
            assert!((v - i as f32 * 0.5).abs() <= 3.5 / 255.0, "{v}");
        }
        session.key_row(0, 0, 1, &mut out).unwrap();
        for (i, v) in out.iter().enumerate() {
            assert!((v - (2.0 + i as f32 * 0.5)).abs() <= 3.5 / 255.0, "{v}");
        }
    }

    #[test]
    fn test_memory_reduction_factors() {
        let f16_session = QuantizedKvSession::new(shape(), 8, CachePrecision::F16).unwrap();
        let int8_session = QuantizedKvSession::new(shape(), 8, CachePrecision::Int8).unwrap();
        let f32_bytes = super::super::KvCacheSession::new(shape(), 8).bytes();
        assert_eq!(f16_session.bytes() * 2, f32_bytes);
        // INT8 payload alone is a quarter; affine params add a little on top
        assert!(int8_session.bytes() < f32_bytes / 2);
    }

    #[test]
    fn test_constant_row_int8() {
        let mut session = QuantizedKvSession::new(shape(), 4, CachePrecision::Int8).unwrap();
        session.stage_kv(0, 0, &[7.5; 8], &[7.5; 8]).unwrap();
        session.commit_tokens(1).unwrap();
        let mut out = vec![0.0; 4];
        session.value_row(0, 0, 1, &mut out).unwrap();
        assert!(out.iter().all(|v| (*v - 7.5).abs() < 1e-6));
    }

    #[test]
    fn test_f32_precision_rejected() {
        assert!(QuantizedKvSession::new(shape(), 4, CachePrecision::F32).is_err());
    }

    #[test]
    fn test_sliding_window_shifts_params() {
        let mut session = QuantizedKvSession::new(shape(), 4, CachePrecision::Int8).unwrap();
        for pos in 0..3 {
            let row = ramp_row(pos as f32 * 10.0);
            for layer in 0..2 {
                session.stage_kv(layer, pos, &row, &row).unwrap();
            }
        }
        session.commit_tokens(3).unwrap();
        session.sliding_window(1).unwrap();

        let mut out = vec![0.0; 4];
        session.key_row(0, 0, 0, &mut out).unwrap();
        // Old position 2 (base 20.0) is now position 0
        assert!((out[0] - 20.0).abs() < 0.1, "{}", out[0]);
    }
}
