/// Q8_0: block-wise symmetric 8-bit quantization
///
/// Each block of `block_size` values shares one f32 scale; payload is one
/// signed byte per element. Dequantization is `q * scale`.
use super::range_check;
use crate::error::{VulcanError, VulcanResult};

pub const DEFAULT_BLOCK_SIZE: usize = 64;
const Q_MAX: f32 = 127.0;

#[derive(Debug, Clone)]
pub struct Q8_0Tensor {
    n: usize,
    block_size: usize,
    scales: Vec<f32>,
    qs: Vec<i8>,
}

impl Q8_0Tensor {
    pub fn quantize(src: &[f32], block_size: usize) -> VulcanResult<Self> {
        if block_size == 0 {
            return Err(VulcanError::Validation("block_size must be > 0".to_string()));
        }
        let num_blocks = src.len().div_ceil(block_size);
        let mut scales = Vec::with_capacity(num_blocks);
        let mut qs = vec![0i8; num_blocks * block_size];

        for (b, chunk) in src.chunks(block_size).enumerate() {
            let amax = chunk.iter().fold(0.0f32, |m, x| m.max(x.abs()));
            let scale = amax / Q_MAX;
            scales.push(scale);
            if scale == 0.0 {
                continue;
            }
            let inv = 1.0 / scale;
            for (i, &x) in chunk.iter().enumerate() {
                qs[b * block_size + i] = (x * inv).round().clamp(-Q_MAX, Q_MAX) as i8;
            }
        }

        Ok(Self {
            n: src.len(),
            block_size,
            scales,
            qs,
        })
    }

    pub fn dequantize_range(&self, start: usize, end: usize, out: &mut [f32]) -> VulcanResult<()> {
        range_check(self.n, start, end, out.len())?;
        for (o, i) in (start..end).enumerate() {
            let scale = self.scales[i / self.block_size];
            out[o] = self.qs[i] as f32 * scale;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    pub fn block_count(&self) -> usize {
        self.scales.len()
    }

    pub fn memory_usage(&self) -> usize {
        self.qs.len() + self.scales.len() * 4
    }
}
