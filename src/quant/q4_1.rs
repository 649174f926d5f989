/// Q4_1: block-wise asymmetric 4-bit quantization
///
/// Blocks of 32 values store an f32 scale and an f32 minimum. Nibbles are
/// unsigned 0..15; dequantization is `q * scale + min`, so the full block
/// range [min, max] is representable exactly at the endpoints.
use super::range_check;
use crate::error::VulcanResult;

pub const BLOCK_SIZE: usize = 32;
const Q_MAX: f32 = 15.0;

#[derive(Debug, Clone)]
pub struct Q4_1Tensor {
    n: usize,
    scales: Vec<f32>,
    mins: Vec<f32>,
    qs: Vec<u8>,
}

impl Q4_1Tensor {
    pub fn quantize(src: &[f32]) -> Self {
        let num_blocks = src.len().div_ceil(BLOCK_SIZE);
        let mut scales = Vec::with_capacity(num_blocks);
        let mut mins = Vec::with_capacity(num_blocks);
        let mut qs = vec![0u8; num_blocks * BLOCK_SIZE / 2];

        for (b, chunk) in src.chunks(BLOCK_SIZE).enumerate() {
            let min = chunk.iter().copied().fold(f32::INFINITY, f32::min);
            let max = chunk.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let scale = (max - min) / Q_MAX;
            scales.push(scale);
            mins.push(min);
            if scale == 0.0 {
                continue;
            }
            let inv = 1.0 / scale;
            for (i, &x) in chunk.iter().enumerate() {
                let q = ((x - min) * inv).round().clamp(0.0, Q_MAX) as u8;
                let byte = &mut qs[b * BLOCK_SIZE / 2 + i / 2];
                if i % 2 == 0 {
                    *byte |= q;
                } else {
                    *byte |= q << 4;
                }
            }
        }

        Self {
            n: src.len(),
            scales,
            mins,
            qs,
        }
    }

    pub fn dequantize_range(&self, start: usize, end: usize, out: &mut [f32]) -> VulcanResult<()> {
        range_check(self.n, start, end, out.len())?;
        for (o, i) in (start..end).enumerate() {
            let block = i / BLOCK_SIZE;
            let byte = self.qs[i / 2];
            let q = if i % 2 == 0 { byte & 0x0F } else { byte >> 4 };
            out[o] = q as f32 * self.scales[block] + self.mins[block];
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
        self.qs.len() + (self.scales.len() + self.mins.len()) * 4
    }
}
