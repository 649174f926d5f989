/// Q5_0: block-wise symmetric 5-bit quantization
///
/// Blocks of 32 values store an f32 scale, 16 nibble-packed bytes holding
/// the low 4 bits, and a 32-bit bitmap holding each element's fifth (high)
/// bit. The reconstructed unsigned 5-bit value is shifted by -16;
/// dequantization is `(u5 - 16) * scale`.
use super::range_check;
use crate::error::VulcanResult;

pub const BLOCK_SIZE: usize = 32;
const Q_MAX: f32 = 15.0;

#[derive(Debug, Clone)]
pub struct Q5_0Tensor {
    n: usize,
    scales: Vec<f32>,
    high_bits: Vec<u32>,
    qs: Vec<u8>,
}

impl Q5_0Tensor {
    pub fn quantize(src: &[f32]) -> Self {
        let num_blocks = src.len().div_ceil(BLOCK_SIZE);
        let mut scales = Vec::with_capacity(num_blocks);
        let mut high_bits = vec![0u32; num_blocks];
        let mut qs = vec![0u8; num_blocks * BLOCK_SIZE / 2];

        for (b, chunk) in src.chunks(BLOCK_SIZE).enumerate() {
            let amax = chunk.iter().fold(0.0f32, |m, x| m.max(x.abs()));
            let scale = amax / Q_MAX;
            scales.push(scale);
            if scale == 0.0 {
                // All-zero block encodes as u5 = 16 everywhere (low nibble 0, high bit 1)
                for i in 0..chunk.len() {
                    high_bits[b] |= 1 << i;
                }
                continue;
            }
            let inv = 1.0 / scale;
            for (i, &x) in chunk.iter().enumerate() {
                let q = (x * inv).round().clamp(-16.0, 15.0) as i32;
                let u5 = (q + 16) as u8; // 0..31
                let byte = &mut qs[b * BLOCK_SIZE / 2 + i / 2];
                if i % 2 == 0 {
                    *byte |= u5 & 0x0F;
                } else {
                    *byte |= (u5 & 0x0F) << 4;
                }
                if u5 & 0x10 != 0 {
                    high_bits[b] |= 1 << i;
                }
            }
        }

        Self {
            n: src.len(),
            scales,
            high_bits,
            qs,
        }
    }

    pub fn dequantize_range(&self, start: usize, end: usize, out: &mut [f32]) -> VulcanResult<()> {
        range_check(self.n, start, end, out.len())?;
        for (o, i) in (start..end).enumerate() {
            let block = i / BLOCK_SIZE;
            let lane = i % BLOCK_SIZE;
            let byte = self.qs[i / 2];
            let low = if i % 2 == 0 { byte & 0x0F } else { byte >> 4 };
            let high = ((self.high_bits[block] >> lane) & 1) as u8;
            let u5 = low | (high << 4);
            out[o] = (u5 as i32 - 16) as f32 * self.scales[block];
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
        self.qs.len() + self.scales.len() * 4 + self.high_bits.len() * 4
    }
}
