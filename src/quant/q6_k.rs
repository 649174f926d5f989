/// Q6_K: 256-element super-blocks of signed 6-bit values
///
/// A super-block covers 256 values split into 16 sub-blocks of 16. Metadata
/// is one fp16 super-scale plus 16 signed 8-bit sub-scales. The payload is
/// 128 bytes of low nibbles (2 values/byte) and 64 bytes of high 2-bit
/// fields (4 values/byte). Each value reconstructs to 0..63 and decodes as
/// `super_scale * sub_scale * (q - 32)`.
use super::range_check;
use crate::error::VulcanResult;
use half::f16;

pub const SUPER_BLOCK_SIZE: usize = 256;
pub const SUB_BLOCK_SIZE: usize = 16;
pub const SUB_BLOCKS: usize = SUPER_BLOCK_SIZE / SUB_BLOCK_SIZE;

const LOW_BYTES: usize = SUPER_BLOCK_SIZE / 2; // 128
const HIGH_BYTES: usize = SUPER_BLOCK_SIZE / 4; // 64
const Q_CENTER: i32 = 32;
const SUB_Q_MAX: f32 = 31.0;
const SCALE_Q_MAX: f32 = 127.0;

#[derive(Debug, Clone)]
pub struct Q6KTensor {
    n: usize,
    /// fp16 bit patterns, one per super-block.
    super_scales: Vec<u16>,
    /// 16 signed sub-scales per super-block.
    sub_scales: Vec<i8>,
    /// Low nibbles, 128 bytes per super-block.
    ql: Vec<u8>,
    /// High 2-bit fields, 64 bytes per super-block.
    qh: Vec<u8>,
}

impl Q6KTensor {
    pub fn quantize(src: &[f32]) -> Self {
        let num_super = src.len().div_ceil(SUPER_BLOCK_SIZE);
        let mut super_scales = Vec::with_capacity(num_super);
        let mut sub_scales = vec![0i8; num_super * SUB_BLOCKS];
        let mut ql = vec![0u8; num_super * LOW_BYTES];
        let mut qh = vec![0u8; num_super * HIGH_BYTES];

        for (sb, chunk) in src.chunks(SUPER_BLOCK_SIZE).enumerate() {
            // Per-sub-block ideal scales
            let mut raw_scales = [0.0f32; SUB_BLOCKS];
            for (j, sub) in chunk.chunks(SUB_BLOCK_SIZE).enumerate() {
                let amax = sub.iter().fold(0.0f32, |m, x| m.max(x.abs()));
                raw_scales[j] = amax / SUB_Q_MAX;
            }

            let max_scale = raw_scales.iter().fold(0.0f32, |m, s| m.max(*s));
            let super_scale = f16::from_f32(max_scale / SCALE_Q_MAX);
            super_scales.push(super_scale.to_bits());
            let d = super_scale.to_f32();
            if d == 0.0 {
                continue;
            }

            for (j, sub) in chunk.chunks(SUB_BLOCK_SIZE).enumerate() {
                let m = (raw_scales[j] / d).round().clamp(0.0, SCALE_Q_MAX) as i8;
                sub_scales[sb * SUB_BLOCKS + j] = m;
                let eff = d * m as f32;
                if eff == 0.0 {
                    continue;
                }
                let inv = 1.0 / eff;
                for (i, &x) in sub.iter().enumerate() {
                    let idx = j * SUB_BLOCK_SIZE + i;
                    let q = ((x * inv).round() as i32 + Q_CENTER).clamp(0, 63) as u8;

                    let low_byte = &mut ql[sb * LOW_BYTES + idx / 2];
                    if idx % 2 == 0 {
                        *low_byte |= q & 0x0F;
                    } else {
                        *low_byte |= (q & 0x0F) << 4;
                    }

                    let high = (q >> 4) & 0x03;
                    qh[sb * HIGH_BYTES + idx / 4] |= high << ((idx % 4) * 2);
                }
            }
        }

        Self {
            n: src.len(),
            super_scales,
            sub_scales,
            ql,
            qh,
        }
    }

    pub fn dequantize_range(&self, start: usize, end: usize, out: &mut [f32]) -> VulcanResult<()> {
        range_check(self.n, start, end, out.len())?;
        for (o, i) in (start..end).enumerate() {
            let sb = i / SUPER_BLOCK_SIZE;
            let idx = i % SUPER_BLOCK_SIZE;
            let sub = idx / SUB_BLOCK_SIZE;

            let low_byte = self.ql[sb * LOW_BYTES + idx / 2];
            let low = if idx % 2 == 0 {
                low_byte & 0x0F
            } else {
                low_byte >> 4
            };
            let high = (self.qh[sb * HIGH_BYTES + idx / 4] >> ((idx % 4) * 2)) & 0x03;
            let q = (low | (high << 4)) as i32;

            let d = f16::from_bits(self.super_scales[sb]).to_f32();
            let m = self.sub_scales[sb * SUB_BLOCKS + sub] as f32;
            out[o] = d * m * (q - Q_CENTER) as f32;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    pub fn super_block_count(&self) -> usize {
        self.super_scales.len()
    }

    pub fn memory_usage(&self) -> usize {
        self.super_scales.len() * 2 + self.sub_scales.len() + self.ql.len() + self.qh.len()
    }
}
