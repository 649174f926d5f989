/// Q4_0: block-wise symmetric 4-bit quantization
///
/// Nibble-packed payload, two elements per byte (even index in the low
/// nibble, odd in the high). Nibbles decode as two's complement: 0..7 map to
/// themselves, 8..15 map to -8..-1. Dequantization is `q * scale`.
use super::range_check;
use crate::error::{VulcanError, VulcanResult};

pub const DEFAULT_BLOCK_SIZE: usize = 64;
const Q_MAX: f32 = 7.0;

#[derive(Debug, Clone)]
pub struct Q4_0Tensor {
    n: usize,
    block_size: usize,
    scales: Vec<f32>,
    qs: Vec<u8>,
}

#[inline]
fn decode_nibble(v: u8) -> i32 {
    // Two's complement over 4 bits
    if v < 8 {
        v as i32
    } else {
        v as i32 - 16
    }
}

impl Q4_0Tensor {
    pub fn quantize(src: &[f32], block_size: usize) -> VulcanResult<Self> {
        if block_size == 0 || block_size % 2 != 0 {
            return Err(VulcanError::Validation(
                "block_size must be a positive even number".to_string(),
            ));
        }
        let num_blocks = src.len().div_ceil(block_size);
        let mut scales = Vec::with_capacity(num_blocks);
        let mut qs = vec![0u8; num_blocks * block_size / 2];

        for (b, chunk) in src.chunks(block_size).enumerate() {
            let amax = chunk.iter().fold(0.0f32, |m, x| m.max(x.abs()));
            let scale = amax / Q_MAX;
            scales.push(scale);
            if scale == 0.0 {
                continue;
            }
            let inv = 1.0 / scale;
            for (i, &x) in chunk.iter().enumerate() {
                let q = (x * inv).round().clamp(-8.0, 7.0) as i32;
                let nibble = (q & 0x0F) as u8;
                let byte = &mut qs[b * block_size / 2 + i / 2];
                if i % 2 == 0 {
                    *byte |= nibble;
                } else {
                    *byte |= nibble << 4;
                }
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
            let byte = self.qs[i / 2];
            let nibble = if i % 2 == 0 { byte & 0x0F } else { byte >> 4 };
            out[o] = decode_nibble(nibble) as f32 * scale;
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_error_within_step() {
        let src: Vec<f32> = (0..128).map(|i| ((i * 13) % 29) as f32 * 0.1 - 1.4).collect();
        let q = Q4_0Tensor::quantize(&src, DEFAULT_BLOCK_SIZE).unwrap();
        let mut out = vec![0.0; 128];
        q.dequantize_range(0, 128, &mut out).unwrap();
        let amax = src.iter().fold(0.0f32, |m, x| m.max(x.abs()));
        for (a, b) in src.iter().zip(out.iter()) {
            assert!((a - b).abs() <= amax / Q_MAX, "{a} vs {b}");
        }
    }

    #[test]
    fn test_negative_values_decode_twos_complement() {
        let src = vec![-7.0, 7.0];
        let q = Q4_0Tensor::quantize(&src, 2).unwrap();
        let mut out = vec![0.0; 2];
        q.dequantize_range(0, 2, &mut out).unwrap();
        assert!((out[0] + 7.0).abs() < 1e-5);
        assert!((out[1] - 7.0).abs() < 1e-5);
    }

    #[test]
    fn test_payload_is_half_a_byte_per_element() {
        let src = vec![1.0; 64];
        let q = Q4_0Tensor::quantize(&src, 64).unwrap();
        assert_eq!(q.qs.len(), 32);
    }

    #[test]
    fn test_odd_block_size_rejected() {
        assert!(Q4_0Tensor::quantize(&[1.0], 3).is_err());
    }

    #[test]
    fn test_second_round_is_lossless() {
        let src: Vec<f32> = (0..64).map(|i| (i as f32 * 0.7).sin()).collect();
        let q1 = Q4_0Tensor::quantize(&src, 64).unwrap();
        let mut once = vec![0.0; 64];
        q1.dequantize_range(0, 64, &mut once).unwrap();

        let q2 = Q4_0Tensor::quantize(&once, 64).unwrap();
        let mut twice = vec![0.0; 64];
        q2.dequantize_range(0, 64, &mut twice).unwrap();
        assert_eq!(once, twice);
    }
}
