/// Block-quantized tensor storage
///
/// Two-dimensional rows x cols matrices stored as fixed-size blocks over the
/// flat row-major element order. Each scheme keeps flat metadata and payload
/// vectors rather than per-block structs so payloads stay contiguous, the
/// same layout the quantized KV cache uses. Dequantization of a given byte
/// stream is deterministic: same bytes, same floats.
pub mod q4_0;
pub mod q4_1;
pub mod q5_0;
pub mod q6_k;
pub mod q8_0;

use crate::error::{VulcanError, VulcanResult};
use serde::{Deserialize, Serialize};

/// Supported block-quantization schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[allow(non_camel_case_types)]
pub enum QuantScheme {
    /// 8-bit symmetric, f32 scale per block.
    Q8_0,
    /// 4-bit symmetric two's complement, f32 scale per block.
    Q4_0,
    /// 4-bit asymmetric, f32 scale + min per block.
    Q4_1,
    /// 5-bit symmetric, low nibble + high-bit bitmap per block.
    Q5_0,
    /// 6-bit super-block of 256 with fp16 super-scale and 16 int8 sub-scales.
    Q6K,
}

/// Storage for one quantized scheme.
#[derive(Debug, Clone)]
pub enum QuantizedData {
    Q8_0(q8_0::Q8_0Tensor),
    Q4_0(q4_0::Q4_0Tensor),
    Q4_1(q4_1::Q4_1Tensor),
    Q5_0(q5_0::Q5_0Tensor),
    Q6K(q6_k::Q6KTensor),
}

/// A rows x cols matrix held in block-quantized form.
#[derive(Debug, Clone)]
pub struct QuantizedMatrix {
    rows: usize,
    cols: usize,
    data: QuantizedData,
}

impl QuantizedMatrix {
    /// Quantize a row-major matrix with the given scheme.
    pub fn quantize(src: &[f32], rows: usize, cols: usize, scheme: QuantScheme) -> VulcanResult<Self> {
        if src.len() != rows * cols {
            return Err(VulcanError::ShapeMismatch {
                expected: rows * cols,
                actual: src.len(),
            });
        }
        let data = match scheme {
            QuantScheme::Q8_0 => QuantizedData::Q8_0(q8_0::Q8_0Tensor::quantize(src, q8_0::DEFAULT_BLOCK_SIZE)?),
            QuantScheme::Q4_0 => QuantizedData::Q4_0(q4_0::Q4_0Tensor::quantize(src, q4_0::DEFAULT_BLOCK_SIZE)?),
            QuantScheme::Q4_1 => QuantizedData::Q4_1(q4_1::Q4_1Tensor::quantize(src)),
            QuantScheme::Q5_0 => QuantizedData::Q5_0(q5_0::Q5_0Tensor::quantize(src)),
            QuantScheme::Q6K => QuantizedData::Q6K(q6_k::Q6KTensor::quantize(src)),
        };
        Ok(Self { rows, cols, data })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn scheme(&self) -> QuantScheme {
        match &self.data {
            QuantizedData::Q8_0(_) => QuantScheme::Q8_0,
            QuantizedData::Q4_0(_) => QuantScheme::Q4_0,
            QuantizedData::Q4_1(_) => QuantScheme::Q4_1,
            QuantizedData::Q5_0(_) => QuantScheme::Q5_0,
            QuantizedData::Q6K(_) => QuantScheme::Q6K,
        }
    }

    /// Dequantize one row into `out` (length `cols`).
    pub fn dequantize_row(&self, row: usize, out: &mut [f32]) -> VulcanResult<()> {
        if row >= self.rows {
            return Err(VulcanError::Validation(format!(
                "row {} out of bounds for {} rows",
                row, self.rows
            )));
        }
        if out.len() != self.cols {
            return Err(VulcanError::ShapeMismatch {
                expected: self.cols,
                actual: out.len(),
            });
        }
        let start = row * self.cols;
        let end = start + self.cols;
        self.dequantize_range(start, end, out)
    }

    /// Dequantize the full matrix into `out` (length rows * cols).
    pub fn dequantize(&self, out: &mut [f32]) -> VulcanResult<()> {
        if out.len() != self.rows * self.cols {
            return Err(VulcanError::ShapeMismatch {
                expected: self.rows * self.cols,
                actual: out.len(),
            });
        }
        self.dequantize_range(0, self.rows * self.cols, out)
    }

    fn dequantize_range(&self, start: usize, end: usize, out: &mut [f32]) -> VulcanResult<()> {
        match &self.data {
            QuantizedData::Q8_0(t) => t.dequantize_range(start, end, out),
            QuantizedData::Q4_0(t) => t.dequantize_range(start, end, out),
            QuantizedData::Q4_1(t) => t.dequantize_range(start, end, out),
            QuantizedData::Q5_0(t) => t.dequantize_range(start, end, out),
            QuantizedData::Q6K(t) => t.dequantize_range(start, end, out),
        }
    }

    /// Bytes retained by the quantized payload and metadata.
    pub fn memory_usage(&self) -> usize {
        match &self.data {
            QuantizedData::Q8_0(t) => t.memory_usage(),
            QuantizedData::Q4_0(t) => t.memory_usage(),
            QuantizedData::Q4_1(t) => t.memory_usage(),
            QuantizedData::Q5_0(t) => t.memory_usage(),
            QuantizedData::Q6K(t) => t.memory_usage(),
        }
    }
}

pub(crate) fn range_check(n: usize, start: usize, end: usize, out_len: usize) -> VulcanResult<()> {
    if start > end || end > n {
        return Err(VulcanError::Validation(format!(
            "dequantize range {start}..{end} out of bounds for {n} elements"
        )));
    }
    if out_len != end - start {
        return Err(VulcanError::ShapeMismatch {
            expected: end - start,
            actual: out_len,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(n: usize) -> Vec<f32> {
        (0..n).map(|i| (i as f32 * 0.37).sin() * 4.0).collect()
    }

    #[test]
    fn test_matrix_round_trip_all_schemes() {
        let rows = 4;
        let cols = 64;
        let src = ramp(rows * cols);
        for scheme in [
            QuantScheme::Q8_0,
            QuantScheme::Q4_0,
            QuantScheme::Q4_1,
            QuantScheme::Q5_0,
            QuantScheme::Q6K,
        ] {
            let q = QuantizedMatrix::quantize(&src, rows, cols, scheme).unwrap();
            let mut out = vec![0.0; rows * cols];
            q.dequantize(&mut out).unwrap();
            let max_err = src
                .iter()
                .zip(out.iter())
                .map(|(a, b)| (a - b).abs())
                .fold(0.0f32, f32::max);
            // 4-bit is the loosest format: half a step of range/15
            assert!(max_err < 8.0 / 15.0 + 1e-3, "{scheme:?}: max_err {max_err}");
        }
    }

    #[test]
    fn test_dequantize_row_matches_full() {
        let rows = 3;
        let cols = 50;
        let src = ramp(rows * cols);
        let q = QuantizedMatrix::quantize(&src, rows, cols, QuantScheme::Q5_0).unwrap();

        let mut full = vec![0.0; rows * cols];
        q.dequantize(&mut full).unwrap();

        let mut row = vec![0.0; cols];
        q.dequantize_row(1, &mut row).unwrap();
        assert_eq!(&full[cols..2 * cols], row.as_slice());
    }

    #[test]
    fn test_quantize_rejects_bad_shape() {
        let src = vec![0.0; 10];
        assert!(QuantizedMatrix::quantize(&src, 3, 4, QuantScheme::Q8_0).is_err());
    }

    #[test]
    fn test_row_out_of_bounds() {
        let src = vec![0.0; 8];
        let q = QuantizedMatrix::quantize(&src, 2, 4, QuantScheme::Q8_0).unwrap();
        let mut out = vec![0.0; 4];
        assert!(q.dequantize_row(2, &mut out).is_err());
    }

    #[test]
    fn test_memory_usage_smaller_than_f32() {
        let src = ramp(1024);
        for scheme in [QuantScheme::Q8_0, QuantScheme::Q4_0, QuantScheme::Q6K] {
            let q = QuantizedMatrix::quantize(&src, 4, 256, scheme).unwrap();
            assert!(q.memory_usage() < 1024 * 4, "{scheme:?}");
        }
    }
}
