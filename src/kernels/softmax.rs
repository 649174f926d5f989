/// Numerically stable softmax kernels
///
/// Row-wise softmax subtracts the row maximum before exponentiating. The
/// fused masked variant applies the attention scale and causal mask in the
/// same pass and never calls `exp` on a masked position.
use crate::error::{VulcanError, VulcanResult};

/// In-place softmax over a single row.
pub fn softmax_row(row: &mut [f32]) {
    if row.is_empty() {
        return;
    }

    // Find max for numerical stability
    let max_val = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);

    // Compute exp and sum
    let mut sum_exp = 0.0;
    for v in row.iter_mut() {
        if v.is_finite() {
            *v = (*v - max_val).exp();
            sum_exp += *v;
        } else {
            *v = 0.0;
        }
    }

    // Normalize
    if sum_exp > 0.0 {
        let inv = 1.0 / sum_exp;
        for v in row.iter_mut() {
            *v *= inv;
        }
    }
}

/// In-place row-wise softmax over a (rows, cols) matrix.
pub fn softmax_rows(data: &mut [f32], cols: usize) -> VulcanResult<()> {
    if cols == 0 || data.len() % cols != 0 {
        return Err(VulcanError::ShapeMismatch {
            expected: cols.max(1),
            actual: data.len(),
        });
    }
    for row in data.chunks_mut(cols) {
        softmax_row(row);
    }
    Ok(())
}

/// Fused scale + causal mask + softmax for attention scores.
///
/// `scores` is a (rows, cols) matrix where row `i` holds the raw dot
/// products of query `i` against every cached key. Row `i` may attend to
/// columns `j <= cache_offset + i`; masked columns are zeroed, never
/// exponentiated, and excluded from the normalizing sum.
pub fn masked_softmax(
    scores: &mut [f32],
    rows: usize,
    cols: usize,
    scale: f32,
    cache_offset: usize,
) -> VulcanResult<()> {
    if scores.len() != rows * cols {
        return Err(VulcanError::ShapeMismatch {
            expected: rows * cols,
            actual: scores.len(),
        });
    }

    for (i, row) in scores.chunks_mut(cols).enumerate() {
        let valid = (cache_offset + i + 1).min(cols);
        let (active, masked) = row.split_at_mut(valid);

        // Scale and find max over the valid prefix only
        let mut max_val = f32::NEG_INFINITY;
        for v in active.iter_mut() {
            *v *= scale;
            max_val = max_val.max(*v);
        }

        let mut sum_exp = 0.0;
        for v in active.iter_mut() {
            *v = (*v - max_val).exp();
            sum_exp += *v;
        }
        if sum_exp > 0.0 {
            let inv = 1.0 / sum_exp;
            for v in active.iter_mut() {
                *v *= inv;
            }
        }

        // Masked positions contribute nothing downstream
        for v in masked.iter_mut() {
            *v = 0.0;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_softmax_sums_to_one() {
        let mut row = vec![1.0, 2.0, 3.0, 4.0];
        softmax_row(&mut row);
        let sum: f32 = row.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        // Monotonic in the inputs
        assert!(row[3] > row[2] && row[2] > row[1] && row[1] > row[0]);
    }

    #[test]
    fn test_softmax_shift_invariance() {
        let mut a = vec![0.5, -1.0, 2.0];
        let mut b: Vec<f32> = a.iter().map(|x| x + 100.0).collect();
        softmax_row(&mut a);
        softmax_row(&mut b);
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[test]
    fn test_softmax_handles_large_magnitudes() {
        let mut row = vec![1000.0, 1000.0];
        softmax_row(&mut row);
        assert!((row[0] - 0.5).abs() < 1e-5);
        assert!(row.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_softmax_rows_shape_check() {
        let mut data = vec![0.0; 7];
        assert!(softmax_rows(&mut data, 3).is_err());
    }

    #[test]
    fn test_masked_softmax_causal_pattern() {
        // 3 new tokens, no cache: row i sees columns 0..=i
        let mut scores = vec![1.0; 9];
        masked_softmax(&mut scores, 3, 3, 1.0, 0).unwrap();

        assert!((scores[0] - 1.0).abs() < 1e-6);
        assert_eq!(scores[1], 0.0);
        assert_eq!(scores[2], 0.0);

        assert!((scores[3] - 0.5).abs() < 1e-6);
        assert!((scores[4] - 0.5).abs() < 1e-6);
        assert_eq!(scores[5], 0.0);

        let last_row_sum: f32 = scores[6..9].iter().sum();
        assert!((last_row_sum - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_masked_softmax_with_cache_offset() {
        // One new token with 3 cached positions sees all 4 columns
        let mut scores = vec![0.0; 4];
        masked_softmax(&mut scores, 1, 4, 0.5, 3).unwrap();
        let sum: f32 = scores.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        for v in &scores {
            assert!((v - 0.25).abs() < 1e-5);
        }
    }

    #[test]
    fn test_masked_softmax_never_exponentiates_masked() {
        // Masked columns hold a poison value that would overflow exp
        let mut scores = vec![0.0, f32::MAX, f32::MAX];
        masked_softmax(&mut scores, 1, 3, 1.0, 0).unwrap();
        assert_eq!(scores[0], 1.0);
        assert_eq!(scores[1], 0.0);
        assert_eq!(scores[2], 0.0);
    }
}
