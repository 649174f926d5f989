/// Layer normalization
///
/// Two passes per row: Welford's algorithm for a numerically stable mean and
/// variance, then a vectorized affine transform
/// `gamma * ((x - mean) * inv_std) + beta` with `inv_std = 1/sqrt(var + eps)`.
use super::{check_same_len, LANES};
use crate::error::{VulcanError, VulcanResult};

pub const LAYER_NORM_EPS: f32 = 1e-5;

/// Welford mean/variance over one row.
#[inline]
fn welford(row: &[f32]) -> (f32, f32) {
    let mut mean = 0.0f64;
    let mut m2 = 0.0f64;
    for (i, &x) in row.iter().enumerate() {
        let x = x as f64;
        let delta = x - mean;
        mean += delta / (i + 1) as f64;
        m2 += delta * (x - mean);
    }
    let var = if row.is_empty() {
        0.0
    } else {
        m2 / row.len() as f64
    };
    (mean as f32, var as f32)
}

/// Normalize each row of `input` (rows x cols) into `out`.
pub fn layer_norm_rows(
    input: &[f32],
    gamma: &[f32],
    beta: &[f32],
    cols: usize,
    out: &mut [f32],
) -> VulcanResult<()> {
    if cols == 0 || input.len() % cols != 0 {
        return Err(VulcanError::ShapeMismatch {
            expected: cols.max(1),
            actual: input.len(),
        });
    }
    check_same_len(cols, gamma.len())?;
    check_same_len(cols, beta.len())?;
    check_same_len(input.len(), out.len())?;

    for (row, out_row) in input.chunks(cols).zip(out.chunks_mut(cols)) {
        let (mean, var) = welford(row);
        let inv_std = 1.0 / (var + LAYER_NORM_EPS).sqrt();

        let chunks = cols / LANES * LANES;
        for j in (0..chunks).step_by(LANES) {
            for l in 0..LANES {
                out_row[j + l] = gamma[j + l] * ((row[j + l] - mean) * inv_std) + beta[j + l];
            }
        }
        for j in chunks..cols {
            out_row[j] = gamma[j] * ((row[j] - mean) * inv_std) + beta[j];
        }
    }
    Ok(())
}

/// Like `layer_norm_rows` but also records per-row (mean, inv_std), which the
/// backward pass needs.
pub fn layer_norm_stats(
    input: &[f32],
    gamma: &[f32],
    beta: &[f32],
    cols: usize,
    out: &mut [f32],
    means: &mut [f32],
    inv_stds: &mut [f32],
) -> VulcanResult<()> {
    if cols == 0 || input.len() % cols != 0 {
        return Err(VulcanError::ShapeMismatch {
            expected: cols.max(1),
            actual: input.len(),
        });
    }
    let rows = input.len() / cols;
    check_same_len(rows, means.len())?;
    check_same_len(rows, inv_stds.len())?;
    check_same_len(cols, gamma.len())?;
    check_same_len(cols, beta.len())?;
    check_same_len(input.len(), out.len())?;

    for (r, (row, out_row)) in input.chunks(cols).zip(out.chunks_mut(cols)).enumerate() {
        let (mean, var) = welford(row);
        let inv_std = 1.0 / (var + LAYER_NORM_EPS).sqrt();
        means[r] = mean;
        inv_stds[r] = inv_std;
        for j in 0..cols {
            out_row[j] = gamma[j] * ((row[j] - mean) * inv_std) + beta[j];
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_norm_zero_mean_unit_variance() {
        let input: Vec<f32> = (0..16).map(|i| i as f32).collect();
        let gamma = vec![1.0; 16];
        let beta = vec![0.0; 16];
        let mut out = vec![0.0; 16];
        layer_norm_rows(&input, &gamma, &beta, 16, &mut out).unwrap();

        let mean: f32 = out.iter().sum::<f32>() / 16.0;
        let var: f32 = out.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / 16.0;
        assert!(mean.abs() < 1e-5);
        assert!((var - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_layer_norm_affine() {
        let input = vec![1.0, 2.0, 3.0, 4.0];
        let gamma = vec![2.0; 4];
        let beta = vec![10.0; 4];
        let mut out = vec![0.0; 4];
        layer_norm_rows(&input, &gamma, &beta, 4, &mut out).unwrap();

        let mean: f32 = out.iter().sum::<f32>() / 4.0;
        assert!((mean - 10.0).abs() < 1e-4);
    }

    #[test]
    fn test_layer_norm_constant_row_is_finite() {
        // Zero variance: eps keeps inv_std finite
        let input = vec![3.0; 8];
        let gamma = vec![1.0; 8];
        let beta = vec![0.0; 8];
        let mut out = vec![f32::NAN; 8];
        layer_norm_rows(&input, &gamma, &beta, 8, &mut out).unwrap();
        assert!(out.iter().all(|v| v.is_finite()));
        assert!(out.iter().all(|v| v.abs() < 1e-2));
    }

    #[test]
    fn test_layer_norm_stats_recorded() {
        let input = vec![0.0, 2.0, 4.0, 6.0];
        let gamma = vec![1.0; 2];
        let beta = vec![0.0; 2];
        let mut out = vec![0.0; 4];
        let mut means = vec![0.0; 2];
        let mut inv_stds = vec![0.0; 2];
        layer_norm_stats(&input, &gamma, &beta, 2, &mut out, &mut means, &mut inv_stds).unwrap();
        assert!((means[0] - 1.0).abs() < 1e-6);
        assert!((means[1] - 5.0).abs() < 1e-6);
        assert!(inv_stds.iter().all(|v| *v > 0.0));
    }

    #[test]
    fn test_layer_norm_gamma_length_mismatch() {
        let input = vec![0.0; 4];
        let gamma = vec![1.0; 3];
        let beta = vec![0.0; 4];
        let mut out = vec![0.0; 4];
        assert!(layer_norm_rows(&input, &gamma, &beta, 4, &mut out).is_err());
    }
}
