/// Row-major matrix multiply
///
/// `C = A * B` for (M,K) x (K,N) -> (M,N). The naive loop is the reference;
/// the tiled variant blocks all three loops at `TILE` and accumulates into
/// the output with inner row-major access for cache locality. Rows are
/// distributed over rayon above a small threshold.
use super::dot::dot;
use crate::error::{VulcanError, VulcanResult};
use rayon::prelude::*;

const TILE: usize = 32;

/// Minimum M before the tiled kernel fans rows out to the rayon pool.
const PARALLEL_ROWS: usize = 8;

fn check_dims(
    a: &[f32],
    b: &[f32],
    out: &[f32],
    m: usize,
    k: usize,
    n: usize,
) -> VulcanResult<()> {
    if a.len() != m * k {
        return Err(VulcanError::ShapeMismatch {
            expected: m * k,
            actual: a.len(),
        });
    }
    if b.len() != k * n {
        return Err(VulcanError::ShapeMismatch {
            expected: k * n,
            actual: b.len(),
        });
    }
    if out.len() != m * n {
        return Err(VulcanError::ShapeMismatch {
            expected: m * n,
            actual: out.len(),
        });
    }
    Ok(())
}

/// Reference triple loop.
pub fn matmul_naive(
    a: &[f32],
    b: &[f32],
    m: usize,
    k: usize,
    n: usize,
    out: &mut [f32],
) -> VulcanResult<()> {
    check_dims(a, b, out, m, k, n)?;
    out.fill(0.0);
    for i in 0..m {
        for p in 0..k {
            let a_ip = a[i * k + p];
            let b_row = &b[p * n..(p + 1) * n];
            let out_row = &mut out[i * n..(i + 1) * n];
            for j in 0..n {
                out_row[j] += a_ip * b_row[j];
            }
        }
    }
    Ok(())
}

#[inline]
fn tiled_row_block(a: &[f32], b: &[f32], k: usize, n: usize, rows: usize, out: &mut [f32]) {
    out.fill(0.0);
    for kk in (0..k).step_by(TILE) {
        let k_end = (kk + TILE).min(k);
        for jj in (0..n).step_by(TILE) {
            let j_end = (jj + TILE).min(n);
            for i in 0..rows {
                let out_row = &mut out[i * n..(i + 1) * n];
                for p in kk..k_end {
                    let a_ip = a[i * k + p];
                    let b_row = &b[p * n..(p + 1) * n];
                    for j in jj..j_end {
                        out_row[j] += a_ip * b_row[j];
                    }
                }
            }
        }
    }
}

/// Cache-blocked multiply, tile size 32, rayon-parallel over row blocks.
pub fn matmul_tiled(
    a: &[f32],
    b: &[f32],
    m: usize,
    k: usize,
    n: usize,
    out: &mut [f32],
) -> VulcanResult<()> {
    check_dims(a, b, out, m, k, n)?;

    if m >= PARALLEL_ROWS {
        out.par_chunks_mut(TILE * n)
            .zip(a.par_chunks(TILE * k))
            .for_each(|(out_block, a_block)| {
                let rows = a_block.len() / k;
                tiled_row_block(a_block, b, k, n, rows, out_block);
            });
    } else {
        tiled_row_block(a, b, k, n, m, out);
    }
    Ok(())
}

/// Batched attention scores.
///
/// `q` and `key` are both (batch_heads, t, head_dim); the output is
/// (batch_heads, t, t) where `out[b][i][j] = dot(q[b][i], key[b][j])`.
/// The key operand plays the role of a transposed B so the inner loop is a
/// contiguous dot product.
pub fn matmul_batched_scores(
    q: &[f32],
    key: &[f32],
    batch_heads: usize,
    t: usize,
    head_dim: usize,
    out: &mut [f32],
) -> VulcanResult<()> {
    let per_mat = t * head_dim;
    if q.len() != batch_heads * per_mat || key.len() != batch_heads * per_mat {
        return Err(VulcanError::ShapeMismatch {
            expected: batch_heads * per_mat,
            actual: q.len().min(key.len()),
        });
    }
    if out.len() != batch_heads * t * t {
        return Err(VulcanError::ShapeMismatch {
            expected: batch_heads * t * t,
            actual: out.len(),
        });
    }

    out.par_chunks_mut(t * t)
        .enumerate()
        .for_each(|(bh, scores)| {
            let q_mat = &q[bh * per_mat..(bh + 1) * per_mat];
            let k_mat = &key[bh * per_mat..(bh + 1) * per_mat];
            for i in 0..t {
                let q_row = &q_mat[i * head_dim..(i + 1) * head_dim];
                for j in 0..t {
                    let k_row = &k_mat[j * head_dim..(j + 1) * head_dim];
                    scores[i * t + j] = dot(q_row, k_row);
                }
            }
        });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_naive_identity() {
        let a = vec![1.0, 2.0, 3.0, 4.0];
        let identity = vec![1.0, 0.0, 0.0, 1.0];
        let mut out = vec![0.0; 4];
        matmul_naive(&a, &identity, 2, 2, 2, &mut out).unwrap();
        assert_eq!(out, a);
    }

    #[test]
    fn test_tiled_matches_naive() {
        let m = 33;
        let k = 65;
        let n = 17;
        let a: Vec<f32> = (0..m * k).map(|i| ((i * 7) % 13) as f32 * 0.25 - 1.0).collect();
        let b: Vec<f32> = (0..k * n).map(|i| ((i * 5) % 11) as f32 * 0.5 - 2.0).collect();
        let mut naive = vec![0.0; m * n];
        let mut tiled = vec![0.0; m * n];
        matmul_naive(&a, &b, m, k, n, &mut naive).unwrap();
        matmul_tiled(&a, &b, m, k, n, &mut tiled).unwrap();
        for (x, y) in naive.iter().zip(tiled.iter()) {
            assert!((x - y).abs() < 1e-3, "{x} vs {y}");
        }
    }

    #[test]
    fn test_tiled_small_matrix_stays_serial() {
        let a = vec![2.0; 6];
        let b = vec![3.0; 6];
        let mut out = vec![0.0; 4];
        matmul_tiled(&a, &b, 2, 3, 2, &mut out).unwrap();
        for v in &out {
            assert_eq!(*v, 18.0);
        }
    }

    #[test]
    fn test_matmul_dim_mismatch() {
        let a = vec![0.0; 4];
        let b = vec![0.0; 4];
        let mut out = vec![0.0; 3];
        assert!(matmul_naive(&a, &b, 2, 2, 2, &mut out).is_err());
    }

    #[test]
    fn test_batched_scores() {
        // Two "heads", one token each of dim 2
        let q = vec![1.0, 0.0, 0.0, 2.0];
        let k = vec![3.0, 4.0, 5.0, 6.0];
        let mut out = vec![0.0; 2];
        matmul_batched_scores(&q, &k, 2, 1, 2, &mut out).unwrap();
        assert_eq!(out[0], 3.0);
        assert_eq!(out[1], 12.0);
    }

    #[test]
    fn test_batched_scores_square_output() {
        let bh = 3;
        let t = 4;
        let d = 8;
        let q: Vec<f32> = (0..bh * t * d).map(|i| (i % 7) as f32).collect();
        let k = q.clone();
        let mut out = vec![0.0; bh * t * t];
        matmul_batched_scores(&q, &k, bh, t, d, &mut out).unwrap();
        // Diagonal entries are squared norms, so strictly positive here
        for b in 0..bh {
            for i in 0..t {
                assert!(out[b * t * t + i * t + i] > 0.0);
            }
        }
    }
}
