/// Rotary positional embeddings
///
/// Precomputed cos/sin tables over (max_seq_len, head_dim / 2). Adjacent
/// element pairs within each head are rotated by a position-dependent
/// angle; inverse frequencies follow `1 / theta^(2i / head_dim)`. The
/// cached K is stored after this rotation, so attention never re-rotates.
use std::sync::Arc;

use crate::error::{VulcanError, VulcanResult};
use crate::tensor::Tensor;

pub struct RopeTable {
    head_dim: usize,
    max_seq_len: usize,
    cos: Vec<f32>,
    sin: Vec<f32>,
}

impl RopeTable {
    pub fn new(head_dim: usize, max_seq_len: usize, theta: f32) -> VulcanResult<Self> {
        if head_dim == 0 || head_dim % 2 != 0 {
            return Err(VulcanError::Validation(
                "head_dim must be a positive even number".to_string(),
            ));
        }
        let half = head_dim / 2;
        let mut cos = vec![0.0; max_seq_len * half];
        let mut sin = vec![0.0; max_seq_len * half];
        for pos in 0..max_seq_len {
            for i in 0..half {
                let freq = 1.0 / theta.powf(2.0 * i as f32 / head_dim as f32);
                let angle = pos as f32 * freq;
                cos[pos * half + i] = angle.cos();
                sin[pos * half + i] = angle.sin();
            }
        }
        Ok(Self {
            head_dim,
            max_seq_len,
            cos,
            sin,
        })
    }

    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    fn rotate(&self, x: &mut [f32], n_heads: usize, start_pos: usize, invert: bool) -> VulcanResult<()> {
        let width = n_heads * self.head_dim;
        if width == 0 || x.len() % width != 0 {
            return Err(VulcanError::ShapeMismatch {
                expected: width.max(1),
                actual: x.len(),
            });
        }
        let rows = x.len() / width;
        if start_pos + rows > self.max_seq_len {
            return Err(VulcanError::Validation(format!(
                "positions {}..{} exceed the rope table length {}",
                start_pos,
                start_pos + rows,
                self.max_seq_len
            )));
        }

        let half = self.head_dim / 2;
        for (row, chunk) in x.chunks_mut(width).enumerate() {
            let pos = start_pos + row;
            let cos_row = &self.cos[pos * half..(pos + 1) * half];
            let sin_row = &self.sin[pos * half..(pos + 1) * half];
            for head in chunk.chunks_mut(self.head_dim) {
                for i in 0..half {
                    let c = cos_row[i];
                    let s = if invert { -sin_row[i] } else { sin_row[i] };
                    let x0 = head[2 * i];
                    let x1 = head[2 * i + 1];
                    head[2 * i] = x0 * c - x1 * s;
                    head[2 * i + 1] = x0 * s + x1 * c;
                }
            }
        }
        Ok(())
    }

    /// Rotate `(rows, n_heads * head_dim)` in place, row r at position
    /// `start_pos + r`.
    pub fn apply(&self, x: &mut [f32], n_heads: usize, start_pos: usize) -> VulcanResult<()> {
        self.rotate(x, n_heads, start_pos, false)
    }

    /// Inverse rotation; the transpose of `apply` (rotations are orthogonal).
    pub fn apply_inverse(&self, x: &mut [f32], n_heads: usize, start_pos: usize) -> VulcanResult<()> {
        self.rotate(x, n_heads, start_pos, true)
    }
}

/// Autograd wrapper: rotation forward, inverse rotation on the gradient.
pub fn rope_op(
    x: &Tensor,
    n_heads: usize,
    table: Arc<RopeTable>,
    start_pos: usize,
) -> VulcanResult<Tensor> {
    let shape = x.shape();
    let mut out = x.data().to_vec();
    table.apply(&mut out, n_heads, start_pos)?;

    if !x.requires_grad() {
        return Ok(Tensor::from_op(out, &shape, Vec::new(), None));
    }

    let x_c = x.clone();
    let backward = Box::new(move |upstream: &[f32]| {
        let mut d_x = upstream.to_vec();
        table
            .apply_inverse(&mut d_x, n_heads, start_pos)
            .expect("rope backward: validated shape");
        x_c.accumulate_grad(&d_x).expect("rope backward: grad size");
    });

    Ok(Tensor::from_op(
        out,
        &shape,
        vec![x.clone()],
        Some(backward),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_zero_is_identity() {
        let table = RopeTable::new(4, 8, 10_000.0).unwrap();
        let mut x = vec![1.0, 2.0, 3.0, 4.0];
        table.apply(&mut x, 1, 0).unwrap();
        assert_eq!(x, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_rotation_preserves_norm() {
        let table = RopeTable::new(4, 8, 10_000.0).unwrap();
        let original = vec![1.0, 2.0, 3.0, 4.0];
        let mut x = original.clone();
        table.apply(&mut x, 1, 5).unwrap();
        let norm_before: f32 = original.iter().map(|v| v * v).sum();
        let norm_after: f32 = x.iter().map(|v| v * v).sum();
        assert!((norm_before - norm_after).abs() < 1e-4);
        assert_ne!(x, original);
    }

    #[test]
    fn test_inverse_round_trips() {
        let table = RopeTable::new(8, 16, 10_000.0).unwrap();
        let original: Vec<f32> = (0..16).map(|i| i as f32 * 0.3).collect();
        let mut x = original.clone();
        table.apply(&mut x, 2, 3).unwrap();
        table.apply_inverse(&mut x, 2, 3).unwrap();
        for (a, b) in original.iter().zip(x.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_relative_angle_property() {
        // The dot product of two rotated vectors depends only on the
        // position difference
        let table = RopeTable::new(2, 32, 10_000.0).unwrap();
        let q = vec![1.0f32, 0.5];
        let k = vec![0.3f32, -0.8];

        let dot_at = |pq: usize, pk: usize| {
            let mut qr = q.clone();
            let mut kr = k.clone();
            table.apply(&mut qr, 1, pq).unwrap();
            table.apply(&mut kr, 1, pk).unwrap();
            qr[0] * kr[0] + qr[1] * kr[1]
        };

        assert!((dot_at(5, 3) - dot_at(10, 8)).abs() < 1e-4);
    }

    #[test]
    fn test_table_length_enforced() {
        let table = RopeTable::new(4, 4, 10_000.0).unwrap();
        let mut x = vec![0.0; 8];
        assert!(table.apply(&mut x, 1, 3).is_err());
    }

    #[test]
    fn test_odd_head_dim_rejected() {
        assert!(RopeTable::new(3, 8, 10_000.0).is_err());
    }

    #[test]
    fn test_rope_op_backward_is_inverse_rotation() {
        let table = Arc::new(RopeTable::new(2, 8, 10_000.0).unwrap());
        let x = Tensor::from_vec(vec![1.0, 0.0], &[1, 2], true).unwrap();
        let out = rope_op(&x, 1, table.clone(), 4).unwrap();

        out.accumulate_grad(&[1.0, 0.0]).unwrap();
        let f = out.take_backward_fn().unwrap();
        f(&out.grad_or_zeros());

        // Gradient of a pure rotation is the inverse rotation of upstream
        let mut expected = vec![1.0, 0.0];
        table.apply_inverse(&mut expected, 1, 4).unwrap();
        let g = x.grad().unwrap();
        assert!((g[0] - expected[0]).abs() < 1e-6);
        assert!((g[1] - expected[1]).abs() < 1e-6);
    }
}
