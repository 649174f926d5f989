/// Causal self-attention over a full sequence (training path)
///
/// Computes `softmax(Q K^T / sqrt(head_dim)) V` per head with the causal
/// mask fused into the softmax. Supports grouped-query attention: query
/// heads broadcast-index K/V heads by integer division. The softmax
/// probabilities from the forward pass are kept for the backward closure.
///
/// The inference path does not use this op; it reads K/V incrementally from
/// the session cache inside the model.
use crate::error::{VulcanError, VulcanResult};
use crate::kernels::{dot, masked_softmax, matmul_batched_scores, scaled_add};
use crate::tensor::Tensor;

/// Head geometry for an attention call.
#[derive(Debug, Clone, Copy)]
pub struct AttentionShape {
    pub n_head: usize,
    pub n_kv_head: usize,
    pub head_dim: usize,
}

impl AttentionShape {
    pub fn validate(&self) -> VulcanResult<()> {
        if self.n_head == 0 || self.n_kv_head == 0 || self.head_dim == 0 {
            return Err(VulcanError::Validation(
                "attention dimensions must be > 0".to_string(),
            ));
        }
        if self.n_head % self.n_kv_head != 0 {
            return Err(VulcanError::Validation(format!(
                "n_head {} not divisible by n_kv_head {}",
                self.n_head, self.n_kv_head
            )));
        }
        Ok(())
    }

    pub fn q_width(&self) -> usize {
        self.n_head * self.head_dim
    }

    pub fn kv_width(&self) -> usize {
        self.n_kv_head * self.head_dim
    }
}

pub fn causal_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    shape: AttentionShape,
) -> VulcanResult<Tensor> {
    shape.validate()?;
    let q_width = shape.q_width();
    let kv_width = shape.kv_width();
    if q.len() % q_width != 0 {
        return Err(VulcanError::ShapeMismatch {
            expected: q_width,
            actual: q.len(),
        });
    }
    let t = q.len() / q_width;
    if k.len() != t * kv_width || v.len() != t * kv_width {
        return Err(VulcanError::ShapeMismatch {
            expected: t * kv_width,
            actual: k.len().min(v.len()),
        });
    }

    let group = shape.n_head / shape.n_kv_head;
    let hd = shape.head_dim;
    let scale = 1.0 / (hd as f32).sqrt();

    let q_data = q.data().to_vec();
    let k_data = k.data().to_vec();
    let v_data = v.data().to_vec();

    // Rearrange to head-major (n_head, t, head_dim); K/V heads broadcast
    // across their query-head group
    let mut q_heads = vec![0.0; shape.n_head * t * hd];
    let mut k_heads = vec![0.0; shape.n_head * t * hd];
    for h in 0..shape.n_head {
        let kvh = h / group;
        for i in 0..t {
            let at = (h * t + i) * hd;
            q_heads[at..at + hd]
                .copy_from_slice(&q_data[i * q_width + h * hd..i * q_width + (h + 1) * hd]);
            k_heads[at..at + hd]
                .copy_from_slice(&k_data[i * kv_width + kvh * hd..i * kv_width + (kvh + 1) * hd]);
        }
    }

    let mut probs = vec![0.0; shape.n_head * t * t];
    matmul_batched_scores(&q_heads, &k_heads, shape.n_head, t, hd, &mut probs)?;

    let mut out = vec![0.0; t * q_width];
    for h in 0..shape.n_head {
        let kvh = h / group;
        let scores = &mut probs[h * t * t..(h + 1) * t * t];
        masked_softmax(scores, t, t, scale, 0)?;

        for i in 0..t {
            let out_row = &mut out[i * q_width + h * hd..i * q_width + (h + 1) * hd];
            for j in 0..=i {
                let p = scores[i * t + j];
                let v_row = &v_data[j * kv_width + kvh * hd..j * kv_width + (kvh + 1) * hd];
                scaled_add(v_row, p, out_row)?;
            }
        }
    }

    let out_shape = [t, q_width];
    let needs_grad = q.requires_grad() || k.requires_grad() || v.requires_grad();
    if !needs_grad {
        return Ok(Tensor::from_op(out, &out_shape, Vec::new(), None));
    }

    let q_c = q.clone();
    let k_c = k.clone();
    let v_c = v.clone();

    let backward = Box::new(move |upstream: &[f32]| {
        let mut d_q = vec![0.0; t * q_width];
        let mut d_k = vec![0.0; t * kv_width];
        let mut d_v = vec![0.0; t * kv_width];
        let mut d_scores = vec![0.0; t * t];

        for h in 0..shape.n_head {
            let kvh = h / group;
            let p = &probs[h * t * t..(h + 1) * t * t];

            for i in 0..t {
                let up_row = &upstream[i * q_width + h * hd..i * q_width + (h + 1) * hd];

                // dP[i][j] = dot(upstream_i, V_j); softmax jacobian folds the
                // row-wise correction sum_j dP*p back in
                let mut row_correction = 0.0;
                for j in 0..=i {
                    let v_row =
                        &v_data[j * kv_width + kvh * hd..j * kv_width + (kvh + 1) * hd];
                    let dp = dot(up_row, v_row);
                    d_scores[i * t + j] = dp;
                    row_correction += dp * p[i * t + j];
                }
                for j in 0..=i {
                    let pij = p[i * t + j];
                    let ds = pij * (d_scores[i * t + j] - row_correction);

                    // dV accumulates across the query heads sharing this kv head
                    let dv_row =
                        &mut d_v[j * kv_width + kvh * hd..j * kv_width + (kvh + 1) * hd];
                    scaled_add(up_row, pij, dv_row).expect("attention backward: dv size");

                    let k_row =
                        &k_data[j * kv_width + kvh * hd..j * kv_width + (kvh + 1) * hd];
                    let dq_row =
                        &mut d_q[i * q_width + h * hd..i * q_width + (h + 1) * hd];
                    scaled_add(k_row, ds * scale, dq_row)
                        .expect("attention backward: dq size");

                    let q_row = &q_data[i * q_width + h * hd..i * q_width + (h + 1) * hd];
                    let dk_row =
                        &mut d_k[j * kv_width + kvh * hd..j * kv_width + (kvh + 1) * hd];
                    scaled_add(q_row, ds * scale, dk_row)
                        .expect("attention backward: dk size");
                }
            }
        }

        if q_c.requires_grad() {
            q_c.accumulate_grad(&d_q).expect("attention backward: q grad size");
        }
        if k_c.requires_grad() {
            k_c.accumulate_grad(&d_k).expect("attention backward: k grad size");
        }
        if v_c.requires_grad() {
            v_c.accumulate_grad(&d_v).expect("attention backward: v grad size");
        }
    });

    Ok(Tensor::from_op(
        out,
        &out_shape,
        vec![q.clone(), k.clone(), v.clone()],
        Some(backward),
    ))
}
