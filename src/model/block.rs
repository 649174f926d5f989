/// Decoder block: pre-norm attention and MLP with residual connections
///
/// Projection weights keep an f32 master parameter for training and may
/// carry a block-quantized copy used by the inference path. The inference
/// forward works on plain buffers and a bound cache session; the training
/// forward composes autograd layer ops over the full sequence.
use rand::rngs::StdRng;
use rand::Rng;
use std::sync::Arc;

use super::rope::{rope_op, RopeTable};
use super::ModelConfig;
use crate::cache::KvSession;
use crate::error::{VulcanError, VulcanResult};
use crate::kernels::{dot, gelu, layer_norm_rows, masked_softmax, matmul_tiled, scaled_add};
use crate::layers::{
    causal_attention, gelu_op, layer_norm, linear, residual_add, AttentionShape,
};
use crate::quant::{QuantScheme, QuantizedMatrix};
use crate::tensor::{Parameter, Tensor};

/// A projection weight: f32 parameter plus optional quantized copy.
pub struct MatrixWeights {
    param: Parameter,
    quantized: Option<QuantizedMatrix>,
    in_features: usize,
    out_features: usize,
}

impl MatrixWeights {
    pub fn new(
        name: impl Into<String>,
        in_features: usize,
        out_features: usize,
        rng: &mut StdRng,
    ) -> VulcanResult<Self> {
        let data: Vec<f32> = (0..in_features * out_features)
            .map(|_| rng.gen_range(-0.02..0.02))
            .collect();
        Ok(Self {
            param: Parameter::new(name, data, &[in_features, out_features])?,
            quantized: None,
            in_features,
            out_features,
        })
    }

    pub fn param(&self) -> &Parameter {
        &self.param
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    /// Build the quantized inference copy from the current f32 weights.
    pub fn quantize(&mut self, scheme: QuantScheme) -> VulcanResult<()> {
        self.quantized = Some(QuantizedMatrix::quantize(
            &self.param.tensor().data(),
            self.in_features,
            self.out_features,
            scheme,
        )?);
        Ok(())
    }

    /// Inference matmul: `out = input @ W` for input (rows, in_features).
    ///
    /// The quantized path dequantizes one weight row at a time into a
    /// scratch buffer and accumulates, so the full matrix is never
    /// materialized in f32.
    pub fn apply(&self, input: &[f32], rows: usize, out: &mut [f32]) -> VulcanResult<()> {
        if input.len() != rows * self.in_features {
            return Err(VulcanError::ShapeMismatch {
                expected: rows * self.in_features,
                actual: input.len(),
            });
        }
        if out.len() != rows * self.out_features {
            return Err(VulcanError::ShapeMismatch {
                expected: rows * self.out_features,
                actual: out.len(),
            });
        }
        match &self.quantized {
            None => matmul_tiled(
                input,
                &self.param.tensor().data(),
                rows,
                self.in_features,
                self.out_features,
                out,
            ),
            Some(q) => {
                out.fill(0.0);
                let mut w_row = vec![0.0; self.out_features];
                for i in 0..self.in_features {
                    q.dequantize_row(i, &mut w_row)?;
                    for r in 0..rows {
                        let coeff = input[r * self.in_features + i];
                        let out_row = &mut out[r * self.out_features..(r + 1) * self.out_features];
                        scaled_add(&w_row, coeff, out_row)?;
                    }
                }
                Ok(())
            }
        }
    }
}

/// Per-layer weights for one decoder block.
pub struct DecoderBlock {
    ln1_gamma: Parameter,
    ln1_beta: Parameter,
    wq: MatrixWeights,
    wk: MatrixWeights,
    wv: MatrixWeights,
    wo: MatrixWeights,
    ln2_gamma: Parameter,
    ln2_beta: Parameter,
    w1: MatrixWeights,
    w2: MatrixWeights,
}

impl DecoderBlock {
    pub fn new(layer: usize, config: &ModelConfig, rng: &mut StdRng) -> VulcanResult<Self> {
        let d = config.n_embd;
        let kv = config.kv_width();
        let hidden = 4 * d;
        let p = |suffix: &str| format!("blocks.{layer}.{suffix}");
        Ok(Self {
            ln1_gamma: Parameter::new(p("ln1.gamma"), vec![1.0; d], &[d])?,
            ln1_beta: Parameter::new(p("ln1.beta"), vec![0.0; d], &[d])?,
            wq: MatrixWeights::new(p("attn.wq"), d, d, rng)?,
            wk: MatrixWeights::new(p("attn.wk"), d, kv, rng)?,
            wv: MatrixWeights::new(p("attn.wv"), d, kv, rng)?,
            wo: MatrixWeights::new(p("attn.wo"), d, d, rng)?,
            ln2_gamma: Parameter::new(p("ln2.gamma"), vec![1.0; d], &[d])?,
            ln2_beta: Parameter::new(p("ln2.beta"), vec![0.0; d], &[d])?,
            w1: MatrixWeights::new(p("mlp.w1"), d, hidden, rng)?,
            w2: MatrixWeights::new(p("mlp.w2"), hidden, d, rng)?,
        })
    }

    pub fn parameters(&self) -> Vec<Parameter> {
        vec![
            self.ln1_gamma.clone(),
            self.ln1_beta.clone(),
            self.wq.param().clone(),
            self.wk.param().clone(),
            self.wv.param().clone(),
            self.wo.param().clone(),
            self.ln2_gamma.clone(),
            self.ln2_beta.clone(),
            self.w1.param().clone(),
            self.w2.param().clone(),
        ]
    }

    pub fn quantize_weights(&mut self, scheme: QuantScheme) -> VulcanResult<()> {
        self.wq.quantize(scheme)?;
        self.wk.quantize(scheme)?;
        self.wv.quantize(scheme)?;
        self.wo.quantize(scheme)?;
        self.w1.quantize(scheme)?;
        self.w2.quantize(scheme)?;
        Ok(())
    }

    /// Training forward over a full sequence; builds the autograd graph.
    pub fn forward_train(
        &self,
        x: &Tensor,
        config: &ModelConfig,
        rope: &Arc<RopeTable>,
    ) -> VulcanResult<Tensor> {
        let attn_shape = AttentionShape {
            n_head: config.n_head,
            n_kv_head: config.n_kv_head,
            head_dim: config.head_dim(),
        };

        let h = layer_norm(x, self.ln1_gamma.tensor(), self.ln1_beta.tensor())?;
        let q = linear(&h, self.wq.param().tensor(), None)?;
        let k = linear(&h, self.wk.param().tensor(), None)?;
        let v = linear(&h, self.wv.param().tensor(), None)?;
        let q = rope_op(&q, config.n_head, rope.clone(), 0)?;
        let k = rope_op(&k, config.n_kv_head, rope.clone(), 0)?;
        let attn = causal_attention(&q, &k, &v, attn_shape)?;
        let proj = linear(&attn, self.wo.param().tensor(), None)?;
        let x = residual_add(x, &proj)?;

        let h2 = layer_norm(&x, self.ln2_gamma.tensor(), self.ln2_beta.tensor())?;
        let m = linear(&h2, self.w1.param().tensor(), None)?;
        let m = gelu_op(&m)?;
        let m = linear(&m, self.w2.param().tensor(), None)?;
        residual_add(&x, &m)
    }

    /// Inference forward for `t` new tokens, updating `x` in place.
    ///
    /// Q/K/V are computed for the new tokens only; K/V are staged into the
    /// session at positions `[pos0, pos0 + t)` (K post-RoPE) and attention
    /// reads the full visible range from the cache.
    pub fn forward_infer(
        &self,
        x: &mut [f32],
        t: usize,
        layer: usize,
        session: &mut dyn KvSession,
        pos0: usize,
        config: &ModelConfig,
        rope: &RopeTable,
    ) -> VulcanResult<()> {
        let d = config.n_embd;
        let kv_width = config.kv_width();
        let hd = config.head_dim();
        let group = config.n_head / config.n_kv_head;
        let scale = 1.0 / (hd as f32).sqrt();

        // Attention half
        let mut h = vec![0.0; t * d];
        layer_norm_rows(x, &self.ln1_gamma.tensor().data(), &self.ln1_beta.tensor().data(), d, &mut h)?;

        let mut q = vec![0.0; t * d];
        let mut k = vec![0.0; t * kv_width];
        let mut v = vec![0.0; t * kv_width];
        self.wq.apply(&h, t, &mut q)?;
        self.wk.apply(&h, t, &mut k)?;
        self.wv.apply(&h, t, &mut v)?;
        rope.apply(&mut q, config.n_head, pos0)?;
        rope.apply(&mut k, config.n_kv_head, pos0)?;

        for i in 0..t {
            session.stage_kv(
                layer,
                pos0 + i,
                &k[i * kv_width..(i + 1) * kv_width],
                &v[i * kv_width..(i + 1) * kv_width],
            )?;
        }

        let mut attn = vec![0.0; t * d];
        let mut key_scratch = vec![0.0; hd];
        let mut value_scratch = vec![0.0; hd];
        let mut scores = Vec::with_capacity(pos0 + t);
        for head in 0..config.n_head {
            let kvh = head / group;
            for i in 0..t {
                let visible = pos0 + i + 1;
                let q_row = &q[i * d + head * hd..i * d + (head + 1) * hd];

                scores.clear();
                scores.resize(visible, 0.0);
                for (j, score) in scores.iter_mut().enumerate() {
                    session.key_row(layer, j, kvh, &mut key_scratch)?;
                    *score = dot(q_row, &key_scratch);
                }
                masked_softmax(&mut scores, 1, visible, scale, visible - 1)?;

                let out_row = &mut attn[i * d + head * hd..i * d + (head + 1) * hd];
                for (j, &p) in scores.iter().enumerate() {
                    session.value_row(layer, j, kvh, &mut value_scratch)?;
                    scaled_add(&value_scratch, p, out_row)?;
                }
            }
        }

        let mut proj = vec![0.0; t * d];
        self.wo.apply(&attn, t, &mut proj)?;
        for (xi, pi) in x.iter_mut().zip(proj.iter()) {
            *xi += pi;
        }

        // MLP half
        let mut h2 = vec![0.0; t * d];
        layer_norm_rows(x, &self.ln2_gamma.tensor().data(), &self.ln2_beta.tensor().data(), d, &mut h2)?;
        let hidden = self.w1.out_features();
        let mut m1 = vec![0.0; t * hidden];
        self.w1.apply(&h2, t, &mut m1)?;
        let mut activated = vec![0.0; t * hidden];
        gelu(&m1, &mut activated)?;
        let mut m2 = vec![0.0; t * d];
        self.w2.apply(&activated, t, &mut m2)?;
        for (xi, mi) in x.iter_mut().zip(m2.iter()) {
            *xi += mi;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_matrix_weights_dense_apply() {
        let mut rng = StdRng::seed_from_u64(1);
        let w = MatrixWeights::new("w", 3, 2, &mut rng).unwrap();
        let input = vec![1.0, 0.0, 0.0];
        let mut out = vec![0.0; 2];
        w.apply(&input, 1, &mut out).unwrap();
        // Picking the first basis vector reads the first weight row
        let expected: Vec<f32> = w.param().tensor().data()[0..2].to_vec();
        assert_eq!(out, expected);
    }

    #[test]
    fn test_quantized_apply_close_to_dense() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut w = MatrixWeights::new("w", 16, 8, &mut rng).unwrap();
        let input: Vec<f32> = (0..32).map(|i| (i as f32 * 0.31).sin()).collect();

        let mut dense = vec![0.0; 16];
        w.apply(&input, 2, &mut dense).unwrap();

        w.quantize(QuantScheme::Q8_0).unwrap();
        let mut quant = vec![0.0; 16];
        w.apply(&input, 2, &mut quant).unwrap();

        for (a, b) in dense.iter().zip(quant.iter()) {
            assert!((a - b).abs() < 0.05, "{a} vs {b}");
        }
    }

    #[test]
    fn test_apply_shape_checks() {
        let mut rng = StdRng::seed_from_u64(3);
        let w = MatrixWeights::new("w", 4, 4, &mut rng).unwrap();
        let input = vec![0.0; 3];
        let mut out = vec![0.0; 4];
        assert!(w.apply(&input, 1, &mut out).is_err());
    }
}
