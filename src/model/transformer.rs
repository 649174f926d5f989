/// Transformer model: embedding, decoder stack, final norm, LM head
///
/// Weight initialization is deterministic given a seed. The training
/// forward builds one autograd graph per sequence; batches combine
/// per-sequence losses through a mean node. The inference forward is
/// cache-bound and returns the last position's logits.
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

use super::block::{DecoderBlock, MatrixWeights};
use super::rope::RopeTable;
use super::ModelConfig;
use crate::cache::KvSession;
use crate::error::{VulcanError, VulcanResult};
use crate::kernels::layer_norm_rows;
use crate::layers::{cross_entropy, embedding, layer_norm, linear};
use crate::quant::QuantScheme;
use crate::tensor::{Parameter, Tensor};

pub struct Transformer {
    config: ModelConfig,
    rope: Arc<RopeTable>,
    wte: Parameter,
    blocks: Vec<DecoderBlock>,
    lnf_gamma: Parameter,
    lnf_beta: Parameter,
    lm_head: MatrixWeights,
}

impl Transformer {
    pub fn new(config: ModelConfig, seed: u64) -> VulcanResult<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(seed);
        let d = config.n_embd;

        let wte_data: Vec<f32> = (0..config.vocab_size * d)
            .map(|_| rng.gen_range(-0.02..0.02))
            .collect();
        let wte = Parameter::new("wte", wte_data, &[config.vocab_size, d])?;

        let mut blocks = Vec::with_capacity(config.n_layer);
        for layer in 0..config.n_layer {
            blocks.push(DecoderBlock::new(layer, &config, &mut rng)?);
        }

        Ok(Self {
            rope: Arc::new(RopeTable::new(
                config.head_dim(),
                config.block_size,
                config.rope_theta,
            )?),
            wte,
            blocks,
            lnf_gamma: Parameter::new("lnf.gamma", vec![1.0; d], &[d])?,
            lnf_beta: Parameter::new("lnf.beta", vec![0.0; d], &[d])?,
            lm_head: MatrixWeights::new("lm_head", d, config.vocab_size, &mut rng)?,
            config,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Ordered parameter list; the order is the checkpoint contract.
    pub fn parameters(&self) -> Vec<Parameter> {
        let mut params = vec![self.wte.clone()];
        for block in &self.blocks {
            params.extend(block.parameters());
        }
        params.push(self.lnf_gamma.clone());
        params.push(self.lnf_beta.clone());
        params.push(self.lm_head.param().clone());
        params
    }

    /// Convert projection weights to a block-quantized inference copy.
    /// Training continues to use the f32 masters.
    pub fn quantize_weights(&mut self, scheme: QuantScheme) -> VulcanResult<()> {
        for block in &mut self.blocks {
            block.quantize_weights(scheme)?;
        }
        self.lm_head.quantize(scheme)
    }

    fn validate_sequence(&self, len: usize) -> VulcanResult<()> {
        if len == 0 {
            return Err(VulcanError::Validation("empty token sequence".to_string()));
        }
        if len > self.config.block_size {
            return Err(VulcanError::Validation(format!(
                "sequence of {} tokens exceeds block_size {}",
                len, self.config.block_size
            )));
        }
        Ok(())
    }

    /// Training forward over one sequence; returns (t, vocab) logits with
    /// the autograd graph attached.
    pub fn forward_train(&self, ids: &[u32]) -> VulcanResult<Tensor> {
        self.validate_sequence(ids.len())?;
        let mut x = embedding(ids, self.wte.tensor())?;
        for block in &self.blocks {
            x = block.forward_train(&x, &self.config, &self.rope)?;
        }
        let x = layer_norm(&x, self.lnf_gamma.tensor(), self.lnf_beta.tensor())?;
        linear(&x, self.lm_head.param().tensor(), None)
    }

    /// Mean cross-entropy over a batch of `batch` equal-length sequences
    /// laid out back to back in `inputs`/`targets`.
    pub fn train_loss(
        &self,
        inputs: &[u32],
        targets: &[u32],
        batch: usize,
    ) -> VulcanResult<Tensor> {
        if batch == 0 || inputs.len() % batch != 0 || inputs.len() != targets.len() {
            return Err(VulcanError::Validation(
                "batch must evenly divide equal-length input and target buffers".to_string(),
            ));
        }
        let t = inputs.len() / batch;
        let mut losses = Vec::with_capacity(batch);
        for b in 0..batch {
            let logits = self.forward_train(&inputs[b * t..(b + 1) * t])?;
            losses.push(cross_entropy(&logits, &targets[b * t..(b + 1) * t])?);
        }
        Ok(mean_scalars(losses))
    }

    /// Cache-bound inference forward over `tokens` new positions. K/V are
    /// staged into the session; the caller commits on success or discards
    /// on failure. Returns the last position's logits.
    pub fn forward_infer(
        &self,
        tokens: &[u32],
        session: &mut dyn KvSession,
    ) -> VulcanResult<Vec<f32>> {
        let t = tokens.len();
        self.validate_sequence(t)?;
        if session.shape() != self.config.shape() {
            return Err(VulcanError::Validation(format!(
                "session shape {:?} does not match model shape {:?}",
                session.shape(),
                self.config.shape()
            )));
        }
        let pos0 = session.committed_tokens();
        if pos0 + t > self.config.block_size {
            return Err(VulcanError::Validation(format!(
                "context {} + {} new tokens exceeds block_size {}",
                pos0, t, self.config.block_size
            )));
        }

        let d = self.config.n_embd;
        let mut x = vec![0.0; t * d];
        {
            let wte = self.wte.tensor().data();
            for (row, &id) in tokens.iter().enumerate() {
                if id as usize >= self.config.vocab_size {
                    return Err(VulcanError::Validation(format!(
                        "token id {} out of range for vocab {}",
                        id, self.config.vocab_size
                    )));
                }
                x[row * d..(row + 1) * d]
                    .copy_from_slice(&wte[id as usize * d..(id as usize + 1) * d]);
            }
        }

        for (layer, block) in self.blocks.iter().enumerate() {
            block.forward_infer(&mut x, t, layer, session, pos0, &self.config, &self.rope)?;
        }

        let mut normed = vec![0.0; d];
        layer_norm_rows(
            &x[(t - 1) * d..t * d],
            &self.lnf_gamma.tensor().data(),
            &self.lnf_beta.tensor().data(),
            d,
            &mut normed,
        )?;
        let mut logits = vec![0.0; self.config.vocab_size];
        self.lm_head.apply(&normed, 1, &mut logits)?;
        Ok(logits)
    }
}

/// Mean of scalar loss tensors; backward hands each input `upstream / n`.
fn mean_scalars(scalars: Vec<Tensor>) -> Tensor {
    let n = scalars.len().max(1);
    let total: f32 = scalars.iter().map(|s| s.data()[0]).sum();
    let mean = total / n as f32;

    let needs_grad = scalars.iter().any(|s| s.requires_grad());
    if !needs_grad {
        return Tensor::from_op(vec![mean], &[1], Vec::new(), None);
    }

    let inputs = scalars.clone();
    let backward = Box::new(move |upstream: &[f32]| {
        let share = upstream[0] / n as f32;
        for s in &inputs {
            if s.requires_grad() {
                s.accumulate_grad(&[share]).expect("mean backward: scalar");
            }
        }
    });
    Tensor::from_op(vec![mean], &[1], scalars, Some(backward))
}
