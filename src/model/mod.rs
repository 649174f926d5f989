/// Decoder-only transformer model
///
/// One stack of pre-norm decoder blocks usable two ways: a training forward
/// that builds an autograd graph over the full sequence, and an inference
/// forward over plain buffers that reads and writes a bound KV-cache
/// session incrementally.
pub mod block;
pub mod rope;
pub mod transformer;

pub use rope::RopeTable;
pub use transformer::Transformer;

use serde::{Deserialize, Serialize};

use crate::cache::ModelShape;
use crate::error::{VulcanError, VulcanResult};

/// Model hyperparameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub n_layer: usize,
    pub n_head: usize,
    pub n_kv_head: usize,
    pub n_embd: usize,
    /// Maximum context length the model attends over.
    pub block_size: usize,
    pub rope_theta: f32,
}

impl ModelConfig {
    pub fn head_dim(&self) -> usize {
        self.n_embd / self.n_head
    }

    pub fn kv_width(&self) -> usize {
        self.n_kv_head * self.head_dim()
    }

    /// Cache layout class for this model.
    pub fn shape(&self) -> ModelShape {
        ModelShape {
            layers: self.n_layer,
            kv_heads: self.n_kv_head,
            head_dim: self.head_dim(),
        }
    }

    pub fn validate(&self) -> VulcanResult<()> {
        if self.vocab_size == 0 || self.n_layer == 0 || self.block_size == 0 {
            return Err(VulcanError::Validation(
                "model dimensions must be > 0".to_string(),
            ));
        }
        if self.n_head == 0 || self.n_embd % self.n_head != 0 {
            return Err(VulcanError::Validation(format!(
                "n_embd {} must divide evenly into {} heads",
                self.n_embd, self.n_head
            )));
        }
        if self.n_kv_head == 0 || self.n_head % self.n_kv_head != 0 {
            return Err(VulcanError::Validation(format!(
                "n_head {} must be a multiple of n_kv_head {}",
                self.n_head, self.n_kv_head
            )));
        }
        if self.head_dim() % 2 != 0 {
            return Err(VulcanError::Validation(
                "head_dim must be even for rotary embeddings".to_string(),
            ));
        }
        Ok(())
    }

    /// A small configuration used by tests and demos.
    pub fn tiny(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            n_layer: 2,
            n_head: 2,
            n_kv_head: 1,
            n_embd: 16,
            block_size: 32,
            rope_theta: 10_000.0,
        }
    }
}
