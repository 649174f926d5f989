/// Token sampling
///
/// Temperature scaling, top-k filtering over a rented scratch buffer, and
/// categorical sampling with a per-request PRNG. No global mutable RNG
/// exists anywhere in the sampling path.
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::Rng;
use std::cmp::Ordering;

use crate::error::{VulcanError, VulcanResult};
use crate::kernels::softmax_row;

/// Pool of logits-sized scratch buffers shared across generation tasks.
pub struct ScratchPool {
    buffers: Mutex<Vec<Vec<f32>>>,
}

impl ScratchPool {
    pub fn new() -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
        }
    }

    fn rent(&self, len: usize) -> Vec<f32> {
        let mut buf = self.buffers.lock().pop().unwrap_or_default();
        buf.clear();
        buf.resize(len, 0.0);
        buf
    }

    fn give_back(&self, buf: Vec<f32>) {
        self.buffers.lock().push(buf);
    }

    pub fn retained(&self) -> usize {
        self.buffers.lock().len()
    }
}

impl Default for ScratchPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Divide logits by the temperature in place. A temperature of exactly 1
/// is a no-op.
pub fn apply_temperature(logits: &mut [f32], temperature: f32) {
    if (temperature - 1.0).abs() < f32::EPSILON {
        return;
    }
    let inv = 1.0 / temperature;
    for logit in logits.iter_mut() {
        *logit *= inv;
    }
}

/// Mask every logit strictly below the k-th largest to -inf.
///
/// The selection runs on a rented copy so the input ordering is never
/// disturbed; the buffer returns to the pool on every path.
pub fn top_k_filter(logits: &mut [f32], k: usize, pool: &ScratchPool) -> VulcanResult<()> {
    if k == 0 || k >= logits.len() {
        return Ok(());
    }

    let mut scratch = pool.rent(logits.len());
    scratch.copy_from_slice(logits);
    // Partial selection: after this, index k-1 holds the k-th largest
    scratch.select_nth_unstable_by(k - 1, |a, b| b.partial_cmp(a).unwrap_or(Ordering::Equal));
    let threshold = scratch[k - 1];
    pool.give_back(scratch);

    if !threshold.is_finite() {
        return Err(VulcanError::Internal(
            "top-k threshold is not finite".to_string(),
        ));
    }
    for logit in logits.iter_mut() {
        if *logit < threshold {
            *logit = f32::NEG_INFINITY;
        }
    }
    Ok(())
}

/// Sample an index from a probability row using the request's PRNG.
pub fn sample_categorical(probs: &[f32], rng: &mut StdRng) -> VulcanResult<usize> {
    if probs.is_empty() {
        return Err(VulcanError::Validation("empty probability row".to_string()));
    }
    let draw: f32 = rng.gen_range(0.0..1.0);
    let mut cumulative = 0.0;
    for (idx, &p) in probs.iter().enumerate() {
        cumulative += p;
        if draw < cumulative {
            return Ok(idx);
        }
    }
    // Rounding left the cumulative sum short of 1: take the last live entry
    Ok(probs
        .iter()
        .rposition(|p| *p > 0.0)
        .unwrap_or(probs.len() - 1))
}

/// Index of the largest logit.
pub fn argmax(logits: &[f32]) -> Option<usize> {
    logits
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(Ordering::Equal))
        .map(|(idx, _)| idx)
}

/// Full sampling step: temperature, top-k, softmax, draw. Returns the token
/// index and its log-probability. `logits` is consumed as scratch.
pub fn sample_token(
    logits: &mut [f32],
    temperature: f32,
    top_k: usize,
    pool: &ScratchPool,
    rng: &mut StdRng,
) -> VulcanResult<(usize, f32)> {
    apply_temperature(logits, temperature);
    top_k_filter(logits, top_k, pool)?;
    softmax_row(logits);
    let idx = sample_categorical(logits, rng)?;
    let logprob = logits[idx].max(f32::MIN_POSITIVE).ln();
    Ok((idx, logprob))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_temperature_one_is_identity() {
        let mut logits = vec![1.0, 2.0, 3.0];
        apply_temperature(&mut logits, 1.0);
        assert_eq!(logits, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_temperature_sharpens_and_softens() {
        let mut sharp = vec![1.0, 2.0];
        apply_temperature(&mut sharp, 0.5);
        assert_eq!(sharp, vec![2.0, 4.0]);

        let mut soft = vec![1.0, 2.0];
        apply_temperature(&mut soft, 2.0);
        assert_eq!(soft, vec![0.5, 1.0]);
    }

    #[test]
    fn test_top_k_masks_all_but_k() {
        let pool = ScratchPool::new();
        let mut logits = vec![0.1, 5.0, 3.0, 4.0, -1.0];
        top_k_filter(&mut logits, 2, &pool).unwrap();
        let live: Vec<usize> = logits
            .iter()
            .enumerate()
            .filter(|(_, v)| v.is_finite())
            .map(|(i, _)| i)
            .collect();
        assert_eq!(live, vec![1, 3]);
    }

    #[test]
    fn test_top_k_zero_disables() {
        let pool = ScratchPool::new();
        let mut logits = vec![1.0, 2.0];
        top_k_filter(&mut logits, 0, &pool).unwrap();
        assert_eq!(logits, vec![1.0, 2.0]);
    }

    #[test]
    fn test_top_k_returns_buffer_to_pool() {
        let pool = ScratchPool::new();
        let mut logits = vec![1.0, 2.0, 3.0];
        top_k_filter(&mut logits, 1, &pool).unwrap();
        assert_eq!(pool.retained(), 1);
        top_k_filter(&mut logits, 1, &pool).unwrap();
        assert_eq!(pool.retained(), 1);
    }

    #[test]
    fn test_top_k_one_degenerates_to_greedy() {
        let pool = ScratchPool::new();
        let mut rng = StdRng::seed_from_u64(3);
        let mut logits = vec![0.5, 9.0, 1.0, -2.0];
        let (idx, _) = sample_token(&mut logits, 1.0, 1, &pool, &mut rng).unwrap();
        assert_eq!(idx, 1);
    }

    #[test]
    fn test_sampling_is_seed_deterministic() {
        let pool = ScratchPool::new();
        let logits = vec![1.0, 1.5, 0.5, 2.0, 0.0];
        let mut picks_a = Vec::new();
        let mut picks_b = Vec::new();
        for picks in [&mut picks_a, &mut picks_b] {
            let mut rng = StdRng::seed_from_u64(42);
            for _ in 0..16 {
                let mut scratch = logits.clone();
                let (idx, _) = sample_token(&mut scratch, 0.8, 3, &pool, &mut rng).unwrap();
                picks.push(idx);
            }
        }
        assert_eq!(picks_a, picks_b);
    }

    #[test]
    fn test_categorical_respects_distribution() {
        let mut rng = StdRng::seed_from_u64(7);
        let probs = vec![0.0, 1.0, 0.0];
        for _ in 0..8 {
            assert_eq!(sample_categorical(&probs, &mut rng).unwrap(), 1);
        }
    }

    #[test]
    fn test_argmax() {
        assert_eq!(argmax(&[1.0, 3.0, 2.0]), Some(1));
        assert_eq!(argmax(&[]), None);
    }

    #[test]
    fn test_logprob_is_negative_or_zero() {
        let pool = ScratchPool::new();
        let mut rng = StdRng::seed_from_u64(1);
        let mut logits = vec![0.3, 0.6, 0.1];
        let (_, logprob) = sample_token(&mut logits, 1.0, 0, &pool, &mut rng).unwrap();
        assert!(logprob <= 0.0);
    }
}
