/// Per-session memory budget policy
///
/// Immutable byte math for one cache layout. Construction verifies that the
/// full `max_seq_len` fits inside the per-session byte cap, so a session
/// sized by the policy can never violate its own budget mid-sequence.
use super::ModelShape;
use crate::error::{VulcanError, VulcanResult};

#[derive(Debug, Clone, Copy)]
pub struct KvCacheBudgetPolicy {
    max_bytes_per_session: usize,
    max_seq_len: usize,
    shape: ModelShape,
    bytes_per_element: usize,
}

impl KvCacheBudgetPolicy {
    pub fn new(
        max_bytes_per_session: usize,
        max_seq_len: usize,
        shape: ModelShape,
        bytes_per_element: usize,
    ) -> VulcanResult<Self> {
        if bytes_per_element == 0 {
            return Err(VulcanError::Validation(
                "bytes_per_element must be > 0".to_string(),
            ));
        }
        let policy = Self {
            max_bytes_per_session,
            max_seq_len,
            shape,
            bytes_per_element,
        };
        let full = policy.compute_required_bytes(max_seq_len);
        if full > max_bytes_per_session {
            return Err(VulcanError::Validation(format!(
                "max_seq_len {} needs {} bytes but the session budget is {}",
                max_seq_len, full, max_bytes_per_session
            )));
        }
        Ok(policy)
    }

    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    pub fn max_bytes_per_session(&self) -> usize {
        self.max_bytes_per_session
    }

    pub fn shape(&self) -> ModelShape {
        self.shape
    }

    /// Bytes needed to cache `n_tokens` positions of K and V.
    pub fn compute_required_bytes(&self, n_tokens: usize) -> usize {
        self.shape.elements(n_tokens) * self.bytes_per_element
    }

    /// Check that appending `additional` tokens on top of `current` stays
    /// within both the sequence and byte budgets.
    pub fn validate_reservation(&self, current: usize, additional: usize) -> VulcanResult<()> {
        let requested_tokens = current + additional;
        let requested = self.compute_required_bytes(requested_tokens);
        let max = self.max_bytes_per_session;
        if requested_tokens > self.max_seq_len || requested > max {
            let used = self.compute_required_bytes(current);
            return Err(VulcanError::OutOfBudget {
                requested: requested.saturating_sub(used),
                available: max.saturating_sub(used),
                max,
            });
        }
        Ok(())
    }
}
