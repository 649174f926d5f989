/// Engine, scheduler and cache configuration
///
/// Configuration is plain data with serde derives. Every config struct has a
/// `validate` method; the engine refuses to start with an invalid config
/// rather than failing later inside a request.
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{VulcanError, VulcanResult};

/// Precision of the per-session KV cache storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CachePrecision {
    /// Full float32 storage (baseline).
    F32,
    /// Half precision, 2x memory reduction.
    F16,
    /// 8-bit affine quantization, 4x memory reduction.
    Int8,
}

impl CachePrecision {
    /// Bytes used per cached element.
    pub fn bytes_per_element(&self) -> usize {
        match self {
            CachePrecision::F32 => 4,
            CachePrecision::F16 => 2,
            CachePrecision::Int8 => 1,
        }
    }
}

/// KV cache subsystem configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Hard cap on bytes a single session may hold.
    pub max_bytes_per_session: usize,
    /// Hard cap on bytes across all sessions in the store.
    pub max_bytes_total: usize,
    /// Maximum number of live sessions before LRU eviction.
    pub max_sessions: usize,
    /// Maximum tokens a session can ever hold.
    pub max_seq_len: usize,
    /// Storage precision for cached K/V.
    pub precision: CachePrecision,
    /// Enable content-addressed prompt prefix sharing.
    pub enable_prefix_sharing: bool,
    /// Maximum retained shared prefixes before LRU eviction.
    pub max_shared_prefixes: usize,
    /// Per-shape pooled sessions retained after release.
    pub pool_retain_per_shape: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes_per_session: 64 * 1024 * 1024,
            max_bytes_total: 512 * 1024 * 1024,
            max_sessions: 64,
            max_seq_len: 2048,
            precision: CachePrecision::F32,
            enable_prefix_sharing: false,
            max_shared_prefixes: 128,
            pool_retain_per_shape: 8,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> VulcanResult<()> {
        if self.max_sessions == 0 {
            return Err(VulcanError::Validation(
                "max_sessions must be > 0".to_string(),
            ));
        }
        if self.max_seq_len == 0 {
            return Err(VulcanError::Validation(
                "max_seq_len must be > 0".to_string(),
            ));
        }
        if self.max_bytes_per_session == 0 || self.max_bytes_total == 0 {
            return Err(VulcanError::Validation(
                "cache byte caps must be > 0".to_string(),
            ));
        }
        if self.max_bytes_per_session > self.max_bytes_total {
            return Err(VulcanError::Validation(
                "max_bytes_per_session exceeds max_bytes_total".to_string(),
            ));
        }
        Ok(())
    }
}

/// Batch scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum requests coalesced into one batch.
    pub max_batch_size: usize,
    /// Maximum time the head request waits before a partial batch releases.
    pub max_batch_wait_ms: u64,
    /// Admission cap across queued requests; enqueue fails beyond this.
    pub max_total_queued_requests: usize,
    /// When true, prefill and decode both run batched and the engine
    /// serializes on a single permit. When false (default), prefill is
    /// batched and decode runs per request in parallel.
    pub full_batching: bool,
    /// Deterministic scheduling: FIFO order, arrival-index tie-break, and
    /// per-request PRNGs derived from this seed.
    pub deterministic_seed: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 8,
            max_batch_wait_ms: 50,
            max_total_queued_requests: 256,
            full_batching: false,
            deterministic_seed: None,
        }
    }
}

impl SchedulerConfig {
    pub fn max_batch_wait(&self) -> Duration {
        Duration::from_millis(self.max_batch_wait_ms)
    }

    pub fn validate(&self) -> VulcanResult<()> {
        if self.max_batch_size == 0 {
            return Err(VulcanError::Validation(
                "max_batch_size must be > 0".to_string(),
            ));
        }
        if self.max_total_queued_requests == 0 {
            return Err(VulcanError::Validation(
                "max_total_queued_requests must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    pub scheduler: SchedulerConfig,
    pub cache: CacheConfig,
}

impl EngineConfig {
    pub fn validate(&self) -> VulcanResult<()> {
        self.scheduler.validate()?;
        self.cache.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let mut config = EngineConfig::default();
        config.scheduler.max_batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_session_cap_above_total_rejected() {
        let mut config = EngineConfig::default();
        config.cache.max_bytes_per_session = config.cache.max_bytes_total + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_precision_bytes() {
        assert_eq!(CachePrecision::F32.bytes_per_element(), 4);
        assert_eq!(CachePrecision::F16.bytes_per_element(), 2);
        assert_eq!(CachePrecision::Int8.bytes_per_element(), 1);
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let config = EngineConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.scheduler.max_batch_size, config.scheduler.max_batch_size);
        assert_eq!(back.cache.precision, config.cache.precision);
    }
}
