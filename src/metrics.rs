/// Runtime metrics interface
///
/// The scheduler and cache publish events through a thin `MetricsSink`
/// trait; a null implementation is always available so the core never
/// depends on a telemetry backend.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Sink for runtime events published by the scheduler and KV-cache store.
pub trait MetricsSink: Send + Sync {
    /// Current depth of the admission queue after an enqueue or dispatch.
    fn queue_depth(&self, depth: usize);

    /// A batch was formed: its size and how long the head waited.
    fn batch_formed(&self, batch_size: usize, wait_ms: u64);

    /// End-to-end latency of a finished request in milliseconds.
    fn request_latency_ms(&self, latency_ms: u64);

    /// A session was evicted from the store, freeing `freed_bytes`.
    fn session_evicted(&self, freed_bytes: usize);

    /// A per-session budget violation was observed.
    fn budget_exceeded(&self, requested: usize, max: usize);
}

/// No-op sink.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMetrics;

impl MetricsSink for NullMetrics {
    fn queue_depth(&self, _depth: usize) {}
    fn batch_formed(&self, _batch_size: usize, _wait_ms: u64) {}
    fn request_latency_ms(&self, _latency_ms: u64) {}
    fn session_evicted(&self, _freed_bytes: usize) {}
    fn budget_exceeded(&self, _requested: usize, _max: usize) {}
}

/// Sink that forwards every event to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMetrics;

impl MetricsSink for LogMetrics {
    fn queue_depth(&self, depth: usize) {
        debug!(depth, "queue depth");
    }

    fn batch_formed(&self, batch_size: usize, wait_ms: u64) {
        debug!(batch_size, wait_ms, "batch formed");
    }

    fn request_latency_ms(&self, latency_ms: u64) {
        debug!(latency_ms, "request finished");
    }

    fn session_evicted(&self, freed_bytes: usize) {
        debug!(freed_bytes, "session evicted");
    }

    fn budget_exceeded(&self, requested: usize, max: usize) {
        warn!(requested, max, "per-session cache budget exceeded");
    }
}

/// Counting sink used in tests and for engine stats snapshots.
#[derive(Debug, Default)]
pub struct CountingMetrics {
    pub batches: AtomicU64,
    pub evictions: AtomicU64,
    pub budget_violations: AtomicU64,
    pub requests_finished: AtomicU64,
    pub bytes_freed: AtomicU64,
}

impl CountingMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl MetricsSink for CountingMetrics {
    fn queue_depth(&self, _depth: usize) {}

    fn batch_formed(&self, _batch_size: usize, _wait_ms: u64) {
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    fn request_latency_ms(&self, _latency_ms: u64) {
        self.requests_finished.fetch_add(1, Ordering::Relaxed);
    }

    fn session_evicted(&self, freed_bytes: usize) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
        self.bytes_freed.fetch_add(freed_bytes as u64, Ordering::Relaxed);
    }

    fn budget_exceeded(&self, _requested: usize, _max: usize) {
        self.budget_violations.fetch_add(1, Ordering::Relaxed);
    }
}
