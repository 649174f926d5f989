/// Bounded admission queue
///
/// Enqueue is non-blocking apart from a short critical section. Admission
/// fails with `ResourceLimit` once the total queued count reaches the cap;
/// the count drops when requests leave the queue (batched or finalized),
/// not when they finish generating.
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::Notify;

use super::request::InferenceRequest;
use crate::error::{VulcanError, VulcanResult};

pub struct RequestQueue {
    max_total: usize,
    queued: AtomicUsize,
    arrivals: AtomicU64,
    inner: Mutex<VecDeque<InferenceRequest>>,
    notify: Notify,
}

impl RequestQueue {
    pub fn new(max_total: usize) -> Self {
        Self {
            max_total,
            queued: AtomicUsize::new(0),
            arrivals: AtomicU64::new(0),
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// Admit a request, assigning its arrival index. Wakes the scheduler.
    pub fn enqueue(&self, mut request: InferenceRequest) -> VulcanResult<()> {
        // Reserve a slot before touching the queue
        let mut current = self.queued.load(Ordering::Acquire);
        loop {
            if current >= self.max_total {
                return Err(VulcanError::ResourceLimit(format!(
                    "queue full: {} requests already pending",
                    current
                )));
            }
            match self.queued.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }

        request.arrival_index = self.arrivals.fetch_add(1, Ordering::Relaxed);
        self.inner.lock().push_back(request);
        self.notify.notify_one();
        Ok(())
    }

    /// Wait until an enqueue signals new work.
    pub async fn wait_for_work(&self) {
        self.notify.notified().await;
    }

    pub fn len(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release `n` queue slots after requests left the queue.
    pub fn release(&self, n: usize) {
        self.queued.fetch_sub(n, Ordering::AcqRel);
    }

    pub(crate) fn with_queue<R>(&self, f: impl FnOnce(&mut VecDeque<InferenceRequest>) -> R) -> R {
        f(&mut self.inner.lock())
    }

    /// Remove everything; the caller finalizes the drained requests.
    pub fn drain_all(&self) -> Vec<InferenceRequest> {
        let drained: Vec<_> = self.inner.lock().drain(..).collect();
        self.release(drained.len());
        drained
    }
}
