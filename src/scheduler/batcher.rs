/// Batch formation
///
/// The scheduler cycles Idle -> Forming -> Dispatched. Forming drains
/// cancelled requests, anchors compatibility on the head request, and pulls
/// compatible followers up to `max_batch_size` without ever reordering past
/// the head. A partial batch releases once the head has waited
/// `max_batch_wait`; otherwise the queue keeps accumulating.
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use super::queue::RequestQueue;
use super::request::InferenceRequest;
use crate::config::SchedulerConfig;
use crate::error::VulcanError;

/// Result of one forming attempt.
pub enum FormOutcome {
    /// Queue is empty.
    Empty,
    /// A head exists but neither the size nor the wait threshold is met.
    NotYet,
    /// A batch is ready for dispatch.
    Batch(Vec<InferenceRequest>),
}

pub struct BatchFormer {
    queue: Arc<RequestQueue>,
    config: SchedulerConfig,
}

impl BatchFormer {
    pub fn new(queue: Arc<RequestQueue>, config: SchedulerConfig) -> Self {
        Self { queue, config }
    }

    /// Attempt to form a batch. Cancelled requests encountered during the
    /// scan are finalized immediately and never join a batch.
    pub fn try_form(&self, now: Instant) -> FormOutcome {
        let mut cancelled = Vec::new();
        let outcome = self.queue.with_queue(|pending| {
            // Drain cancelled requests from the head
            while let Some(head) = pending.front() {
                if head.cancel.is_cancelled() {
                    cancelled.push(pending.pop_front().expect("front checked"));
                } else {
                    break;
                }
            }

            let Some(head) = pending.front() else {
                return FormOutcome::Empty;
            };
            let head_options = head.options.clone();
            let head_waited = head.waited(now);

            // Count the compatible prefix-with-gaps without disturbing order
            let mut compatible = 0;
            let mut cancelled_idx = Vec::new();
            for (idx, request) in pending.iter().enumerate() {
                if compatible >= self.config.max_batch_size {
                    break;
                }
                if request.cancel.is_cancelled() {
                    cancelled_idx.push(idx);
                    continue;
                }
                if request.options.batch_compatible(&head_options) {
                    compatible += 1;
                }
            }

            let release = compatible >= self.config.max_batch_size
                || head_waited >= self.config.max_batch_wait();
            if !release {
                // Still pull cancelled stragglers out of the queue
                for idx in cancelled_idx.into_iter().rev() {
                    if let Some(request) = pending.remove(idx) {
                        cancelled.push(request);
                    }
                }
                return FormOutcome::NotYet;
            }

            // Extract the batch, skipping incompatible requests in place
            let mut batch = Vec::with_capacity(compatible);
            let mut idx = 0;
            while idx < pending.len() && batch.len() < self.config.max_batch_size {
                let request = &pending[idx];
                if request.cancel.is_cancelled() {
                    if let Some(request) = pending.remove(idx) {
                        cancelled.push(request);
                    }
                    continue;
                }
                if request.options.batch_compatible(&head_options) {
                    if let Some(request) = pending.remove(idx) {
                        batch.push(request);
                    }
                    continue;
                }
                idx += 1;
            }

            if self.config.deterministic_seed.is_some() {
                batch.sort_by_key(|r| r.arrival_index);
            }
            FormOutcome::Batch(batch)
        });

        // Finalize outside the queue lock
        let dropped = cancelled.len();
        for request in cancelled {
            debug!(request = %request.id, "cancelled request drained from queue");
            request.finalize_failed(VulcanError::Cancelled);
        }
        if dropped > 0 {
            self.queue.release(dropped);
        }

        if let FormOutcome::Batch(batch) = &outcome {
            self.queue.release(batch.len());
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SessionId;
    use crate::scheduler::request::{CompletionState, SamplingOptions};
    use std::time::Duration;
    use tokio::sync::{mpsc, oneshot};
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn request_with(options: SamplingOptions) -> InferenceRequest {
        let (token_tx, _rx) = mpsc::channel(4);
        let (completion_tx, _crx) = oneshot::channel();
        InferenceRequest {
            id: Uuid::new_v4(),
            session_id: SessionId::new(),
            prompt: vec![1],
            options,
            cancel: CancellationToken::new(),
            token_tx,
            completion_tx,
            enqueued_at: Instant::now(),
            arrival_index: 0,
            position: 0,
            generated: 0,
            state: CompletionState::Running,
        }
    }

    fn former(max_batch_size: usize, max_wait_ms: u64) -> (Arc<RequestQueue>, BatchFormer) {
        let queue = Arc::new(RequestQueue::new(64));
        let config = SchedulerConfig {
            max_batch_size,
            max_batch_wait_ms: max_wait_ms,
            ..SchedulerConfig::default()
        };
        (queue.clone(), BatchFormer::new(queue, config))
    }

    #[test]
    fn test_empty_queue() {
        let (_queue, former) = former(4, 50);
        assert!(matches!(former.try_form(Instant::now()), FormOutcome::Empty));
    }

    #[test]
    fn test_full_batch_releases_immediately() {
        let (queue, former) = former(2, 10_000);
        queue.enqueue(request_with(SamplingOptions::default())).unwrap();
        queue.enqueue(request_with(SamplingOptions::default())).unwrap();
        match former.try_form(Instant::now()) {
            FormOutcome::Batch(batch) => assert_eq!(batch.len(), 2),
            _ => panic!("expected a batch"),
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_partial_batch_waits_for_head_timeout() {
        let (queue, former) = former(4, 10_000);
        queue.enqueue(request_with(SamplingOptions::default())).unwrap();
        assert!(matches!(former.try_form(Instant::now()), FormOutcome::NotYet));

        // Pretend the head has waited past the limit
        let later = Instant::now() + Duration::from_secs(11);
        match former.try_form(later) {
            FormOutcome::Batch(batch) => assert_eq!(batch.len(), 1),
            _ => panic!("expected a partial batch"),
        }
    }

    #[test]
    fn test_incompatible_requests_stay_queued() {
        let (queue, former) = former(4, 0);
        let mut other = SamplingOptions::default();
        other.temperature = 0.5;

        queue.enqueue(request_with(SamplingOptions::default())).unwrap();
        queue.enqueue(request_with(other.clone())).unwrap();
        queue.enqueue(request_with(SamplingOptions::default())).unwrap();

        match former.try_form(Instant::now()) {
            FormOutcome::Batch(batch) => {
                assert_eq!(batch.len(), 2);
                for request in &batch {
                    assert_eq!(request.options.temperature, 1.0);
                }
            }
            _ => panic!("expected a batch"),
        }

        // The incompatible request is now the head for the next cycle
        let remaining = queue.with_queue(|q| q.len());
        assert_eq!(remaining, 1);
        match former.try_form(Instant::now()) {
            FormOutcome::Batch(batch) => {
                assert_eq!(batch.len(), 1);
                assert_eq!(batch[0].options.temperature, 0.5);
            }
            _ => panic!("expected the leftover request"),
        }
    }

    #[test]
    fn test_cancelled_head_is_finalized_not_batched() {
        let (queue, former) = former(4, 0);
        let cancelled = request_with(SamplingOptions::default());
        cancelled.cancel.cancel();
        let cancelled_id = cancelled.id;
        queue.enqueue(cancelled).unwrap();
        queue.enqueue(request_with(SamplingOptions::default())).unwrap();

        match former.try_form(Instant::now()) {
            FormOutcome::Batch(batch) => {
                assert_eq!(batch.len(), 1);
                assert_ne!(batch[0].id, cancelled_id);
            }
            _ => panic!("expected a batch"),
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_batch_size_cap() {
        let (queue, former) = former(2, 0);
        for _ in 0..5 {
            queue.enqueue(request_with(SamplingOptions::default())).unwrap();
        }
        match former.try_form(Instant::now()) {
            FormOutcome::Batch(batch) => assert_eq!(batch.len(), 2),
            _ => panic!("expected a batch"),
        }
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_deterministic_mode_orders_by_arrival() {
        let queue = Arc::new(RequestQueue::new(16));
        let config = SchedulerConfig {
            max_batch_size: 4,
            max_batch_wait_ms: 0,
            deterministic_seed: Some(99),
            ..SchedulerConfig::default()
        };
        let former = BatchFormer::new(queue.clone(), config);
        for _ in 0..3 {
            queue.enqueue(request_with(SamplingOptions::default())).unwrap();
        }
        match former.try_form(Instant::now()) {
            FormOutcome::Batch(batch) => {
                let indices: Vec<u64> = batch.iter().map(|r| r.arrival_index).collect();
                assert_eq!(indices, vec![0, 1, 2]);
            }
            _ => panic!("expected a batch"),
        }
    }
}
