/// Inference engine
///
/// Owns the model, the KV-cache store, the admission queue and the single
/// scheduler task. Batches formed by the scheduler run on blocking threads
/// under a permit-counting semaphore: `num_cpus` permits for per-request
/// decode, one permit when full batching is enabled so all concurrency is
/// expressed through the batch itself.
pub mod generation;
pub mod sampling;

pub use sampling::ScratchPool;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{KvCacheBudgetPolicy, KvCacheStore, PrefixRegistry, SessionId};
use crate::config::EngineConfig;
use crate::error::{VulcanError, VulcanResult};
use crate::metrics::MetricsSink;
use crate::model::Transformer;
use crate::scheduler::batcher::{BatchFormer, FormOutcome};
use crate::scheduler::queue::RequestQueue;
use crate::scheduler::request::{
    CompletionState, InferenceRequest, SamplingOptions, TokenStream, TOKEN_CHANNEL_CAPACITY,
};
use crate::tokenizer::Tokenizer;

/// Counters exposed by `InferenceEngine::stats`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineStats {
    pub requests_completed: u64,
    pub tokens_generated: u64,
    pub batches_formed: u64,
    pub queue_depth: usize,
}

pub struct InferenceEngine {
    config: EngineConfig,
    model: Arc<Transformer>,
    tokenizer: Arc<dyn Tokenizer>,
    store: Arc<KvCacheStore>,
    prefixes: Option<Arc<PrefixRegistry>>,
    policy: KvCacheBudgetPolicy,
    session_tokens: usize,
    queue: Arc<RequestQueue>,
    permits: Arc<Semaphore>,
    scratch: ScratchPool,
    metrics: Arc<dyn MetricsSink>,
    shutdown: CancellationToken,
    scheduler_task: Mutex<Option<JoinHandle<()>>>,
    requests_completed: AtomicU64,
    tokens_generated: AtomicU64,
    batches_formed: AtomicU64,
}

impl InferenceEngine {
    /// Build the engine and start its scheduler task. Must be called from
    /// within a tokio runtime.
    pub fn new(
        model: Arc<Transformer>,
        tokenizer: Arc<dyn Tokenizer>,
        config: EngineConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> VulcanResult<Arc<Self>> {
        config.validate()?;
        if tokenizer.vocab_size() > model.config().vocab_size {
            return Err(VulcanError::Validation(format!(
                "tokenizer vocab {} exceeds model vocab {}",
                tokenizer.vocab_size(),
                model.config().vocab_size
            )));
        }

        let shape = model.config().shape();
        let session_tokens = config.cache.max_seq_len.min(model.config().block_size);
        let policy = KvCacheBudgetPolicy::new(
            config.cache.max_bytes_per_session,
            session_tokens,
            shape,
            config.cache.precision.bytes_per_element(),
        )?;
        let store = Arc::new(KvCacheStore::new(config.cache.clone(), metrics.clone())?);
        let prefixes = config
            .cache
            .enable_prefix_sharing
            .then(|| Arc::new(PrefixRegistry::new(config.cache.max_shared_prefixes)));

        let permit_count = if config.scheduler.full_batching {
            1
        } else {
            num_cpus::get().max(1)
        };
        let queue = Arc::new(RequestQueue::new(config.scheduler.max_total_queued_requests));

        let engine = Arc::new(Self {
            model,
            tokenizer,
            store,
            prefixes,
            policy,
            session_tokens,
            queue,
            permits: Arc::new(Semaphore::new(permit_count)),
            scratch: ScratchPool::new(),
            metrics,
            shutdown: CancellationToken::new(),
            scheduler_task: Mutex::new(None),
            requests_completed: AtomicU64::new(0),
            tokens_generated: AtomicU64::new(0),
            batches_formed: AtomicU64::new(0),
            config,
        });

        let task = tokio::spawn(Self::scheduler_loop(engine.clone()));
        *engine.scheduler_task.lock() = Some(task);
        info!(permits = permit_count, "inference engine started");
        Ok(engine)
    }

    /// Single scheduler task: wait for work or a timer tick, form batches,
    /// dispatch them, repeat. On shutdown, drain and finalize the queue.
    async fn scheduler_loop(engine: Arc<Self>) {
        let former = BatchFormer::new(engine.queue.clone(), engine.config.scheduler.clone());
        let tick = engine
            .config
            .scheduler
            .max_batch_wait()
            .max(std::time::Duration::from_millis(1));
        loop {
            tokio::select! {
                _ = engine.shutdown.cancelled() => break,
                _ = engine.queue.wait_for_work() => {}
                _ = tokio::time::sleep(tick) => {}
            }
            loop {
                match former.try_form(Instant::now()) {
                    FormOutcome::Empty | FormOutcome::NotYet => break,
                    FormOutcome::Batch(batch) => {
                        engine.metrics.queue_depth(engine.queue.len());
                        Self::dispatch(&engine, batch).await;
                    }
                }
            }
        }

        for request in engine.queue.drain_all() {
            request.finalize_failed(VulcanError::Cancelled);
        }
        debug!("scheduler task exited");
    }

    /// Hand a formed batch to blocking workers under the engine semaphore.
    async fn dispatch(engine: &Arc<Self>, batch: Vec<InferenceRequest>) {
        let head_wait_ms = batch
            .first()
            .map(|r| r.waited(Instant::now()).as_millis() as u64)
            .unwrap_or(0);
        engine.metrics.batch_formed(batch.len(), head_wait_ms);
        engine.batches_formed.fetch_add(1, Ordering::Relaxed);
        debug!(size = batch.len(), head_wait_ms, "batch dispatched");

        // Deterministic mode also serializes the batch so emission order
        // between its members follows arrival index
        let sequential = engine.config.scheduler.full_batching
            || engine.config.scheduler.deterministic_seed.is_some();
        if sequential {
            let Ok(permit) = engine.permits.clone().acquire_owned().await else {
                return;
            };
            let engine = engine.clone();
            tokio::task::spawn_blocking(move || {
                let _permit = permit;
                for request in batch {
                    generation::process_request(&engine, request);
                }
            });
        } else {
            for request in batch {
                let Ok(permit) = engine.permits.clone().acquire_owned().await else {
                    return;
                };
                let engine = engine.clone();
                tokio::task::spawn_blocking(move || {
                    let _permit = permit;
                    generation::process_request(&engine, request);
                });
            }
        }
    }

    fn submit(
        &self,
        session_id: SessionId,
        prompt: &str,
        options: SamplingOptions,
        cancel: CancellationToken,
    ) -> VulcanResult<TokenStream> {
        if self.shutdown.is_cancelled() {
            return Err(VulcanError::ResourceLimit(
                "engine is shutting down".to_string(),
            ));
        }
        options.validate()?;
        if prompt.is_empty() {
            return Err(VulcanError::Validation("empty prompt".to_string()));
        }
        let tokens = self.tokenizer.encode(prompt);
        if tokens.is_empty() {
            return Err(VulcanError::Validation(
                "prompt encoded to zero tokens".to_string(),
            ));
        }

        let (token_tx, token_rx) = tokio::sync::mpsc::channel(TOKEN_CHANNEL_CAPACITY);
        let (completion_tx, completion_rx) = tokio::sync::oneshot::channel();
        let id = Uuid::new_v4();
        let request = InferenceRequest {
            id,
            session_id,
            prompt: tokens,
            options,
            cancel: cancel.clone(),
            token_tx,
            completion_tx,
            enqueued_at: Instant::now(),
            arrival_index: 0,
            position: 0,
            generated: 0,
            state: CompletionState::Running,
        };
        self.queue.enqueue(request)?;
        self.metrics.queue_depth(self.queue.len());
        Ok(TokenStream::new(id, session_id, token_rx, completion_rx, cancel))
    }

    /// Generate and collect the whole stream into a string.
    pub async fn generate(
        &self,
        prompt: &str,
        options: SamplingOptions,
        cancel: CancellationToken,
    ) -> VulcanResult<String> {
        let stream = self.submit(SessionId::new(), prompt, options, cancel)?;
        stream.finish().await
    }

    /// Generate with per-token streaming in a fresh session.
    pub async fn generate_streaming(
        &self,
        prompt: &str,
        options: SamplingOptions,
        cancel: CancellationToken,
    ) -> VulcanResult<TokenStream> {
        self.submit(SessionId::new(), prompt, options, cancel)
    }

    /// Generate within an existing session so its cache carries over.
    pub async fn generate_in_session(
        &self,
        session_id: SessionId,
        prompt: &str,
        options: SamplingOptions,
        cancel: CancellationToken,
    ) -> VulcanResult<TokenStream> {
        self.submit(session_id, prompt, options, cancel)
    }

    /// Extend a session's cache with `tokens` without generating.
    pub fn append_session(&self, session_id: SessionId, tokens: &[u32]) -> VulcanResult<()> {
        if tokens.is_empty() {
            return Err(VulcanError::Validation("empty token sequence".to_string()));
        }
        let block_size = self.model.config().block_size;
        let tokens = if tokens.len() > block_size {
            &tokens[tokens.len() - block_size..]
        } else {
            tokens
        };
        let handle =
            self.store
                .get_or_create(session_id, self.model.config().shape(), self.session_tokens)?;
        let mut guard = handle.lock();
        let session = &mut **guard;
        if session.committed_tokens() + tokens.len() > block_size {
            session.sliding_window(block_size - tokens.len())?;
        }
        self.check_budget(session.committed_tokens(), tokens.len())?;
        match self.model.forward_infer(tokens, session) {
            Ok(_) => session.commit_tokens(tokens.len()),
            Err(err) => {
                session.discard_staged();
                Err(err)
            }
        }
    }

    /// Reset a session's cache to empty.
    pub fn reset_session(&self, session_id: SessionId) -> VulcanResult<()> {
        match self.store.try_get(&session_id) {
            Some(handle) => {
                handle.lock().reset();
                Ok(())
            }
            None => Err(VulcanError::Validation(format!(
                "unknown session {session_id}"
            ))),
        }
    }

    /// Drain the scheduler, finalize pending requests as cancelled, and
    /// release all pooled buffers.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let task = self.scheduler_task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(error = %err, "scheduler task join failed");
            }
        }
        self.store.shutdown();
        if let Some(prefixes) = &self.prefixes {
            prefixes.clear();
        }
        info!("inference engine shut down");
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            requests_completed: self.requests_completed.load(Ordering::Relaxed),
            tokens_generated: self.tokens_generated.load(Ordering::Relaxed),
            batches_formed: self.batches_formed.load(Ordering::Relaxed),
            queue_depth: self.queue.len(),
        }
    }

    pub fn cache_stats(&self) -> crate::cache::CacheStats {
        self.store.stats()
    }

    /// Reserve cache room or fail the request with the budget error.
    pub(crate) fn check_budget(&self, current: usize, additional: usize) -> VulcanResult<()> {
        match self.policy.validate_reservation(current, additional) {
            Ok(()) => Ok(()),
            Err(err) => {
                if let VulcanError::OutOfBudget { requested, max, .. } = &err {
                    self.store.note_budget_violation(*requested, *max);
                }
                Err(err)
            }
        }
    }

    /// Per-request PRNG. Deterministic scheduling derives it from the
    /// global seed and the session seed (arrival index when unset).
    pub(crate) fn request_rng(&self, request: &InferenceRequest) -> StdRng {
        match (
            self.config.scheduler.deterministic_seed,
            request.options.seed,
        ) {
            (Some(global), Some(session)) => StdRng::seed_from_u64(global ^ session),
            (Some(global), None) => StdRng::seed_from_u64(global ^ request.arrival_index),
            (None, Some(seed)) => StdRng::seed_from_u64(seed),
            (None, None) => StdRng::from_entropy(),
        }
    }

    pub(crate) fn model(&self) -> &Transformer {
        &self.model
    }

    pub(crate) fn tokenizer(&self) -> &dyn Tokenizer {
        self.tokenizer.as_ref()
    }

    pub(crate) fn store(&self) -> &KvCacheStore {
        &self.store
    }

    pub(crate) fn prefix_registry(&self) -> Option<&PrefixRegistry> {
        self.prefixes.as_deref()
    }

    pub(crate) fn scratch(&self) -> &ScratchPool {
        &self.scratch
    }

    pub(crate) fn metrics(&self) -> &dyn MetricsSink {
        self.metrics.as_ref()
    }

    pub(crate) fn session_tokens(&self) -> usize {
        self.session_tokens
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub(crate) fn note_request_finished(&self) {
        self.requests_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_token_generated(&self) {
        self.tokens_generated.fetch_add(1, Ordering::Relaxed);
    }
}
