/// Request and stream types
///
/// An `InferenceRequest` owns everything the engine needs to serve one
/// generation: prompt tokens, sampling options, a cancellation token, the
/// per-request token channel, and a completion channel that closes the
/// stream with the final state.
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::SessionId;
use crate::error::{VulcanError, VulcanResult};

/// Capacity of the per-request token channel. A slow consumer exerts
/// back-pressure on the generation loop once this many tokens are buffered.
pub const TOKEN_CHANNEL_CAPACITY: usize = 100;

/// Sampling controls for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingOptions {
    /// Softmax temperature; must be > 0.
    pub temperature: f32,
    /// Keep only the top K logits before sampling; 0 disables the filter.
    pub top_k: usize,
    /// Maximum tokens to generate; must be >= 1.
    pub max_new_tokens: usize,
    /// Stop once the session context reaches this many tokens.
    pub max_context_tokens: usize,
    /// Per-request sampling seed; falls back to the arrival index under
    /// deterministic scheduling, or to entropy otherwise.
    pub seed: Option<u64>,
    /// Token ids that end generation when produced.
    pub stop_tokens: Vec<u32>,
    /// Wall-clock bound for the whole request.
    pub timeout: Option<Duration>,
}

impl Default for SamplingOptions {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: 0,
            max_new_tokens: 64,
            max_context_tokens: 2048,
            seed: None,
            stop_tokens: Vec::new(),
            timeout: None,
        }
    }
}

impl SamplingOptions {
    pub fn validate(&self) -> VulcanResult<()> {
        if !(self.temperature > 0.0) {
            return Err(VulcanError::Validation(format!(
                "temperature must be > 0, got {}",
                self.temperature
            )));
        }
        if self.max_new_tokens == 0 {
            return Err(VulcanError::Validation(
                "max_new_tokens must be >= 1".to_string(),
            ));
        }
        if self.max_context_tokens == 0 {
            return Err(VulcanError::Validation(
                "max_context_tokens must be >= 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Pairwise batch compatibility: requests sharing a batch must agree on
    /// the sampling regime.
    pub fn batch_compatible(&self, other: &SamplingOptions) -> bool {
        self.temperature == other.temperature && self.top_k == other.top_k
    }
}

/// One streamed token.
#[derive(Debug, Clone)]
pub struct GeneratedToken {
    pub token_id: u32,
    pub text: String,
    /// Zero-based index within this request's generation.
    pub index: usize,
    pub logprob: Option<f32>,
}

/// Terminal state of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionState {
    Running,
    Complete,
    Failed(String),
}

/// A request as carried through the queue and into a batch.
pub struct InferenceRequest {
    pub id: Uuid,
    pub session_id: SessionId,
    pub prompt: Vec<u32>,
    pub options: SamplingOptions,
    pub cancel: CancellationToken,
    pub token_tx: mpsc::Sender<GeneratedToken>,
    pub completion_tx: oneshot::Sender<VulcanResult<()>>,
    pub enqueued_at: Instant,
    pub arrival_index: u64,
    pub position: usize,
    pub generated: usize,
    pub state: CompletionState,
}

impl InferenceRequest {
    /// Close the stream with a terminal error.
    pub fn finalize_failed(mut self, err: VulcanError) {
        self.state = CompletionState::Failed(err.code().to_string());
        let _ = self.completion_tx.send(Err(err));
        // Dropping token_tx closes the stream
    }

    /// Close the stream successfully.
    pub fn finalize_complete(mut self) {
        self.state = CompletionState::Complete;
        let _ = self.completion_tx.send(Ok(()));
    }

    pub fn waited(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.enqueued_at)
    }
}

/// Client half of a streaming request.
pub struct TokenStream {
    pub id: Uuid,
    pub session_id: SessionId,
    token_rx: mpsc::Receiver<GeneratedToken>,
    completion_rx: oneshot::Receiver<VulcanResult<()>>,
    cancel: CancellationToken,
}

impl TokenStream {
    pub(crate) fn new(
        id: Uuid,
        session_id: SessionId,
        token_rx: mpsc::Receiver<GeneratedToken>,
        completion_rx: oneshot::Receiver<VulcanResult<()>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            session_id,
            token_rx,
            completion_rx,
            cancel,
        }
    }

    /// Next token, or None once the stream is closed.
    pub async fn next_token(&mut self) -> Option<GeneratedToken> {
        self.token_rx.recv().await
    }

    /// Request cancellation; the engine observes it at the next safe point.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Adapt the token channel into an async `Stream` of tokens. The
    /// terminal state is lost; use `finish` when the error matters.
    pub fn into_stream(self) -> tokio_stream::wrappers::ReceiverStream<GeneratedToken> {
        tokio_stream::wrappers::ReceiverStream::new(self.token_rx)
    }

    /// Drain the remaining tokens and return the terminal result.
    pub async fn finish(mut self) -> VulcanResult<String> {
        let mut text = String::new();
        while let Some(token) = self.token_rx.recv().await {
            text.push_str(&token.text);
        }
        match self.completion_rx.await {
            Ok(Ok(())) => Ok(text),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(VulcanError::Internal(
                "request dropped without completion".to_string(),
            )),
        }
    }
}

impl futures::Stream for TokenStream {
    type Item = GeneratedToken;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.get_mut().token_rx.poll_recv(cx)
    }
}
