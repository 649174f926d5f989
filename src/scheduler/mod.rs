/// Batched inference scheduling
///
/// Requests enter a bounded admission queue; a single scheduler task forms
/// compatible batches anchored on the head request and hands them to the
/// engine. Per-request streaming and cancellation ride on channels carried
/// by the request itself.
pub mod batcher;
pub mod queue;
pub mod request;

pub use batcher::{BatchFormer, FormOutcome};
pub use queue::RequestQueue;
pub use request::{
    CompletionState, GeneratedToken, InferenceRequest, SamplingOptions, TokenStream,
};
