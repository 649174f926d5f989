/// Per-request generation
///
/// Runs on a blocking thread under an engine permit. Each step crops the
/// context to the model's block size, forwards through the model with the
/// session cache bound, samples with the request's own PRNG and streams the
/// token back. Cancellation and the deadline are observed before every
/// step; cache writes commit only after the forward that staged them
/// succeeds.
use std::sync::Arc;
use tracing::debug;

use super::sampling::sample_token;
use super::InferenceEngine;
use crate::cache::{KvSession, SharedPrefix};
use crate::error::{VulcanError, VulcanResult};
use crate::scheduler::request::{GeneratedToken, InferenceRequest};

/// Detaches the prefix when the request finishes on any path.
struct PrefixGuard<'a> {
    engine: &'a InferenceEngine,
    prefix: Arc<SharedPrefix>,
}

impl Drop for PrefixGuard<'_> {
    fn drop(&mut self) {
        if let Some(registry) = self.engine.prefix_registry() {
            registry.detach(&self.prefix);
        }
    }
}

pub(crate) fn process_request(engine: &Arc<InferenceEngine>, mut request: InferenceRequest) {
    let result = run_generation(engine, &mut request);
    let latency_ms = request.enqueued_at.elapsed().as_millis() as u64;
    engine.metrics().request_latency_ms(latency_ms);
    engine.note_request_finished();
    match result {
        Ok(()) => {
            debug!(request = %request.id, generated = request.generated, latency_ms, "request complete");
            request.finalize_complete();
        }
        Err(err) => {
            debug!(request = %request.id, error = %err, latency_ms, "request failed");
            request.finalize_failed(err);
        }
    }
}

fn check_interrupts(engine: &InferenceEngine, request: &InferenceRequest) -> VulcanResult<()> {
    if request.cancel.is_cancelled() || engine.is_shutting_down() {
        return Err(VulcanError::Cancelled);
    }
    if let Some(timeout) = request.options.timeout {
        if request.enqueued_at.elapsed() >= timeout {
            return Err(VulcanError::Timeout);
        }
    }
    Ok(())
}

fn run_generation(engine: &Arc<InferenceEngine>, request: &mut InferenceRequest) -> VulcanResult<()> {
    check_interrupts(engine, request)?;

    let model = engine.model();
    let config = *model.config();
    let block_size = config.block_size;

    let handle = engine
        .store()
        .get_or_create(request.session_id, config.shape(), engine.session_tokens())?;
    let mut guard = handle.lock();
    let session: &mut dyn KvSession = &mut **guard;

    // Crop the prompt to the attention window
    let prompt: &[u32] = if request.prompt.len() > block_size {
        &request.prompt[request.prompt.len() - block_size..]
    } else {
        &request.prompt
    };

    // Prefix sharing: restore cached K/V for a known prompt head
    let mut skip = 0;
    let mut prefix_guard = None;
    if let Some(registry) = engine.prefix_registry() {
        if session.committed_tokens() == 0 {
            let prefix = registry.attach(prompt);
            if prefix.has_cached_kv()
                && prefix.tokens().len() < prompt.len()
                && prompt.starts_with(prefix.tokens())
            {
                let restored = prefix.apply_to_session(session)?;
                session.commit_tokens(restored)?;
                skip = restored;
                debug!(request = %request.id, restored, "prefix restored from cache");
            }
            prefix_guard = Some(PrefixGuard {
                engine: engine.as_ref(),
                prefix: prefix.clone(),
            });
        }
    }

    // Make room in the attention window for the new tokens
    let new_tokens = prompt.len() - skip;
    if session.committed_tokens() + new_tokens > block_size {
        session.sliding_window(block_size - new_tokens)?;
    }
    engine.check_budget(session.committed_tokens(), new_tokens)?;

    // Prefill over the (remaining) prompt
    let mut logits = match model.forward_infer(&prompt[skip..], session) {
        Ok(logits) => logits,
        Err(err) => {
            session.discard_staged();
            return Err(err);
        }
    };
    session.commit_tokens(new_tokens)?;
    request.position = session.committed_tokens();

    // First observer of an uncached prefix captures its K/V for sharing
    if skip == 0 {
        if let Some(attached) = &prefix_guard {
            capture_prefix_kv(&attached.prefix, session, prompt.len())?;
        }
    }

    let mut rng = engine.request_rng(request);

    for index in 0..request.options.max_new_tokens {
        check_interrupts(engine, request)?;

        let (token_idx, logprob) = sample_token(
            &mut logits,
            request.options.temperature,
            request.options.top_k,
            engine.scratch(),
            &mut rng,
        )?;
        let token_id = token_idx as u32;
        let token = GeneratedToken {
            token_id,
            text: engine.tokenizer().decode(&[token_id]),
            index,
            logprob: Some(logprob),
        };
        // A dropped receiver reads as cancellation
        request
            .token_tx
            .blocking_send(token)
            .map_err(|_| VulcanError::Cancelled)?;
        request.generated += 1;
        engine.note_token_generated();

        if request.options.stop_tokens.contains(&token_id) {
            break;
        }
        if index + 1 >= request.options.max_new_tokens {
            break;
        }
        if session.committed_tokens() + 1 > request.options.max_context_tokens {
            break;
        }

        // Keep the context inside the attention window, then reserve
        if session.committed_tokens() + 1 > block_size {
            session.sliding_window(block_size - 1)?;
        }
        engine.check_budget(session.committed_tokens(), 1)?;

        logits = match model.forward_infer(&[token_id], session) {
            Ok(logits) => logits,
            Err(err) => {
                session.discard_staged();
                return Err(err);
            }
        };
        session.commit_tokens(1)?;
        request.position = session.committed_tokens();
    }

    drop(prefix_guard);
    Ok(())
}

/// Copy the per-layer K/V rows for positions `0..prefix_len` out of the
/// session into the shared prefix, once.
fn capture_prefix_kv(
    prefix: &SharedPrefix,
    session: &dyn KvSession,
    prompt_len: usize,
) -> VulcanResult<()> {
    let prefix_len = prefix.tokens().len();
    if prefix.has_cached_kv() || prefix_len > prompt_len || prefix_len == 0 {
        return Ok(());
    }
    if session.committed_tokens() < prefix_len {
        return Ok(());
    }

    let shape = session.shape();
    let hd = shape.head_dim;
    let width = shape.row_width();
    let mut keys = Vec::with_capacity(shape.layers);
    let mut values = Vec::with_capacity(shape.layers);
    let mut scratch = vec![0.0; hd];
    for layer in 0..shape.layers {
        let mut k_layer = vec![0.0; prefix_len * width];
        let mut v_layer = vec![0.0; prefix_len * width];
        for pos in 0..prefix_len {
            for head in 0..shape.kv_heads {
                let at = pos * width + head * hd;
                session.key_row(layer, pos, head, &mut scratch)?;
                k_layer[at..at + hd].copy_from_slice(&scratch);
                session.value_row(layer, pos, head, &mut scratch)?;
                v_layer[at..at + hd].copy_from_slice(&scratch);
            }
        }
        keys.push(k_layer);
        values.push(v_layer);
    }
    prefix.store_kv(keys, values)
}
