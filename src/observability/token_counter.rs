use crate::protocol::canonical::{CanonicalPart, CanonicalRequest, CanonicalUsage};
use std::sync::LazyLock;
use std::time::Duration;
use tiktoken_rs::CoreBPE;
use tracing::info;

static BPE: LazyLock<Option<CoreBPE>> = LazyLock::new(|| match tiktoken_rs::cl100k_base() {
    Ok(bpe) => Some(bpe),
    Err(err) => {
        tracing::warn!(error = %err, "cl100k tokenizer unavailable, estimating tokens from byte length");
        None
    }
});

/// Load the tokenizer table now so the first request does not pay for it.
pub fn preload_tokenizer() {
    LazyLock::force(&BPE);
}

/// Estimate the number of tokens in `text` with the cl100k BPE.
#[must_use]
pub fn estimate_tokens(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    match BPE.as_ref() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len() as u64,
        None => estimate_tokens_for_len(text.len()),
    }
}

/// `bytes / 4`, used when the BPE table could not be loaded.
#[must_use]
pub fn estimate_tokens_for_len(byte_len: usize) -> u64 {
    (byte_len as u64).div_ceil(4)
}

/// Estimate the total input tokens for a canonical request.
///
/// Sums tokens from the system prompt, all text parts of messages,
/// and serialized tool definitions.
#[must_use]
pub fn estimate_request_tokens(request: &CanonicalRequest) -> u64 {
    let mut total: u64 = 0;

    if let Some(ref system) = request.system_prompt {
        total += estimate_tokens(system);
    }

    for msg in &request.messages {
        for part in &msg.parts {
            match part {
                CanonicalPart::Text(text) | CanonicalPart::Reasoning(text) => {
                    total += estimate_tokens(text);
                }
                CanonicalPart::ToolResult { content, .. } => {
                    total += estimate_tokens(content);
                }
                CanonicalPart::ToolCall { arguments, .. } => {
                    total += estimate_tokens(&arguments.to_string());
                }
                CanonicalPart::Image { .. } => {
                    // Images are not counted via text tokenization
                }
            }
        }
    }

    for tool in &request.tools {
        total += estimate_tokens(&tool.input_schema.to_string());
        if let Some(ref desc) = tool.description {
            total += estimate_tokens(desc);
        }
        total += estimate_tokens(&tool.name);
    }

    total
}

/// Back-compute input tokens from a reported context-window percentage.
///
/// `round(budget * pct / 100) - output`, floored at zero. Only as accurate as
/// `context_budget` is for the backend model.
#[must_use]
pub fn input_tokens_from_context(context_budget: u64, percentage: f64, output_tokens: u64) -> u64 {
    if !percentage.is_finite() || percentage <= 0.0 {
        return 0;
    }
    let total = (context_budget as f64 * percentage / 100.0).round();
    let total = if total >= u64::MAX as f64 {
        u64::MAX
    } else {
        total as u64
    };
    total.saturating_sub(output_tokens)
}

/// Log token usage for a completed request at INFO level.
pub fn log_request_usage(request_id: &str, model: &str, usage: &CanonicalUsage, duration: Duration) {
    info!(
        request_id = request_id,
        model = model,
        input_tokens = usage.input_tokens,
        output_tokens = usage.output_tokens,
        total_tokens = usage.total_tokens(),
        duration_seconds = duration.as_secs_f64(),
        "request completed"
    );
}
