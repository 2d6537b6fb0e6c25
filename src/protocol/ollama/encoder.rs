use serde_json::{json, Value};

use crate::protocol::canonical::{CanonicalPart, CanonicalResponse, IngressApi, ModelInfo};
use crate::protocol::framing::rules_for;

use super::created_at;

/// Encode a canonical response as a non-streaming `/api/chat` reply.
#[must_use]
pub fn encode_response(response: &CanonicalResponse) -> Value {
    let mut content = String::new();
    let mut thinking = String::new();
    let mut tool_calls = Vec::new();
    for part in &response.content {
        match part {
            CanonicalPart::Text(text) => content.push_str(text),
            CanonicalPart::Reasoning(text) => thinking.push_str(text),
            CanonicalPart::ToolCall {
                name, arguments, ..
            } => tool_calls.push(json!({"function": {"name": name, "arguments": arguments}})),
            CanonicalPart::Image { .. } | CanonicalPart::ToolResult { .. } => {}
        }
    }
    let mut message = json!({"role": "assistant", "content": content});
    if !thinking.is_empty() {
        message["thinking"] = Value::String(thinking);
    }
    if !tool_calls.is_empty() {
        message["tool_calls"] = Value::Array(tool_calls);
    }
    json!({
        "model": response.model,
        "created_at": created_at(),
        "message": message,
        "done": true,
        "done_reason": rules_for(IngressApi::Ollama).finish_reason(response.stop_reason),
        "prompt_eval_count": response.usage.input_tokens,
        "eval_count": response.usage.output_tokens,
    })
}

/// `GET /api/tags` body.
#[must_use]
pub fn encode_model_list(models: &[ModelInfo]) -> Value {
    let modified_at = created_at();
    let models: Vec<Value> = models
        .iter()
        .map(|model| {
            json!({
                "name": model.id,
                "model": model.id,
                "modified_at": modified_at,
                "size": 0,
                "digest": "",
                "details": {"family": model.owned_by, "format": "remote"},
            })
        })
        .collect();
    json!({"models": models})
}
