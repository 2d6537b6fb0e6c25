use serde_json::{json, Value};

use crate::protocol::canonical::{CanonicalPart, CanonicalResponse, IngressApi, ModelInfo};
use crate::protocol::framing::rules_for;
use crate::protocol::mapping::canonical_usage_to_openai;
use crate::util::unix_now_secs;

/// Encode a canonical response as an `OpenAI` `chat.completion` object.
#[must_use]
pub fn encode_response(response: &CanonicalResponse) -> Value {
    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls = Vec::new();
    for part in &response.content {
        match part {
            CanonicalPart::Text(t) => text.push_str(t),
            CanonicalPart::Reasoning(t) => reasoning.push_str(t),
            CanonicalPart::ToolCall {
                id,
                name,
                arguments,
            } => tool_calls.push(json!({
                "id": id,
                "type": "function",
                "function": {"name": name, "arguments": arguments.to_string()},
            })),
            CanonicalPart::Image { .. } | CanonicalPart::ToolResult { .. } => {}
        }
    }

    let content = if text.is_empty() && !tool_calls.is_empty() {
        Value::Null
    } else {
        Value::String(text)
    };
    let mut message = json!({"role": "assistant", "content": content});
    if !reasoning.is_empty() {
        message["reasoning_content"] = Value::String(reasoning);
    }
    if !tool_calls.is_empty() {
        message["tool_calls"] = Value::Array(tool_calls);
    }

    json!({
        "id": response.id,
        "object": "chat.completion",
        "created": unix_now_secs(),
        "model": response.model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": rules_for(IngressApi::OpenAiChat).finish_reason(response.stop_reason),
        }],
        "usage": canonical_usage_to_openai(&response.usage),
    })
}

/// `GET /v1/models` body.
#[must_use]
pub fn encode_model_list(models: &[ModelInfo]) -> Value {
    let created = unix_now_secs();
    let data: Vec<Value> = models
        .iter()
        .map(|model| {
            json!({
                "id": model.id,
                "object": "model",
                "created": created,
                "owned_by": model.owned_by,
            })
        })
        .collect();
    json!({"object": "list", "data": data})
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::canonical::{CanonicalStopReason, CanonicalUsage};

    #[test]
    fn tool_call_response_shape() {
        let response = CanonicalResponse {
            id: "chatcmpl-1".into(),
            model: "m".into(),
            content: vec![CanonicalPart::ToolCall {
                id: "c1".into(),
                name: "f".into(),
                arguments: json!({"a": 1}),
            }],
            stop_reason: CanonicalStopReason::ToolCalls,
            usage: CanonicalUsage {
                input_tokens: 3,
                output_tokens: 2,
            },
        };
        let body = encode_response(&response);
        assert_eq!(body["choices"][0]["finish_reason"], "tool_calls");
        assert_eq!(body["choices"][0]["message"]["content"], Value::Null);
        assert_eq!(body["choices"][0]["message"]["tool_calls"][0]["function"]["arguments"], "{\"a\":1}");
        assert_eq!(body["usage"]["total_tokens"], 5);
    }

    #[test]
    fn model_list_shape() {
        let body = encode_model_list(&[ModelInfo {
            id: "m1".into(),
            owned_by: "kiro".into(),
        }]);
        assert_eq!(body["object"], "list");
        assert_eq!(body["data"][0]["id"], "m1");
    }
}
