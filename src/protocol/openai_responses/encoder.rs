use serde_json::{json, Value};

use crate::protocol::canonical::{
    CanonicalPart, CanonicalResponse, CanonicalUsage, IngressApi,
};
use crate::protocol::framing::rules_for;
use crate::protocol::mapping::canonical_usage_to_responses;
use crate::util::unix_now_secs;

pub(crate) fn message_item(id: &str, text: &str) -> Value {
    json!({
        "type": "message",
        "id": id,
        "status": "completed",
        "role": "assistant",
        "content": [{"type": "output_text", "text": text, "annotations": []}],
    })
}

pub(crate) fn reasoning_item(id: &str, text: &str) -> Value {
    json!({
        "type": "reasoning",
        "id": id,
        "summary": [{"type": "summary_text", "text": text}],
    })
}

pub(crate) fn function_call_item(id: &str, call_id: &str, name: &str, arguments: &str) -> Value {
    json!({
        "type": "function_call",
        "id": id,
        "call_id": call_id,
        "name": name,
        "arguments": arguments,
        "status": "completed",
    })
}

/// Full `response` object; the stream's `response.completed` reuses it.
pub(crate) fn response_object(
    id: &str,
    model: &str,
    created_at: u64,
    status: &str,
    output: Vec<Value>,
    usage: Option<&CanonicalUsage>,
) -> Value {
    json!({
        "id": id,
        "object": "response",
        "created_at": created_at,
        "status": status,
        "model": model,
        "output": output,
        "usage": usage.map(canonical_usage_to_responses),
    })
}

/// Encode a canonical response as a Responses API `response` object.
#[must_use]
pub fn encode_response(response: &CanonicalResponse) -> Value {
    let mut output = Vec::with_capacity(response.content.len());
    for (i, part) in response.content.iter().enumerate() {
        match part {
            CanonicalPart::Text(text) => output.push(message_item(&format!("msg_{}_{i}", response.id), text)),
            CanonicalPart::Reasoning(text) => {
                output.push(reasoning_item(&format!("rs_{}_{i}", response.id), text));
            }
            CanonicalPart::ToolCall {
                id,
                name,
                arguments,
            } => output.push(function_call_item(
                &format!("fc_{id}"),
                id,
                name,
                &arguments.to_string(),
            )),
            CanonicalPart::Image { .. } | CanonicalPart::ToolResult { .. } => {}
        }
    }
    response_object(
        &response.id,
        &response.model,
        unix_now_secs(),
        rules_for(IngressApi::OpenAiResponses).finish_reason(response.stop_reason),
        output,
        Some(&response.usage),
    )
}
