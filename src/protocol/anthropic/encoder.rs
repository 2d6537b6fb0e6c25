use serde_json::{json, Value};

use crate::protocol::canonical::{CanonicalPart, CanonicalResponse, IngressApi, ModelInfo};
use crate::protocol::framing::rules_for;

use super::{AnthropicContentBlock, AnthropicResponse, AnthropicUsage};

/// Encode a canonical response as an Anthropic `message` object.
#[must_use]
pub fn encode_response(response: &CanonicalResponse) -> Value {
    let content = response
        .content
        .iter()
        .filter_map(|part| match part {
            CanonicalPart::Text(text) => Some(AnthropicContentBlock::Text { text: text.clone() }),
            CanonicalPart::Reasoning(thinking) => Some(AnthropicContentBlock::Thinking {
                thinking: thinking.clone(),
                signature: String::new(),
            }),
            CanonicalPart::ToolCall {
                id,
                name,
                arguments,
            } => Some(AnthropicContentBlock::ToolUse {
                id: id.clone(),
                name: name.clone(),
                input: arguments.clone(),
            }),
            CanonicalPart::Image { .. } | CanonicalPart::ToolResult { .. } => None,
        })
        .collect();

    let message = AnthropicResponse {
        id: response.id.clone(),
        type_: "message",
        role: "assistant",
        model: response.model.clone(),
        content,
        stop_reason: rules_for(IngressApi::Anthropic).finish_reason(response.stop_reason),
        stop_sequence: None,
        usage: AnthropicUsage {
            input_tokens: response.usage.input_tokens,
            output_tokens: response.usage.output_tokens,
        },
    };
    serde_json::to_value(message).unwrap_or(Value::Null)
}

/// Anthropic-style `GET /v1/models` body.
#[must_use]
pub fn encode_model_list(models: &[ModelInfo]) -> Value {
    let data: Vec<Value> = models
        .iter()
        .map(|model| {
            json!({
                "type": "model",
                "id": model.id,
                "display_name": model.id,
                "created_at": "1970-01-01T00:00:00Z",
            })
        })
        .collect();
    json!({
        "data": data,
        "has_more": false,
        "first_id": models.first().map(|m| m.id.as_str()),
        "last_id": models.last().map(|m| m.id.as_str()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::canonical::{CanonicalStopReason, CanonicalUsage};

    #[test]
    fn message_shape() {
        let response = CanonicalResponse {
            id: "msg_1".into(),
            model: "claude".into(),
            content: vec![
                CanonicalPart::Reasoning("r".into()),
                CanonicalPart::Text("t".into()),
                CanonicalPart::ToolCall {
                    id: "t1".into(),
                    name: "f".into(),
                    arguments: json!({}),
                },
            ],
            stop_reason: CanonicalStopReason::ToolCalls,
            usage: CanonicalUsage {
                input_tokens: 1,
                output_tokens: 2,
            },
        };
        let body = encode_response(&response);
        assert_eq!(body["type"], "message");
        assert_eq!(body["content"][0]["type"], "thinking");
        assert_eq!(body["content"][2]["type"], "tool_use");
        assert_eq!(body["stop_reason"], "tool_use");
        assert_eq!(body["usage"]["output_tokens"], 2);
    }
}
