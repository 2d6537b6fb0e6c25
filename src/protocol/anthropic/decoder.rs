use serde_json::Value;
use smallvec::SmallVec;

use crate::error::RelayError;
use crate::protocol::canonical::{
    CanonicalMessage, CanonicalPart, CanonicalRequest, CanonicalRole, CanonicalToolSpec,
    IngressApi, ThinkingConfig, ThinkingMode,
};
use crate::protocol::converter::parse_body;

use super::AnthropicRequest;

/// Decode an Anthropic Messages request body into the canonical IR.
///
/// # Errors
///
/// Returns [`RelayError::InvalidRequest`] for malformed bodies, unknown roles
/// or an empty message list.
pub fn decode_request(body: &[u8]) -> Result<CanonicalRequest, RelayError> {
    let request: AnthropicRequest = parse_body(body)?;
    if request.messages.is_empty() {
        return Err(RelayError::InvalidRequest("messages must not be empty".into()));
    }

    let thinking = decode_thinking(&request);
    let mut canonical = CanonicalRequest::new(IngressApi::Anthropic, request.model);
    canonical.stream = request.stream.unwrap_or(false);
    canonical.max_tokens = request.max_tokens;
    canonical.temperature = request.temperature;
    canonical.system_prompt = request.system.as_ref().map(system_text).filter(|s| !s.is_empty());
    canonical.thinking = thinking;
    canonical.tools = request
        .tools
        .unwrap_or_default()
        .into_iter()
        .map(|tool| CanonicalToolSpec {
            name: tool.name,
            description: tool.description,
            input_schema: tool
                .input_schema
                .unwrap_or_else(|| serde_json::json!({"type": "object", "properties": {}})),
        })
        .collect();

    for msg in request.messages {
        let role = match msg.role.as_str() {
            "user" => CanonicalRole::User,
            "assistant" => CanonicalRole::Assistant,
            other => {
                return Err(RelayError::InvalidRequest(format!("unsupported role: {other}")));
            }
        };
        canonical.messages.push(CanonicalMessage {
            role,
            parts: decode_content(msg.content),
        });
    }
    Ok(canonical)
}

fn decode_thinking(request: &AnthropicRequest) -> Option<ThinkingConfig> {
    let thinking = request.thinking.as_ref()?;
    let mode = match thinking.type_.as_str() {
        "enabled" => ThinkingMode::Enabled,
        "adaptive" => ThinkingMode::Adaptive,
        _ => return None,
    };
    Some(ThinkingConfig {
        mode,
        budget_tokens: thinking.budget_tokens,
        effort: request.output_config.as_ref().and_then(|c| c.effort.clone()),
    })
}

/// `system` may be a string or an array of text blocks.
fn system_text(system: &Value) -> String {
    match system {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn tool_result_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Some(other) if !other.is_null() => other.to_string(),
        _ => String::new(),
    }
}

fn decode_content(content: Value) -> SmallVec<[CanonicalPart; 1]> {
    let mut parts = SmallVec::new();
    let blocks = match content {
        Value::String(text) => {
            parts.push(CanonicalPart::Text(text));
            return parts;
        }
        Value::Array(blocks) => blocks,
        _ => return parts,
    };
    for block in blocks {
        let str_field = |key: &str| block.get(key).and_then(Value::as_str).unwrap_or("").to_owned();
        match block.get("type").and_then(Value::as_str) {
            Some("text") => parts.push(CanonicalPart::Text(str_field("text"))),
            Some("thinking") => parts.push(CanonicalPart::Reasoning(str_field("thinking"))),
            Some("image") => {
                let source = block.get("source");
                let data = source.and_then(|s| s.get("data")).and_then(Value::as_str);
                let media_type = source.and_then(|s| s.get("media_type")).and_then(Value::as_str);
                if let (Some(data), Some(media_type)) = (data, media_type) {
                    parts.push(CanonicalPart::Image {
                        media_type: media_type.to_owned(),
                        data: data.to_owned(),
                    });
                }
            }
            Some("tool_use") => parts.push(CanonicalPart::ToolCall {
                id: str_field("id"),
                name: str_field("name"),
                arguments: block
                    .get("input")
                    .cloned()
                    .unwrap_or_else(|| Value::Object(serde_json::Map::new())),
            }),
            Some("tool_result") => parts.push(CanonicalPart::ToolResult {
                tool_call_id: str_field("tool_use_id"),
                content: tool_result_text(block.get("content")),
                is_error: block.get("is_error").and_then(Value::as_bool).unwrap_or(false),
            }),
            _ => {}
        }
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_blocks_and_thinking() {
        let body = json!({
            "model": "claude-sonnet-4-5",
            "max_tokens": 1024,
            "stream": true,
            "system": [{"type": "text", "text": "a"}, {"type": "text", "text": "b"}],
            "thinking": {"type": "enabled", "budget_tokens": 2048},
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": [
                    {"type": "thinking", "thinking": "hm", "signature": "s"},
                    {"type": "tool_use", "id": "t1", "name": "f", "input": {"q": 1}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "t1", "content": [{"type": "text", "text": "done"}], "is_error": true},
                    {"type": "image", "source": {"type": "base64", "media_type": "image/jpeg", "data": "BBBB"}}
                ]}
            ],
            "tools": [{"name": "f", "input_schema": {"type": "object"}}]
        });
        let request = decode_request(body.to_string().as_bytes()).unwrap();
        assert_eq!(request.system_prompt.as_deref(), Some("a\nb"));
        let thinking = request.thinking.unwrap();
        assert_eq!(thinking.mode, ThinkingMode::Enabled);
        assert_eq!(thinking.budget_tokens, Some(2048));
        assert_eq!(request.messages[1].parts.len(), 2);
        assert_eq!(
            request.messages[2].parts[0],
            CanonicalPart::ToolResult {
                tool_call_id: "t1".into(),
                content: "done".into(),
                is_error: true,
            }
        );
        assert!(matches!(request.messages[2].parts[1], CanonicalPart::Image { .. }));
    }

    #[test]
    fn unknown_role_is_invalid() {
        let err = decode_request(br#"{"model":"m","messages":[{"role":"system","content":"x"}]}"#).unwrap_err();
        assert!(matches!(err, RelayError::InvalidRequest(_)));
    }
}
