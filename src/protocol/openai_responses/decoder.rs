use serde_json::Value;
use smallvec::{smallvec, SmallVec};

use crate::error::RelayError;
use crate::protocol::canonical::{
    CanonicalMessage, CanonicalPart, CanonicalRequest, CanonicalRole, CanonicalToolSpec,
    IngressApi, ThinkingConfig, ThinkingMode,
};
use crate::protocol::converter::{parse_body, split_data_url};
use crate::protocol::mapping::openai_role_to_canonical;
use crate::reconstruct::repair::parse_arguments;

use super::ResponsesRequest;

/// Decode a Responses API request body.
///
/// # Errors
///
/// Returns [`RelayError::InvalidRequest`] for malformed bodies or empty input.
pub fn decode_request(body: &[u8]) -> Result<CanonicalRequest, RelayError> {
    let request: ResponsesRequest = parse_body(body)?;
    let mut canonical = CanonicalRequest::new(IngressApi::OpenAiResponses, request.model);
    canonical.stream = request.stream.unwrap_or(false);
    canonical.temperature = request.temperature;
    canonical.max_tokens = request.max_output_tokens;
    canonical.thinking = request
        .reasoning
        .and_then(|r| r.effort)
        .map(|effort| ThinkingConfig {
            mode: ThinkingMode::Enabled,
            budget_tokens: None,
            effort: Some(effort),
        });
    canonical.tools = request
        .tools
        .unwrap_or_default()
        .into_iter()
        .filter(|tool| tool.type_ == "function")
        .filter_map(|tool| {
            Some(CanonicalToolSpec {
                name: tool.name?,
                description: tool.description,
                input_schema: tool
                    .parameters
                    .unwrap_or_else(|| serde_json::json!({"type": "object", "properties": {}})),
            })
        })
        .collect();

    let mut system = request.instructions.unwrap_or_default();
    match request.input {
        Value::String(text) => canonical
            .messages
            .push(CanonicalMessage::text(CanonicalRole::User, text)),
        Value::Array(items) => {
            for item in &items {
                decode_item(item, &mut canonical.messages, &mut system);
            }
        }
        _ => return Err(RelayError::InvalidRequest("input must be a string or an array".into())),
    }
    if canonical.messages.is_empty() {
        return Err(RelayError::InvalidRequest("input must not be empty".into()));
    }
    if !system.is_empty() {
        canonical.system_prompt = Some(system);
    }
    Ok(canonical)
}

/// Append to the previous message when it has the same role, so function
/// call items after an assistant message stay in one turn.
fn push_part(messages: &mut Vec<CanonicalMessage>, role: CanonicalRole, part: CanonicalPart) {
    match messages.last_mut() {
        Some(last) if last.role == role => last.parts.push(part),
        _ => messages.push(CanonicalMessage {
            role,
            parts: smallvec![part],
        }),
    }
}

fn decode_item(item: &Value, messages: &mut Vec<CanonicalMessage>, system: &mut String) {
    let str_field = |key: &str| item.get(key).and_then(Value::as_str).unwrap_or("").to_owned();
    match item.get("type").and_then(Value::as_str).unwrap_or("message") {
        "message" => {
            let role = openai_role_to_canonical(item.get("role").and_then(Value::as_str).unwrap_or("user"));
            let parts = content_parts(item.get("content"));
            if role == CanonicalRole::System {
                for part in &parts {
                    if let CanonicalPart::Text(text) = part {
                        if !system.is_empty() {
                            system.push('\n');
                        }
                        system.push_str(text);
                    }
                }
                return;
            }
            for part in parts {
                push_part(messages, role, part);
            }
        }
        "function_call" => push_part(
            messages,
            CanonicalRole::Assistant,
            CanonicalPart::ToolCall {
                id: str_field("call_id"),
                name: str_field("name"),
                arguments: parse_arguments(&str_field("arguments"))
                    .unwrap_or_else(|| Value::Object(serde_json::Map::new())),
            },
        ),
        "function_call_output" => push_part(
            messages,
            CanonicalRole::User,
            CanonicalPart::ToolResult {
                tool_call_id: str_field("call_id"),
                content: match item.get("output") {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => String::new(),
                },
                is_error: false,
            },
        ),
        "reasoning" => {
            let text: String = item
                .get("summary")
                .and_then(Value::as_array)
                .map(|parts| {
                    parts
                        .iter()
                        .filter_map(|p| p.get("text").and_then(Value::as_str))
                        .collect()
                })
                .unwrap_or_default();
            if !text.is_empty() {
                push_part(messages, CanonicalRole::Assistant, CanonicalPart::Reasoning(text));
            }
        }
        _ => {}
    }
}

fn content_parts(content: Option<&Value>) -> SmallVec<[CanonicalPart; 1]> {
    let mut parts = SmallVec::new();
    match content {
        Some(Value::String(text)) => parts.push(CanonicalPart::Text(text.clone())),
        Some(Value::Array(items)) => {
            for item in items {
                match item.get("type").and_then(Value::as_str) {
                    Some("input_text" | "output_text" | "text") => {
                        if let Some(text) = item.get("text").and_then(Value::as_str) {
                            parts.push(CanonicalPart::Text(text.to_owned()));
                        }
                    }
                    Some("input_image") => {
                        let image = item.get("image_url").and_then(Value::as_str).and_then(split_data_url);
                        if let Some((media_type, data)) = image {
                            parts.push(CanonicalPart::Image { media_type, data });
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }
    parts
}
