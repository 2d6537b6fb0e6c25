use serde_json::Value;
use smallvec::SmallVec;

use crate::error::RelayError;
use crate::protocol::canonical::{
    CanonicalMessage, CanonicalPart, CanonicalRequest, CanonicalRole, CanonicalToolSpec,
    IngressApi, ThinkingConfig, ThinkingMode,
};
use crate::protocol::converter::{parse_body, split_data_url};
use crate::protocol::mapping::openai_role_to_canonical;
use crate::reconstruct::repair::parse_arguments;

use super::{OpenAiChatRequest, OpenAiMessage, OpenAiTool};

/// Decode an `OpenAI` Chat Completions request body into the canonical IR.
///
/// # Errors
///
/// Returns [`RelayError::InvalidRequest`] for malformed bodies or requests
/// without messages.
pub fn decode_request(body: &[u8]) -> Result<CanonicalRequest, RelayError> {
    let request: OpenAiChatRequest = parse_body(body)?;
    decode_openai_chat_request(request, IngressApi::OpenAiChat)
}

pub(crate) fn decode_openai_chat_request(
    request: OpenAiChatRequest,
    ingress: IngressApi,
) -> Result<CanonicalRequest, RelayError> {
    if request.messages.is_empty() {
        return Err(RelayError::InvalidRequest("messages must not be empty".into()));
    }

    let mut canonical = CanonicalRequest::new(ingress, request.model);
    canonical.stream = request.stream.unwrap_or(false);
    canonical.temperature = request.temperature;
    canonical.max_tokens = request.max_tokens.or(request.max_completion_tokens);
    canonical.thinking = request.reasoning_effort.map(|effort| ThinkingConfig {
        mode: ThinkingMode::Enabled,
        budget_tokens: None,
        effort: Some(effort),
    });
    canonical.tools = decode_tools(request.tools.unwrap_or_default());

    let mut system_parts: Vec<String> = Vec::new();
    for msg in request.messages {
        let role = openai_role_to_canonical(&msg.role);
        if role == CanonicalRole::System {
            let text = text_of(msg.content.as_ref());
            if !text.is_empty() {
                system_parts.push(text);
            }
            continue;
        }
        canonical.messages.push(decode_message(role, msg));
    }
    if !system_parts.is_empty() {
        canonical.system_prompt = Some(system_parts.join("\n"));
    }
    Ok(canonical)
}

pub(crate) fn decode_tools(tools: Vec<OpenAiTool>) -> Vec<CanonicalToolSpec> {
    tools
        .into_iter()
        .filter(|tool| tool.type_ == "function")
        .map(|tool| CanonicalToolSpec {
            name: tool.function.name,
            description: tool.function.description,
            input_schema: tool
                .function
                .parameters
                .unwrap_or_else(|| serde_json::json!({"type": "object", "properties": {}})),
        })
        .collect()
}

/// Concatenated text of a string or content-part array.
pub(crate) fn text_of(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => {
            let mut text = String::new();
            for part in parts {
                let kind = part.get("type").and_then(Value::as_str);
                if matches!(kind, Some("text" | "input_text" | "output_text")) {
                    if let Some(t) = part.get("text").and_then(Value::as_str) {
                        text.push_str(t);
                    }
                }
            }
            text
        }
        _ => String::new(),
    }
}

fn decode_content_parts(content: Option<Value>, parts: &mut SmallVec<[CanonicalPart; 1]>) {
    match content {
        Some(Value::String(s)) => {
            if !s.is_empty() {
                parts.push(CanonicalPart::Text(s));
            }
        }
        Some(Value::Array(items)) => {
            for item in items {
                match item.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        if let Some(t) = item.get("text").and_then(Value::as_str) {
                            parts.push(CanonicalPart::Text(t.to_owned()));
                        }
                    }
                    Some("image_url") => {
                        let url = item
                            .get("image_url")
                            .and_then(|v| v.get("url").or(Some(v)))
                            .and_then(Value::as_str);
                        if let Some((media_type, data)) = url.and_then(split_data_url) {
                            parts.push(CanonicalPart::Image { media_type, data });
                        } else {
                            tracing::debug!("skipping non-inline image reference");
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }
}

fn decode_message(role: CanonicalRole, msg: OpenAiMessage) -> CanonicalMessage {
    let mut parts: SmallVec<[CanonicalPart; 1]> = SmallVec::new();
    match role {
        CanonicalRole::Tool => {
            parts.push(CanonicalPart::ToolResult {
                tool_call_id: msg.tool_call_id.unwrap_or_default(),
                content: text_of(msg.content.as_ref()),
                is_error: false,
            });
        }
        _ => {
            if let Some(reasoning) = msg.reasoning_content.filter(|r| !r.is_empty()) {
                parts.push(CanonicalPart::Reasoning(reasoning));
            }
            decode_content_parts(msg.content, &mut parts);
            for call in msg.tool_calls.unwrap_or_default() {
                parts.push(CanonicalPart::ToolCall {
                    id: call.id,
                    name: call.function.name,
                    arguments: parse_arguments(&call.function.arguments)
                        .unwrap_or_else(|| Value::Object(serde_json::Map::new())),
                });
            }
        }
    }
    CanonicalMessage { role, parts }
}
