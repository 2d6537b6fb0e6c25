use serde_json::Value;
use smallvec::SmallVec;

use crate::error::RelayError;
use crate::protocol::canonical::{
    CanonicalMessage, CanonicalPart, CanonicalRequest, CanonicalRole, IngressApi, ThinkingConfig,
    ThinkingMode,
};
use crate::protocol::converter::parse_body;
use crate::protocol::mapping::openai_role_to_canonical;
use crate::protocol::openai_chat::decoder::decode_tools;

use super::OllamaChatRequest;

/// Decode an Ollama `/api/chat` body. `stream` defaults to true.
///
/// # Errors
///
/// Returns [`RelayError::InvalidRequest`] for malformed bodies or an empty
/// message list.
pub fn decode_request(body: &[u8]) -> Result<CanonicalRequest, RelayError> {
    let request: OllamaChatRequest = parse_body(body)?;
    if request.messages.is_empty() {
        return Err(RelayError::InvalidRequest("messages must not be empty".into()));
    }
    let mut canonical = CanonicalRequest::new(IngressApi::Ollama, request.model);
    canonical.stream = request.stream.unwrap_or(true);
    if let Some(options) = &request.options {
        canonical.temperature = options.temperature;
        canonical.max_tokens = options.num_predict;
    }
    if request.think == Some(true) {
        canonical.thinking = Some(ThinkingConfig {
            mode: ThinkingMode::Adaptive,
            budget_tokens: None,
            effort: None,
        });
    }
    canonical.tools = decode_tools(request.tools.unwrap_or_default());

    let mut system = Vec::new();
    for msg in request.messages {
        let role = openai_role_to_canonical(&msg.role);
        if role == CanonicalRole::System {
            system.push(msg.content);
            continue;
        }
        let mut parts: SmallVec<[CanonicalPart; 1]> = SmallVec::new();
        if role == CanonicalRole::Tool {
            parts.push(CanonicalPart::ToolResult {
                tool_call_id: msg.tool_name.unwrap_or_default(),
                content: msg.content,
                is_error: false,
            });
            canonical.messages.push(CanonicalMessage {
                role: CanonicalRole::User,
                parts,
            });
            continue;
        }
        if let Some(thinking) = msg.thinking.filter(|t| !t.is_empty()) {
            parts.push(CanonicalPart::Reasoning(thinking));
        }
        if !msg.content.is_empty() {
            parts.push(CanonicalPart::Text(msg.content));
        }
        for image in msg.images.unwrap_or_default() {
            parts.push(CanonicalPart::Image {
                media_type: "image/png".into(),
                data: image,
            });
        }
        for call in msg.tool_calls.unwrap_or_default() {
            let arguments = match call.function.arguments {
                Value::Object(map) => Value::Object(map),
                Value::String(s) => crate::reconstruct::repair::parse_arguments(&s)
                    .unwrap_or_else(|| Value::Object(serde_json::Map::new())),
                _ => Value::Object(serde_json::Map::new()),
            };
            parts.push(CanonicalPart::ToolCall {
                id: call.function.name.clone(),
                name: call.function.name,
                arguments,
            });
        }
        canonical.messages.push(CanonicalMessage { role, parts });
    }
    if !system.is_empty() {
        canonical.system_prompt = Some(system.join("\n"));
    }
    Ok(canonical)
}
