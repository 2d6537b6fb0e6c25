use serde_json::Value;
use smallvec::SmallVec;

use crate::error::RelayError;
use crate::protocol::canonical::{
    CanonicalMessage, CanonicalPart, CanonicalRequest, CanonicalRole, CanonicalToolSpec,
    IngressApi, ThinkingConfig, ThinkingMode,
};
use crate::protocol::converter::{parse_body, IngressHints};
use crate::protocol::mapping::gemini_role_to_canonical;

use super::{GeminiContent, GeminiRequest, GeminiThinkingConfig};

/// Decode a Gemini `generateContent` body. Model and streaming come from the
/// URL, so they arrive through `hints`.
///
/// # Errors
///
/// Returns [`RelayError::InvalidRequest`] for malformed bodies, a missing model
/// or empty contents.
pub fn decode_request(body: &[u8], hints: &IngressHints) -> Result<CanonicalRequest, RelayError> {
    let request: GeminiRequest = parse_body(body)?;
    let model = hints
        .model
        .clone()
        .filter(|m| !m.is_empty())
        .ok_or_else(|| RelayError::InvalidRequest("model missing from request path".into()))?;
    if request.contents.is_empty() {
        return Err(RelayError::InvalidRequest("contents must not be empty".into()));
    }

    let mut canonical = CanonicalRequest::new(IngressApi::Gemini, model);
    canonical.stream = hints.stream.unwrap_or(false);
    canonical.system_prompt = request
        .system_instruction
        .as_ref()
        .map(content_text)
        .filter(|s| !s.is_empty());
    if let Some(config) = &request.generation_config {
        canonical.temperature = config.temperature;
        canonical.max_tokens = config.max_output_tokens;
        canonical.thinking = config.thinking_config.as_ref().and_then(decode_thinking);
    }
    canonical.tools = request
        .tools
        .unwrap_or_default()
        .into_iter()
        .flat_map(|tool| tool.function_declarations)
        .map(|decl| CanonicalToolSpec {
            name: decl.name,
            description: decl.description,
            input_schema: decl
                .parameters
                .unwrap_or_else(|| serde_json::json!({"type": "object", "properties": {}})),
        })
        .collect();

    for content in request.contents {
        let role = gemini_role_to_canonical(content.role.as_deref().unwrap_or("user"));
        let parts = decode_parts(content);
        // functionResponse turns are user turns carrying tool results.
        let role = if role == CanonicalRole::Tool {
            CanonicalRole::User
        } else {
            role
        };
        canonical.messages.push(CanonicalMessage { role, parts });
    }
    Ok(canonical)
}

/// `thinkingBudget`: -1 is dynamic, 0 disables, positive is a fixed budget.
fn decode_thinking(config: &GeminiThinkingConfig) -> Option<ThinkingConfig> {
    match config.thinking_budget {
        Some(0) => None,
        Some(budget) if budget > 0 => Some(ThinkingConfig {
            mode: ThinkingMode::Enabled,
            budget_tokens: u64::try_from(budget).ok(),
            effort: None,
        }),
        Some(_) => Some(ThinkingConfig {
            mode: ThinkingMode::Adaptive,
            budget_tokens: None,
            effort: None,
        }),
        None if config.include_thoughts == Some(true) => Some(ThinkingConfig {
            mode: ThinkingMode::Adaptive,
            budget_tokens: None,
            effort: None,
        }),
        None => None,
    }
}

fn content_text(content: &GeminiContent) -> String {
    content
        .parts
        .iter()
        .filter_map(|part| part.text.as_deref())
        .collect::<Vec<_>>()
        .join("\n")
}

fn decode_parts(content: GeminiContent) -> SmallVec<[CanonicalPart; 1]> {
    let mut parts = SmallVec::new();
    for part in content.parts {
        if let Some(text) = part.text {
            if part.thought == Some(true) {
                parts.push(CanonicalPart::Reasoning(text));
            } else {
                parts.push(CanonicalPart::Text(text));
            }
        } else if let Some(call) = part.function_call {
            parts.push(CanonicalPart::ToolCall {
                id: call.name.clone(),
                name: call.name,
                arguments: if call.args.is_null() {
                    Value::Object(serde_json::Map::new())
                } else {
                    call.args
                },
            });
        } else if let Some(response) = part.function_response {
            let content = match response.response {
                Value::String(s) => s,
                other => other.to_string(),
            };
            parts.push(CanonicalPart::ToolResult {
                tool_call_id: response.name,
                content,
                is_error: false,
            });
        } else if let Some(inline) = part.inline_data {
            parts.push(CanonicalPart::Image {
                media_type: inline.mime_type,
                data: inline.data,
            });
        }
    }
    parts
}
