//! The OpenAI chat shape as spoken to OpenAI-compatible backends.

use rustc_hash::FxHashMap;
use serde_json::{json, Value};

use crate::error::RelayError;
use crate::observability::token_counter::estimate_tokens;
use crate::protocol::canonical::{
    BlockKind, CanonicalPart, CanonicalRequest, CanonicalResponse, CanonicalRole,
    CanonicalStopReason, CanonicalStreamEvent, CanonicalUsage,
};
use crate::protocol::framing::correct_stop_reason;
use crate::protocol::mapping::{canonical_role_to_openai, openai_stop_to_canonical, openai_usage_to_canonical};
use crate::reconstruct::repair::parse_arguments;
use crate::util::next_call_id;

use super::{
    OpenAiChatRequest, OpenAiMessage, OpenAiStreamChunk, OpenAiStreamOptions, OpenAiTool,
    OpenAiToolCall, OpenAiToolCallFunction, OpenAiToolFunction,
};

/// Build the backend request body for `model`.
#[must_use]
pub fn encode_request(request: &CanonicalRequest, model: &str, stream: bool) -> OpenAiChatRequest {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);
    if let Some(system) = request.system_prompt.as_deref() {
        messages.push(OpenAiMessage {
            role: "system".into(),
            content: Some(Value::String(system.to_owned())),
            ..OpenAiMessage::default()
        });
    }

    for msg in &request.messages {
        let mut content_parts: Vec<Value> = Vec::new();
        let mut has_image = false;
        let mut tool_calls = Vec::new();
        for part in &msg.parts {
            match part {
                CanonicalPart::Text(text) => content_parts.push(json!({"type": "text", "text": text})),
                CanonicalPart::Image { media_type, data } => {
                    has_image = true;
                    content_parts.push(json!({
                        "type": "image_url",
                        "image_url": {"url": format!("data:{media_type};base64,{data}")},
                    }));
                }
                CanonicalPart::ToolCall {
                    id,
                    name,
                    arguments,
                } => tool_calls.push(OpenAiToolCall {
                    id: id.clone(),
                    type_: "function".into(),
                    function: OpenAiToolCallFunction {
                        name: name.clone(),
                        arguments: arguments.to_string(),
                    },
                }),
                CanonicalPart::ToolResult {
                    tool_call_id,
                    content,
                    ..
                } => messages.push(OpenAiMessage {
                    role: "tool".into(),
                    content: Some(Value::String(content.clone())),
                    tool_call_id: Some(tool_call_id.clone()),
                    ..OpenAiMessage::default()
                }),
                CanonicalPart::Reasoning(_) => {}
            }
        }
        if content_parts.is_empty() && tool_calls.is_empty() {
            continue;
        }
        let content = if has_image {
            Some(Value::Array(content_parts))
        } else if content_parts.is_empty() {
            None
        } else {
            let text: String = content_parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect();
            Some(Value::String(text))
        };
        let role = match msg.role {
            CanonicalRole::Tool => CanonicalRole::User,
            other => other,
        };
        messages.push(OpenAiMessage {
            role: canonical_role_to_openai(role).into(),
            content,
            tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            ..OpenAiMessage::default()
        });
    }

    let tools: Vec<OpenAiTool> = request
        .tools
        .iter()
        .map(|tool| OpenAiTool {
            type_: "function".into(),
            function: OpenAiToolFunction {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: Some(tool.input_schema.clone()),
            },
        })
        .collect();

    OpenAiChatRequest {
        model: model.to_owned(),
        messages,
        tools: (!tools.is_empty()).then_some(tools),
        stream: Some(stream),
        stream_options: stream.then_some(OpenAiStreamOptions {
            include_usage: Some(true),
        }),
        temperature: request.temperature,
        max_tokens: request.max_tokens,
        max_completion_tokens: None,
        reasoning_effort: request.thinking.as_ref().and_then(|t| t.effort.clone()),
    }
}

/// Decode a unary `chat.completion` body.
///
/// # Errors
///
/// Returns [`RelayError::Translation`] when the body has no choices.
pub fn decode_response(body: &Value, fallback_model: &str, estimated_input: u64) -> Result<CanonicalResponse, RelayError> {
    let choice = body
        .get("choices")
        .and_then(|c| c.get(0))
        .ok_or_else(|| RelayError::Translation("backend response has no choices".into()))?;
    let message = choice.get("message").cloned().unwrap_or(Value::Null);

    let mut content = Vec::new();
    let mut output_text = String::new();
    if let Some(reasoning) = message
        .get("reasoning_content")
        .or_else(|| message.get("reasoning"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
    {
        output_text.push_str(reasoning);
        content.push(CanonicalPart::Reasoning(reasoning.to_owned()));
    }
    if let Some(text) = message.get("content").and_then(Value::as_str).filter(|s| !s.is_empty()) {
        output_text.push_str(text);
        content.push(CanonicalPart::Text(text.to_owned()));
    }
    for call in message.get("tool_calls").and_then(Value::as_array).into_iter().flatten() {
        let function = call.get("function").cloned().unwrap_or(Value::Null);
        let args = function.get("arguments").and_then(Value::as_str).unwrap_or("");
        output_text.push_str(args);
        content.push(CanonicalPart::ToolCall {
            id: call
                .get("id")
                .and_then(Value::as_str)
                .map_or_else(next_call_id, str::to_owned),
            name: function.get("name").and_then(Value::as_str).unwrap_or("").to_owned(),
            arguments: parse_arguments(args).unwrap_or_else(|| json!({})),
        });
    }

    let saw_tool = content.iter().any(|p| matches!(p, CanonicalPart::ToolCall { .. }));
    let stop = choice
        .get("finish_reason")
        .and_then(Value::as_str)
        .map_or(CanonicalStopReason::EndOfTurn, openai_stop_to_canonical);
    let usage = match body.get("usage") {
        Some(usage) if usage.is_object() => openai_usage_to_canonical(usage),
        _ => CanonicalUsage {
            input_tokens: estimated_input,
            output_tokens: estimate_tokens(&output_text),
        },
    };

    Ok(CanonicalResponse {
        id: body.get("id").and_then(Value::as_str).unwrap_or("").to_owned(),
        model: body
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(fallback_model)
            .to_owned(),
        content,
        stop_reason: correct_stop_reason(stop, saw_tool),
        usage,
    })
}

/// Turns backend stream chunks into block-indexed canonical events.
#[derive(Debug)]
pub struct ChunkDecoder {
    next_index: usize,
    open_text: Option<usize>,
    open_reasoning: Option<usize>,
    open_tool: Option<usize>,
    /// Backend `tool_calls[].index` to canonical block index.
    tool_blocks: FxHashMap<u32, usize>,
    stop_reason: Option<CanonicalStopReason>,
    usage: Option<CanonicalUsage>,
    estimated_input: u64,
    output_text: String,
    saw_tool: bool,
}

impl ChunkDecoder {
    #[must_use]
    pub fn new(estimated_input: u64) -> Self {
        Self {
            next_index: 0,
            open_text: None,
            open_reasoning: None,
            open_tool: None,
            tool_blocks: FxHashMap::default(),
            stop_reason: None,
            usage: None,
            estimated_input,
            output_text: String::new(),
            saw_tool: false,
        }
    }

    fn close_open(&mut self, out: &mut Vec<CanonicalStreamEvent>) {
        for index in [self.open_text.take(), self.open_reasoning.take(), self.open_tool.take()]
            .into_iter()
            .flatten()
        {
            out.push(CanonicalStreamEvent::BlockStop { index });
        }
    }

    fn open(&mut self, kind: BlockKind, out: &mut Vec<CanonicalStreamEvent>) -> usize {
        self.close_open(out);
        let index = self.next_index;
        self.next_index += 1;
        out.push(CanonicalStreamEvent::BlockStart { index, kind });
        index
    }

    pub fn push_chunk(&mut self, chunk: OpenAiStreamChunk, out: &mut Vec<CanonicalStreamEvent>) {
        for choice in chunk.choices {
            let delta = choice.delta;
            if let Some(text) = delta.reasoning_content.filter(|t| !t.is_empty()) {
                let index = match self.open_reasoning {
                    Some(index) => index,
                    None => {
                        let index = self.open(BlockKind::Reasoning, out);
                        self.open_reasoning = Some(index);
                        index
                    }
                };
                self.output_text.push_str(&text);
                out.push(CanonicalStreamEvent::ReasoningDelta { index, text });
            }
            if let Some(text) = delta.content.filter(|t| !t.is_empty()) {
                let index = match self.open_text {
                    Some(index) => index,
                    None => {
                        let index = self.open(BlockKind::Text, out);
                        self.open_text = Some(index);
                        index
                    }
                };
                self.output_text.push_str(&text);
                out.push(CanonicalStreamEvent::TextDelta { index, text });
            }
            for call in delta.tool_calls.unwrap_or_default() {
                self.push_tool_delta(call, out);
            }
            if let Some(reason) = choice.finish_reason {
                self.stop_reason = Some(openai_stop_to_canonical(&reason));
            }
        }
        if let Some(usage) = chunk.usage.filter(Value::is_object) {
            self.usage = Some(openai_usage_to_canonical(&usage));
        }
    }

    fn push_tool_delta(&mut self, call: super::OpenAiStreamToolCall, out: &mut Vec<CanonicalStreamEvent>) {
        let (name, arguments) = call
            .function
            .map(|f| (f.name, f.arguments))
            .unwrap_or_default();
        let index = match self.tool_blocks.get(&call.index).copied() {
            Some(index) => index,
            None => {
                let kind = BlockKind::ToolUse {
                    id: call.id.unwrap_or_else(next_call_id),
                    name: name.unwrap_or_default(),
                };
                let index = self.open(kind, out);
                self.open_tool = Some(index);
                self.tool_blocks.insert(call.index, index);
                self.saw_tool = true;
                index
            }
        };
        let Some(args) = arguments.filter(|a| !a.is_empty()) else {
            return;
        };
        if self.open_tool != Some(index) {
            tracing::debug!(slot = call.index, "late tool argument delta for a closed call, dropped");
            return;
        }
        self.output_text.push_str(&args);
        out.push(CanonicalStreamEvent::ToolArgsDelta {
            index,
            partial_json: args,
        });
    }

    /// Close open blocks and emit `MessageEnd` + `Done`.
    pub fn finish(&mut self, out: &mut Vec<CanonicalStreamEvent>) {
        self.close_open(out);
        let stop = self.stop_reason.unwrap_or(CanonicalStopReason::EndOfTurn);
        let usage = self.usage.unwrap_or(CanonicalUsage {
            input_tokens: self.estimated_input,
            output_tokens: estimate_tokens(&self.output_text),
        });
        out.push(CanonicalStreamEvent::MessageEnd {
            stop_reason: correct_stop_reason(stop, self.saw_tool),
            usage,
        });
        out.push(CanonicalStreamEvent::Done);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::canonical::{CanonicalMessage, CanonicalToolSpec, IngressApi};
    use smallvec::smallvec;

    fn chunk(value: Value) -> OpenAiStreamChunk {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn request_splits_tool_results_into_tool_messages() {
        let mut request = CanonicalRequest::new(IngressApi::Anthropic, "claude");
        request.system_prompt = Some("sys".into());
        request.messages.push(CanonicalMessage {
            role: CanonicalRole::Assistant,
            parts: smallvec![CanonicalPart::ToolCall {
                id: "t1".into(),
                name: "f".into(),
                arguments: json!({"a": 1}),
            }],
        });
        request.messages.push(CanonicalMessage {
            role: CanonicalRole::User,
            parts: smallvec![
                CanonicalPart::ToolResult {
                    tool_call_id: "t1".into(),
                    content: "ok".into(),
                    is_error: false,
                },
                CanonicalPart::Text("next".into()),
            ],
        });
        request.tools.push(CanonicalToolSpec {
            name: "f".into(),
            description: None,
            input_schema: json!({"type": "object"}),
        });
        let body = serde_json::to_value(encode_request(&request, "gpt-x", true)).unwrap();
        assert_eq!(body["model"], "gpt-x");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["tool_calls"][0]["function"]["arguments"], "{\"a\":1}");
        assert_eq!(body["messages"][2]["role"], "tool");
        assert_eq!(body["messages"][3]["content"], "next");
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert_eq!(body["tools"][0]["function"]["name"], "f");
    }

    #[test]
    fn chunks_become_indexed_blocks() {
        let mut decoder = ChunkDecoder::new(9);
        let mut out = Vec::new();
        decoder.push_chunk(chunk(json!({"choices": [{"delta": {"reasoning_content": "hmm"}}]})), &mut out);
        decoder.push_chunk(chunk(json!({"choices": [{"delta": {"content": "Hi"}}]})), &mut out);
        decoder.push_chunk(
            chunk(json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "c1", "function": {"name": "f", "arguments": "{\"a\""}}
            ]}}]})),
            &mut out,
        );
        decoder.push_chunk(
            chunk(json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": ":1}"}}
            ]}, "finish_reason": "stop"}]})),
            &mut out,
        );
        decoder.finish(&mut out);
        assert_eq!(
            out,
            vec![
                CanonicalStreamEvent::BlockStart { index: 0, kind: BlockKind::Reasoning },
                CanonicalStreamEvent::ReasoningDelta { index: 0, text: "hmm".into() },
                CanonicalStreamEvent::BlockStop { index: 0 },
                CanonicalStreamEvent::BlockStart { index: 1, kind: BlockKind::Text },
                CanonicalStreamEvent::TextDelta { index: 1, text: "Hi".into() },
                CanonicalStreamEvent::BlockStop { index: 1 },
                CanonicalStreamEvent::BlockStart {
                    index: 2,
                    kind: BlockKind::ToolUse { id: "c1".into(), name: "f".into() },
                },
                CanonicalStreamEvent::ToolArgsDelta { index: 2, partial_json: "{\"a\"".into() },
                CanonicalStreamEvent::ToolArgsDelta { index: 2, partial_json: ":1}".into() },
                CanonicalStreamEvent::BlockStop { index: 2 },
                CanonicalStreamEvent::MessageEnd {
                    stop_reason: CanonicalStopReason::ToolCalls,
                    usage: CanonicalUsage {
                        input_tokens: 9,
                        output_tokens: estimate_tokens("hmmHi{\"a\":1}"),
                    },
                },
                CanonicalStreamEvent::Done,
            ]
        );
    }

    #[test]
    fn unary_response_decodes_tool_calls() {
        let body = json!({
            "id": "chatcmpl-9",
            "model": "gpt-x",
            "choices": [{"message": {"role": "assistant", "content": "", "tool_calls": [
                {"id": "c1", "type": "function", "function": {"name": "f", "arguments": "{\"a\":1}"}}
            ]}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 5, "completion_tokens": 6}
        });
        let response = decode_response(&body, "fallback", 0).unwrap();
        assert_eq!(response.stop_reason, CanonicalStopReason::ToolCalls);
        assert_eq!(response.usage.output_tokens, 6);
        assert_eq!(response.content.len(), 1);
    }
}
