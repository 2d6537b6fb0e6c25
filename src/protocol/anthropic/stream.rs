use bytes::Bytes;
use rustc_hash::FxHashMap;
use serde_json::{json, Value};

use crate::error::{format_error, RelayError};
use crate::protocol::canonical::{BlockKind, CanonicalStreamEvent, CanonicalUsage, IngressApi};
use crate::protocol::framing::rules_for;
use crate::protocol::mapping::canonical_usage_to_anthropic;
use crate::stream::sse::named_frame;
use crate::stream::StreamEncoder;

/// Canonical events to Anthropic Messages SSE events.
pub struct MessagesStreamEncoder {
    id: String,
    model: String,
    /// Canonical block index to the client-visible `index`.
    blocks: FxHashMap<usize, usize>,
    next_index: usize,
    usage: Option<CanonicalUsage>,
}

impl MessagesStreamEncoder {
    #[must_use]
    pub fn new(model: &str, id: &str) -> Self {
        Self {
            id: id.to_owned(),
            model: model.to_owned(),
            blocks: FxHashMap::default(),
            next_index: 0,
            usage: None,
        }
    }

    fn event(out: &mut Vec<Bytes>, name: &str, body: &Value) {
        out.push(named_frame(name, &body.to_string()));
    }

    fn delta(&self, out: &mut Vec<Bytes>, index: usize, delta: Value) {
        let Some(client_index) = self.blocks.get(&index) else {
            return;
        };
        Self::event(
            out,
            "content_block_delta",
            &json!({"type": "content_block_delta", "index": client_index, "delta": delta}),
        );
    }
}

impl StreamEncoder for MessagesStreamEncoder {
    fn encode(&mut self, event: &CanonicalStreamEvent, out: &mut Vec<Bytes>) {
        match event {
            CanonicalStreamEvent::MessageStart { input_tokens, .. } => {
                let body = json!({
                    "type": "message_start",
                    "message": {
                        "id": self.id,
                        "type": "message",
                        "role": "assistant",
                        "model": self.model,
                        "content": [],
                        "stop_reason": null,
                        "stop_sequence": null,
                        "usage": {"input_tokens": input_tokens, "output_tokens": 0},
                    },
                });
                Self::event(out, "message_start", &body);
            }
            CanonicalStreamEvent::BlockStart { index, kind } => {
                let client_index = self.next_index;
                self.next_index += 1;
                self.blocks.insert(*index, client_index);
                let content_block = match kind {
                    BlockKind::Text => json!({"type": "text", "text": ""}),
                    BlockKind::Reasoning => json!({"type": "thinking", "thinking": ""}),
                    BlockKind::ToolUse { id, name } => {
                        json!({"type": "tool_use", "id": id, "name": name, "input": {}})
                    }
                };
                Self::event(
                    out,
                    "content_block_start",
                    &json!({"type": "content_block_start", "index": client_index, "content_block": content_block}),
                );
            }
            CanonicalStreamEvent::TextDelta { index, text } => {
                self.delta(out, *index, json!({"type": "text_delta", "text": text}));
            }
            CanonicalStreamEvent::ReasoningDelta { index, text } => {
                self.delta(out, *index, json!({"type": "thinking_delta", "thinking": text}));
            }
            CanonicalStreamEvent::ToolArgsDelta {
                index,
                partial_json,
            } => {
                self.delta(
                    out,
                    *index,
                    json!({"type": "input_json_delta", "partial_json": partial_json}),
                );
            }
            CanonicalStreamEvent::BlockStop { index } => {
                if let Some(client_index) = self.blocks.remove(index) {
                    Self::event(
                        out,
                        "content_block_stop",
                        &json!({"type": "content_block_stop", "index": client_index}),
                    );
                }
            }
            CanonicalStreamEvent::Usage(usage) => self.usage = Some(*usage),
            CanonicalStreamEvent::MessageEnd { stop_reason, usage } => {
                let usage = self.usage.take().unwrap_or(*usage);
                let body = json!({
                    "type": "message_delta",
                    "delta": {
                        "stop_reason": rules_for(IngressApi::Anthropic).finish_reason(*stop_reason),
                        "stop_sequence": null,
                    },
                    "usage": canonical_usage_to_anthropic(&usage),
                });
                Self::event(out, "message_delta", &body);
            }
            CanonicalStreamEvent::Done => {
                Self::event(out, "message_stop", &json!({"type": "message_stop"}));
            }
        }
    }

    fn encode_error(&mut self, err: &RelayError, out: &mut Vec<Bytes>) {
        let (_, body) = format_error(err, IngressApi::Anthropic);
        Self::event(out, "error", &body);
    }
}
