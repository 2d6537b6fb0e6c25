use bytes::Bytes;
use rustc_hash::FxHashMap;

use crate::error::{format_error, RelayError};
use crate::protocol::canonical::{BlockKind, CanonicalStreamEvent, CanonicalUsage, IngressApi};
use crate::protocol::framing::rules_for;
use crate::stream::sse::{data_frame, done_frame};
use crate::stream::StreamEncoder;
use crate::util::{push_json_string_escaped, push_u64_decimal, unix_now_secs};

/// Canonical events to `chat.completion.chunk` SSE frames.
pub struct ChatStreamEncoder {
    id: String,
    model: String,
    created: u64,
    /// Canonical block index to `tool_calls[].index`.
    tool_slots: FxHashMap<usize, u32>,
    usage: Option<CanonicalUsage>,
}

impl ChatStreamEncoder {
    #[must_use]
    pub fn new(model: &str, id: &str) -> Self {
        Self {
            id: id.to_owned(),
            model: model.to_owned(),
            created: unix_now_secs(),
            tool_slots: FxHashMap::default(),
            usage: None,
        }
    }

    fn chunk(&self, choice_body: &str) -> Bytes {
        let mut out = String::with_capacity(128 + self.id.len() + self.model.len() + choice_body.len());
        out.push_str("{\"id\":");
        push_json_string_escaped(&mut out, &self.id);
        out.push_str(",\"object\":\"chat.completion.chunk\",\"created\":");
        push_u64_decimal(&mut out, self.created);
        out.push_str(",\"model\":");
        push_json_string_escaped(&mut out, &self.model);
        out.push_str(choice_body);
        out.push('}');
        data_frame(&out)
    }

    fn delta(&self, delta_body: &str) -> Bytes {
        let mut body = String::with_capacity(64 + delta_body.len());
        body.push_str(",\"choices\":[{\"index\":0,\"delta\":");
        body.push_str(delta_body);
        body.push_str(",\"finish_reason\":null}]");
        self.chunk(&body)
    }
}

impl StreamEncoder for ChatStreamEncoder {
    fn encode(&mut self, event: &CanonicalStreamEvent, out: &mut Vec<Bytes>) {
        match event {
            CanonicalStreamEvent::MessageStart { .. } => {
                out.push(self.delta("{\"role\":\"assistant\",\"content\":\"\"}"));
            }
            CanonicalStreamEvent::TextDelta { text, .. } => {
                let mut delta = String::with_capacity(16 + text.len());
                delta.push_str("{\"content\":");
                push_json_string_escaped(&mut delta, text);
                delta.push('}');
                out.push(self.delta(&delta));
            }
            CanonicalStreamEvent::ReasoningDelta { text, .. } => {
                let mut delta = String::with_capacity(28 + text.len());
                delta.push_str("{\"reasoning_content\":");
                push_json_string_escaped(&mut delta, text);
                delta.push('}');
                out.push(self.delta(&delta));
            }
            CanonicalStreamEvent::BlockStart {
                index,
                kind: BlockKind::ToolUse { id, name },
            } => {
                let slot = u32::try_from(self.tool_slots.len()).unwrap_or(u32::MAX);
                self.tool_slots.insert(*index, slot);
                let mut delta = String::with_capacity(96 + id.len() + name.len());
                delta.push_str("{\"tool_calls\":[{\"index\":");
                push_u64_decimal(&mut delta, u64::from(slot));
                delta.push_str(",\"id\":");
                push_json_string_escaped(&mut delta, id);
                delta.push_str(",\"type\":\"function\",\"function\":{\"name\":");
                push_json_string_escaped(&mut delta, name);
                delta.push_str(",\"arguments\":\"\"}}]}");
                out.push(self.delta(&delta));
            }
            CanonicalStreamEvent::ToolArgsDelta {
                index,
                partial_json,
            } => {
                let Some(slot) = self.tool_slots.get(index).copied() else {
                    return;
                };
                let mut delta = String::with_capacity(64 + partial_json.len());
                delta.push_str("{\"tool_calls\":[{\"index\":");
                push_u64_decimal(&mut delta, u64::from(slot));
                delta.push_str(",\"function\":{\"arguments\":");
                push_json_string_escaped(&mut delta, partial_json);
                delta.push_str("}}]}");
                out.push(self.delta(&delta));
            }
            CanonicalStreamEvent::Usage(usage) => self.usage = Some(*usage),
            CanonicalStreamEvent::MessageEnd { stop_reason, usage } => {
                let finish = rules_for(IngressApi::OpenAiChat).finish_reason(*stop_reason);
                let mut body = String::with_capacity(64);
                body.push_str(",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":");
                push_json_string_escaped(&mut body, finish);
                body.push_str("}]");
                out.push(self.chunk(&body));

                let usage = self.usage.take().unwrap_or(*usage);
                let mut body = String::with_capacity(96);
                body.push_str(",\"choices\":[],\"usage\":{\"prompt_tokens\":");
                push_u64_decimal(&mut body, usage.input_tokens);
                body.push_str(",\"completion_tokens\":");
                push_u64_decimal(&mut body, usage.output_tokens);
                body.push_str(",\"total_tokens\":");
                push_u64_decimal(&mut body, usage.total_tokens());
                body.push('}');
                out.push(self.chunk(&body));
            }
            CanonicalStreamEvent::Done => out.push(done_frame()),
            CanonicalStreamEvent::BlockStart { .. } | CanonicalStreamEvent::BlockStop { .. } => {}
        }
    }

    fn encode_error(&mut self, err: &RelayError, out: &mut Vec<Bytes>) {
        let (_, body) = format_error(err, IngressApi::OpenAiChat);
        out.push(data_frame(&body.to_string()));
    }
}
