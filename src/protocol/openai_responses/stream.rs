use bytes::Bytes;
use rustc_hash::FxHashMap;
use serde_json::{json, Value};

use crate::error::{format_error, RelayError};
use crate::protocol::canonical::{BlockKind, CanonicalStreamEvent, CanonicalUsage, IngressApi};
use crate::protocol::framing::rules_for;
use crate::stream::sse::named_frame;
use crate::stream::StreamEncoder;
use crate::util::unix_now_secs;

use super::encoder::{function_call_item, message_item, reasoning_item, response_object};

enum OpenItem {
    Message { item_id: String, text: String },
    Reasoning { item_id: String, text: String },
    FunctionCall { item_id: String, call_id: String, name: String, arguments: String },
}

/// Canonical events to Responses API SSE events.
///
/// Every canonical block becomes one output item. Finished items are kept so
/// the closing `response.completed` event can carry the whole response.
pub struct ResponsesStreamEncoder {
    id: String,
    model: String,
    created_at: u64,
    sequence: u64,
    /// Canonical block index to (output index, item).
    open: FxHashMap<usize, (usize, OpenItem)>,
    output: Vec<Value>,
    status: &'static str,
    usage: Option<CanonicalUsage>,
}

impl ResponsesStreamEncoder {
    #[must_use]
    pub fn new(model: &str, id: &str) -> Self {
        Self {
            id: id.to_owned(),
            model: model.to_owned(),
            created_at: unix_now_secs(),
            sequence: 0,
            open: FxHashMap::default(),
            output: Vec::new(),
            status: "in_progress",
            usage: None,
        }
    }

    fn emit(&mut self, out: &mut Vec<Bytes>, name: &str, mut body: Value) {
        if let Value::Object(map) = &mut body {
            map.insert("type".into(), Value::String(name.to_owned()));
            map.insert("sequence_number".into(), Value::from(self.sequence));
        }
        self.sequence += 1;
        out.push(named_frame(name, &body.to_string()));
    }

    fn snapshot(&self, status: &str, output: Vec<Value>) -> Value {
        response_object(
            &self.id,
            &self.model,
            self.created_at,
            status,
            output,
            self.usage.as_ref(),
        )
    }

    fn open_item(&mut self, out: &mut Vec<Bytes>, index: usize, kind: &BlockKind) {
        let output_index = self.output.len() + self.open.len();
        let item_id = format!("{}_{output_index}", match kind {
            BlockKind::Text => "msg",
            BlockKind::Reasoning => "rs",
            BlockKind::ToolUse { .. } => "fc",
        });
        let (item, open) = match kind {
            BlockKind::Text => (
                json!({"type": "message", "id": item_id, "status": "in_progress", "role": "assistant", "content": []}),
                OpenItem::Message { item_id: item_id.clone(), text: String::new() },
            ),
            BlockKind::Reasoning => (
                json!({"type": "reasoning", "id": item_id, "summary": []}),
                OpenItem::Reasoning { item_id: item_id.clone(), text: String::new() },
            ),
            BlockKind::ToolUse { id, name } => (
                json!({"type": "function_call", "id": item_id, "call_id": id, "name": name, "arguments": "", "status": "in_progress"}),
                OpenItem::FunctionCall {
                    item_id: item_id.clone(),
                    call_id: id.clone(),
                    name: name.clone(),
                    arguments: String::new(),
                },
            ),
        };
        self.emit(out, "response.output_item.added", json!({"output_index": output_index, "item": item}));
        match kind {
            BlockKind::Text => self.emit(
                out,
                "response.content_part.added",
                json!({
                    "item_id": item_id,
                    "output_index": output_index,
                    "content_index": 0,
                    "part": {"type": "output_text", "text": "", "annotations": []},
                }),
            ),
            BlockKind::Reasoning => self.emit(
                out,
                "response.reasoning_summary_part.added",
                json!({
                    "item_id": item_id,
                    "output_index": output_index,
                    "summary_index": 0,
                    "part": {"type": "summary_text", "text": ""},
                }),
            ),
            BlockKind::ToolUse { .. } => {}
        }
        self.open.insert(index, (output_index, open));
    }

    fn close_item(&mut self, out: &mut Vec<Bytes>, index: usize) {
        let Some((output_index, item)) = self.open.remove(&index) else {
            return;
        };
        let done = match item {
            OpenItem::Message { item_id, text } => {
                self.emit(
                    out,
                    "response.output_text.done",
                    json!({"item_id": item_id, "output_index": output_index, "content_index": 0, "text": text}),
                );
                self.emit(
                    out,
                    "response.content_part.done",
                    json!({
                        "item_id": item_id,
                        "output_index": output_index,
                        "content_index": 0,
                        "part": {"type": "output_text", "text": text, "annotations": []},
                    }),
                );
                message_item(&item_id, &text)
            }
            OpenItem::Reasoning { item_id, text } => {
                self.emit(
                    out,
                    "response.reasoning_summary_text.done",
                    json!({"item_id": item_id, "output_index": output_index, "summary_index": 0, "text": text}),
                );
                reasoning_item(&item_id, &text)
            }
            OpenItem::FunctionCall {
                item_id,
                call_id,
                name,
                arguments,
            } => {
                self.emit(
                    out,
                    "response.function_call_arguments.done",
                    json!({"item_id": item_id, "output_index": output_index, "arguments": arguments}),
                );
                function_call_item(&item_id, &call_id, &name, &arguments)
            }
        };
        self.emit(
            out,
            "response.output_item.done",
            json!({"output_index": output_index, "item": done}),
        );
        self.output.push(done);
    }

    fn delta(&mut self, out: &mut Vec<Bytes>, index: usize, delta: &str) {
        let Some((output_index, item)) = self.open.get_mut(&index) else {
            return;
        };
        let output_index = *output_index;
        let (name, body) = match item {
            OpenItem::Message { item_id, text } => {
                text.push_str(delta);
                (
                    "response.output_text.delta",
                    json!({"item_id": item_id, "output_index": output_index, "content_index": 0, "delta": delta}),
                )
            }
            OpenItem::Reasoning { item_id, text } => {
                text.push_str(delta);
                (
                    "response.reasoning_summary_text.delta",
                    json!({"item_id": item_id, "output_index": output_index, "summary_index": 0, "delta": delta}),
                )
            }
            OpenItem::FunctionCall {
                item_id, arguments, ..
            } => {
                arguments.push_str(delta);
                (
                    "response.function_call_arguments.delta",
                    json!({"item_id": item_id, "output_index": output_index, "delta": delta}),
                )
            }
        };
        self.emit(out, name, body);
    }
}

impl StreamEncoder for ResponsesStreamEncoder {
    fn encode(&mut self, event: &CanonicalStreamEvent, out: &mut Vec<Bytes>) {
        match event {
            CanonicalStreamEvent::MessageStart { .. } => {
                let response = self.snapshot("in_progress", Vec::new());
                self.emit(out, "response.created", json!({"response": response}));
                let response = self.snapshot("in_progress", Vec::new());
                self.emit(out, "response.in_progress", json!({"response": response}));
            }
            CanonicalStreamEvent::BlockStart { index, kind } => self.open_item(out, *index, kind),
            CanonicalStreamEvent::TextDelta { index, text }
            | CanonicalStreamEvent::ReasoningDelta { index, text } => self.delta(out, *index, text),
            CanonicalStreamEvent::ToolArgsDelta {
                index,
                partial_json,
            } => self.delta(out, *index, partial_json),
            CanonicalStreamEvent::BlockStop { index } => self.close_item(out, *index),
            CanonicalStreamEvent::Usage(usage) => self.usage = Some(*usage),
            CanonicalStreamEvent::MessageEnd { stop_reason, usage } => {
                self.status = rules_for(IngressApi::OpenAiResponses).finish_reason(*stop_reason);
                if self.usage.is_none() {
                    self.usage = Some(*usage);
                }
            }
            CanonicalStreamEvent::Done => {
                let mut open: Vec<usize> = self.open.keys().copied().collect();
                open.sort_unstable();
                for index in open {
                    self.close_item(out, index);
                }
                let output = std::mem::take(&mut self.output);
                let response = self.snapshot(self.status, output);
                self.emit(out, "response.completed", json!({"response": response}));
            }
        }
    }

    fn encode_error(&mut self, err: &RelayError, out: &mut Vec<Bytes>) {
        let (_, body) = format_error(err, IngressApi::OpenAiResponses);
        let error = &body["error"];
        let payload = json!({
            "code": error["code"],
            "message": error["message"],
            "param": Value::Null,
        });
        self.emit(out, "error", payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::canonical::CanonicalStopReason;

    fn parse(frames: &[Bytes]) -> Vec<(String, Value)> {
        frames
            .iter()
            .map(|frame| {
                let text = std::str::from_utf8(frame).unwrap();
                let mut lines = text.lines();
                let name = lines.next().unwrap().strip_prefix("event: ").unwrap().to_owned();
                let data = lines.next().unwrap().strip_prefix("data: ").unwrap();
                (name, serde_json::from_str(data).unwrap())
            })
            .collect()
    }

    #[test]
    fn text_and_function_call_items() {
        let mut encoder = ResponsesStreamEncoder::new("m", "resp_1");
        let mut out = Vec::new();
        for event in [
            CanonicalStreamEvent::MessageStart {
                id: "resp_1".into(),
                model: "m".into(),
                input_tokens: 2,
            },
            CanonicalStreamEvent::BlockStart {
                index: 0,
                kind: BlockKind::Text,
            },
            CanonicalStreamEvent::TextDelta {
                index: 0,
                text: "he".into(),
            },
            CanonicalStreamEvent::TextDelta {
                index: 0,
                text: "llo".into(),
            },
            CanonicalStreamEvent::BlockStop { index: 0 },
            CanonicalStreamEvent::BlockStart {
                index: 1,
                kind: BlockKind::ToolUse {
                    id: "call_1".into(),
                    name: "f".into(),
                },
            },
            CanonicalStreamEvent::ToolArgsDelta {
                index: 1,
                partial_json: "{}".into(),
            },
            CanonicalStreamEvent::BlockStop { index: 1 },
            CanonicalStreamEvent::MessageEnd {
                stop_reason: CanonicalStopReason::ToolCalls,
                usage: CanonicalUsage {
                    input_tokens: 2,
                    output_tokens: 3,
                },
            },
            CanonicalStreamEvent::Done,
        ] {
            encoder.encode(&event, &mut out);
        }
        let events = parse(&out);
        for (i, (name, body)) in events.iter().enumerate() {
            assert_eq!(body["type"], name.as_str());
            assert_eq!(body["sequence_number"], i);
        }
        let (last_name, last) = events.last().unwrap();
        assert_eq!(last_name, "response.completed");
        assert_eq!(last["response"]["status"], "completed");
        assert_eq!(last["response"]["output"][0]["content"][0]["text"], "hello");
        assert_eq!(last["response"]["output"][1]["call_id"], "call_1");
        assert_eq!(last["response"]["usage"]["output_tokens"], 3);
        assert_eq!(
            events.iter().filter(|(n, _)| n == "response.completed").count(),
            1
        );
        assert!(events.iter().any(|(n, b)| n == "response.function_call_arguments.delta" && b["output_index"] == 1));
    }

    #[test]
    fn error_event() {
        let mut encoder = ResponsesStreamEncoder::new("m", "resp_1");
        let mut out = Vec::new();
        encoder.encode_error(&RelayError::Transport("reset".into()), &mut out);
        let events = parse(&out);
        assert_eq!(events[0].0, "error");
        assert_eq!(events[0].1["code"], "server_error");
    }
}
