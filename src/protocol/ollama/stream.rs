use bytes::Bytes;
use rustc_hash::FxHashMap;
use serde_json::{json, Value};

use crate::error::{format_error, RelayError};
use crate::protocol::canonical::{
    BlockKind, CanonicalStopReason, CanonicalStreamEvent, CanonicalUsage, IngressApi,
};
use crate::protocol::framing::rules_for;
use crate::reconstruct::repair::parse_arguments;
use crate::stream::sse::ndjson_line;
use crate::stream::StreamEncoder;

use super::created_at;

/// Canonical events to Ollama NDJSON lines.
///
/// The terminal marker is the final `done: true` line, written on `Done` from
/// the stop reason and usage remembered at `MessageEnd`.
pub struct OllamaStreamEncoder {
    model: String,
    tools: FxHashMap<usize, (String, String)>,
    finish: Option<(CanonicalStopReason, CanonicalUsage)>,
    usage: Option<CanonicalUsage>,
}

impl OllamaStreamEncoder {
    #[must_use]
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_owned(),
            tools: FxHashMap::default(),
            finish: None,
            usage: None,
        }
    }

    fn line(&self, message: Value) -> Bytes {
        let body = json!({
            "model": self.model,
            "created_at": created_at(),
            "message": message,
            "done": false,
        });
        ndjson_line(&body.to_string())
    }
}

impl StreamEncoder for OllamaStreamEncoder {
    fn encode(&mut self, event: &CanonicalStreamEvent, out: &mut Vec<Bytes>) {
        match event {
            CanonicalStreamEvent::TextDelta { text, .. } => {
                out.push(self.line(json!({"role": "assistant", "content": text})));
            }
            CanonicalStreamEvent::ReasoningDelta { text, .. } => {
                out.push(self.line(json!({"role": "assistant", "content": "", "thinking": text})));
            }
            CanonicalStreamEvent::BlockStart {
                index,
                kind: BlockKind::ToolUse { name, .. },
            } => {
                self.tools.insert(*index, (name.clone(), String::new()));
            }
            CanonicalStreamEvent::ToolArgsDelta {
                index,
                partial_json,
            } => {
                if let Some((_, args)) = self.tools.get_mut(index) {
                    args.push_str(partial_json);
                }
            }
            CanonicalStreamEvent::BlockStop { index } => {
                if let Some((name, args)) = self.tools.remove(index) {
                    let arguments = parse_arguments(&args).unwrap_or_else(|| json!({}));
                    out.push(self.line(json!({
                        "role": "assistant",
                        "content": "",
                        "tool_calls": [{"function": {"name": name, "arguments": arguments}}],
                    })));
                }
            }
            CanonicalStreamEvent::Usage(usage) => self.usage = Some(*usage),
            CanonicalStreamEvent::MessageEnd { stop_reason, usage } => {
                let usage = self.usage.take().unwrap_or(*usage);
                self.finish = Some((*stop_reason, usage));
            }
            CanonicalStreamEvent::Done => {
                let (reason, usage) = self
                    .finish
                    .take()
                    .unwrap_or((CanonicalStopReason::EndOfTurn, CanonicalUsage::default()));
                let body = json!({
                    "model": self.model,
                    "created_at": created_at(),
                    "message": {"role": "assistant", "content": ""},
                    "done": true,
                    "done_reason": rules_for(IngressApi::Ollama).finish_reason(reason),
                    "prompt_eval_count": usage.input_tokens,
                    "eval_count": usage.output_tokens,
                });
                out.push(ndjson_line(&body.to_string()));
            }
            CanonicalStreamEvent::MessageStart { .. } | CanonicalStreamEvent::BlockStart { .. } => {}
        }
    }

    fn encode_error(&mut self, err: &RelayError, out: &mut Vec<Bytes>) {
        let (_, body) = format_error(err, IngressApi::Ollama);
        out.push(ndjson_line(&body.to_string()));
    }
}
