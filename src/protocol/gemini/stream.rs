use bytes::Bytes;
use rustc_hash::FxHashMap;
use serde_json::{json, Value};

use crate::error::{format_error, RelayError};
use crate::protocol::canonical::{BlockKind, CanonicalStreamEvent, CanonicalUsage, IngressApi};
use crate::protocol::framing::rules_for;
use crate::protocol::mapping::canonical_usage_to_gemini;
use crate::reconstruct::repair::parse_arguments;
use crate::stream::sse::data_frame;
use crate::stream::StreamEncoder;

/// Canonical events to Gemini `streamGenerateContent?alt=sse` chunks.
///
/// Function calls are sent whole, so tool arguments are buffered until the
/// block stops. The stream has no terminal frame; the final chunk carries
/// `finishReason` and the connection close ends it.
pub struct GeminiStreamEncoder {
    model: String,
    tools: FxHashMap<usize, (String, String)>,
    usage: Option<CanonicalUsage>,
}

impl GeminiStreamEncoder {
    #[must_use]
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_owned(),
            tools: FxHashMap::default(),
            usage: None,
        }
    }

    fn chunk(&self, part: Value) -> Bytes {
        let body = json!({
            "candidates": [{"content": {"role": "model", "parts": [part]}, "index": 0}],
            "modelVersion": self.model,
        });
        data_frame(&body.to_string())
    }
}

impl StreamEncoder for GeminiStreamEncoder {
    fn encode(&mut self, event: &CanonicalStreamEvent, out: &mut Vec<Bytes>) {
        match event {
            CanonicalStreamEvent::TextDelta { text, .. } => {
                out.push(self.chunk(json!({"text": text})));
            }
            CanonicalStreamEvent::ReasoningDelta { text, .. } => {
                out.push(self.chunk(json!({"text": text, "thought": true})));
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
                    let args = parse_arguments(&args).unwrap_or_else(|| json!({}));
                    out.push(self.chunk(json!({"functionCall": {"name": name, "args": args}})));
                }
            }
            CanonicalStreamEvent::Usage(usage) => self.usage = Some(*usage),
            CanonicalStreamEvent::MessageEnd { stop_reason, usage } => {
                let usage = self.usage.take().unwrap_or(*usage);
                let body = json!({
                    "candidates": [{
                        "content": {"role": "model", "parts": [{"text": ""}]},
                        "finishReason": rules_for(IngressApi::Gemini).finish_reason(*stop_reason),
                        "index": 0,
                    }],
                    "usageMetadata": canonical_usage_to_gemini(&usage),
                    "modelVersion": self.model,
                });
                out.push(data_frame(&body.to_string()));
            }
            CanonicalStreamEvent::MessageStart { .. }
            | CanonicalStreamEvent::BlockStart { .. }
            | CanonicalStreamEvent::Done => {}
        }
    }

    fn encode_error(&mut self, err: &RelayError, out: &mut Vec<Bytes>) {
        let (_, body) = format_error(err, IngressApi::Gemini);
        out.push(data_frame(&body.to_string()));
    }
}
