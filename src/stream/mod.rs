pub mod sse;

pub use sse::{SseEvent, SseParser};

use bytes::Bytes;

use crate::error::RelayError;
use crate::protocol::canonical::{
    BlockKind, CanonicalPart, CanonicalResponse, CanonicalStopReason, CanonicalStreamEvent,
    CanonicalUsage,
};
use crate::reconstruct::repair::parse_arguments;

/// Turns canonical stream events into one client protocol's wire frames.
///
/// An encoder owns per-response state (ids, open blocks, pending finish data).
/// It writes the protocol's terminal marker when it sees
/// [`CanonicalStreamEvent::Done`], and `encode_error` writes an error frame that
/// ends the stream in its place.
pub trait StreamEncoder: Send {
    fn encode(&mut self, event: &CanonicalStreamEvent, out: &mut Vec<Bytes>);

    fn encode_error(&mut self, err: &RelayError, out: &mut Vec<Bytes>);
}

#[derive(Debug)]
enum CollectedBlock {
    Text(String),
    Reasoning(String),
    ToolUse { id: String, name: String, args: String },
}

/// Folds a canonical event stream back into a unary response.
#[derive(Debug)]
pub struct ResponseCollector {
    id: String,
    model: String,
    blocks: Vec<(usize, CollectedBlock)>,
    stop_reason: Option<CanonicalStopReason>,
    usage: CanonicalUsage,
}

impl ResponseCollector {
    #[must_use]
    pub fn new(id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            blocks: Vec::new(),
            stop_reason: None,
            usage: CanonicalUsage::default(),
        }
    }

    fn block_mut(&mut self, index: usize) -> Option<&mut CollectedBlock> {
        self.blocks
            .iter_mut()
            .rev()
            .find(|(i, _)| *i == index)
            .map(|(_, block)| block)
    }

    pub fn push(&mut self, event: CanonicalStreamEvent) {
        match event {
            CanonicalStreamEvent::MessageStart {
                id,
                model,
                input_tokens,
            } => {
                if !id.is_empty() {
                    self.id = id;
                }
                if !model.is_empty() {
                    self.model = model;
                }
                self.usage.input_tokens = input_tokens;
            }
            CanonicalStreamEvent::BlockStart { index, kind } => {
                let block = match kind {
                    BlockKind::Text => CollectedBlock::Text(String::new()),
                    BlockKind::Reasoning => CollectedBlock::Reasoning(String::new()),
                    BlockKind::ToolUse { id, name } => CollectedBlock::ToolUse {
                        id,
                        name,
                        args: String::new(),
                    },
                };
                self.blocks.push((index, block));
            }
            CanonicalStreamEvent::TextDelta { index, text }
            | CanonicalStreamEvent::ReasoningDelta { index, text } => {
                if let Some(CollectedBlock::Text(buf) | CollectedBlock::Reasoning(buf)) =
                    self.block_mut(index)
                {
                    buf.push_str(&text);
                }
            }
            CanonicalStreamEvent::ToolArgsDelta {
                index,
                partial_json,
            } => {
                if let Some(CollectedBlock::ToolUse { args, .. }) = self.block_mut(index) {
                    args.push_str(&partial_json);
                }
            }
            CanonicalStreamEvent::Usage(usage) => self.usage = usage,
            CanonicalStreamEvent::MessageEnd { stop_reason, usage } => {
                self.stop_reason = Some(stop_reason);
                self.usage = usage;
            }
            CanonicalStreamEvent::BlockStop { .. } | CanonicalStreamEvent::Done => {}
        }
    }

    #[must_use]
    pub fn finish(self) -> CanonicalResponse {
        let content: Vec<CanonicalPart> = self
            .blocks
            .into_iter()
            .filter_map(|(_, block)| match block {
                CollectedBlock::Text(text) if text.is_empty() => None,
                CollectedBlock::Text(text) => Some(CanonicalPart::Text(text)),
                CollectedBlock::Reasoning(text) => Some(CanonicalPart::Reasoning(text)),
                CollectedBlock::ToolUse { id, name, args } => Some(CanonicalPart::ToolCall {
                    id,
                    name,
                    arguments: parse_arguments(&args)
                        .unwrap_or_else(|| serde_json::Value::Object(serde_json::Map::new())),
                }),
            })
            .collect();
        let saw_tool = content
            .iter()
            .any(|part| matches!(part, CanonicalPart::ToolCall { .. }));
        let stop_reason = match self.stop_reason {
            Some(CanonicalStopReason::EndOfTurn) | None if saw_tool => CanonicalStopReason::ToolCalls,
            Some(reason) => reason,
            None => CanonicalStopReason::EndOfTurn,
        };
        CanonicalResponse {
            id: self.id,
            model: self.model,
            content,
            stop_reason,
            usage: self.usage,
        }
    }
}
