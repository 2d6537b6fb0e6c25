//! Rebuilds structured responses from the Kiro event stream.
//!
//! Bytes go through the frame decoder; content deltas are split into
//! reasoning and text, text is scanned for bracket tool calls, and structured
//! tool frames are joined by the accumulator. Everything comes out as
//! block-indexed [`CanonicalStreamEvent`]s.

pub mod bracket;
pub mod frames;
pub mod reasoning;
pub mod repair;
pub mod tool_calls;

use rustc_hash::FxHashSet;

use crate::observability::token_counter::{estimate_tokens, input_tokens_from_context};
use crate::protocol::canonical::{BlockKind, CanonicalStopReason, CanonicalStreamEvent, CanonicalUsage};
use crate::util::next_call_id;

use bracket::{BracketCall, BracketExtractor};
use frames::{FrameDecoder, FrameEvent, UsageUpdate};
use reasoning::{ReasoningExtractor, Segment, Segments};
use tool_calls::{ToolCallAccumulator, ToolCallDedup, ToolCallRecord};

#[derive(Debug, Clone, Copy)]
pub struct ReconstructOptions {
    /// Split `<thinking>` sections out of content. Only on when the request
    /// asked for reasoning.
    pub extract_reasoning: bool,
    pub context_budget_tokens: u64,
    /// Used for `input_tokens` when the backend reports nothing better.
    pub estimated_input_tokens: u64,
}

/// Open/closed bookkeeping for block indices.
#[derive(Debug, Default)]
struct BlockTracker {
    next_index: usize,
    open_text: Option<usize>,
    open_reasoning: Option<usize>,
    stopped: FxHashSet<usize>,
}

impl BlockTracker {
    fn allocate(&mut self) -> usize {
        let index = self.next_index;
        self.next_index += 1;
        index
    }

    fn open_text(&mut self, out: &mut Vec<CanonicalStreamEvent>) -> usize {
        if let Some(index) = self.open_text {
            return index;
        }
        self.close_reasoning(out);
        let index = self.allocate();
        out.push(CanonicalStreamEvent::BlockStart {
            index,
            kind: BlockKind::Text,
        });
        self.open_text = Some(index);
        index
    }

    fn open_reasoning(&mut self, out: &mut Vec<CanonicalStreamEvent>) -> usize {
        if let Some(index) = self.open_reasoning {
            return index;
        }
        self.close_text(out);
        let index = self.allocate();
        out.push(CanonicalStreamEvent::BlockStart {
            index,
            kind: BlockKind::Reasoning,
        });
        self.open_reasoning = Some(index);
        index
    }

    fn stop(&mut self, index: usize, out: &mut Vec<CanonicalStreamEvent>) {
        if self.stopped.insert(index) {
            out.push(CanonicalStreamEvent::BlockStop { index });
        }
    }

    fn close_text(&mut self, out: &mut Vec<CanonicalStreamEvent>) {
        if let Some(index) = self.open_text.take() {
            self.stop(index, out);
        }
    }

    fn close_reasoning(&mut self, out: &mut Vec<CanonicalStreamEvent>) {
        if let Some(index) = self.open_reasoning.take() {
            self.stop(index, out);
        }
    }

    fn close_all(&mut self, out: &mut Vec<CanonicalStreamEvent>) {
        self.close_reasoning(out);
        self.close_text(out);
    }

    /// Tool calls are complete when emitted, so their block opens and closes at once.
    fn tool_block(&mut self, record: &ToolCallRecord, args_json: String, out: &mut Vec<CanonicalStreamEvent>) {
        self.close_all(out);
        let index = self.allocate();
        out.push(CanonicalStreamEvent::BlockStart {
            index,
            kind: BlockKind::ToolUse {
                id: record.id.clone(),
                name: record.name.clone(),
            },
        });
        out.push(CanonicalStreamEvent::ToolArgsDelta {
            index,
            partial_json: args_json,
        });
        self.stop(index, out);
    }
}

/// Per-attempt reconstruction state.
#[derive(Debug)]
pub struct Reconstructor {
    options: ReconstructOptions,
    frames: FrameDecoder,
    frame_events: Vec<FrameEvent>,
    reasoning: Option<ReasoningExtractor>,
    brackets: BracketExtractor,
    tools: ToolCallAccumulator,
    dedup: ToolCallDedup,
    blocks: BlockTracker,
    /// Rebuilt output (reasoning, text and tool arguments) for the token estimate.
    output_text: String,
    tool_calls_emitted: usize,
    context_percentage: Option<f64>,
    reported_input: Option<u64>,
    reported_output: Option<u64>,
    finished: bool,
}

impl Reconstructor {
    #[must_use]
    pub fn new(options: ReconstructOptions) -> Self {
        Self {
            options,
            frames: FrameDecoder::new(),
            frame_events: Vec::new(),
            reasoning: options.extract_reasoning.then(ReasoningExtractor::new),
            brackets: BracketExtractor::new(),
            tools: ToolCallAccumulator::new(),
            dedup: ToolCallDedup::new(),
            blocks: BlockTracker::default(),
            output_text: String::new(),
            tool_calls_emitted: 0,
            context_percentage: None,
            reported_input: None,
            reported_output: None,
            finished: false,
        }
    }

    #[must_use]
    pub fn message_start(&self, id: impl Into<String>, model: impl Into<String>) -> CanonicalStreamEvent {
        CanonicalStreamEvent::MessageStart {
            id: id.into(),
            model: model.into(),
            input_tokens: self.options.estimated_input_tokens,
        }
    }

    /// Feed one network chunk.
    pub fn push_bytes(&mut self, chunk: &[u8], out: &mut Vec<CanonicalStreamEvent>) {
        let mut events = std::mem::take(&mut self.frame_events);
        self.frames.feed(chunk, &mut events);
        for event in events.drain(..) {
            self.push_frame(event, out);
        }
        self.frame_events = events;
    }

    /// Feed one already-decoded frame.
    pub fn push_frame(&mut self, event: FrameEvent, out: &mut Vec<CanonicalStreamEvent>) {
        match event {
            FrameEvent::ContentDelta(text) => self.push_content(&text, out),
            FrameEvent::ToolCallStart { id, name, input } => {
                self.settle_text(out);
                let mut records = Vec::new();
                self.tools.start(id, name, input.as_deref(), &mut records);
                self.emit_records(records, out);
            }
            FrameEvent::ToolCallInputDelta { id, input } => {
                self.tools.input(id.as_deref(), &input);
            }
            FrameEvent::ToolCallStop { id, name, input } => {
                let mut records = Vec::new();
                self.tools.stop(id, name, input.as_deref(), &mut records);
                self.emit_records(records, out);
            }
            FrameEvent::UsageUpdate(UsageUpdate::ContextPercentage(pct)) => {
                self.context_percentage = Some(pct);
            }
            FrameEvent::UsageUpdate(UsageUpdate::Tokens { input, output }) => {
                if input.is_some() {
                    self.reported_input = input;
                }
                if output.is_some() {
                    self.reported_output = output;
                }
            }
        }
    }

    /// Flush everything and close the message. Emits `MessageEnd` then `Done`;
    /// a second call does nothing.
    pub fn finish(&mut self, out: &mut Vec<CanonicalStreamEvent>) {
        if self.finished {
            return;
        }
        self.finished = true;

        let mut events = std::mem::take(&mut self.frame_events);
        self.frames.finish(&mut events);
        for event in events.drain(..) {
            self.push_frame(event, out);
        }

        self.settle_text(out);
        let mut records = Vec::new();
        self.tools.flush(&mut records);
        self.emit_records(records, out);
        self.blocks.close_all(out);

        let stop_reason = if self.tool_calls_emitted > 0 {
            CanonicalStopReason::ToolCalls
        } else {
            CanonicalStopReason::EndOfTurn
        };
        out.push(CanonicalStreamEvent::MessageEnd {
            stop_reason,
            usage: self.usage(),
        });
        out.push(CanonicalStreamEvent::Done);
    }

    #[must_use]
    pub fn usage(&self) -> CanonicalUsage {
        let output_tokens = self
            .reported_output
            .unwrap_or_else(|| estimate_tokens(&self.output_text));
        let input_tokens = match (self.context_percentage, self.reported_input) {
            (Some(pct), _) => {
                input_tokens_from_context(self.options.context_budget_tokens, pct, output_tokens)
            }
            (None, Some(reported)) => reported,
            (None, None) => self.options.estimated_input_tokens,
        };
        CanonicalUsage {
            input_tokens,
            output_tokens,
        }
    }

    #[must_use]
    pub fn tool_calls_emitted(&self) -> usize {
        self.tool_calls_emitted
    }

    fn push_content(&mut self, text: &str, out: &mut Vec<CanonicalStreamEvent>) {
        let Some(reasoning) = self.reasoning.as_mut() else {
            self.push_answer_text(text, out);
            return;
        };
        let mut segments = Segments::new();
        reasoning.feed(text, &mut segments);
        self.emit_segments(segments, out);
    }

    fn emit_segments(&mut self, segments: Segments, out: &mut Vec<CanonicalStreamEvent>) {
        for segment in segments {
            match segment {
                Segment::Reasoning(text) => {
                    let index = self.blocks.open_reasoning(out);
                    self.output_text.push_str(&text);
                    out.push(CanonicalStreamEvent::ReasoningDelta { index, text });
                }
                Segment::Text(text) => self.push_answer_text(&text, out),
            }
        }
    }

    fn push_answer_text(&mut self, text: &str, out: &mut Vec<CanonicalStreamEvent>) {
        let mut calls = Vec::new();
        let released = self.brackets.feed(text, &mut calls);
        self.emit_text(released, out);
        self.emit_bracket_calls(calls, out);
    }

    fn emit_text(&mut self, text: String, out: &mut Vec<CanonicalStreamEvent>) {
        if text.is_empty() {
            return;
        }
        let index = self.blocks.open_text(out);
        self.output_text.push_str(&text);
        out.push(CanonicalStreamEvent::TextDelta { index, text });
    }

    /// No more text can complete a marker or bracket call that is already buffered.
    fn settle_text(&mut self, out: &mut Vec<CanonicalStreamEvent>) {
        if let Some(reasoning) = self.reasoning.as_mut() {
            let mut segments = Segments::new();
            reasoning.settle(&mut segments);
            self.emit_segments(segments, out);
        }
        let mut calls = Vec::new();
        let released = self.brackets.settle(&mut calls);
        self.emit_text(released, out);
        self.emit_bracket_calls(calls, out);
    }

    fn emit_bracket_calls(&mut self, calls: Vec<BracketCall>, out: &mut Vec<CanonicalStreamEvent>) {
        if calls.is_empty() {
            return;
        }
        let records = calls
            .into_iter()
            .map(|call| ToolCallRecord {
                id: next_call_id(),
                name: call.name,
                arguments: call.arguments,
            })
            .collect();
        self.emit_records(records, out);
    }

    fn emit_records(&mut self, records: Vec<ToolCallRecord>, out: &mut Vec<CanonicalStreamEvent>) {
        for record in records {
            if !self.dedup.admit(&record.name, &record.arguments) {
                continue;
            }
            let args_json = record.arguments.to_string();
            self.output_text.push_str(&args_json);
            self.tool_calls_emitted += 1;
            self.blocks.tool_block(&record, args_json, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn options(extract_reasoning: bool) -> ReconstructOptions {
        ReconstructOptions {
            extract_reasoning,
            context_budget_tokens: 172_500,
            estimated_input_tokens: 42,
        }
    }

    fn run(extract_reasoning: bool, chunks: &[&[u8]]) -> Vec<CanonicalStreamEvent> {
        let mut reconstructor = Reconstructor::new(options(extract_reasoning));
        let mut out = Vec::new();
        for chunk in chunks {
            reconstructor.push_bytes(chunk, &mut out);
        }
        reconstructor.finish(&mut out);
        out
    }

    /// (kind, text) per block, with deltas concatenated.
    fn blocks(events: &[CanonicalStreamEvent]) -> Vec<(String, String)> {
        let mut blocks: Vec<(usize, String, String)> = Vec::new();
        for event in events {
            match event {
                CanonicalStreamEvent::BlockStart { index, kind } => {
                    let label = match kind {
                        BlockKind::Text => "text".to_owned(),
                        BlockKind::Reasoning => "thinking".to_owned(),
                        BlockKind::ToolUse { name, .. } => format!("tool:{name}"),
                    };
                    blocks.push((*index, label, String::new()));
                }
                CanonicalStreamEvent::TextDelta { index, text }
                | CanonicalStreamEvent::ReasoningDelta { index, text }
                | CanonicalStreamEvent::ToolArgsDelta {
                    index,
                    partial_json: text,
                } => {
                    let block = blocks.iter_mut().find(|b| b.0 == *index).unwrap();
                    block.2.push_str(text);
                }
                _ => {}
            }
        }
        blocks.into_iter().map(|(_, kind, text)| (kind, text)).collect()
    }

    fn stop_reason(events: &[CanonicalStreamEvent]) -> CanonicalStopReason {
        events
            .iter()
            .find_map(|event| match event {
                CanonicalStreamEvent::MessageEnd { stop_reason, .. } => Some(*stop_reason),
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn reasoning_between_text_blocks() {
        let events = run(
            true,
            &[br#"{"content":"Hello <thinking>step one</thinking>\n\nAnswer: 4"}"#],
        );
        assert_eq!(
            blocks(&events),
            vec![
                ("text".into(), "Hello ".into()),
                ("thinking".into(), "step one".into()),
                ("text".into(), "Answer: 4".into()),
            ]
        );
        assert_eq!(events.last(), Some(&CanonicalStreamEvent::Done));
    }

    #[test]
    fn quoted_marker_stays_text() {
        let events = run(true, &[br#"{"content":"say \"<thinking>\" aloud"}"#]);
        assert_eq!(blocks(&events), vec![("text".into(), "say \"<thinking>\" aloud".into())]);
    }

    #[test]
    fn reasoning_disabled_keeps_markers() {
        let events = run(false, &[br#"{"content":"<thinking>x</thinking>\n\ny"}"#]);
        assert_eq!(blocks(&events), vec![("text".into(), "<thinking>x</thinking>\n\ny".into())]);
    }

    #[test]
    fn structured_tool_call_across_frames() {
        let events = run(
            false,
            &[
                br#"{"name":"add","toolUseId":"t1","input":"{\"a\":"}"#,
                br#"{"input":"1}","stop":true}"#,
            ],
        );
        assert_eq!(blocks(&events), vec![("tool:add".into(), json!({"a": 1}).to_string())]);
        assert_eq!(stop_reason(&events), CanonicalStopReason::ToolCalls);
    }

    #[test]
    fn bracket_and_structured_duplicates_collapse() {
        let events = run(
            false,
            &[
                br#"{"content":"ok [Called add with args: {\"a\": 1}]"}"#,
                br#"{"name":"add","toolUseId":"t1","input":"{\"a\":1}"}"#,
                br#"{"stop":true}"#,
            ],
        );
        assert_eq!(
            blocks(&events),
            vec![
                ("text".into(), "ok ".into()),
                ("tool:add".into(), r#"{"a":1}"#.into()),
            ]
        );
    }

    #[test]
    fn block_indices_start_and_stop_once() {
        let events = run(
            true,
            &[
                br#"{"content":"<thinking>plan</thinking>\n\nfirst"}"#,
                br#"{"name":"f","toolUseId":"t1","input":"{}","stop":true}"#,
                br#"{"content":" after"}"#,
            ],
        );
        let mut started = FxHashSet::default();
        let mut stopped = FxHashSet::default();
        for event in &events {
            match event {
                CanonicalStreamEvent::BlockStart { index, .. } => assert!(started.insert(*index)),
                CanonicalStreamEvent::BlockStop { index } => {
                    assert!(started.contains(index));
                    assert!(stopped.insert(*index));
                }
                _ => {}
            }
        }
        assert_eq!(started, stopped);
        assert_eq!(
            blocks(&events),
            vec![
                ("thinking".into(), "plan".into()),
                ("text".into(), "first".into()),
                ("tool:f".into(), "{}".into()),
                ("text".into(), " after".into()),
            ]
        );
    }

    #[test]
    fn chunking_does_not_change_output() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(br#"{"content":"Hi <thinking>\nweigh it</thinking>\n\nSo"}"#);
        bytes.extend_from_slice(b"\x00\x07binary");
        bytes.extend_from_slice(br#"{"content":" done."}"#);
        bytes.extend_from_slice(br#"{"name":"f","toolUseId":"t1","input":"{\"k\":"}"#);
        bytes.extend_from_slice(br#"{"input":"[1,2]}","stop":true}"#);
        bytes.extend_from_slice(br#"{"contextUsagePercentage":5.0}"#);
        let whole = run(true, &[&bytes]);
        for size in [1, 2, 3, 7, 16, 64] {
            let chunks: Vec<&[u8]> = bytes.chunks(size).collect();
            assert_eq!(run(true, &chunks), whole, "chunk size {size}");
        }
    }

    #[test]
    fn usage_back_computed_from_context_percentage() {
        let events = run(
            false,
            &[br#"{"content":"abcdefgh"}{"contextUsagePercentage":10.0}"#],
        );
        let usage = events
            .iter()
            .find_map(|event| match event {
                CanonicalStreamEvent::MessageEnd { usage, .. } => Some(*usage),
                _ => None,
            })
            .unwrap();
        let output = estimate_tokens("abcdefgh");
        assert_eq!(usage.output_tokens, output);
        assert_eq!(usage.input_tokens, 17_250 - output);
    }

    #[test]
    fn usage_falls_back_to_request_estimate() {
        let reconstructor = Reconstructor::new(options(false));
        assert_eq!(reconstructor.usage().input_tokens, 42);
    }

    #[test]
    fn finish_is_idempotent() {
        let mut reconstructor = Reconstructor::new(options(false));
        let mut out = Vec::new();
        reconstructor.finish(&mut out);
        let len = out.len();
        reconstructor.finish(&mut out);
        assert_eq!(out.len(), len);
    }
}
