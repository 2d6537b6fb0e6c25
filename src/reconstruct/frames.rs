//! Balanced-JSON frame extraction from the Kiro event stream.
//!
//! The backend wraps JSON payloads in binary event-stream envelopes. Rather
//! than decoding the envelope, frames are found by their leading key and cut
//! out by brace matching. Bytes that might still belong to an unfinished
//! frame are handed back as a remainder for the next call.

use memchr::memmem;
use serde_json::Value;

use crate::json_scan::{balanced_object_end, partial_suffix_len};

const LEADING_KEYS: [&[u8]; 8] = [
    br#"{"content":"#,
    br#"{"name":"#,
    br#"{"toolUseId":"#,
    br#"{"input":"#,
    br#"{"stop":"#,
    br#"{"followupPrompt":"#,
    br#"{"usage":"#,
    br#"{"contextUsagePercentage":"#,
];

/// Usage information carried by a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum UsageUpdate {
    ContextPercentage(f64),
    Tokens {
        input: Option<u64>,
        output: Option<u64>,
    },
}

/// One classified frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameEvent {
    ContentDelta(String),
    ToolCallStart {
        id: String,
        name: String,
        input: Option<String>,
    },
    ToolCallInputDelta {
        id: Option<String>,
        input: String,
    },
    ToolCallStop {
        id: Option<String>,
        name: Option<String>,
        input: Option<String>,
    },
    UsageUpdate(UsageUpdate),
}

/// Scan `buffer` for complete frames.
///
/// Returns the events in order plus the number of bytes consumed; the caller
/// keeps `buffer[consumed..]` for the next call.
#[must_use]
pub fn parse_frames(buffer: &[u8]) -> (Vec<FrameEvent>, usize) {
    let mut events = Vec::new();
    let consumed = scan(buffer, false, &mut events);
    (events, consumed)
}

fn scan(buffer: &[u8], at_eof: bool, events: &mut Vec<FrameEvent>) -> usize {
    let mut pos = 0;
    loop {
        let Some(start) = earliest_key(buffer, pos) else {
            if at_eof {
                return buffer.len();
            }
            let tail = buffer.len() - pos;
            let keep = LEADING_KEYS
                .iter()
                .map(|key| partial_suffix_len(&buffer[pos..], key))
                .max()
                .unwrap_or(0)
                .min(tail);
            return buffer.len() - keep;
        };

        let Some(end) = balanced_object_end(buffer, start) else {
            if at_eof {
                pos = start + 1;
                continue;
            }
            return start;
        };

        match serde_json::from_slice::<Value>(&buffer[start..end]) {
            Ok(value) => {
                if let Some(event) = classify(&value) {
                    events.push(event);
                }
                pos = end;
            }
            Err(err) => {
                tracing::debug!(offset = start, error = %err, "skipping malformed frame candidate");
                pos = start + 1;
            }
        }
    }
}

fn earliest_key(buffer: &[u8], from: usize) -> Option<usize> {
    let haystack = buffer.get(from..)?;
    LEADING_KEYS
        .iter()
        .filter_map(|key| memmem::find(haystack, key))
        .min()
        .map(|offset| from + offset)
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_owned)
}

/// Classify a frame object into exactly one event kind.
///
/// Frames with no recognized payload (follow-up prompts, metering) yield `None`.
fn classify(value: &Value) -> Option<FrameEvent> {
    if value.get("stop").and_then(Value::as_bool).unwrap_or(false) {
        return Some(FrameEvent::ToolCallStop {
            id: str_field(value, "toolUseId"),
            name: str_field(value, "name"),
            input: str_field(value, "input"),
        });
    }

    if let Some(pct) = value.get("contextUsagePercentage").and_then(Value::as_f64) {
        return Some(FrameEvent::UsageUpdate(UsageUpdate::ContextPercentage(pct)));
    }

    if let Some(usage) = value.get("usage").filter(|usage| usage.is_object()) {
        let field = |camel: &str, snake: &str| {
            usage
                .get(camel)
                .or_else(|| usage.get(snake))
                .and_then(Value::as_u64)
        };
        return Some(FrameEvent::UsageUpdate(UsageUpdate::Tokens {
            input: field("inputTokens", "input_tokens"),
            output: field("outputTokens", "output_tokens"),
        }));
    }

    if let (Some(name), Some(id)) = (str_field(value, "name"), str_field(value, "toolUseId")) {
        return Some(FrameEvent::ToolCallStart {
            id,
            name,
            input: str_field(value, "input"),
        });
    }

    if let Some(input) = str_field(value, "input") {
        return Some(FrameEvent::ToolCallInputDelta {
            id: str_field(value, "toolUseId"),
            input,
        });
    }

    if value.get("followupPrompt").is_some() {
        return None;
    }

    str_field(value, "content").map(FrameEvent::ContentDelta)
}

/// Incremental wrapper that owns the carry-over buffer.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a network chunk and collect every frame it completes.
    pub fn feed(&mut self, chunk: &[u8], out: &mut Vec<FrameEvent>) {
        self.buffer.extend_from_slice(chunk);
        let consumed = scan(&self.buffer, false, out);
        self.buffer.drain(..consumed);
    }

    /// Drain what is left at end of stream. Unclosed candidates are skipped.
    pub fn finish(&mut self, out: &mut Vec<FrameEvent>) {
        if self.buffer.is_empty() {
            return;
        }
        let before = out.len();
        scan(&self.buffer, true, out);
        if out.len() == before {
            tracing::debug!(
                remaining_bytes = self.buffer.len(),
                "discarding incomplete trailing frame bytes"
            );
        }
        self.buffer.clear();
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_stream() -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"\x00\x00\x01\x0b:event-type\x07\x00\x16assistantResponseEvent");
        bytes.extend_from_slice(br#"{"content":"Hello {world}"}"#);
        bytes.extend_from_slice(b"\x8f\x1c\x00\x00");
        bytes.extend_from_slice(br#"{"content":"quote \" and } brace"}"#);
        bytes.extend_from_slice(b"\x00\x01");
        bytes.extend_from_slice(br#"{"name":"add","toolUseId":"t1","input":"{\"a\":"}"#);
        bytes.extend_from_slice(br#"{"input":"1}","stop":true}"#);
        bytes.extend_from_slice(br#"{"followupPrompt":{"content":"ignored"}}"#);
        bytes.extend_from_slice(br#"{"contextUsagePercentage":12.5}"#);
        bytes.extend_from_slice(b"\xff\xfe");
        bytes
    }

    fn decode_in_chunks(bytes: &[u8], chunk: usize) -> Vec<FrameEvent> {
        let mut decoder = FrameDecoder::new();
        let mut out = Vec::new();
        for piece in bytes.chunks(chunk) {
            decoder.feed(piece, &mut out);
        }
        decoder.finish(&mut out);
        out
    }

    #[test]
    fn classifies_each_frame_kind() {
        let (events, _) = parse_frames(&sample_stream());
        assert_eq!(
            events,
            vec![
                FrameEvent::ContentDelta("Hello {world}".into()),
                FrameEvent::ContentDelta("quote \" and } brace".into()),
                FrameEvent::ToolCallStart {
                    id: "t1".into(),
                    name: "add".into(),
                    input: Some("{\"a\":".into()),
                },
                FrameEvent::ToolCallStop {
                    id: None,
                    name: None,
                    input: Some("1}".into()),
                },
                FrameEvent::UsageUpdate(UsageUpdate::ContextPercentage(12.5)),
            ]
        );
    }

    #[test]
    fn chunk_boundaries_do_not_change_events() {
        let bytes = sample_stream();
        let (whole, _) = parse_frames(&bytes);
        for chunk in 1..=bytes.len() {
            assert_eq!(decode_in_chunks(&bytes, chunk), whole, "chunk size {chunk}");
        }
    }

    #[test]
    fn incomplete_frame_is_kept_as_remainder() {
        let input = br#"junk{"content":"partial"#;
        let (events, consumed) = parse_frames(input);
        assert!(events.is_empty());
        assert_eq!(&input[consumed..], br#"{"content":"partial"#);
    }

    #[test]
    fn partial_leading_key_is_kept() {
        let input = br#"binary{"cont"#;
        let (_, consumed) = parse_frames(input);
        assert_eq!(&input[consumed..], br#"{"cont"#);
    }

    #[test]
    fn malformed_candidate_is_skipped() {
        let input = br#"{"content":nope}{"content":"ok"}"#;
        let (events, consumed) = parse_frames(input);
        assert_eq!(events, vec![FrameEvent::ContentDelta("ok".into())]);
        assert_eq!(consumed, input.len());
    }

    #[test]
    fn usage_object_frame() {
        let (events, _) = parse_frames(br#"{"usage":{"inputTokens":10,"outputTokens":4}}"#);
        assert_eq!(
            events,
            vec![FrameEvent::UsageUpdate(UsageUpdate::Tokens {
                input: Some(10),
                output: Some(4),
            })]
        );
    }
}
