/// SSE (Server-Sent Events) parsing and framing helpers.
///
/// The parser handles partial lines and split UTF-8 sequences across network
/// chunks, following the field rules of the
/// [SSE specification](https://html.spec.whatwg.org/multipage/server-sent-events.html).
use bytes::Bytes;
use memchr::memchr_iter;

/// One dispatched SSE event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

/// Incremental SSE line parser.
///
/// Feed it raw chunks (potentially arriving in arbitrary byte boundaries) and
/// it yields fully-assembled [`SseEvent`] frames.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    read_offset: usize,
    utf8_tail: Vec<u8>,
    event_type: Option<String>,
    data_buffer: String,
    has_data: bool,
}

impl SseParser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw text and return any complete events parsed.
    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        let mut out = Vec::new();
        self.feed_into(chunk, &mut out);
        out
    }

    /// Feed network bytes. A UTF-8 sequence split across chunks is held back
    /// until its remaining bytes arrive; invalid bytes are replaced.
    pub fn feed_bytes(&mut self, chunk: &[u8], out: &mut Vec<SseEvent>) {
        let mut joined;
        let bytes = if self.utf8_tail.is_empty() {
            chunk
        } else {
            joined = std::mem::take(&mut self.utf8_tail);
            joined.extend_from_slice(chunk);
            joined.as_slice()
        };

        let mut rest = bytes;
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    self.feed_into(text, out);
                    return;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    if let Ok(text) = std::str::from_utf8(valid) {
                        self.feed_into(text, out);
                    }
                    match err.error_len() {
                        // Incomplete sequence at the end: wait for more bytes.
                        None => {
                            self.utf8_tail = after.to_vec();
                            return;
                        }
                        Some(bad) => {
                            self.feed_into("\u{FFFD}", out);
                            rest = &after[bad..];
                        }
                    }
                }
            }
        }
    }

    /// Feed raw text and append complete events into a caller-provided buffer.
    ///
    /// - `event:` sets the event type for the next frame
    /// - `data:` lines append to the data buffer, joined with `\n`
    /// - an empty line dispatches the frame
    /// - `:` comments and unknown fields are ignored
    pub fn feed_into(&mut self, chunk: &str, out: &mut Vec<SseEvent>) {
        self.buffer.push_str(chunk);
        let mut processed_up_to = self.read_offset;
        let scan_start = processed_up_to;
        let positions: Vec<usize> = memchr_iter(b'\n', &self.buffer.as_bytes()[scan_start..])
            .map(|rel| scan_start + rel)
            .collect();
        for line_end in positions {
            let line = self.buffer[processed_up_to..line_end].to_owned();
            let line = line.strip_suffix('\r').unwrap_or(&line);
            self.process_line(line, out);
            processed_up_to = line_end + 1;
        }

        self.read_offset = processed_up_to;
        if self.read_offset == self.buffer.len() {
            self.buffer.clear();
            self.read_offset = 0;
            return;
        }
        let should_compact = self.read_offset > 0
            && (self.read_offset >= self.buffer.len() / 2 || self.read_offset >= 8 * 1024);
        if should_compact {
            self.buffer.drain(..self.read_offset);
            self.read_offset = 0;
        }
    }

    /// Dispatch a final frame that was not followed by a blank line.
    pub fn finish(&mut self, out: &mut Vec<SseEvent>) {
        if self.read_offset < self.buffer.len() {
            let line = self.buffer[self.read_offset..].to_owned();
            let line = line.strip_suffix('\r').unwrap_or(&line);
            self.process_line(line, out);
        }
        self.buffer.clear();
        self.read_offset = 0;
        self.process_line("", out);
    }

    fn process_line(&mut self, line: &str, out: &mut Vec<SseEvent>) {
        if line.is_empty() {
            if self.has_data {
                out.push(SseEvent {
                    event: self.event_type.take(),
                    data: std::mem::take(&mut self.data_buffer),
                });
                self.has_data = false;
            }
            return;
        }

        if line.starts_with(':') {
            return;
        }

        if let Some(value) = line.strip_prefix("data:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            if self.has_data {
                self.data_buffer.push('\n');
            } else {
                self.has_data = true;
            }
            self.data_buffer.push_str(value);
        } else if let Some(value) = line.strip_prefix("event:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            self.event_type = Some(value.to_owned());
        }
    }
}

// ---------------------------------------------------------------------------
// Framing helpers
// ---------------------------------------------------------------------------

const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";

/// `data: {json}\n\n`
#[must_use]
pub fn data_frame(json: &str) -> Bytes {
    let mut out = String::with_capacity(8 + json.len());
    out.push_str("data: ");
    out.push_str(json);
    out.push_str("\n\n");
    Bytes::from(out)
}

/// `event: {name}\ndata: {json}\n\n`
#[must_use]
pub fn named_frame(event_type: &str, json: &str) -> Bytes {
    let mut out = String::with_capacity(18 + event_type.len() + json.len());
    out.push_str("event: ");
    out.push_str(event_type);
    out.push('\n');
    out.push_str("data: ");
    out.push_str(json);
    out.push_str("\n\n");
    Bytes::from(out)
}

/// One newline-delimited JSON line.
#[must_use]
pub fn ndjson_line(json: &str) -> Bytes {
    let mut out = String::with_capacity(json.len() + 1);
    out.push_str(json);
    out.push('\n');
    Bytes::from(out)
}

#[must_use]
pub fn done_frame() -> Bytes {
    Bytes::from_static(DONE_FRAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_data_frame() {
        let mut parser = SseParser::new();
        let events = parser.feed("data: hello world\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "hello world");
        assert!(events[0].event.is_none());
    }

    #[test]
    fn test_parse_named_event() {
        let mut parser = SseParser::new();
        let events = parser.feed("event: message_start\ndata: {\"type\":\"message_start\"}\n\n");
        assert_eq!(events[0].event.as_deref(), Some("message_start"));
        assert_eq!(events[0].data, "{\"type\":\"message_start\"}");
    }

    #[test]
    fn test_parse_multiline_data_and_comments() {
        let mut parser = SseParser::new();
        let events = parser.feed(": keepalive\ndata: line1\ndata:line2\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "line1\nline2");
    }

    #[test]
    fn test_parse_incremental_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.feed("data: {\"a\"").is_empty());
        assert!(parser.feed(":1}\r\n").is_empty());
        let events = parser.feed("\r\ndata: [DONE]\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "{\"a\":1}");
        assert!(events[1].is_done());
    }

    #[test]
    fn test_feed_bytes_split_utf8() {
        let text = "data: héllo ✓\n\n".as_bytes();
        let mut parser = SseParser::new();
        let mut out = Vec::new();
        for byte in text {
            parser.feed_bytes(std::slice::from_ref(byte), &mut out);
        }
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].data, "héllo ✓");
    }

    #[test]
    fn test_finish_dispatches_unterminated_frame() {
        let mut parser = SseParser::new();
        let mut out = Vec::new();
        parser.feed_into("data: tail", &mut out);
        assert!(out.is_empty());
        parser.finish(&mut out);
        assert_eq!(out[0].data, "tail");
    }

    #[test]
    fn test_frame_helpers() {
        assert_eq!(&data_frame("{}")[..], b"data: {}\n\n");
        assert_eq!(&named_frame("ping", "{}")[..], b"event: ping\ndata: {}\n\n");
        assert_eq!(&ndjson_line("{}")[..], b"{}\n");
        assert_eq!(&done_frame()[..], b"data: [DONE]\n\n");
    }
}
