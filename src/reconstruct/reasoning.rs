//! Splits backend text into reasoning and answer segments.
//!
//! The backend inlines reasoning between `<thinking>` and `</thinking>`
//! markers inside ordinary content deltas, and a marker may be split across
//! deltas. Text is released as soon as it can no longer be part of a marker.

use smallvec::SmallVec;

use crate::json_scan::partial_suffix_len;

pub const REASONING_START: &str = "<thinking>";
pub const REASONING_END: &str = "</thinking>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Reasoning(String),
    Text(String),
}

pub type Segments = SmallVec<[Segment; 4]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingContent,
    InReasoning,
    AfterReasoning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MarkerKind {
    Start,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scan {
    Real(usize),
    Hold(usize),
    Absent,
}

#[inline]
fn is_quote(ch: char) -> bool {
    matches!(ch, '"' | '\'' | '`')
}

#[inline]
fn prev_char_start(s: &str, idx: usize) -> usize {
    s[..idx].char_indices().next_back().map_or(0, |(i, _)| i)
}

/// Locate the first real marker in `hay`.
///
/// A marker adjacent to a quote or backtick is prose, not a marker. `before`
/// is the character released just ahead of `hay`, so a quote that went out
/// with an earlier delta still counts. An end marker additionally needs a
/// blank line after it, or only whitespace up to the end of the buffer once
/// no more text can arrive (`settled`).
fn scan_marker(hay: &str, before: Option<char>, kind: MarkerKind, settled: bool) -> Scan {
    let marker = match kind {
        MarkerKind::Start => REASONING_START,
        MarkerKind::End => REASONING_END,
    };

    for (pos, _) in hay.match_indices(marker) {
        let preceding = if pos == 0 { before } else { hay[..pos].chars().next_back() };
        if preceding.is_some_and(is_quote) {
            continue;
        }
        let rest = &hay[pos + marker.len()..];
        if rest.chars().next().is_some_and(is_quote) {
            continue;
        }
        match kind {
            MarkerKind::Start => {
                if rest.is_empty() && !settled {
                    return Scan::Hold(prev_char_start(hay, pos));
                }
                return Scan::Real(pos);
            }
            MarkerKind::End => {
                if rest.starts_with("\n\n") || rest.starts_with("\r\n\r\n") {
                    return Scan::Real(pos);
                }
                if rest.trim().is_empty() {
                    if settled {
                        return Scan::Real(pos);
                    }
                    return Scan::Hold(prev_char_start(hay, pos));
                }
            }
        }
    }

    let partial = partial_suffix_len(hay.as_bytes(), marker.as_bytes());
    if partial > 0 && !settled {
        return Scan::Hold(prev_char_start(hay, hay.len() - partial));
    }
    Scan::Absent
}

/// Reasoning marker state machine for one response.
#[derive(Debug)]
pub struct ReasoningExtractor {
    phase: Phase,
    pending: String,
    last_released: Option<char>,
    strip_start_newline: bool,
    end_newlines_to_strip: u8,
    text_emitted_in_phase: bool,
}

impl Default for ReasoningExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl ReasoningExtractor {
    #[must_use]
    pub fn new() -> Self {
        Self {
            phase: Phase::AwaitingContent,
            pending: String::new(),
            last_released: None,
            strip_start_newline: false,
            end_newlines_to_strip: 0,
            text_emitted_in_phase: false,
        }
    }

    #[must_use]
    pub fn in_reasoning(&self) -> bool {
        self.phase == Phase::InReasoning
    }

    #[must_use]
    pub fn reasoning_extracted(&self) -> bool {
        self.phase == Phase::AfterReasoning
    }

    pub fn feed(&mut self, text: &str, out: &mut Segments) {
        self.pending.push_str(text);
        self.process(false, out);
    }

    /// Settle everything buffered so far, as at end of stream.
    ///
    /// Also called when a structured tool call starts, since no more text can
    /// complete a marker that precedes it.
    pub fn settle(&mut self, out: &mut Segments) {
        self.process(true, out);
        if self.phase != Phase::InReasoning && !self.pending.is_empty() {
            // Whitespace-only leftovers never open a block.
            self.pending.clear();
        }
    }

    fn process(&mut self, settled: bool, out: &mut Segments) {
        loop {
            match self.phase {
                Phase::AwaitingContent => match scan_marker(&self.pending, self.last_released, MarkerKind::Start, settled) {
                    Scan::Real(pos) => {
                        let before = self.take_front(pos);
                        self.push_text(before, out);
                        self.take_front(REASONING_START.len());
                        self.phase = Phase::InReasoning;
                        self.strip_start_newline = true;
                        self.text_emitted_in_phase = false;
                    }
                    Scan::Hold(from) => {
                        self.flush_text_upto(from, out);
                        return;
                    }
                    Scan::Absent => {
                        self.flush_text_upto(self.pending.len(), out);
                        return;
                    }
                },
                Phase::InReasoning => {
                    if self.strip_start_newline {
                        if self.pending.is_empty() && !settled {
                            return;
                        }
                        if self.pending.starts_with('\n') {
                            self.take_front(1);
                        }
                        self.strip_start_newline = false;
                    }
                    match scan_marker(&self.pending, self.last_released, MarkerKind::End, settled) {
                        Scan::Real(pos) => {
                            let reasoning = self.take_front(pos);
                            push_reasoning(reasoning, out);
                            self.take_front(REASONING_END.len());
                            self.phase = Phase::AfterReasoning;
                            self.end_newlines_to_strip = 2;
                        }
                        Scan::Hold(from) => {
                            let reasoning = self.take_front(from);
                            push_reasoning(reasoning, out);
                            return;
                        }
                        Scan::Absent => {
                            let reasoning = self.take_front(self.pending.len());
                            push_reasoning(reasoning, out);
                            return;
                        }
                    }
                }
                Phase::AfterReasoning => {
                    self.strip_end_newlines();
                    if self.end_newlines_to_strip > 0 && self.pending.is_empty() && !settled {
                        return;
                    }
                    self.flush_text_upto(self.pending.len(), out);
                    return;
                }
            }
        }
    }

    fn strip_end_newlines(&mut self) {
        while self.end_newlines_to_strip > 0 {
            if self.pending.starts_with("\r\n") {
                self.take_front(2);
            } else if self.pending.starts_with('\n') {
                self.take_front(1);
            } else {
                if !self.pending.is_empty() {
                    self.end_newlines_to_strip = 0;
                }
                return;
            }
            self.end_newlines_to_strip -= 1;
        }
    }

    /// Release `pending[..upto]` as text unless it is still leading whitespace.
    fn flush_text_upto(&mut self, upto: usize, out: &mut Segments) {
        if upto == 0 {
            return;
        }
        if !self.text_emitted_in_phase && self.pending[..upto].trim().is_empty() {
            return;
        }
        let text = self.take_front(upto);
        self.push_text(text, out);
    }

    fn take_front(&mut self, upto: usize) -> String {
        let taken: String = self.pending.drain(..upto).collect();
        if let Some(ch) = taken.chars().next_back() {
            self.last_released = Some(ch);
        }
        taken
    }

    fn push_text(&mut self, text: String, out: &mut Segments) {
        if text.is_empty() {
            return;
        }
        if !self.text_emitted_in_phase && text.trim().is_empty() {
            return;
        }
        self.text_emitted_in_phase = true;
        out.push(Segment::Text(text));
    }
}

fn push_reasoning(text: String, out: &mut Segments) {
    if !text.is_empty() {
        out.push(Segment::Reasoning(text));
    }
}
