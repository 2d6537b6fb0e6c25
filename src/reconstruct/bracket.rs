//! Tool calls the model wrote as text: `[Called <name> with args: <json>]`.

use std::sync::LazyLock;

use regex_lite::Regex;
use serde_json::Value;

use super::repair::parse_arguments;
use crate::json_scan::{balanced_end, partial_suffix_len, skip_ws};

const CALL_PREFIX: &str = "[Called ";
/// A candidate whose arguments have not closed after this many bytes is
/// treated as prose.
const MAX_CANDIDATE_BYTES: usize = 256 * 1024;

static CALL_SHAPE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?s)^\[Called\s+([A-Za-z0-9_.:\-]+)\s+with\s+args:\s*(.*?)\s*\]$").ok()
});

#[derive(Debug, Clone, PartialEq)]
pub struct BracketCall {
    pub name: String,
    pub arguments: Value,
}

/// Parse one complete `[Called ...]` candidate.
#[must_use]
pub fn parse_bracket_call(candidate: &str) -> Option<BracketCall> {
    let shape = CALL_SHAPE.as_ref()?;
    let captures = shape.captures(candidate)?;
    let name = captures.get(1)?.as_str().to_owned();
    let arguments = parse_arguments(captures.get(2)?.as_str())?;
    Some(BracketCall { name, arguments })
}

/// Why a buffered candidate is not a complete call yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    /// Everything so far fits; more text is needed.
    Incomplete,
    /// The text can no longer become a call.
    Prose,
}

#[inline]
fn is_name_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b':' | b'-')
}

fn expect_word(bytes: &[u8], i: usize, word: &[u8]) -> Result<usize, Shape> {
    let rest = &bytes[i..];
    if rest.len() < word.len() {
        return Err(if word.starts_with(rest) { Shape::Incomplete } else { Shape::Prose });
    }
    if rest.starts_with(word) {
        Ok(i + word.len())
    } else {
        Err(Shape::Prose)
    }
}

/// At least one whitespace byte, then the rest of the run.
fn expect_ws(bytes: &[u8], i: usize) -> Result<usize, Shape> {
    match bytes.get(i) {
        None => Err(Shape::Incomplete),
        Some(b' ' | b'\n' | b'\r' | b'\t') => Ok(skip_ws(bytes, i)),
        Some(_) => Err(Shape::Prose),
    }
}

/// Check `[Called <name> with args: <json>]` against a buffer that starts
/// with the call prefix, as far as the text has arrived. `Ok` is the end
/// (exclusive) of a closed candidate.
fn scan_candidate(bytes: &[u8]) -> Result<usize, Shape> {
    let mut i = skip_ws(bytes, CALL_PREFIX.len());
    let name_start = i;
    while bytes.get(i).copied().is_some_and(is_name_byte) {
        i += 1;
    }
    if i == bytes.len() {
        return Err(Shape::Incomplete);
    }
    if i == name_start {
        return Err(Shape::Prose);
    }
    i = expect_ws(bytes, i)?;
    i = expect_word(bytes, i, b"with")?;
    i = expect_ws(bytes, i)?;
    i = expect_word(bytes, i, b"args:")?;
    i = skip_ws(bytes, i);
    let (open, close) = match bytes.get(i) {
        None => return Err(Shape::Incomplete),
        Some(b'{') => (b'{', b'}'),
        Some(b'[') => (b'[', b']'),
        Some(_) => return Err(Shape::Prose),
    };
    let args_end = balanced_end(bytes, i, open, close).ok_or(Shape::Incomplete)?;
    let i = skip_ws(bytes, args_end);
    match bytes.get(i) {
        None => Err(Shape::Incomplete),
        Some(b']') => Ok(i + 1),
        Some(_) => Err(Shape::Prose),
    }
}

/// Pulls bracket calls out of streamed text, passing everything else through.
#[derive(Debug, Default)]
pub struct BracketExtractor {
    pending: String,
}

impl BracketExtractor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed text; returns the text that is safe to emit now.
    pub fn feed(&mut self, text: &str, calls: &mut Vec<BracketCall>) -> String {
        self.pending.push_str(text);
        self.process(false, calls)
    }

    /// Release everything; unfinished candidates come back as plain text.
    pub fn settle(&mut self, calls: &mut Vec<BracketCall>) -> String {
        self.process(true, calls)
    }

    fn process(&mut self, settled: bool, calls: &mut Vec<BracketCall>) -> String {
        let mut released = String::new();
        loop {
            let Some(pos) = self.pending.find(CALL_PREFIX) else {
                let keep = if settled {
                    0
                } else {
                    partial_suffix_len(self.pending.as_bytes(), CALL_PREFIX.as_bytes())
                };
                let upto = self.pending.len() - keep;
                released.extend(self.pending.drain(..upto));
                return released;
            };

            released.extend(self.pending.drain(..pos));
            match scan_candidate(self.pending.as_bytes()) {
                Ok(end) => {
                    if let Some(call) = parse_bracket_call(&self.pending[..end]) {
                        calls.push(call);
                        self.pending.drain(..end);
                    } else {
                        released.push('[');
                        self.pending.remove(0);
                    }
                }
                Err(Shape::Incomplete) if !settled && self.pending.len() <= MAX_CANDIDATE_BYTES => {
                    return released;
                }
                Err(_) => {
                    released.push('[');
                    self.pending.remove(0);
                }
            }
        }
    }
}
