use rustc_hash::FxHashSet;
use serde_json::Value;

use super::repair::parse_arguments;

/// A completed tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug)]
struct PendingToolCall {
    id: String,
    name: String,
    args: String,
    stop_seen: bool,
}

impl PendingToolCall {
    fn new(id: String, name: String) -> Self {
        Self {
            id,
            name,
            args: String::new(),
            stop_seen: false,
        }
    }

    fn try_complete(&self) -> Option<ToolCallRecord> {
        parse_arguments(&self.args).map(|arguments| ToolCallRecord {
            id: self.id.clone(),
            name: self.name.clone(),
            arguments,
        })
    }

    /// Completion at end of stream; unparseable arguments degrade to `{}`.
    fn force_complete(self) -> ToolCallRecord {
        let arguments = parse_arguments(&self.args).unwrap_or_else(|| {
            tracing::warn!(
                tool = %self.name,
                args_len = self.args.len(),
                "tool arguments could not be parsed, sending empty object"
            );
            Value::Object(serde_json::Map::new())
        });
        ToolCallRecord {
            id: self.id,
            name: self.name,
            arguments,
        }
    }
}

/// Joins structured start/input/stop events into complete tool calls.
///
/// Argument fragments are concatenated until a stop event; the buffer is only
/// turned into a record once it parses, or when the stream ends.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    pending: Option<PendingToolCall>,
}

impl ToolCallAccumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn start(
        &mut self,
        id: String,
        name: String,
        input: Option<&str>,
        out: &mut Vec<ToolCallRecord>,
    ) {
        let continues_current = self.pending.as_ref().is_some_and(|p| p.id == id);
        if !continues_current {
            self.flush(out);
            self.pending = Some(PendingToolCall::new(id, name));
        }
        if let (Some(pending), Some(input)) = (self.pending.as_mut(), input) {
            pending.args.push_str(input);
        }
    }

    pub fn input(&mut self, id: Option<&str>, input: &str) {
        match self.pending.as_mut() {
            Some(pending) => {
                if id.is_some_and(|id| id != pending.id) {
                    tracing::debug!(
                        expected = %pending.id,
                        got = ?id,
                        "tool input for a different call id, appending to current call"
                    );
                }
                pending.args.push_str(input);
            }
            None => tracing::debug!("tool input without an open tool call, dropped"),
        }
    }

    pub fn stop(
        &mut self,
        id: Option<String>,
        name: Option<String>,
        input: Option<&str>,
        out: &mut Vec<ToolCallRecord>,
    ) {
        if self.pending.is_none() {
            match (id, name) {
                (Some(id), Some(name)) => self.pending = Some(PendingToolCall::new(id, name)),
                _ => {
                    tracing::debug!("tool stop without an open tool call, ignored");
                    return;
                }
            }
        }
        let Some(pending) = self.pending.as_mut() else {
            return;
        };
        if let Some(input) = input {
            pending.args.push_str(input);
        }
        pending.stop_seen = true;
        if let Some(record) = pending.try_complete() {
            self.pending = None;
            out.push(record);
        }
    }

    /// Emit whatever is buffered, parsed as well as possible.
    pub fn flush(&mut self, out: &mut Vec<ToolCallRecord>) {
        if let Some(pending) = self.pending.take() {
            if !pending.stop_seen {
                tracing::debug!(tool = %pending.name, "tool call closed without a stop event");
            }
            out.push(pending.force_complete());
        }
    }
}

/// Drops repeated calls with the same name and arguments.
#[derive(Debug, Default)]
pub struct ToolCallDedup {
    seen: FxHashSet<(String, String)>,
}

impl ToolCallDedup {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` the first time a (name, arguments) pair is seen.
    pub fn admit(&mut self, name: &str, arguments: &Value) -> bool {
        let key = (name.to_owned(), arguments.to_string());
        if self.seen.insert(key) {
            return true;
        }
        tracing::debug!(tool = %name, "duplicate tool call dropped");
        false
    }
}
