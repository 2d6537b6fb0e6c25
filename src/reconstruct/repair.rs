//! Lenient JSON parsing for model-produced tool arguments.
//!
//! Repair is lossy and runs a fixed, ordered list of rewrites, re-parsing
//! after each one. Never feed it data that is expected to be valid.

use serde_json::Value;

/// Which rewrite made the input parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairStep {
    None,
    TrailingCommas,
    UnquotedKeys,
    BareWordValues,
}

const STEPS: [(RepairStep, fn(&str) -> String); 3] = [
    (RepairStep::TrailingCommas, strip_trailing_commas),
    (RepairStep::UnquotedKeys, quote_unquoted_keys),
    (RepairStep::BareWordValues, quote_bare_values),
];

/// Parse `input`, applying the repair steps cumulatively until one parses.
#[must_use]
pub fn parse_lenient(input: &str) -> Option<(Value, RepairStep)> {
    if let Ok(value) = serde_json::from_str(input) {
        return Some((value, RepairStep::None));
    }
    let mut current = input.trim().to_owned();
    for (step, rewrite) in STEPS {
        current = rewrite(&current);
        if let Ok(value) = serde_json::from_str(&current) {
            return Some((value, step));
        }
    }
    None
}

/// Parse tool arguments. Empty input means no arguments.
#[must_use]
pub fn parse_arguments(input: &str) -> Option<Value> {
    if input.trim().is_empty() {
        return Some(Value::Object(serde_json::Map::new()));
    }
    let (value, step) = parse_lenient(input)?;
    if step != RepairStep::None {
        tracing::debug!(?step, "tool arguments needed JSON repair");
    }
    Some(value)
}

/// Walks `input` copying string literals verbatim and handing every other
/// character to `on_code` together with the unread tail.
fn rewrite_outside_strings(input: &str, mut on_code: impl FnMut(char, &str, &mut String) -> usize) -> String {
    let mut out = String::with_capacity(input.len() + 16);
    let mut in_string = false;
    let mut escaped = false;
    let mut idx = 0;
    while let Some(ch) = input[idx..].chars().next() {
        let next = idx + ch.len_utf8();
        if in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            idx = next;
            continue;
        }
        if ch == '"' {
            in_string = true;
            out.push(ch);
            idx = next;
            continue;
        }
        let skip = on_code(ch, &input[next..], &mut out);
        idx = next + skip;
    }
    out
}

fn is_ident_start(ch: char) -> bool {
    ch.is_ascii_alphabetic() || ch == '_' || ch == '$'
}

fn is_ident_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '_' | '$' | '-' | '.')
}

fn leading_ws_len(s: &str) -> usize {
    s.len() - s.trim_start().len()
}

#[must_use]
pub fn strip_trailing_commas(input: &str) -> String {
    rewrite_outside_strings(input, |ch, rest, out| {
        if ch == ',' {
            let after = rest.trim_start();
            if after.starts_with('}') || after.starts_with(']') {
                return 0;
            }
        }
        out.push(ch);
        0
    })
}

#[must_use]
pub fn quote_unquoted_keys(input: &str) -> String {
    rewrite_outside_strings(input, |ch, rest, out| {
        out.push(ch);
        if ch != '{' && ch != ',' {
            return 0;
        }
        let ws = leading_ws_len(rest);
        let tail = &rest[ws..];
        if !tail.chars().next().is_some_and(is_ident_start) {
            return 0;
        }
        let ident_len = tail.find(|c: char| !is_ident_char(c)).unwrap_or(tail.len());
        let after_ident = &tail[ident_len..];
        if !after_ident.trim_start().starts_with(':') {
            return 0;
        }
        out.push_str(&rest[..ws]);
        out.push('"');
        out.push_str(&tail[..ident_len]);
        out.push('"');
        ws + ident_len
    })
}

#[must_use]
pub fn quote_bare_values(input: &str) -> String {
    rewrite_outside_strings(input, |ch, rest, out| {
        out.push(ch);
        if ch != ':' {
            return 0;
        }
        let ws = leading_ws_len(rest);
        let tail = &rest[ws..];
        if !tail.chars().next().is_some_and(is_ident_start) {
            return 0;
        }
        let word_len = tail
            .find(|c: char| !(is_ident_char(c) || c == ' '))
            .unwrap_or(tail.len());
        let word = tail[..word_len].trim_end();
        if matches!(word, "true" | "false" | "null") {
            return 0;
        }
        out.push_str(&rest[..ws]);
        out.push('"');
        out.push_str(word);
        out.push('"');
        ws + word.len()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn valid_json_needs_no_repair() {
        let (value, step) = parse_lenient(r#"{"a":1}"#).unwrap();
        assert_eq!(value, json!({"a": 1}));
        assert_eq!(step, RepairStep::None);
    }

    #[test]
    fn trailing_commas_removed_outside_strings() {
        let (value, step) = parse_lenient(r#"{"a":[1,2,],"b":"x,}",}"#).unwrap();
        assert_eq!(value, json!({"a": [1, 2], "b": "x,}"}));
        assert_eq!(step, RepairStep::TrailingCommas);
    }

    #[test]
    fn unquoted_keys_are_quoted() {
        let (value, step) = parse_lenient(r#"{path: "/tmp", nested: {depth: 2}}"#).unwrap();
        assert_eq!(value, json!({"path": "/tmp", "nested": {"depth": 2}}));
        assert_eq!(step, RepairStep::UnquotedKeys);
    }

    #[test]
    fn bare_word_values_are_quoted() {
        let (value, step) = parse_lenient(r#"{"city": Paris, "ok": true, "n": null}"#).unwrap();
        assert_eq!(value, json!({"city": "Paris", "ok": true, "n": null}));
        assert_eq!(step, RepairStep::BareWordValues);
    }

    #[test]
    fn hopeless_input_fails() {
        assert!(parse_lenient("{{{").is_none());
        assert!(parse_lenient("not json at all").is_none());
    }

    #[test]
    fn empty_arguments_are_empty_object() {
        assert_eq!(parse_arguments("  "), Some(json!({})));
    }
}
