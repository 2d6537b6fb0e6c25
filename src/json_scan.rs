//! Byte-level scanning helpers for JSON embedded in unstructured text.

#[inline]
pub(crate) fn skip_ws(bytes: &[u8], mut i: usize) -> usize {
    let len = bytes.len();
    while i < len {
        match bytes[i] {
            b' ' | b'\n' | b'\r' | b'\t' => i += 1,
            _ => break,
        }
    }
    i
}

/// Find the end (exclusive) of the balanced region opened by `open` at `start`.
///
/// Double quotes toggle string mode and a backslash inside a string escapes
/// the next byte, so delimiters inside string values never count. Returns
/// `None` when the buffer ends before depth returns to zero.
#[inline]
pub(crate) fn balanced_end(bytes: &[u8], start: usize, open: u8, close: u8) -> Option<usize> {
    if bytes.get(start) != Some(&open) {
        return None;
    }
    let mut depth = 0_usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        if b == b'"' {
            in_string = true;
        } else if b == open {
            depth += 1;
        } else if b == close {
            depth -= 1;
            if depth == 0 {
                return Some(start + offset + 1);
            }
        }
    }
    None
}

/// Balanced `{...}` object starting at `start`.
#[inline]
pub(crate) fn balanced_object_end(bytes: &[u8], start: usize) -> Option<usize> {
    balanced_end(bytes, start, b'{', b'}')
}

/// Length of the longest suffix of `bytes` that is a proper prefix of `pattern`.
#[inline]
pub(crate) fn partial_suffix_len(bytes: &[u8], pattern: &[u8]) -> usize {
    let max = pattern.len().saturating_sub(1).min(bytes.len());
    (1..=max)
        .rev()
        .find(|&n| bytes[bytes.len() - n..] == pattern[..n])
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balanced_end_ignores_braces_in_strings() {
        let input = br#"xx{"a":"}{","b":{"c":1}}tail"#;
        let end = balanced_object_end(input, 2).unwrap();
        assert_eq!(&input[2..end], br#"{"a":"}{","b":{"c":1}}"#);
    }

    #[test]
    fn balanced_end_handles_escaped_quotes() {
        let input = br#"{"a":"say \"}\" now"}"#;
        assert_eq!(balanced_object_end(input, 0), Some(input.len()));
    }

    #[test]
    fn balanced_end_incomplete_returns_none() {
        assert_eq!(balanced_object_end(br#"{"a":{"b":1}"#, 0), None);
        assert_eq!(balanced_object_end(b"no", 0), None);
    }

    #[test]
    fn brackets_with_string_aware_depth() {
        let input = br#"[Called f with args: {"q":"a]b"}] rest"#;
        let end = balanced_end(input, 0, b'[', b']').unwrap();
        assert_eq!(&input[end..], b" rest");
    }

    #[test]
    fn partial_suffix_detection() {
        assert_eq!(partial_suffix_len(b"abc{\"con", b"{\"content\":"), 5);
        assert_eq!(partial_suffix_len(b"abc", b"{\"content\":"), 0);
        assert_eq!(partial_suffix_len(b"x<thi", b"<thinking>"), 4);
    }
}
