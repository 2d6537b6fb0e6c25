//! Tolerant credential file loading.
//!
//! Persisted credentials get hand-edited and half-written. Loading tries a
//! strict parse, then the structural repairs used for tool arguments, then
//! pulls the required string fields out with a regex. Only when all three
//! fail is the credential unusable.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::RelayError;
use crate::reconstruct::repair::{quote_unquoted_keys, strip_trailing_commas};

/// Which loading step produced the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStep {
    Strict,
    Repaired,
    Extracted,
}

/// Pull `"field": "value"` pairs for `fields` out of otherwise broken text.
fn extract_fields(text: &str, fields: &[&str]) -> Map<String, Value> {
    let mut map = Map::new();
    for field in fields {
        let pattern = format!(r#""{}"\s*:\s*"((?:[^"\\]|\\.)*)""#, regex_lite::escape(field));
        let Ok(re) = regex_lite::Regex::new(&pattern) else {
            continue;
        };
        if let Some(value) = re.captures(text).and_then(|caps| caps.get(1)) {
            let raw = value.as_str();
            // Undo JSON escapes when the captured literal is itself valid.
            let decoded = serde_json::from_str::<String>(&format!("\"{raw}\""))
                .unwrap_or_else(|_| raw.to_owned());
            map.insert((*field).to_owned(), Value::String(decoded));
        }
    }
    map
}

/// Parse credential text with the three-step fallback.
///
/// `required` lists the fields the regex step must find; `optional` fields are
/// picked up when present.
///
/// # Errors
///
/// [`RelayError::NoCredentials`] when every step fails.
pub fn parse_credential_text<T: DeserializeOwned>(
    text: &str,
    required: &[&str],
    optional: &[&str],
) -> Result<(T, LoadStep), RelayError> {
    if let Ok(value) = serde_json::from_str::<T>(text) {
        return Ok((value, LoadStep::Strict));
    }

    let repaired = quote_unquoted_keys(&strip_trailing_commas(text.trim()));
    if let Ok(value) = serde_json::from_str::<T>(&repaired) {
        return Ok((value, LoadStep::Repaired));
    }

    let mut all = Vec::with_capacity(required.len() + optional.len());
    all.extend_from_slice(required);
    all.extend_from_slice(optional);
    let map = extract_fields(text, &all);
    if let Some(missing) = required.iter().find(|field| !map.contains_key(**field)) {
        return Err(RelayError::NoCredentials(format!(
            "credential is unreadable and field '{missing}' could not be recovered"
        )));
    }
    serde_json::from_value::<T>(Value::Object(map))
        .map(|value| (value, LoadStep::Extracted))
        .map_err(|err| RelayError::NoCredentials(format!("recovered credential is incomplete: {err}")))
}

/// Read and parse a credential file.
///
/// # Errors
///
/// [`RelayError::NoCredentials`] when the file is missing or unreadable by all
/// three steps.
pub async fn load_credential_file<T: DeserializeOwned>(
    path: &Path,
    required: &[&str],
    optional: &[&str],
) -> Result<T, RelayError> {
    let text = tokio::fs::read_to_string(path).await.map_err(|err| {
        RelayError::NoCredentials(format!("cannot read {}: {err}", path.display()))
    })?;
    let (value, step) = parse_credential_text(&text, required, optional)?;
    if step != LoadStep::Strict {
        tracing::warn!(path = %path.display(), ?step, "credential file was damaged and has been recovered");
    }
    Ok(value)
}
