use http::header::{HeaderName, AUTHORIZATION};
use rustc_hash::FxHashSet;

use crate::error::RelayError;
use crate::protocol::canonical::IngressApi;

const X_API_KEY: HeaderName = HeaderName::from_static("x-api-key");
const X_GOOG_API_KEY: HeaderName = HeaderName::from_static("x-goog-api-key");

/// Compact key index used in hot-path authentication.
#[derive(Debug)]
pub enum AllowedClientKeys {
    Empty,
    Single(Box<str>),
    Multiple(FxHashSet<String>),
}

impl AllowedClientKeys {
    fn contains(&self, key: &str) -> bool {
        match self {
            AllowedClientKeys::Empty => false,
            AllowedClientKeys::Single(single) => single.as_ref() == key,
            AllowedClientKeys::Multiple(set) => set.contains(key),
        }
    }
}

fn header_str<'a>(headers: &'a http::HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn bearer(headers: &http::HeaderMap) -> Option<&str> {
    header_str(headers, &AUTHORIZATION).and_then(|s| s.strip_prefix("Bearer "))
}

/// `key` parameter of a query string.
fn query_key(query: Option<&str>) -> Option<&str> {
    query?
        .split('&')
        .find_map(|pair| pair.strip_prefix("key="))
        .filter(|key| !key.is_empty())
}

/// Extract the API key the way each client protocol sends it.
///
/// - `OpenAiChat` / `OpenAiResponses` / Ollama: `Authorization: Bearer <key>`
/// - Anthropic: `x-api-key: <key>`, then bearer
/// - Gemini: `x-goog-api-key: <key>`, then `?key=<key>`, then bearer
///
/// # Errors
///
/// Returns `RelayError::Auth` when no expected API key is present.
pub fn extract_api_key<'a>(
    ingress: IngressApi,
    headers: &'a http::HeaderMap,
    query: Option<&'a str>,
) -> Result<&'a str, RelayError> {
    let key = match ingress {
        IngressApi::Anthropic => header_str(headers, &X_API_KEY).or_else(|| bearer(headers)),
        IngressApi::Gemini => header_str(headers, &X_GOOG_API_KEY)
            .or_else(|| query_key(query))
            .or_else(|| bearer(headers)),
        IngressApi::OpenAiChat | IngressApi::OpenAiResponses | IngressApi::Ollama => bearer(headers),
    };

    key.ok_or_else(|| RelayError::Auth("Missing API key".to_string()))
}

/// Authenticate an incoming request against `allowed_keys`.
///
/// # Errors
///
/// Returns `RelayError::Auth` when the API key is missing or invalid.
pub fn authenticate(
    ingress: IngressApi,
    headers: &http::HeaderMap,
    query: Option<&str>,
    allowed_keys: &AllowedClientKeys,
) -> Result<(), RelayError> {
    let client_key = extract_api_key(ingress, headers, query)?;
    if allowed_keys.contains(client_key) {
        Ok(())
    } else {
        Err(RelayError::Auth("Invalid API key".to_string()))
    }
}

/// Build the key index from the configured list.
#[must_use]
pub fn build_allowed_key_set(keys: &[String]) -> AllowedClientKeys {
    let mut allowed_set: FxHashSet<String> = keys.iter().cloned().collect();
    match allowed_set.len() {
        0 => AllowedClientKeys::Empty,
        1 => match allowed_set.drain().next() {
            Some(single_key) => AllowedClientKeys::Single(single_key.into_boxed_str()),
            None => AllowedClientKeys::Empty,
        },
        _ => AllowedClientKeys::Multiple(allowed_set),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &str)]) -> http::HeaderMap {
        let mut map = http::HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, value.parse().unwrap());
        }
        map
    }

    #[test]
    fn test_extract_openai_bearer() {
        let h = headers(&[("authorization", "Bearer sk-test123")]);
        assert_eq!(extract_api_key(IngressApi::OpenAiChat, &h, None).unwrap(), "sk-test123");
        assert_eq!(extract_api_key(IngressApi::Ollama, &h, None).unwrap(), "sk-test123");
    }

    #[test]
    fn test_extract_anthropic_falls_back_to_bearer() {
        let h = headers(&[("x-api-key", "ant")]);
        assert_eq!(extract_api_key(IngressApi::Anthropic, &h, None).unwrap(), "ant");
        let h = headers(&[("authorization", "Bearer b")]);
        assert_eq!(extract_api_key(IngressApi::Anthropic, &h, None).unwrap(), "b");
    }

    #[test]
    fn test_extract_gemini_query_key() {
        let h = http::HeaderMap::new();
        assert_eq!(
            extract_api_key(IngressApi::Gemini, &h, Some("alt=sse&key=g")).unwrap(),
            "g"
        );
        let h = headers(&[("x-goog-api-key", "hdr")]);
        assert_eq!(
            extract_api_key(IngressApi::Gemini, &h, Some("key=q")).unwrap(),
            "hdr"
        );
    }

    #[test]
    fn test_missing_key() {
        let h = headers(&[("x-api-key", "k")]);
        let err = extract_api_key(IngressApi::OpenAiChat, &h, None).unwrap_err();
        assert!(matches!(err, RelayError::Auth(_)));
    }

    #[test]
    fn test_authenticate_single_and_multiple() {
        let single = build_allowed_key_set(&["a".into()]);
        let multi = build_allowed_key_set(&["a".into(), "b".into()]);
        let h = headers(&[("authorization", "Bearer b")]);
        assert!(authenticate(IngressApi::OpenAiChat, &h, None, &single).is_err());
        assert!(authenticate(IngressApi::OpenAiChat, &h, None, &multi).is_ok());
        assert!(authenticate(IngressApi::OpenAiChat, &h, None, &build_allowed_key_set(&[])).is_err());
    }
}
