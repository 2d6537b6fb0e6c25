use std::time::{Duration, SystemTime};

use http::header::RETRY_AFTER;

use crate::config::RetryConfig;

/// Same-credential retry tuning for one adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// `base * 2^attempt`, capped at `max_delay`.
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let multiplier = 1_u32 << attempt.min(16);
        self.base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Honour `Retry-After` when present, bounded by `max_delay`.
    #[must_use]
    pub fn status_delay(&self, headers: &http::HeaderMap, attempt: u32) -> Duration {
        parse_retry_after_delay(headers)
            .map(|delay| delay.min(self.max_delay))
            .unwrap_or_else(|| self.backoff_delay(attempt))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[inline]
pub(crate) fn should_retry_upstream_status(status: http::StatusCode) -> bool {
    status.as_u16() == 429 || status.is_server_error()
}

#[inline]
pub(crate) fn should_retry_transport_message(message: &str) -> bool {
    const NEEDLES: [&[u8]; 12] = [
        b"timed out",
        b"timeout",
        b"connection reset",
        b"connection aborted",
        b"connection refused",
        b"connection closed",
        b"broken pipe",
        b"unexpected eof",
        b"dns error",
        b"failed to lookup address",
        b"connection error",
        b"stream closed",
    ];
    let haystack = message.as_bytes();
    NEEDLES
        .iter()
        .any(|needle| contains_ascii_case_insensitive(haystack, needle))
}

#[inline]
fn contains_ascii_case_insensitive(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    if haystack.len() < needle.len() {
        return false;
    }

    haystack.windows(needle.len()).any(|window| {
        window
            .iter()
            .zip(needle.iter())
            .all(|(a, b)| a.eq_ignore_ascii_case(b))
    })
}

#[inline]
pub(crate) fn parse_retry_after_delay(headers: &http::HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(seconds) = raw.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let target = httpdate::parse_http_date(raw).ok()?;
    Some(target.duration_since(SystemTime::now()).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = policy();
        assert_eq!(policy.backoff_delay(0), Duration::from_millis(1000));
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(2000));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(4000));
        assert_eq!(policy.backoff_delay(10), Duration::from_millis(30_000));
        assert_eq!(policy.backoff_delay(40), Duration::from_millis(30_000));
    }

    #[test]
    fn test_should_retry_upstream_status() {
        assert!(should_retry_upstream_status(http::StatusCode::TOO_MANY_REQUESTS));
        assert!(should_retry_upstream_status(http::StatusCode::INTERNAL_SERVER_ERROR));
        assert!(should_retry_upstream_status(http::StatusCode::from_u16(529).unwrap()));
        assert!(!should_retry_upstream_status(http::StatusCode::UNAUTHORIZED));
        assert!(!should_retry_upstream_status(http::StatusCode::BAD_REQUEST));
    }

    #[test]
    fn test_parse_retry_after_seconds_is_capped_by_policy() {
        let mut headers = http::HeaderMap::new();
        headers.insert(RETRY_AFTER, http::HeaderValue::from_static("5"));
        assert_eq!(parse_retry_after_delay(&headers), Some(Duration::from_secs(5)));
        headers.insert(RETRY_AFTER, http::HeaderValue::from_static("600"));
        assert_eq!(policy().status_delay(&headers, 0), Duration::from_millis(30_000));
    }

    #[test]
    fn test_parse_retry_after_http_date() {
        let target = SystemTime::now() + Duration::from_secs(2);
        let mut headers = http::HeaderMap::new();
        headers.insert(
            RETRY_AFTER,
            http::HeaderValue::from_str(&httpdate::fmt_http_date(target)).unwrap(),
        );
        let delay = parse_retry_after_delay(&headers).unwrap();
        assert!(delay <= Duration::from_secs(2));
    }

    #[test]
    fn test_parse_retry_after_invalid_falls_back_to_backoff() {
        let mut headers = http::HeaderMap::new();
        headers.insert(RETRY_AFTER, http::HeaderValue::from_static("not-a-delay"));
        assert!(parse_retry_after_delay(&headers).is_none());
        assert_eq!(policy().status_delay(&headers, 1), Duration::from_millis(2000));
    }

    #[test]
    fn test_transient_transport_messages() {
        assert!(should_retry_transport_message("connection reset by peer"));
        assert!(should_retry_transport_message("dns error: failed to lookup address information"));
        assert!(should_retry_transport_message("operation timed out"));
        assert!(!should_retry_transport_message("invalid certificate"));
    }
}
