use std::error::Error as _;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::error::RelayError;

use super::retry_policy::{should_retry_transport_message, should_retry_upstream_status, RetryPolicy};

fn build_reqwest_client(
    pool_max_idle_per_host: usize,
    pool_idle_timeout: Option<Duration>,
    timeout: Duration,
) -> Result<reqwest::Client, RelayError> {
    reqwest::Client::builder()
        .pool_max_idle_per_host(pool_max_idle_per_host)
        .pool_idle_timeout(pool_idle_timeout)
        .tcp_nodelay(true)
        .connect_timeout(Duration::from_secs(10))
        .redirect(reqwest::redirect::Policy::none())
        .timeout(timeout)
        .build()
        .map_err(|err| RelayError::Transport(format!("Failed to build HTTP client: {err}")))
}

/// Error text including the source chain; reqwest keeps the useful part
/// (reset, refused, dns) in the sources.
pub(crate) fn error_chain_message(err: &reqwest::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}

fn is_transient_transport(err: &reqwest::Error, message: &str) -> bool {
    err.is_timeout() || err.is_connect() || should_retry_transport_message(message)
}

/// A request the transport can replay on retry.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: http::Method,
    pub url: String,
    pub headers: http::HeaderMap,
    pub body: bytes::Bytes,
}

impl UpstreamRequest {
    #[must_use]
    pub fn post_json(url: impl Into<String>, headers: http::HeaderMap, body: bytes::Bytes) -> Self {
        Self {
            method: http::Method::POST,
            url: url.into(),
            headers,
            body,
        }
    }
}

/// HTTP clients shared by every adapter: a pooled client with the long
/// generation timeout and a short-timeout client for token refresh.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    refresh_client: reqwest::Client,
    policy: RetryPolicy,
}

impl HttpTransport {
    /// # Errors
    ///
    /// Returns [`RelayError::Transport`] when a client cannot be built.
    pub fn new(config: &ServerConfig, policy: RetryPolicy) -> Result<Self, RelayError> {
        let idle = Some(Duration::from_secs(config.http_pool_idle_timeout_secs));
        Ok(Self {
            client: build_reqwest_client(
                config.http_pool_max_idle_per_host,
                idle,
                Duration::from_secs(config.timeout),
            )?,
            refresh_client: build_reqwest_client(1, idle, Duration::from_secs(config.refresh_timeout))?,
            policy,
        })
    }

    #[must_use]
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    #[must_use]
    pub fn refresh_client(&self) -> &reqwest::Client {
        &self.refresh_client
    }

    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Send `request`, retrying on the same credential for 429, 5xx and
    /// transient network errors with exponential backoff.
    ///
    /// Returns the response only for 2xx statuses. Any other final status
    /// comes back as [`RelayError::Upstream`] carrying the response body, so
    /// the caller can classify it.
    ///
    /// # Errors
    ///
    /// [`RelayError::Cancelled`] when `cancel` fires while waiting,
    /// [`RelayError::Upstream`] for non-success statuses and
    /// [`RelayError::Transport`] for network failures.
    pub async fn send_with_retry(
        &self,
        request: &UpstreamRequest,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, RelayError> {
        let mut attempt = 0;
        loop {
            let send = self
                .client
                .request(request.method.clone(), &request.url)
                .headers(request.headers.clone())
                .body(request.body.clone())
                .send();
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(RelayError::Cancelled),
                result = send => result,
            };

            let delay = match result {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    if attempt >= self.policy.max_retries || !should_retry_upstream_status(status) {
                        let body = response.text().await.unwrap_or_default();
                        return Err(RelayError::upstream(status.as_u16(), body));
                    }
                    let delay = self.policy.status_delay(response.headers(), attempt);
                    tracing::debug!(
                        status = status.as_u16(),
                        retry_attempt = attempt + 1,
                        delay_ms = delay.as_millis(),
                        "retrying upstream request after retriable status"
                    );
                    delay
                }
                Err(err) => {
                    let message = error_chain_message(&err);
                    if attempt >= self.policy.max_retries || !is_transient_transport(&err, &message) {
                        return Err(RelayError::Transport(message));
                    }
                    let delay = self.policy.backoff_delay(attempt);
                    tracing::debug!(
                        retry_attempt = attempt + 1,
                        delay_ms = delay.as_millis(),
                        error = %message,
                        "retrying upstream request after transport error"
                    );
                    delay
                }
            };

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(RelayError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clients_build_from_defaults() {
        let transport = HttpTransport::new(&ServerConfig::default(), RetryPolicy::default()).unwrap();
        assert_eq!(transport.policy().max_retries, 3);
    }

    #[tokio::test]
    async fn test_cancelled_before_send() {
        let transport = HttpTransport::new(&ServerConfig::default(), RetryPolicy::default()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let request = UpstreamRequest::post_json(
            "http://127.0.0.1:9/unused",
            http::HeaderMap::new(),
            bytes::Bytes::new(),
        );
        let err = transport.send_with_retry(&request, &cancel).await.unwrap_err();
        assert!(matches!(err, RelayError::Cancelled));
    }
}
