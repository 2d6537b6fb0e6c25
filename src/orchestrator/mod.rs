//! Request orchestration: credential selection, rotation and final framing.
//!
//! One logical request may run several attempts. Adapters retry transient
//! failures themselves; the orchestrator only decides whether a failed attempt
//! is worth a fresh credential. Streaming responses never retry once the
//! client has seen a byte, and end with exactly one terminal marker.

pub mod sink;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;
use crate::error::{FailureClass, RelayError};
use crate::observability::log_request_complete;
use crate::protocol::canonical::{
    BlockKind, CanonicalRequest, CanonicalResponse, CanonicalStreamEvent, CanonicalUsage,
    ProviderKind,
};
use crate::protocol::framing::correct_stop_reason;
use crate::provider::{AdapterHandle, AttemptContext, ProviderPool};

pub use sink::ClientSink;

/// State shared by every attempt of one logical request.
#[derive(Debug, Clone)]
pub struct RetryContext {
    pub request_id: String,
    /// Set when the client disconnects; checked before each attempt and write.
    pub cancel: CancellationToken,
    pub started: Instant,
}

impl RetryContext {
    #[must_use]
    pub fn new(request_id: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            request_id: request_id.into(),
            cancel,
            started: Instant::now(),
        }
    }
}

pub struct Orchestrator {
    pool: Arc<dyn ProviderPool>,
    max_attempts: u32,
    rotation_jitter_max: Duration,
    /// How long a transient failure keeps a credential out of rotation.
    transient_cooldown: Duration,
}

impl Orchestrator {
    #[must_use]
    pub fn new(pool: Arc<dyn ProviderPool>, retry: &RetryConfig) -> Self {
        Self {
            pool,
            max_attempts: retry.max_attempts.max(1),
            rotation_jitter_max: Duration::from_millis(retry.rotation_jitter_max_ms),
            transient_cooldown: Duration::from_millis(retry.max_delay_ms),
        }
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<dyn ProviderPool> {
        &self.pool
    }

    fn attempt_context(&self, ctx: &RetryContext, handle: &AdapterHandle) -> AttemptContext {
        AttemptContext {
            request_id: ctx.request_id.clone(),
            provider: handle.provider,
            credential_id: handle.credential_id.clone(),
            pool: Arc::clone(&self.pool),
            cancel: ctx.cancel.clone(),
        }
    }

    /// Record a failed attempt and decide whether another credential should
    /// be tried.
    async fn should_rotate(
        &self,
        ctx: &RetryContext,
        handle: &AdapterHandle,
        err: &RelayError,
        attempt: u32,
        bytes_sent: bool,
    ) -> bool {
        let class = err.failure_class();
        let unreported_credential_failure =
            class == FailureClass::CredentialExhausted && !err.credential_reported();
        if class == FailureClass::Transient {
            self.pool.mark_unhealthy_with_recovery(
                handle.provider,
                &handle.credential_id,
                &err.to_string(),
                self.cooldown_until(),
            );
        } else if unreported_credential_failure {
            self.pool
                .mark_unhealthy(handle.provider, &handle.credential_id, &err.to_string());
        }
        if class != FailureClass::CredentialExhausted || bytes_sent || attempt >= self.max_attempts {
            return false;
        }

        let jitter = self.jitter();
        tracing::warn!(
            request_id = %ctx.request_id,
            provider = %handle.provider,
            credential = %handle.credential_id,
            attempt,
            delay_ms = jitter.as_millis(),
            error = %err,
            "credential exhausted, rotating"
        );
        tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => false,
            () = tokio::time::sleep(jitter) => true,
        }
    }

    fn cooldown_until(&self) -> DateTime<Utc> {
        let now = Utc::now();
        chrono::Duration::from_std(self.transient_cooldown)
            .ok()
            .and_then(|cooldown| now.checked_add_signed(cooldown))
            .unwrap_or(now)
    }

    fn jitter(&self) -> Duration {
        let max = u64::try_from(self.rotation_jitter_max.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(fastrand::u64(0..=max))
    }

    /// Unary generation with credential rotation.
    ///
    /// # Errors
    ///
    /// The last attempt's error when no attempt succeeded.
    pub async fn generate(
        &self,
        provider: ProviderKind,
        request: &CanonicalRequest,
        ctx: &RetryContext,
    ) -> Result<CanonicalResponse, RelayError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            if ctx.cancel.is_cancelled() {
                return Err(RelayError::Cancelled);
            }
            let handle = self.pool.select_adapter(provider, &request.model)?;
            let actx = self.attempt_context(ctx, &handle);
            match handle
                .adapter
                .generate_content(&request.model, request, &actx)
                .await
            {
                Ok(mut response) => {
                    self.pool.mark_healthy(handle.provider, &handle.credential_id);
                    response.stop_reason =
                        correct_stop_reason(response.stop_reason, response.has_tool_calls());
                    log_request_complete(&ctx.request_id, &request.model, &response.usage, ctx.started);
                    return Ok(response);
                }
                Err(RelayError::Cancelled) => return Err(RelayError::Cancelled),
                Err(err) => {
                    if !self.should_rotate(ctx, &handle, &err, attempt, false).await {
                        return Err(err);
                    }
                }
            }
        }
    }

    /// Streaming generation. Always leaves the sink with exactly one terminal
    /// marker or error frame, unless the client went away.
    pub async fn stream(
        &self,
        provider: ProviderKind,
        request: &CanonicalRequest,
        ctx: &RetryContext,
        sink: &mut ClientSink,
    ) {
        let mut attempt = 0;
        loop {
            attempt += 1;
            if ctx.cancel.is_cancelled() {
                tracing::debug!(request_id = %ctx.request_id, "client gone, abandoning request");
                return;
            }
            let handle = match self.pool.select_adapter(provider, &request.model) {
                Ok(handle) => handle,
                Err(err) => {
                    sink.send_error(&err).await;
                    return;
                }
            };
            let actx = self.attempt_context(ctx, &handle);
            match Self::stream_attempt(&handle, request, &actx, sink).await {
                Ok(usage) => {
                    self.pool.mark_healthy(handle.provider, &handle.credential_id);
                    log_request_complete(&ctx.request_id, &request.model, &usage, ctx.started);
                    return;
                }
                Err(RelayError::Cancelled) => {
                    tracing::debug!(
                        request_id = %ctx.request_id,
                        credential = %handle.credential_id,
                        "client disconnected mid-stream, backend stream closed"
                    );
                    return;
                }
                Err(err) => {
                    if self
                        .should_rotate(ctx, &handle, &err, attempt, sink.bytes_sent())
                        .await
                    {
                        continue;
                    }
                    if sink.bytes_sent() {
                        tracing::warn!(
                            request_id = %ctx.request_id,
                            error = %err,
                            "stream failed after output was sent, ending with an error frame"
                        );
                    }
                    sink.send_error(&err).await;
                    return;
                }
            }
        }
    }

    /// Pump one adapter stream into the sink. Stop reasons are corrected for
    /// observed tool calls before they are framed.
    async fn stream_attempt(
        handle: &AdapterHandle,
        request: &CanonicalRequest,
        ctx: &AttemptContext,
        sink: &mut ClientSink,
    ) -> Result<CanonicalUsage, RelayError> {
        let mut events = handle
            .adapter
            .generate_content_stream(&request.model, request, ctx)
            .await?;
        let mut saw_tool = false;
        let mut usage = CanonicalUsage::default();
        while let Some(item) = events.next().await {
            let mut event = item?;
            match &mut event {
                CanonicalStreamEvent::BlockStart {
                    kind: BlockKind::ToolUse { .. },
                    ..
                } => saw_tool = true,
                CanonicalStreamEvent::MessageEnd {
                    stop_reason,
                    usage: end_usage,
                } => {
                    *stop_reason = correct_stop_reason(*stop_reason, saw_tool);
                    usage = *end_usage;
                }
                _ => {}
            }
            sink.send_event(&event).await?;
            if matches!(event, CanonicalStreamEvent::Done) {
                return Ok(usage);
            }
        }
        Err(RelayError::Transport("backend stream ended without a terminal event".into()))
    }
}
