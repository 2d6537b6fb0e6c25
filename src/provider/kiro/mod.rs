//! Adapter for the Kiro (CodeWhisperer) event-stream backend.
//!
//! The backend answers with an undelimited byte stream of JSON objects; the
//! [`Reconstructor`] rebuilds text, reasoning and tool calls from it.

pub mod auth;
pub mod payload;

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use http::{HeaderMap, HeaderName, HeaderValue};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};

use crate::config::{CredentialConfig, FeaturesConfig, ProviderConfig};
use crate::error::RelayError;
use crate::observability::token_counter::estimate_request_tokens;
use crate::protocol::canonical::{
    CanonicalRequest, CanonicalResponse, CanonicalStreamEvent, ModelInfo, ProviderKind,
};
use crate::reconstruct::{ReconstructOptions, Reconstructor};
use crate::stream::ResponseCollector;
use crate::transport::{HttpTransport, UpstreamRequest};

use super::classify::report_failure;
use super::event_stream::{decode_byte_stream, ByteDecoder};
use super::{AttemptContext, EventStream, ProviderAdapter};

use auth::KiroCredential;
use payload::{build_payload, resolve_model, MODEL_MAP};

const DEFAULT_REGION: &str = "us-east-1";
const KIRO_VERSION: &str = "0.2.13";

impl ByteDecoder for Reconstructor {
    fn push(&mut self, chunk: &[u8], out: &mut Vec<CanonicalStreamEvent>) {
        self.push_bytes(chunk, out);
    }

    fn finish(&mut self, out: &mut Vec<CanonicalStreamEvent>) {
        Reconstructor::finish(self, out);
    }
}

pub struct KiroAdapter {
    credential_id: String,
    path: PathBuf,
    region: String,
    /// Replaces the AWS hosts for generation and token refresh.
    base_override: Option<String>,
    credential: RwLock<Option<KiroCredential>>,
    /// Held for the duration of a token refresh.
    refresh_lock: tokio::sync::Mutex<()>,
    fingerprint: String,
    context_budget_tokens: u64,
    reasoning_max_tokens: u64,
    transport: HttpTransport,
}

impl KiroAdapter {
    /// # Errors
    ///
    /// [`RelayError::Config`] when the credential has no file.
    pub fn from_config(
        provider: &ProviderConfig,
        credential: &CredentialConfig,
        features: &FeaturesConfig,
        transport: HttpTransport,
    ) -> Result<Self, RelayError> {
        let path = credential
            .file
            .as_ref()
            .map(PathBuf::from)
            .ok_or_else(|| RelayError::Config(format!("kiro credential '{}' needs a file", credential.id)))?;
        Ok(Self {
            credential_id: credential.id.clone(),
            path,
            region: provider.region.clone().unwrap_or_else(|| DEFAULT_REGION.to_owned()),
            base_override: provider
                .base_url
                .as_deref()
                .map(|url| url.trim_end_matches('/').to_owned()),
            credential: RwLock::new(None),
            refresh_lock: tokio::sync::Mutex::new(()),
            fingerprint: fingerprint(&credential.id),
            context_budget_tokens: features.context_budget_tokens,
            reasoning_max_tokens: features.reasoning_max_tokens,
            transport,
        })
    }

    fn region_for(&self, credential: &KiroCredential) -> String {
        credential.region.clone().unwrap_or_else(|| self.region.clone())
    }

    fn generate_url(&self, region: &str) -> String {
        match self.base_override.as_deref() {
            Some(base) => format!("{base}/generateAssistantResponse"),
            None => format!("https://codewhisperer.{region}.amazonaws.com/generateAssistantResponse"),
        }
    }

    async fn refresh_and_store(&self, current: &KiroCredential) -> Result<KiroCredential, RelayError> {
        let region = self.region_for(current);
        let next = auth::refresh(
            self.transport.refresh_client(),
            current,
            &region,
            self.base_override.as_deref(),
        )
        .await?;
        *self.credential.write() = Some(next.clone());
        auth::write_back(&self.path, &next).await;
        tracing::debug!(credential = %self.credential_id, "kiro access token refreshed");
        Ok(next)
    }

    /// One refresh at a time. A caller that waited behind another refresh
    /// takes its result instead of spending the refresh token again.
    async fn refresh_serialized(&self, stale: &KiroCredential) -> Result<KiroCredential, RelayError> {
        let _guard = self.refresh_lock.lock().await;
        let latest = self.credential.read().clone();
        if let Some(latest) = latest {
            if latest.access_token != stale.access_token && !latest.needs_refresh(Utc::now()) {
                return Ok(latest);
            }
        }
        self.refresh_and_store(stale).await
    }

    /// Loaded credential with a usable access token.
    async fn ensure_token(&self) -> Result<KiroCredential, RelayError> {
        let loaded = self.credential.read().clone();
        let credential = match loaded {
            Some(credential) => credential,
            None => {
                let from_file = auth::load(&self.path).await?;
                self.credential.write().get_or_insert(from_file).clone()
            }
        };
        if credential.needs_refresh(Utc::now()) {
            return self.refresh_serialized(&credential).await;
        }
        Ok(credential)
    }

    fn headers(&self, access_token: &str) -> Result<HeaderMap, RelayError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let bearer = HeaderValue::from_str(&format!("Bearer {access_token}"))
            .map_err(|_| RelayError::upstream(401, "access token is not a valid header value"))?;
        headers.insert(AUTHORIZATION, bearer);
        let agent = |value: String| {
            HeaderValue::from_str(&value).map_err(|err| RelayError::Internal(format!("user agent: {err}")))
        };
        headers.insert(
            USER_AGENT,
            agent(format!(
                "aws-sdk-js/1.0.0 ua/2.1 os/linux lang/js md/nodejs#20.0.0 api/codewhispererstreaming#1.0.0 m/E KiroIDE-{KIRO_VERSION}-{}",
                self.fingerprint
            ))?,
        );
        headers.insert(
            HeaderName::from_static("x-amz-user-agent"),
            agent(format!("aws-sdk-js/1.0.0 KiroIDE-{KIRO_VERSION}-{}", self.fingerprint))?,
        );
        headers.insert(
            HeaderName::from_static("amz-sdk-invocation-id"),
            agent(uuid::Uuid::new_v4().to_string())?,
        );
        headers.insert(
            HeaderName::from_static("amz-sdk-request"),
            HeaderValue::from_static("attempt=1; max=1"),
        );
        headers.insert(
            HeaderName::from_static("x-amzn-kiro-agent-mode"),
            HeaderValue::from_static("vibe"),
        );
        Ok(headers)
    }

    async fn send(
        &self,
        model: &str,
        request: &CanonicalRequest,
        ctx: &AttemptContext,
    ) -> Result<reqwest::Response, RelayError> {
        let credential = self
            .ensure_token()
            .await
            .map_err(|err| report_failure(as_credential_failure(err), ctx))?;
        let access_token = credential.access_token.as_deref().unwrap_or_default();
        let body = build_payload(
            request,
            resolve_model(model),
            credential.profile_arn.clone(),
            self.reasoning_max_tokens,
        );
        let body = serde_json::to_vec(&body)
            .map_err(|err| RelayError::Internal(format!("encode kiro payload: {err}")))?;
        let upstream = UpstreamRequest::post_json(
            self.generate_url(&self.region_for(&credential)),
            self.headers(access_token)?,
            Bytes::from(body),
        );
        tracing::debug!(
            request_id = %ctx.request_id,
            credential = %self.credential_id,
            model,
            "sending kiro request"
        );
        self.transport
            .send_with_retry(&upstream, &ctx.cancel)
            .await
            .map_err(|err| report_failure(err, ctx))
    }

    fn reconstructor(&self, request: &CanonicalRequest) -> Reconstructor {
        Reconstructor::new(ReconstructOptions {
            extract_reasoning: request.thinking.is_some(),
            context_budget_tokens: self.context_budget_tokens,
            estimated_input_tokens: estimate_request_tokens(request),
        })
    }
}

/// Credential trouble before the request was sent rotates like a 401.
fn as_credential_failure(err: RelayError) -> RelayError {
    match err {
        RelayError::Auth(message) | RelayError::NoCredentials(message) => RelayError::upstream(401, message),
        other => other,
    }
}

/// Stable per-credential id sent in the user agent.
fn fingerprint(credential_id: &str) -> String {
    format!("{:x}", Sha256::digest(credential_id.as_bytes()))
}

#[async_trait]
impl ProviderAdapter for KiroAdapter {
    fn provider_kind(&self) -> ProviderKind {
        ProviderKind::Kiro
    }

    fn credential_id(&self) -> &str {
        &self.credential_id
    }

    async fn initialize(&self) -> Result<(), RelayError> {
        self.ensure_token().await.map(|_| ())
    }

    async fn refresh_credential(&self) -> Result<(), RelayError> {
        // Re-read first: the file may have been replaced by hand.
        let current = match auth::load(&self.path).await {
            Ok(credential) => credential,
            Err(err) => self.credential.read().clone().ok_or(err)?,
        };
        self.refresh_serialized(&current).await.map(|_| ())
    }

    async fn generate_content(
        &self,
        model: &str,
        request: &CanonicalRequest,
        ctx: &AttemptContext,
    ) -> Result<CanonicalResponse, RelayError> {
        let response = self.send(model, request, ctx).await?;
        let body = tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => return Err(RelayError::Cancelled),
            body = response.bytes() => body
                .map_err(|err| RelayError::Transport(format!("read kiro body: {err}")))?,
        };

        let mut reconstructor = self.reconstructor(request);
        let mut events = vec![reconstructor.message_start(ctx.request_id.as_str(), model)];
        reconstructor.push_bytes(&body, &mut events);
        reconstructor.finish(&mut events);

        let mut collector = ResponseCollector::new(ctx.request_id.as_str(), model);
        for event in events {
            collector.push(event);
        }
        Ok(collector.finish())
    }

    async fn generate_content_stream(
        &self,
        model: &str,
        request: &CanonicalRequest,
        ctx: &AttemptContext,
    ) -> Result<EventStream, RelayError> {
        let response = self.send(model, request, ctx).await?;
        let reconstructor = self.reconstructor(request);
        let start = reconstructor.message_start(ctx.request_id.as_str(), model);
        Ok(decode_byte_stream(
            response.bytes_stream(),
            reconstructor,
            vec![start],
            ctx.cancel.clone(),
        ))
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, RelayError> {
        Ok(MODEL_MAP
            .iter()
            .map(|(client, _)| ModelInfo {
                id: (*client).to_owned(),
                owned_by: "kiro".to_owned(),
            })
            .collect())
    }
}
