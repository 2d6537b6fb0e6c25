//! Adapter for any backend speaking the OpenAI chat completions API.

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue};
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::Value;

use crate::config::{CredentialConfig, ProviderConfig};
use crate::error::RelayError;
use crate::observability::token_counter::estimate_request_tokens;
use crate::protocol::canonical::{
    CanonicalRequest, CanonicalResponse, CanonicalStreamEvent, ModelInfo, ProviderKind,
};
use crate::protocol::openai_chat::upstream::{decode_response, encode_request, ChunkDecoder};
use crate::protocol::openai_chat::OpenAiStreamChunk;
use crate::stream::sse::{SseEvent, SseParser};
use crate::transport::{HttpTransport, UpstreamRequest};

use super::classify::report_failure;
use super::credentials::load_credential_file;
use super::event_stream::{decode_byte_stream, ByteDecoder};
use super::{AttemptContext, EventStream, ProviderAdapter};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiKeyFile {
    api_key: String,
}

pub struct OpenAiCompatAdapter {
    credential_id: String,
    base_url: String,
    key_file: Option<PathBuf>,
    api_key: RwLock<Option<String>>,
    models: Vec<String>,
    transport: HttpTransport,
}

impl OpenAiCompatAdapter {
    /// # Errors
    ///
    /// [`RelayError::Config`] when the entry has no `base_url` or the
    /// credential has neither a key nor a key file.
    pub fn from_config(
        provider: &ProviderConfig,
        credential: &CredentialConfig,
        transport: HttpTransport,
    ) -> Result<Self, RelayError> {
        let base_url = provider
            .base_url
            .as_deref()
            .ok_or_else(|| RelayError::Config(format!("provider '{}' needs base_url", provider.name)))?
            .trim_end_matches('/')
            .to_owned();
        if credential.api_key.is_none() && credential.file.is_none() {
            return Err(RelayError::Config(format!(
                "credential '{}' has neither api_key nor file",
                credential.id
            )));
        }
        Ok(Self {
            credential_id: credential.id.clone(),
            base_url,
            key_file: credential.file.as_ref().map(PathBuf::from),
            api_key: RwLock::new(credential.api_key.clone()),
            models: provider.models.clone(),
            transport,
        })
    }

    fn headers(&self) -> Result<HeaderMap, RelayError> {
        let key = self
            .api_key
            .read()
            .clone()
            .ok_or_else(|| RelayError::NoCredentials(format!("{} has no api key loaded", self.credential_id)))?;
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let bearer = HeaderValue::from_str(&format!("Bearer {key}"))
            .map_err(|_| RelayError::Config(format!("{} api key is not a valid header", self.credential_id)))?;
        headers.insert(AUTHORIZATION, bearer);
        Ok(headers)
    }

    async fn send(
        &self,
        request: &CanonicalRequest,
        model: &str,
        stream: bool,
        ctx: &AttemptContext,
    ) -> Result<reqwest::Response, RelayError> {
        let body = serde_json::to_vec(&encode_request(request, model, stream))
            .map_err(|err| RelayError::Internal(format!("encode backend request: {err}")))?;
        let upstream = UpstreamRequest::post_json(
            format!("{}/chat/completions", self.base_url),
            self.headers()?,
            Bytes::from(body),
        );
        self.transport
            .send_with_retry(&upstream, &ctx.cancel)
            .await
            .map_err(|err| report_failure(err, ctx))
    }

    async fn load_key_file(&self) -> Result<(), RelayError> {
        let Some(path) = self.key_file.as_deref() else {
            return Ok(());
        };
        let file: ApiKeyFile = load_credential_file(path, &["apiKey"], &[]).await?;
        *self.api_key.write() = Some(file.api_key);
        Ok(())
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiCompatAdapter {
    fn provider_kind(&self) -> ProviderKind {
        ProviderKind::OpenAiCompatible
    }

    fn credential_id(&self) -> &str {
        &self.credential_id
    }

    async fn initialize(&self) -> Result<(), RelayError> {
        self.load_key_file().await
    }

    async fn refresh_credential(&self) -> Result<(), RelayError> {
        // Static keys cannot be refreshed; a rewritten key file can.
        self.load_key_file().await
    }

    async fn generate_content(
        &self,
        model: &str,
        request: &CanonicalRequest,
        ctx: &AttemptContext,
    ) -> Result<CanonicalResponse, RelayError> {
        let response = self.send(request, model, false, ctx).await?;
        let body: Value = response
            .json()
            .await
            .map_err(|err| RelayError::Transport(format!("read backend body: {err}")))?;
        decode_response(&body, model, estimate_request_tokens(request))
    }

    async fn generate_content_stream(
        &self,
        model: &str,
        request: &CanonicalRequest,
        ctx: &AttemptContext,
    ) -> Result<EventStream, RelayError> {
        let response = self.send(request, model, true, ctx).await?;
        let estimated_input = estimate_request_tokens(request);
        let start = CanonicalStreamEvent::MessageStart {
            id: ctx.request_id.clone(),
            model: model.to_owned(),
            input_tokens: estimated_input,
        };
        Ok(decode_byte_stream(
            response.bytes_stream(),
            ChatSseDecoder::new(estimated_input),
            vec![start],
            ctx.cancel.clone(),
        ))
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, RelayError> {
        if !self.models.is_empty() {
            return Ok(self
                .models
                .iter()
                .map(|id| ModelInfo {
                    id: id.clone(),
                    owned_by: self.credential_id.clone(),
                })
                .collect());
        }
        let response = self
            .transport
            .client()
            .get(format!("{}/models", self.base_url))
            .headers(self.headers()?)
            .send()
            .await
            .map_err(|err| RelayError::Transport(crate::transport::error_chain_message(&err)))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::upstream(status.as_u16(), body));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|err| RelayError::Transport(format!("read model list: {err}")))?;
        Ok(parse_model_list(&body))
    }
}

fn parse_model_list(body: &Value) -> Vec<ModelInfo> {
    body.get("data")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|entry| {
            Some(ModelInfo {
                id: entry.get("id")?.as_str()?.to_owned(),
                owned_by: entry
                    .get("owned_by")
                    .and_then(Value::as_str)
                    .unwrap_or("openai")
                    .to_owned(),
            })
        })
        .collect()
}

/// SSE bytes to chat chunks to canonical events.
struct ChatSseDecoder {
    parser: SseParser,
    chunks: ChunkDecoder,
    events: Vec<SseEvent>,
}

impl ChatSseDecoder {
    fn new(estimated_input: u64) -> Self {
        Self {
            parser: SseParser::new(),
            chunks: ChunkDecoder::new(estimated_input),
            events: Vec::new(),
        }
    }

    fn drain(&mut self, out: &mut Vec<CanonicalStreamEvent>) {
        for event in self.events.drain(..) {
            if event.is_done() || event.data.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<OpenAiStreamChunk>(&event.data) {
                Ok(chunk) => self.chunks.push_chunk(chunk, out),
                Err(err) => tracing::debug!(error = %err, "skipping unparseable backend chunk"),
            }
        }
    }
}

impl ByteDecoder for ChatSseDecoder {
    fn push(&mut self, chunk: &[u8], out: &mut Vec<CanonicalStreamEvent>) {
        self.parser.feed_bytes(chunk, &mut self.events);
        self.drain(out);
    }

    fn finish(&mut self, out: &mut Vec<CanonicalStreamEvent>) {
        self.parser.finish(&mut self.events);
        self.drain(out);
        self.chunks.finish(out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::canonical::BlockKind;
    use serde_json::json;

    #[test]
    fn sse_decoder_survives_split_frames() {
        let body = concat!(
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
        );
        let mut decoder = ChatSseDecoder::new(3);
        let mut out = Vec::new();
        for piece in body.as_bytes().chunks(7) {
            decoder.push(piece, &mut out);
        }
        decoder.finish(&mut out);
        assert_eq!(
            out[0],
            CanonicalStreamEvent::BlockStart {
                index: 0,
                kind: BlockKind::Text
            }
        );
        let text: String = out
            .iter()
            .filter_map(|e| match e {
                CanonicalStreamEvent::TextDelta { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "Hello");
        assert_eq!(out.last(), Some(&CanonicalStreamEvent::Done));
    }

    #[test]
    fn model_list_parses_data_array() {
        let models = parse_model_list(&json!({"data": [{"id": "a", "owned_by": "x"}, {"id": "b"}, {}]}));
        assert_eq!(models.len(), 2);
        assert_eq!(models[1].owned_by, "openai");
    }

    #[test]
    fn config_requires_base_url() {
        let provider = ProviderConfig {
            name: "p".into(),
            provider: "openai-custom".into(),
            credentials: Vec::new(),
            base_url: None,
            region: None,
            models: Vec::new(),
        };
        let credential = CredentialConfig {
            id: "c".into(),
            file: None,
            api_key: Some("k".into()),
        };
        let transport = HttpTransport::new(
            &crate::config::ServerConfig::default(),
            crate::transport::RetryPolicy::default(),
        )
        .unwrap();
        assert!(matches!(
            OpenAiCompatAdapter::from_config(&provider, &credential, transport),
            Err(RelayError::Config(_))
        ));
    }
}
