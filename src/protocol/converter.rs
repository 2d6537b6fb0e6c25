//! Client-protocol conversion seam.
//!
//! The orchestrator and handlers only talk to [`ProtocolConverter`]; the
//! per-protocol modules hold the actual wire shapes.

use crate::error::RelayError;
use crate::stream::StreamEncoder;

use super::canonical::{
    CanonicalPart, CanonicalRequest, CanonicalResponse, IngressApi, ModelInfo,
};
use super::{anthropic, gemini, ollama, openai_chat, openai_responses};

/// Request facts carried by the URL rather than the body (Gemini).
#[derive(Debug, Clone, Default)]
pub struct IngressHints {
    pub model: Option<String>,
    pub stream: Option<bool>,
}

pub trait ProtocolConverter: Send + Sync {
    /// Decode a client request body into the canonical request.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidRequest`] when the body is not a valid
    /// request for `api`.
    fn decode_request(
        &self,
        api: IngressApi,
        body: &[u8],
        hints: &IngressHints,
    ) -> Result<CanonicalRequest, RelayError>;

    fn encode_response(&self, api: IngressApi, response: &CanonicalResponse) -> serde_json::Value;

    fn stream_encoder(&self, api: IngressApi, model: &str, response_id: &str) -> Box<dyn StreamEncoder>;

    fn encode_model_list(&self, api: IngressApi, models: &[ModelInfo]) -> serde_json::Value;

    /// Plain text of the last user turn.
    fn extract_prompt_text(&self, request: &CanonicalRequest) -> String {
        request
            .messages
            .iter()
            .rev()
            .find(|msg| msg.role == super::canonical::CanonicalRole::User)
            .map(super::canonical::CanonicalMessage::joined_text)
            .unwrap_or_default()
    }

    fn extract_response_text(&self, response: &CanonicalResponse) -> String {
        let mut out = String::new();
        for part in &response.content {
            if let CanonicalPart::Text(text) = part {
                out.push_str(text);
            }
        }
        out
    }
}

/// The built-in converter for all five client protocols.
#[derive(Debug, Default, Clone, Copy)]
pub struct WireConverter;

impl ProtocolConverter for WireConverter {
    fn decode_request(
        &self,
        api: IngressApi,
        body: &[u8],
        hints: &IngressHints,
    ) -> Result<CanonicalRequest, RelayError> {
        match api {
            IngressApi::OpenAiChat => openai_chat::decoder::decode_request(body),
            IngressApi::OpenAiResponses => openai_responses::decoder::decode_request(body),
            IngressApi::Anthropic => anthropic::decoder::decode_request(body),
            IngressApi::Gemini => gemini::decoder::decode_request(body, hints),
            IngressApi::Ollama => ollama::decoder::decode_request(body),
        }
    }

    fn encode_response(&self, api: IngressApi, response: &CanonicalResponse) -> serde_json::Value {
        match api {
            IngressApi::OpenAiChat => openai_chat::encoder::encode_response(response),
            IngressApi::OpenAiResponses => openai_responses::encoder::encode_response(response),
            IngressApi::Anthropic => anthropic::encoder::encode_response(response),
            IngressApi::Gemini => gemini::encoder::encode_response(response),
            IngressApi::Ollama => ollama::encoder::encode_response(response),
        }
    }

    fn stream_encoder(&self, api: IngressApi, model: &str, response_id: &str) -> Box<dyn StreamEncoder> {
        match api {
            IngressApi::OpenAiChat => Box::new(openai_chat::stream::ChatStreamEncoder::new(model, response_id)),
            IngressApi::OpenAiResponses => Box::new(openai_responses::stream::ResponsesStreamEncoder::new(
                model,
                response_id,
            )),
            IngressApi::Anthropic => Box::new(anthropic::stream::MessagesStreamEncoder::new(model, response_id)),
            IngressApi::Gemini => Box::new(gemini::stream::GeminiStreamEncoder::new(model)),
            IngressApi::Ollama => Box::new(ollama::stream::OllamaStreamEncoder::new(model)),
        }
    }

    fn encode_model_list(&self, api: IngressApi, models: &[ModelInfo]) -> serde_json::Value {
        match api {
            IngressApi::Gemini => gemini::encoder::encode_model_list(models),
            IngressApi::Ollama => ollama::encoder::encode_model_list(models),
            IngressApi::Anthropic => anthropic::encoder::encode_model_list(models),
            IngressApi::OpenAiChat | IngressApi::OpenAiResponses => {
                openai_chat::encoder::encode_model_list(models)
            }
        }
    }
}

/// Parse a JSON request body, mapping failures to `InvalidRequest`.
pub(crate) fn parse_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, RelayError> {
    serde_json::from_slice(body).map_err(|err| RelayError::InvalidRequest(format!("invalid JSON body: {err}")))
}

/// Split a `data:` URL into (media type, base64 payload).
pub(crate) fn split_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    let media_type = meta.strip_suffix(";base64")?;
    Some((media_type.to_owned(), data.to_owned()))
}
