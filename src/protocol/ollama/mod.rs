pub mod decoder;
pub mod encoder;
pub mod stream;

use serde::Deserialize;

use crate::protocol::openai_chat::OpenAiTool;

/// Ollama `/api/chat` request wire type.
#[derive(Debug, Clone, Deserialize)]
pub struct OllamaChatRequest {
    pub model: String,
    #[serde(default)]
    pub messages: Vec<OllamaMessage>,
    #[serde(default)]
    pub tools: Option<Vec<OpenAiTool>>,
    /// Ollama streams unless told otherwise.
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub options: Option<OllamaOptions>,
    #[serde(default)]
    pub think: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OllamaMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub thinking: Option<String>,
    #[serde(default)]
    pub images: Option<Vec<String>>,
    #[serde(default)]
    pub tool_calls: Option<Vec<OllamaToolCall>>,
    #[serde(default)]
    pub tool_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OllamaToolCall {
    pub function: OllamaToolCallFunction,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OllamaToolCallFunction {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OllamaOptions {
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub num_predict: Option<u64>,
}

/// RFC 3339 timestamp used in `created_at` fields.
pub(crate) fn created_at() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
