use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Which client wire protocol the request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IngressApi {
    OpenAiChat,
    OpenAiResponses,
    Anthropic,
    Gemini,
    Ollama,
}

impl IngressApi {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            IngressApi::OpenAiChat => "openai-chat",
            IngressApi::OpenAiResponses => "openai-responses",
            IngressApi::Anthropic => "claude",
            IngressApi::Gemini => "gemini",
            IngressApi::Ollama => "ollama",
        }
    }
}

/// The backend family a credential belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderKind {
    #[serde(rename = "claude-kiro-oauth")]
    Kiro,
    #[serde(rename = "openai-custom")]
    OpenAiCompatible,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 2] = [ProviderKind::Kiro, ProviderKind::OpenAiCompatible];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::Kiro => "claude-kiro-oauth",
            ProviderKind::OpenAiCompatible => "openai-custom",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CanonicalRole {
    System,
    User,
    Assistant,
    Tool,
}

/// Reason the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CanonicalStopReason {
    EndOfTurn,
    ToolCalls,
    MaxTokens,
    ContentFilter,
}

/// Token usage information. Backends that report nothing get estimates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CanonicalUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl CanonicalUsage {
    #[must_use]
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThinkingMode {
    Enabled,
    Adaptive,
}

/// Reasoning request normalized across protocols.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThinkingConfig {
    pub mode: ThinkingMode,
    pub budget_tokens: Option<u64>,
    pub effort: Option<String>,
}

/// A single part of a message's content. Ordering inside a message is preserved.
#[derive(Debug, Clone, PartialEq)]
pub enum CanonicalPart {
    Text(String),
    Reasoning(String),
    Image {
        media_type: String,
        data: String,
    },
    ToolCall {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },
    ToolResult {
        tool_call_id: String,
        content: String,
        is_error: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalMessage {
    pub role: CanonicalRole,
    pub parts: SmallVec<[CanonicalPart; 1]>,
}

impl CanonicalMessage {
    #[must_use]
    pub fn text(role: CanonicalRole, text: impl Into<String>) -> Self {
        let mut parts = SmallVec::new();
        parts.push(CanonicalPart::Text(text.into()));
        Self { role, parts }
    }

    /// Concatenated text parts, ignoring tool and image parts.
    #[must_use]
    pub fn joined_text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let CanonicalPart::Text(text) = part {
                out.push_str(text);
            }
        }
        out
    }
}

/// A tool declaration offered to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalToolSpec {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: serde_json::Value,
}

/// The fully-decoded, protocol-agnostic generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRequest {
    pub request_id: String,
    pub ingress_api: IngressApi,
    pub model: String,
    pub stream: bool,
    pub system_prompt: Option<String>,
    pub messages: Vec<CanonicalMessage>,
    pub tools: Vec<CanonicalToolSpec>,
    pub thinking: Option<ThinkingConfig>,
    pub max_tokens: Option<u64>,
    pub temperature: Option<f64>,
}

impl CanonicalRequest {
    #[must_use]
    pub fn new(ingress_api: IngressApi, model: impl Into<String>) -> Self {
        Self {
            request_id: String::new(),
            ingress_api,
            model: model.into(),
            stream: false,
            system_prompt: None,
            messages: Vec::new(),
            tools: Vec::new(),
            thinking: None,
            max_tokens: None,
            temperature: None,
        }
    }
}

/// The fully-assembled non-streaming response.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalResponse {
    pub id: String,
    pub model: String,
    pub content: Vec<CanonicalPart>,
    pub stop_reason: CanonicalStopReason,
    pub usage: CanonicalUsage,
}

impl CanonicalResponse {
    #[must_use]
    pub fn has_tool_calls(&self) -> bool {
        self.content
            .iter()
            .any(|part| matches!(part, CanonicalPart::ToolCall { .. }))
    }
}

/// Kind of a content block opened on the canonical stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockKind {
    Text,
    Reasoning,
    ToolUse { id: String, name: String },
}

/// A single event in a canonical stream.
///
/// Blocks are addressed by index; an index is started once, receives deltas,
/// and is stopped once. Adapters emit these, client encoders consume them.
#[derive(Debug, Clone, PartialEq)]
pub enum CanonicalStreamEvent {
    MessageStart {
        id: String,
        model: String,
        input_tokens: u64,
    },
    BlockStart {
        index: usize,
        kind: BlockKind,
    },
    TextDelta {
        index: usize,
        text: String,
    },
    ReasoningDelta {
        index: usize,
        text: String,
    },
    ToolArgsDelta {
        index: usize,
        partial_json: String,
    },
    BlockStop {
        index: usize,
    },
    Usage(CanonicalUsage),
    MessageEnd {
        stop_reason: CanonicalStopReason,
        usage: CanonicalUsage,
    },
    Done,
}

/// A model advertised by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
    pub id: String,
    pub owned_by: String,
}
