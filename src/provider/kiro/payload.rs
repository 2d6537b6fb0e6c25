//! `generateAssistantResponse` request body.

use serde::Serialize;
use serde_json::Value;

use crate::protocol::canonical::{
    CanonicalMessage, CanonicalPart, CanonicalRequest, CanonicalRole, ThinkingMode,
};

/// Client model name to backend model id. The first entry is the default.
pub const MODEL_MAP: &[(&str, &str)] = &[
    ("claude-sonnet-4-5", "CLAUDE_SONNET_4_5_20250929_V1_0"),
    ("claude-sonnet-4-5-20250929", "CLAUDE_SONNET_4_5_20250929_V1_0"),
    ("claude-sonnet-4-20250514", "CLAUDE_SONNET_4_20250514_V1_0"),
    ("claude-3-7-sonnet-20250219", "CLAUDE_3_7_SONNET_20250219_V1_0"),
    ("claude-haiku-4-5", "claude-haiku-4.5"),
    ("claude-opus-4-5", "claude-opus-4.5"),
];

const CONTINUE_TEXT: &str = "Continue";
const TOOL_RESULTS_TEXT: &str = "Tool results provided.";
const EMPTY_ASSISTANT_TEXT: &str = "I understand.";

/// Unknown names fall back to the default model.
#[must_use]
pub fn resolve_model(name: &str) -> &'static str {
    MODEL_MAP
        .iter()
        .find(|(client, _)| *client == name)
        .map_or_else(
            || {
                tracing::debug!(model = name, "unmapped model, using default");
                MODEL_MAP[0].1
            },
            |(_, backend)| *backend,
        )
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratePayload {
    pub conversation_state: ConversationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_arn: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationState {
    pub chat_trigger_type: &'static str,
    pub conversation_id: String,
    pub current_message: CurrentMessage,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<HistoryEntry>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentMessage {
    pub user_input_message: UserInputMessage,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum HistoryEntry {
    UserInputMessage(UserInputMessage),
    AssistantResponseMessage(AssistantResponseMessage),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInputMessage {
    pub content: String,
    pub model_id: String,
    pub origin: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<KiroImage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_input_message_context: Option<UserInputMessageContext>,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInputMessageContext {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<KiroTool>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_results: Vec<KiroToolResult>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KiroTool {
    pub tool_specification: ToolSpecification,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpecification {
    pub name: String,
    pub description: String,
    pub input_schema: InputSchema,
}

#[derive(Debug, Serialize)]
pub struct InputSchema {
    pub json: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KiroToolResult {
    pub tool_use_id: String,
    pub content: Vec<TextContent>,
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct TextContent {
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct KiroImage {
    pub format: String,
    pub source: ImageSource,
}

#[derive(Debug, Serialize)]
pub struct ImageSource {
    pub bytes: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantResponseMessage {
    pub content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_uses: Vec<KiroToolUse>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KiroToolUse {
    pub tool_use_id: String,
    pub name: String,
    pub input: Value,
}

/// Consecutive same-role messages merged into one backend turn.
#[derive(Debug, Default)]
struct Turn {
    assistant: bool,
    text: Vec<String>,
    images: Vec<KiroImage>,
    tool_results: Vec<KiroToolResult>,
    tool_uses: Vec<KiroToolUse>,
}

impl Turn {
    fn new(assistant: bool) -> Self {
        Self {
            assistant,
            ..Self::default()
        }
    }

    fn absorb(&mut self, message: &CanonicalMessage) {
        for part in &message.parts {
            match part {
                CanonicalPart::Text(text) if !text.is_empty() => self.text.push(text.clone()),
                CanonicalPart::Text(_) => {}
                CanonicalPart::Reasoning(text) if self.assistant && !text.is_empty() => {
                    self.text.push(format!("<thinking>{text}</thinking>"));
                }
                CanonicalPart::Reasoning(_) => {}
                CanonicalPart::Image { media_type, data } => self.images.push(KiroImage {
                    format: media_type
                        .rsplit('/')
                        .next()
                        .unwrap_or("png")
                        .to_owned(),
                    source: ImageSource {
                        bytes: data.clone(),
                    },
                }),
                CanonicalPart::ToolCall {
                    id,
                    name,
                    arguments,
                } => self.tool_uses.push(KiroToolUse {
                    tool_use_id: id.clone(),
                    name: name.clone(),
                    input: arguments.clone(),
                }),
                CanonicalPart::ToolResult {
                    tool_call_id,
                    content,
                    is_error,
                } => self.tool_results.push(KiroToolResult {
                    tool_use_id: tool_call_id.clone(),
                    content: vec![TextContent {
                        text: if content.is_empty() {
                            TOOL_RESULTS_TEXT.to_owned()
                        } else {
                            content.clone()
                        },
                    }],
                    status: if *is_error { "error" } else { "success" },
                }),
            }
        }
    }

    fn joined_text(&self) -> String {
        self.text.join("\n\n")
    }

    fn into_user(self, model_id: &str, tools: Vec<KiroTool>) -> UserInputMessage {
        let mut content = self.joined_text();
        if content.is_empty() {
            content = if self.tool_results.is_empty() {
                CONTINUE_TEXT.to_owned()
            } else {
                TOOL_RESULTS_TEXT.to_owned()
            };
        }
        let context = (!tools.is_empty() || !self.tool_results.is_empty()).then(|| {
            UserInputMessageContext {
                tools,
                tool_results: self.tool_results,
            }
        });
        UserInputMessage {
            content,
            model_id: model_id.to_owned(),
            origin: "AI_EDITOR",
            images: self.images,
            user_input_message_context: context,
        }
    }

    fn into_assistant(self) -> AssistantResponseMessage {
        let mut content = self.joined_text();
        if content.is_empty() && self.tool_uses.is_empty() {
            content = EMPTY_ASSISTANT_TEXT.to_owned();
        }
        AssistantResponseMessage {
            content,
            tool_uses: self.tool_uses,
        }
    }
}

/// System text with the reasoning preamble when the request asks for it.
fn system_text(request: &CanonicalRequest, reasoning_max_tokens: u64) -> Option<String> {
    let preamble = request.thinking.as_ref().map(|thinking| match thinking.mode {
        ThinkingMode::Enabled => format!(
            "<thinking_mode>enabled</thinking_mode><max_thinking_length>{}</max_thinking_length>",
            thinking.budget_tokens.unwrap_or(reasoning_max_tokens)
        ),
        ThinkingMode::Adaptive => {
            let mut text = format!(
                "<thinking_mode>adaptive</thinking_mode><max_thinking_length>{}</max_thinking_length>",
                thinking.budget_tokens.unwrap_or(reasoning_max_tokens)
            );
            if let Some(effort) = thinking.effort.as_deref() {
                text.push_str("<thinking_effort>");
                text.push_str(effort);
                text.push_str("</thinking_effort>");
            }
            text
        }
    });
    match (preamble, request.system_prompt.as_deref().filter(|s| !s.is_empty())) {
        (Some(preamble), Some(system)) => Some(format!("{preamble}\n\n{system}")),
        (Some(preamble), None) => Some(preamble),
        (None, Some(system)) => Some(system.to_owned()),
        (None, None) => None,
    }
}

fn tool_specs(request: &CanonicalRequest) -> Vec<KiroTool> {
    request
        .tools
        .iter()
        .map(|tool| KiroTool {
            tool_specification: ToolSpecification {
                name: tool.name.clone(),
                description: tool
                    .description
                    .clone()
                    .filter(|d| !d.is_empty())
                    .unwrap_or_else(|| tool.name.clone()),
                input_schema: InputSchema {
                    json: tool.input_schema.clone(),
                },
            },
        })
        .collect()
}

/// Build the backend body. History alternates user/assistant and always ends
/// with the current user turn.
#[must_use]
pub fn build_payload(
    request: &CanonicalRequest,
    model_id: &str,
    profile_arn: Option<String>,
    reasoning_max_tokens: u64,
) -> GeneratePayload {
    let mut turns: Vec<Turn> = Vec::with_capacity(request.messages.len() + 1);
    for message in &request.messages {
        let assistant = message.role == CanonicalRole::Assistant;
        match turns.last_mut() {
            Some(turn) if turn.assistant == assistant => turn.absorb(message),
            _ => {
                let mut turn = Turn::new(assistant);
                turn.absorb(message);
                turns.push(turn);
            }
        }
    }
    if turns.first().map_or(true, |turn| turn.assistant) {
        turns.insert(0, Turn::new(false));
    }
    if turns.last().is_some_and(|turn| turn.assistant) {
        turns.push(Turn::new(false));
    }
    if let Some(system) = system_text(request, reasoning_max_tokens) {
        if let Some(first) = turns.first_mut() {
            first.text.insert(0, system);
        }
    }

    let current = turns.pop().unwrap_or_else(|| Turn::new(false));
    let history = turns
        .into_iter()
        .map(|turn| {
            if turn.assistant {
                HistoryEntry::AssistantResponseMessage(turn.into_assistant())
            } else {
                HistoryEntry::UserInputMessage(turn.into_user(model_id, Vec::new()))
            }
        })
        .collect();

    GeneratePayload {
        conversation_state: ConversationState {
            chat_trigger_type: "MANUAL",
            conversation_id: uuid::Uuid::new_v4().to_string(),
            current_message: CurrentMessage {
                user_input_message: current.into_user(model_id, tool_specs(request)),
            },
            history,
        },
        profile_arn,
    }
}
