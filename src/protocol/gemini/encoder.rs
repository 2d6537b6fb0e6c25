use serde_json::{json, Value};

use crate::protocol::canonical::{CanonicalPart, CanonicalResponse, IngressApi, ModelInfo};
use crate::protocol::framing::rules_for;
use crate::protocol::mapping::canonical_usage_to_gemini;

use super::{GeminiContent, GeminiFunctionCall, GeminiInlineData, GeminiPart};

pub(crate) fn part_for(part: &CanonicalPart) -> Option<GeminiPart> {
    match part {
        CanonicalPart::Text(text) => Some(GeminiPart {
            text: Some(text.clone()),
            ..GeminiPart::default()
        }),
        CanonicalPart::Reasoning(text) => Some(GeminiPart {
            text: Some(text.clone()),
            thought: Some(true),
            ..GeminiPart::default()
        }),
        CanonicalPart::ToolCall {
            name, arguments, ..
        } => Some(GeminiPart {
            function_call: Some(GeminiFunctionCall {
                name: name.clone(),
                args: arguments.clone(),
            }),
            ..GeminiPart::default()
        }),
        CanonicalPart::Image { media_type, data } => Some(GeminiPart {
            inline_data: Some(GeminiInlineData {
                mime_type: media_type.clone(),
                data: data.clone(),
            }),
            ..GeminiPart::default()
        }),
        CanonicalPart::ToolResult { .. } => None,
    }
}

/// Encode a canonical response as a Gemini `GenerateContentResponse`.
#[must_use]
pub fn encode_response(response: &CanonicalResponse) -> Value {
    let content = GeminiContent {
        role: Some("model".into()),
        parts: response.content.iter().filter_map(part_for).collect(),
    };
    json!({
        "candidates": [{
            "content": content,
            "finishReason": rules_for(IngressApi::Gemini).finish_reason(response.stop_reason),
            "index": 0,
        }],
        "usageMetadata": canonical_usage_to_gemini(&response.usage),
        "modelVersion": response.model,
    })
}

/// `GET /v1beta/models` body.
#[must_use]
pub fn encode_model_list(models: &[ModelInfo]) -> Value {
    let models: Vec<Value> = models
        .iter()
        .map(|model| {
            json!({
                "name": format!("models/{}", model.id),
                "displayName": model.id,
                "supportedGenerationMethods": ["generateContent", "streamGenerateContent"],
            })
        })
        .collect();
    json!({"models": models})
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::canonical::{CanonicalStopReason, CanonicalUsage};

    #[test]
    fn tool_call_keeps_stop_finish() {
        let response = CanonicalResponse {
            id: "r".into(),
            model: "gemini".into(),
            content: vec![
                CanonicalPart::Reasoning("r".into()),
                CanonicalPart::ToolCall {
                    id: "get".into(),
                    name: "get".into(),
                    arguments: json!({"k": 1}),
                },
            ],
            stop_reason: CanonicalStopReason::ToolCalls,
            usage: CanonicalUsage {
                input_tokens: 2,
                output_tokens: 3,
            },
        };
        let body = encode_response(&response);
        let candidate = &body["candidates"][0];
        assert_eq!(candidate["finishReason"], "STOP");
        assert_eq!(candidate["content"]["parts"][0]["thought"], true);
        assert_eq!(candidate["content"]["parts"][1]["functionCall"]["name"], "get");
        assert!(candidate["content"]["parts"][1].get("text").is_none());
        assert_eq!(body["usageMetadata"]["totalTokenCount"], 5);
    }

    #[test]
    fn model_names_are_prefixed() {
        let body = encode_model_list(&[ModelInfo {
            id: "g".into(),
            owned_by: "x".into(),
        }]);
        assert_eq!(body["models"][0]["name"], "models/g");
    }
}
