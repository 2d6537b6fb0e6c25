use super::canonical::{CanonicalRole, CanonicalStopReason, CanonicalUsage};

// ---------------------------------------------------------------------------
// Role mappings
// ---------------------------------------------------------------------------

#[must_use]
pub fn canonical_role_to_openai(role: CanonicalRole) -> &'static str {
    match role {
        CanonicalRole::System => "system",
        CanonicalRole::User => "user",
        CanonicalRole::Assistant => "assistant",
        CanonicalRole::Tool => "tool",
    }
}

#[must_use]
pub fn openai_role_to_canonical(s: &str) -> CanonicalRole {
    match s {
        "system" | "developer" => CanonicalRole::System,
        "assistant" => CanonicalRole::Assistant,
        "tool" | "function" => CanonicalRole::Tool,
        _ => CanonicalRole::User,
    }
}

#[must_use]
pub fn gemini_role_to_canonical(s: &str) -> CanonicalRole {
    match s {
        "model" => CanonicalRole::Assistant,
        "function" => CanonicalRole::Tool,
        _ => CanonicalRole::User,
    }
}

// ---------------------------------------------------------------------------
// Stop reasons reported by OpenAI-compatible backends
// ---------------------------------------------------------------------------

#[must_use]
pub fn openai_stop_to_canonical(s: &str) -> CanonicalStopReason {
    match s {
        "tool_calls" | "function_call" => CanonicalStopReason::ToolCalls,
        "length" => CanonicalStopReason::MaxTokens,
        "content_filter" => CanonicalStopReason::ContentFilter,
        _ => CanonicalStopReason::EndOfTurn,
    }
}

// ---------------------------------------------------------------------------
// Usage mappings
// ---------------------------------------------------------------------------

#[must_use]
pub fn canonical_usage_to_openai(usage: &CanonicalUsage) -> serde_json::Value {
    serde_json::json!({
        "prompt_tokens": usage.input_tokens,
        "completion_tokens": usage.output_tokens,
        "total_tokens": usage.total_tokens(),
    })
}

#[must_use]
pub fn openai_usage_to_canonical(val: &serde_json::Value) -> CanonicalUsage {
    CanonicalUsage {
        input_tokens: val
            .get("prompt_tokens")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0),
        output_tokens: val
            .get("completion_tokens")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0),
    }
}

#[must_use]
pub fn canonical_usage_to_responses(usage: &CanonicalUsage) -> serde_json::Value {
    serde_json::json!({
        "input_tokens": usage.input_tokens,
        "output_tokens": usage.output_tokens,
        "total_tokens": usage.total_tokens(),
    })
}

#[must_use]
pub fn canonical_usage_to_anthropic(usage: &CanonicalUsage) -> serde_json::Value {
    serde_json::json!({
        "input_tokens": usage.input_tokens,
        "output_tokens": usage.output_tokens,
    })
}

#[must_use]
pub fn canonical_usage_to_gemini(usage: &CanonicalUsage) -> serde_json::Value {
    serde_json::json!({
        "promptTokenCount": usage.input_tokens,
        "candidatesTokenCount": usage.output_tokens,
        "totalTokenCount": usage.total_tokens(),
    })
}
