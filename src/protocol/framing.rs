//! Per-client-protocol framing rules.
//!
//! One record per protocol: how a stream ends, which finish-reason strings
//! mean "normal stop" and "tool call", and which error envelope to use.
//! Everything that would otherwise branch on the protocol name reads from
//! [`rules_for`].

use super::canonical::{CanonicalStopReason, IngressApi};

/// How the end of a streaming response is signalled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalSignal {
    /// A literal `data: [DONE]` frame.
    DoneLiteral,
    /// A named SSE event such as `message_stop`.
    NamedEvent(&'static str),
    /// A final content chunk carrying the stop reason.
    TerminalChunk,
    /// No marker frame; the connection closing ends the stream.
    ConnectionClose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorEnvelope {
    OpenAi,
    Anthropic,
    Gemini,
    Ollama,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolRules {
    pub protocol: IngressApi,
    pub stream_content_type: &'static str,
    pub terminal: TerminalSignal,
    pub normal_finish: &'static str,
    pub tool_finish: &'static str,
    pub length_finish: &'static str,
    pub error_envelope: ErrorEnvelope,
}

const SSE: &str = "text/event-stream";
const NDJSON: &str = "application/x-ndjson";

static OPENAI_CHAT: ProtocolRules = ProtocolRules {
    protocol: IngressApi::OpenAiChat,
    stream_content_type: SSE,
    terminal: TerminalSignal::DoneLiteral,
    normal_finish: "stop",
    tool_finish: "tool_calls",
    length_finish: "length",
    error_envelope: ErrorEnvelope::OpenAi,
};

static OPENAI_RESPONSES: ProtocolRules = ProtocolRules {
    protocol: IngressApi::OpenAiResponses,
    stream_content_type: SSE,
    terminal: TerminalSignal::NamedEvent("response.completed"),
    normal_finish: "completed",
    tool_finish: "completed",
    length_finish: "incomplete",
    error_envelope: ErrorEnvelope::OpenAi,
};

static ANTHROPIC: ProtocolRules = ProtocolRules {
    protocol: IngressApi::Anthropic,
    stream_content_type: SSE,
    terminal: TerminalSignal::NamedEvent("message_stop"),
    normal_finish: "end_turn",
    tool_finish: "tool_use",
    length_finish: "max_tokens",
    error_envelope: ErrorEnvelope::Anthropic,
};

static GEMINI: ProtocolRules = ProtocolRules {
    protocol: IngressApi::Gemini,
    stream_content_type: SSE,
    terminal: TerminalSignal::ConnectionClose,
    normal_finish: "STOP",
    // Gemini has no dedicated tool-call finish reason.
    tool_finish: "STOP",
    length_finish: "MAX_TOKENS",
    error_envelope: ErrorEnvelope::Gemini,
};

static OLLAMA: ProtocolRules = ProtocolRules {
    protocol: IngressApi::Ollama,
    stream_content_type: NDJSON,
    terminal: TerminalSignal::TerminalChunk,
    normal_finish: "stop",
    tool_finish: "stop",
    length_finish: "length",
    error_envelope: ErrorEnvelope::Ollama,
};

#[must_use]
pub fn rules_for(api: IngressApi) -> &'static ProtocolRules {
    match api {
        IngressApi::OpenAiChat => &OPENAI_CHAT,
        IngressApi::OpenAiResponses => &OPENAI_RESPONSES,
        IngressApi::Anthropic => &ANTHROPIC,
        IngressApi::Gemini => &GEMINI,
        IngressApi::Ollama => &OLLAMA,
    }
}

impl ProtocolRules {
    /// Finish-reason string for `reason` in this protocol's vocabulary.
    #[must_use]
    pub fn finish_reason(&self, reason: CanonicalStopReason) -> &'static str {
        match reason {
            CanonicalStopReason::EndOfTurn => self.normal_finish,
            CanonicalStopReason::ToolCalls => self.tool_finish,
            CanonicalStopReason::MaxTokens => self.length_finish,
            CanonicalStopReason::ContentFilter => match self.protocol {
                IngressApi::OpenAiChat => "content_filter",
                IngressApi::Gemini => "SAFETY",
                _ => self.normal_finish,
            },
        }
    }
}

/// Rewrite a normal stop into the tool-call variant when tool calls were seen.
#[must_use]
pub fn correct_stop_reason(
    reason: CanonicalStopReason,
    saw_tool_call: bool,
) -> CanonicalStopReason {
    if saw_tool_call && reason == CanonicalStopReason::EndOfTurn {
        CanonicalStopReason::ToolCalls
    } else {
        reason
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_protocol_has_distinct_terminal_signal_family() {
        assert_eq!(
            rules_for(IngressApi::OpenAiChat).terminal,
            TerminalSignal::DoneLiteral
        );
        assert_eq!(
            rules_for(IngressApi::Anthropic).terminal,
            TerminalSignal::NamedEvent("message_stop")
        );
        assert_eq!(
            rules_for(IngressApi::Ollama).terminal,
            TerminalSignal::TerminalChunk
        );
        assert_eq!(
            rules_for(IngressApi::Gemini).terminal,
            TerminalSignal::ConnectionClose
        );
    }

    #[test]
    fn stop_correction_only_rewrites_normal_stop() {
        assert_eq!(
            correct_stop_reason(CanonicalStopReason::EndOfTurn, true),
            CanonicalStopReason::ToolCalls
        );
        assert_eq!(
            correct_stop_reason(CanonicalStopReason::MaxTokens, true),
            CanonicalStopReason::MaxTokens
        );
        assert_eq!(
            correct_stop_reason(CanonicalStopReason::EndOfTurn, false),
            CanonicalStopReason::EndOfTurn
        );
    }

    #[test]
    fn finish_reason_vocabulary() {
        let openai = rules_for(IngressApi::OpenAiChat);
        assert_eq!(openai.finish_reason(CanonicalStopReason::ToolCalls), "tool_calls");
        let claude = rules_for(IngressApi::Anthropic);
        assert_eq!(claude.finish_reason(CanonicalStopReason::ToolCalls), "tool_use");
        assert_eq!(claude.finish_reason(CanonicalStopReason::MaxTokens), "max_tokens");
        let gemini = rules_for(IngressApi::Gemini);
        assert_eq!(gemini.finish_reason(CanonicalStopReason::ContentFilter), "SAFETY");
    }
}
