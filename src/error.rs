use crate::protocol::canonical::IngressApi;
use crate::protocol::error_shapes::{
    anthropic_error_payload, gemini_error_payload, ollama_error_payload, openai_error_payload,
};
use crate::protocol::framing::{rules_for, ErrorEnvelope};

/// Error type shared by every layer of the relay.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RelayError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Auth error: {0}")]
    Auth(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Upstream error: status={status}, message={message}")]
    Upstream {
        status: u16,
        message: String,
        /// The credential was already reported to the pool by the adapter.
        credential_reported: bool,
    },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Protocol translation error: {0}")]
    Translation(String),
    #[error("No credentials available: {0}")]
    NoCredentials(String),
    #[error("Client disconnected")]
    Cancelled,
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Broad error category for status code and error-type selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    InvalidRequest,
    Authentication,
    Permission,
    RateLimit,
    Overloaded,
    ServerError,
    Unknown,
}

/// How the orchestrator must treat a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Rate limit, server error or network blip; the adapter already retried.
    Transient,
    /// Auth rejected, quota exhausted or forbidden; needs a different credential.
    CredentialExhausted,
    /// Malformed request; never retried, never counted against the credential.
    ClientInvalid,
    Fatal,
}

/// Map an upstream HTTP status code to an error category.
#[must_use]
pub fn category_from_upstream_status(status: u16) -> ErrorCategory {
    match status {
        400 | 404 | 413 | 422 => ErrorCategory::InvalidRequest,
        401 => ErrorCategory::Authentication,
        402 | 403 => ErrorCategory::Permission,
        429 => ErrorCategory::RateLimit,
        503 | 529 => ErrorCategory::Overloaded,
        500..=599 => ErrorCategory::ServerError,
        _ => ErrorCategory::Unknown,
    }
}

/// Classify an upstream HTTP status into the failure taxonomy.
#[must_use]
pub fn failure_class_for_status(status: u16) -> FailureClass {
    match status {
        429 | 500..=599 => FailureClass::Transient,
        401 | 402 | 403 => FailureClass::CredentialExhausted,
        400 | 413 | 422 => FailureClass::ClientInvalid,
        _ => FailureClass::Fatal,
    }
}

impl RelayError {
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            RelayError::InvalidRequest(_) => ErrorCategory::InvalidRequest,
            RelayError::Auth(_) => ErrorCategory::Authentication,
            RelayError::NoCredentials(_) => ErrorCategory::Overloaded,
            RelayError::Config(_)
            | RelayError::Transport(_)
            | RelayError::Translation(_)
            | RelayError::Cancelled
            | RelayError::Internal(_) => ErrorCategory::ServerError,
            RelayError::Upstream { status, .. } => category_from_upstream_status(*status),
        }
    }

    #[must_use]
    pub fn failure_class(&self) -> FailureClass {
        match self {
            RelayError::Upstream { status, .. } => failure_class_for_status(*status),
            RelayError::Transport(_) => FailureClass::Transient,
            RelayError::InvalidRequest(_) | RelayError::Auth(_) => FailureClass::ClientInvalid,
            RelayError::Config(_)
            | RelayError::Translation(_)
            | RelayError::NoCredentials(_)
            | RelayError::Cancelled
            | RelayError::Internal(_) => FailureClass::Fatal,
        }
    }

    /// Whether the pool has already been told about this failure.
    #[must_use]
    pub fn credential_reported(&self) -> bool {
        matches!(
            self,
            RelayError::Upstream {
                credential_reported: true,
                ..
            }
        )
    }

    #[must_use]
    pub fn upstream(status: u16, message: impl Into<String>) -> Self {
        RelayError::Upstream {
            status,
            message: message.into(),
            credential_reported: false,
        }
    }

    /// Tag an upstream failure as already reported to the pool.
    #[must_use]
    pub fn mark_reported(self) -> Self {
        match self {
            RelayError::Upstream {
                status, message, ..
            } => RelayError::Upstream {
                status,
                message,
                credential_reported: true,
            },
            other => other,
        }
    }
}

fn http_status_for_category(cat: ErrorCategory) -> http::StatusCode {
    match cat {
        ErrorCategory::InvalidRequest => http::StatusCode::BAD_REQUEST,
        ErrorCategory::Authentication => http::StatusCode::UNAUTHORIZED,
        ErrorCategory::Permission => http::StatusCode::FORBIDDEN,
        ErrorCategory::RateLimit => http::StatusCode::TOO_MANY_REQUESTS,
        ErrorCategory::Overloaded => http::StatusCode::SERVICE_UNAVAILABLE,
        ErrorCategory::ServerError | ErrorCategory::Unknown => {
            http::StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Format an error for a given ingress API, returning (`status_code`, JSON body).
#[must_use]
pub fn format_error(err: &RelayError, ingress: IngressApi) -> (http::StatusCode, serde_json::Value) {
    let cat = err.category();
    let status = http_status_for_category(cat);
    let message = err.to_string();

    let body = match rules_for(ingress).error_envelope {
        ErrorEnvelope::OpenAi => openai_error_payload(cat, &message),
        ErrorEnvelope::Anthropic => anthropic_error_payload(cat, &message),
        ErrorEnvelope::Gemini => gemini_error_payload(cat, status, &message),
        ErrorEnvelope::Ollama => ollama_error_payload(&message),
    };

    (status, body)
}

/// Convert a `RelayError` into an axum response for a specific ingress.
#[must_use]
pub fn into_axum_response(err: &RelayError, ingress: IngressApi) -> axum::response::Response {
    use axum::response::IntoResponse;
    let (status, body) = format_error(err, ingress);
    (status, axum::Json(body)).into_response()
}

impl axum::response::IntoResponse for RelayError {
    fn into_response(self) -> axum::response::Response {
        into_axum_response(&self, IngressApi::OpenAiChat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classes_follow_taxonomy() {
        for status in [429, 500, 502, 503] {
            assert_eq!(failure_class_for_status(status), FailureClass::Transient);
        }
        for status in [401, 402, 403] {
            assert_eq!(
                failure_class_for_status(status),
                FailureClass::CredentialExhausted
            );
        }
        assert_eq!(failure_class_for_status(400), FailureClass::ClientInvalid);
        assert_eq!(failure_class_for_status(404), FailureClass::Fatal);
    }

    #[test]
    fn mark_reported_only_touches_upstream() {
        let err = RelayError::upstream(401, "expired").mark_reported();
        assert!(err.credential_reported());
        assert_eq!(err.failure_class(), FailureClass::CredentialExhausted);

        let err = RelayError::Transport("reset".into()).mark_reported();
        assert!(!err.credential_reported());
    }

    #[test]
    fn format_error_uses_protocol_envelope() {
        let err = RelayError::upstream(429, "slow down");
        let (status, body) = format_error(&err, IngressApi::Anthropic);
        assert_eq!(status, http::StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["type"], "error");
        assert_eq!(body["error"]["type"], "rate_limit_error");

        let (_, body) = format_error(&err, IngressApi::Gemini);
        assert_eq!(body["error"]["status"], "RESOURCE_EXHAUSTED");
        assert_eq!(body["error"]["code"], 429);

        let (_, body) = format_error(&err, IngressApi::Ollama);
        assert!(body["error"].as_str().is_some());
    }
}
