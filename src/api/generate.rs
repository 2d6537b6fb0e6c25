//! Generation endpoints for every client protocol.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::error::{into_axum_response, RelayError};
use crate::orchestrator::{ClientSink, RetryContext};
use crate::protocol::canonical::{CanonicalRequest, IngressApi, ProviderKind};
use crate::protocol::converter::{IngressHints, ProtocolConverter};
use crate::protocol::framing::rules_for;
use crate::state::AppState;

/// Authenticate, decode and run one generation request.
pub async fn handler(
    state: Arc<AppState>,
    ingress: IngressApi,
    headers: &HeaderMap,
    query: Option<&str>,
    body: Bytes,
    hints: IngressHints,
) -> Response {
    if let Err(err) = state.authenticate(ingress, headers, query) {
        return into_axum_response(&err, ingress);
    }
    let mut request = match state.converter.decode_request(ingress, &body, &hints) {
        Ok(request) => request,
        Err(err) => return into_axum_response(&err, ingress),
    };
    request.request_id = state.next_request_id(ingress);
    let provider = state.router.provider_for(&request.model);
    tracing::debug!(
        request_id = %request.request_id,
        ingress = ingress.as_str(),
        model = %request.model,
        stream = request.stream,
        %provider,
        "request accepted"
    );

    if request.stream {
        stream_response(&state, ingress, provider, request)
    } else {
        unary_response(&state, ingress, provider, &request).await
    }
}

/// Gemini puts the model and the streaming flag in the path:
/// `{model}:generateContent` or `{model}:streamGenerateContent`.
pub async fn gemini_handler(
    state: Arc<AppState>,
    model_action: &str,
    headers: &HeaderMap,
    query: Option<&str>,
    body: Bytes,
) -> Response {
    let Some(hints) = parse_gemini_action(model_action) else {
        let err = RelayError::InvalidRequest(format!("unsupported model action '{model_action}'"));
        return into_axum_response(&err, IngressApi::Gemini);
    };
    handler(state, IngressApi::Gemini, headers, query, body, hints).await
}

fn parse_gemini_action(model_action: &str) -> Option<IngressHints> {
    let (model, action) = model_action.rsplit_once(':')?;
    let stream = match action {
        "generateContent" => false,
        "streamGenerateContent" => true,
        _ => return None,
    };
    (!model.is_empty()).then(|| IngressHints {
        model: Some(model.to_owned()),
        stream: Some(stream),
    })
}

async fn unary_response(
    state: &AppState,
    ingress: IngressApi,
    provider: ProviderKind,
    request: &CanonicalRequest,
) -> Response {
    // Dropping this future (client gone) drops the backend request with it.
    let ctx = RetryContext::new(request.request_id.clone(), CancellationToken::new());
    match state.orchestrator.generate(provider, request, &ctx).await {
        Ok(response) => Json(state.converter.encode_response(ingress, &response)).into_response(),
        Err(err) => {
            tracing::warn!(request_id = %ctx.request_id, error = %err, "request failed");
            into_axum_response(&err, ingress)
        }
    }
}

fn stream_response(
    state: &Arc<AppState>,
    ingress: IngressApi,
    provider: ProviderKind,
    request: CanonicalRequest,
) -> Response {
    let cancel = CancellationToken::new();
    let encoder = state
        .converter
        .stream_encoder(ingress, &request.model, &request.request_id);
    let (mut sink, body) = ClientSink::channel(encoder, cancel.clone());
    let orchestrator = Arc::clone(&state.orchestrator);
    tokio::spawn(async move {
        let ctx = RetryContext::new(request.request_id.clone(), cancel);
        orchestrator.stream(provider, &request, &ctx, &mut sink).await;
    });

    let mut response = Response::new(Body::from_stream(body));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(rules_for(ingress).stream_content_type),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    response
}
