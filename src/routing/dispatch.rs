use std::convert::Infallible;
use std::sync::Arc;

use axum::body::{self, Body};
use axum::http::{HeaderMap, Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::api::{generate, health, models};
use crate::protocol::canonical::IngressApi;
use crate::protocol::converter::IngressHints;
use crate::state::AppState;

const DEFAULT_BODY_LIMIT_BYTES: usize = 20 * 1024 * 1024;

#[derive(Debug, PartialEq, Eq)]
enum RouteMatch<'a> {
    Health,
    Models(IngressApi),
    Generate(IngressApi),
    Gemini { model_action: &'a str },
    MethodNotAllowed,
    NotFound,
}

/// Dispatch a raw HTTP request to the matching handler.
///
/// # Errors
///
/// This function currently never returns `Err` and uses `Infallible`.
pub async fn dispatch_request(
    state: Arc<AppState>,
    base_path: Arc<str>,
    request: Request<Body>,
) -> Result<Response, Infallible> {
    let (parts, body) = request.into_parts();
    let query = parts.uri.query();
    let route = match_route(&parts.method, parts.uri.path(), base_path.as_ref(), &parts.headers);

    let response = match route {
        RouteMatch::Health => health::health_handler(&state).into_response(),
        RouteMatch::Models(ingress) => models::handler(state, ingress, &parts.headers, query).await,
        RouteMatch::Generate(ingress) => {
            let body_bytes = match read_request_body(body).await {
                Ok(bytes) => bytes,
                Err(response) => return Ok(response),
            };
            generate::handler(
                state,
                ingress,
                &parts.headers,
                query,
                body_bytes,
                IngressHints::default(),
            )
            .await
        }
        RouteMatch::Gemini { model_action } => {
            let body_bytes = match read_request_body(body).await {
                Ok(bytes) => bytes,
                Err(response) => return Ok(response),
            };
            generate::gemini_handler(state, model_action, &parts.headers, query, body_bytes).await
        }
        RouteMatch::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED.into_response(),
        RouteMatch::NotFound => StatusCode::NOT_FOUND.into_response(),
    };

    Ok(response)
}

#[must_use]
pub fn normalize_base_path(base_path: &str) -> String {
    let trimmed = base_path.trim();
    if trimmed.is_empty() || trimmed == "/" {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.trim_end_matches('/').to_string()
    } else {
        format!("/{}", trimmed.trim_end_matches('/'))
    }
}

async fn read_request_body(body: Body) -> Result<bytes::Bytes, Response> {
    body::to_bytes(body, DEFAULT_BODY_LIMIT_BYTES)
        .await
        .map_err(|_| {
            (
                StatusCode::PAYLOAD_TOO_LARGE,
                "Request body too large (max 20MiB)",
            )
                .into_response()
        })
}

fn only<'a>(method: &Method, expected: Method, route: RouteMatch<'a>) -> RouteMatch<'a> {
    if *method == expected {
        route
    } else {
        RouteMatch::MethodNotAllowed
    }
}

fn match_route<'a>(method: &Method, path: &'a str, base_path: &str, headers: &HeaderMap) -> RouteMatch<'a> {
    let Some(path) = strip_base_path(path, base_path) else {
        return RouteMatch::NotFound;
    };

    match path {
        "/" | "/health" => only(method, Method::GET, RouteMatch::Health),
        "/v1/models" => {
            // Claude SDKs share the path with OpenAI ones.
            let ingress = if headers.contains_key("anthropic-version") {
                IngressApi::Anthropic
            } else {
                IngressApi::OpenAiChat
            };
            only(method, Method::GET, RouteMatch::Models(ingress))
        }
        "/v1beta/models" => only(method, Method::GET, RouteMatch::Models(IngressApi::Gemini)),
        "/api/tags" => only(method, Method::GET, RouteMatch::Models(IngressApi::Ollama)),
        "/v1/chat/completions" => only(method, Method::POST, RouteMatch::Generate(IngressApi::OpenAiChat)),
        "/v1/responses" => only(method, Method::POST, RouteMatch::Generate(IngressApi::OpenAiResponses)),
        "/v1/messages" => only(method, Method::POST, RouteMatch::Generate(IngressApi::Anthropic)),
        "/api/chat" => only(method, Method::POST, RouteMatch::Generate(IngressApi::Ollama)),
        _ => {
            if let Some(model_action) = path.strip_prefix("/v1beta/models/") {
                if method != Method::POST {
                    RouteMatch::MethodNotAllowed
                } else if model_action.is_empty() {
                    RouteMatch::NotFound
                } else {
                    RouteMatch::Gemini { model_action }
                }
            } else {
                RouteMatch::NotFound
            }
        }
    }
}

fn strip_base_path<'a>(path: &'a str, base_path: &str) -> Option<&'a str> {
    if base_path.is_empty() {
        return Some(path);
    }

    let remainder = path.strip_prefix(base_path)?;
    if remainder.is_empty() {
        Some("/")
    } else if remainder.starts_with('/') {
        Some(remainder)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route<'a>(method: Method, path: &'a str) -> RouteMatch<'a> {
        match_route(&method, path, "", &HeaderMap::new())
    }

    #[test]
    fn routes_each_protocol() {
        assert_eq!(route(Method::GET, "/health"), RouteMatch::Health);
        assert_eq!(
            route(Method::POST, "/v1/messages"),
            RouteMatch::Generate(IngressApi::Anthropic)
        );
        assert_eq!(
            route(Method::POST, "/api/chat"),
            RouteMatch::Generate(IngressApi::Ollama)
        );
        assert_eq!(
            route(Method::GET, "/api/tags"),
            RouteMatch::Models(IngressApi::Ollama)
        );
        assert_eq!(
            route(Method::POST, "/v1beta/models/gemini-pro:generateContent"),
            RouteMatch::Gemini {
                model_action: "gemini-pro:generateContent"
            }
        );
        assert_eq!(route(Method::GET, "/v1/chat/completions"), RouteMatch::MethodNotAllowed);
        assert_eq!(route(Method::GET, "/nope"), RouteMatch::NotFound);
    }

    #[test]
    fn anthropic_model_list_by_header() {
        let mut headers = HeaderMap::new();
        headers.insert("anthropic-version", "2023-06-01".parse().unwrap());
        assert_eq!(
            match_route(&Method::GET, "/v1/models", "", &headers),
            RouteMatch::Models(IngressApi::Anthropic)
        );
    }

    #[test]
    fn base_path_is_stripped() {
        assert_eq!(normalize_base_path("relay/"), "/relay");
        assert_eq!(
            match_route(&Method::GET, "/relay/health", "/relay", &HeaderMap::new()),
            RouteMatch::Health
        );
        assert_eq!(
            match_route(&Method::GET, "/relayx/health", "/relay", &HeaderMap::new()),
            RouteMatch::NotFound
        );
    }
}
