use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use protorelay::config::parse_config;
use protorelay::provider::InMemoryPool;
use protorelay::routing::dispatch::dispatch_request;
use protorelay::state::AppState;
use protorelay::transport::{HttpTransport, RetryPolicy};
use serde_json::{json, Value};

const STREAM_BODY: &str = concat!(
    "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"po\"}}]}\n\n",
    "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"ng\"},\"finish_reason\":\"stop\"}]}\n\n",
    "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"choices\":[],\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":2,\"total_tokens\":7}}\n\n",
    "data: [DONE]\n\n",
);

async fn mock_upstream(headers: HeaderMap, Json(body): Json<Value>) -> axum::response::Response {
    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if bearer != "Bearer upstream-secret" {
        return (StatusCode::UNAUTHORIZED, "bad upstream key").into_response();
    }
    if body["stream"].as_bool().unwrap_or(false) {
        return ([("content-type", "text/event-stream")], STREAM_BODY).into_response();
    }
    Json(json!({
        "id": "chatcmpl_mock",
        "object": "chat.completion",
        "created": 1_727_000_000_u64,
        "model": body["model"],
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "pong"},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7}
    }))
    .into_response()
}

async fn start_upstream() -> (String, tokio::task::JoinHandle<()>) {
    let app = Router::new().route("/v1/chat/completions", post(mock_upstream));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock upstream");
    let addr = listener.local_addr().expect("local addr");
    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}/v1"), server)
}

async fn build_state(base_url: &str) -> Arc<AppState> {
    let yaml = format!(
        r#"
client_authentication:
  allowed_keys: ["client-key"]
retry:
  max_retries: 0
  base_delay_ms: 1
  max_delay_ms: 5
  rotation_jitter_max_ms: 0
routing:
  default_provider: "openai-custom"
providers:
  - name: "mock"
    provider: "openai-custom"
    base_url: "{base_url}"
    models: ["gpt-4o-mini"]
    credentials:
      - id: "mock-key"
        api_key: "upstream-secret"
"#
    );
    let config = parse_config(&yaml).expect("parse config");
    let transport =
        HttpTransport::new(&config.server, RetryPolicy::from_config(&config.retry)).expect("transport");
    let pool = InMemoryPool::from_config(&config, &transport).expect("pool");
    pool.initialize_all().await;
    Arc::new(AppState::new(config, Arc::new(pool)).expect("state"))
}

async fn send(state: &Arc<AppState>, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = dispatch_request(state.clone(), Arc::<str>::from(""), request)
        .await
        .expect("dispatch");
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    (status, body.to_vec())
}

fn post_json(uri: &str, auth: (&str, &str), body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(auth.0, auth.1)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("build request")
}

#[tokio::test]
async fn test_openai_chat_unary_forward() {
    let (base_url, server) = start_upstream().await;
    let state = build_state(&base_url).await;
    let request = post_json(
        "/v1/chat/completions",
        ("authorization", "Bearer client-key"),
        &json!({"model": "gpt-4o-mini", "messages": [{"role": "user", "content": "ping"}]}),
    );
    let (status, body) = send(&state, request).await;
    assert_eq!(status, StatusCode::OK);
    let payload: Value = serde_json::from_slice(&body).expect("json payload");
    assert_eq!(payload["object"], "chat.completion");
    assert_eq!(payload["choices"][0]["message"]["content"], "pong");
    assert_eq!(payload["usage"]["completion_tokens"], 2);
    server.abort();
}

#[tokio::test]
async fn test_anthropic_stream_from_openai_upstream() {
    let (base_url, server) = start_upstream().await;
    let state = build_state(&base_url).await;
    let request = post_json(
        "/v1/messages",
        ("x-api-key", "client-key"),
        &json!({
            "model": "gpt-4o-mini",
            "max_tokens": 64,
            "stream": true,
            "messages": [{"role": "user", "content": "ping"}]
        }),
    );
    let (status, body) = send(&state, request).await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).expect("utf8");
    assert_eq!(text.matches("event: message_start").count(), 1);
    assert_eq!(text.matches("event: message_stop").count(), 1);
    assert!(text.contains("\"text\":\"po\""));
    assert!(text.contains("\"text\":\"ng\""));
    assert!(text.contains("\"stop_reason\":\"end_turn\""));
    server.abort();
}

#[tokio::test]
async fn test_ollama_chat_streams_ndjson_by_default() {
    let (base_url, server) = start_upstream().await;
    let state = build_state(&base_url).await;
    let request = post_json(
        "/api/chat",
        ("authorization", "Bearer client-key"),
        &json!({"model": "gpt-4o-mini", "messages": [{"role": "user", "content": "ping"}]}),
    );
    let (status, body) = send(&state, request).await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).expect("utf8");
    let lines: Vec<Value> = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).expect("ndjson line"))
        .collect();
    let last = lines.last().expect("at least one line");
    assert_eq!(last["done"], true);
    assert_eq!(lines.iter().filter(|line| line["done"] == true).count(), 1);
    server.abort();
}

#[tokio::test]
async fn test_gemini_generate_content_unary() {
    let (base_url, server) = start_upstream().await;
    let state = build_state(&base_url).await;
    let request = post_json(
        "/v1beta/models/gpt-4o-mini:generateContent",
        ("x-goog-api-key", "client-key"),
        &json!({"contents": [{"role": "user", "parts": [{"text": "ping"}]}]}),
    );
    let (status, body) = send(&state, request).await;
    assert_eq!(status, StatusCode::OK);
    let payload: Value = serde_json::from_slice(&body).expect("json payload");
    assert_eq!(payload["candidates"][0]["content"]["parts"][0]["text"], "pong");
    server.abort();
}

#[tokio::test]
async fn test_auth_failures_use_protocol_envelopes() {
    let (base_url, server) = start_upstream().await;
    let state = build_state(&base_url).await;
    let chat = json!({"model": "gpt-4o-mini", "messages": [{"role": "user", "content": "ping"}]});

    let (status, body) = send(
        &state,
        post_json("/v1/chat/completions", ("authorization", "Bearer wrong"), &chat),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let payload: Value = serde_json::from_slice(&body).expect("json");
    assert_eq!(payload["error"]["type"], "authentication_error");

    let (status, body) = send(&state, post_json("/v1/messages", ("x-api-key", "wrong"), &chat)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let payload: Value = serde_json::from_slice(&body).expect("json");
    assert_eq!(payload["type"], "error");
    assert_eq!(payload["error"]["type"], "authentication_error");

    let gemini = json!({"contents": [{"role": "user", "parts": [{"text": "ping"}]}]});
    let (status, body) = send(
        &state,
        post_json(
            "/v1beta/models/gpt-4o-mini:generateContent?key=wrong",
            ("content-type", "application/json"),
            &gemini,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let payload: Value = serde_json::from_slice(&body).expect("json");
    assert_eq!(payload["error"]["status"], "UNAUTHENTICATED");

    let (status, body) = send(&state, post_json("/api/chat", ("authorization", "Bearer wrong"), &chat)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let payload: Value = serde_json::from_slice(&body).expect("json");
    assert!(payload["error"].is_string());

    server.abort();
}

#[tokio::test]
async fn test_model_listing_and_health() {
    let (base_url, server) = start_upstream().await;
    let state = build_state(&base_url).await;

    let request = Request::builder()
        .method("GET")
        .uri("/v1/models")
        .header("authorization", "Bearer client-key")
        .body(Body::empty())
        .expect("build request");
    let (status, body) = send(&state, request).await;
    assert_eq!(status, StatusCode::OK);
    let payload: Value = serde_json::from_slice(&body).expect("json");
    assert_eq!(payload["object"], "list");
    assert_eq!(payload["data"][0]["id"], "gpt-4o-mini");

    let request = Request::builder()
        .method("GET")
        .uri("/api/tags")
        .header("authorization", "Bearer client-key")
        .body(Body::empty())
        .expect("build request");
    let (status, body) = send(&state, request).await;
    assert_eq!(status, StatusCode::OK);
    let payload: Value = serde_json::from_slice(&body).expect("json");
    assert!(payload["models"].is_array());

    let request = Request::builder()
        .method("GET")
        .uri("/health")
        .body(Body::empty())
        .expect("build request");
    let (status, body) = send(&state, request).await;
    assert_eq!(status, StatusCode::OK);
    let payload: Value = serde_json::from_slice(&body).expect("json");
    assert_eq!(payload["credentials"]["total"], 1);

    server.abort();
}
