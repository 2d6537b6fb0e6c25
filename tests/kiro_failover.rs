use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use protorelay::config::parse_config;
use protorelay::provider::InMemoryPool;
use protorelay::routing::dispatch::dispatch_request;
use protorelay::state::AppState;
use protorelay::transport::{HttpTransport, RetryPolicy};
use serde_json::json;

const KIRO_BODY: &[u8] =
    br#"{"content":"Hello"}{"content":" world"}{"contextUsagePercentage":1.0}"#;

fn credential_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("protorelay-kiro-{}", uuid::Uuid::new_v4().simple()));
    std::fs::create_dir_all(&dir).expect("create credential dir");
    dir
}

fn write_credential(dir: &Path, name: &str, access_token: &str) -> String {
    let path = dir.join(format!("{name}.json"));
    let expires_at = (chrono::Utc::now() + chrono::Duration::hours(1)).to_rfc3339();
    let body = json!({
        "accessToken": access_token,
        "refreshToken": format!("refresh-{name}"),
        "expiresAt": expires_at,
    });
    std::fs::write(&path, body.to_string()).expect("write credential");
    path.display().to_string()
}

async fn build_state(base_url: &str, credentials: &[(&str, String)]) -> Arc<AppState> {
    let credential_lines: String = credentials
        .iter()
        .map(|(id, file)| format!("      - id: \"{id}\"\n        file: \"{file}\"\n"))
        .collect();
    let yaml = format!(
        r#"
client_authentication:
  allowed_keys: ["client-key"]
retry:
  max_retries: 3
  base_delay_ms: 1
  max_delay_ms: 5
  max_attempts: 3
  rotation_jitter_max_ms: 0
routing:
  default_provider: "claude-kiro-oauth"
providers:
  - name: "kiro"
    provider: "claude-kiro-oauth"
    base_url: "{base_url}"
    credentials:
{credential_lines}"#
    );
    let config = parse_config(&yaml).expect("parse config");
    let transport =
        HttpTransport::new(&config.server, RetryPolicy::from_config(&config.retry)).expect("transport");
    let pool = InMemoryPool::from_config(&config, &transport).expect("pool");
    pool.initialize_all().await;
    Arc::new(AppState::new(config, Arc::new(pool)).expect("state"))
}

async fn serve(app: Router) -> (String, tokio::task::JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock kiro");
    let addr = listener.local_addr().expect("local addr");
    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), server)
}

fn chat_request(stream: bool) -> Request<Body> {
    let body = json!({
        "model": "claude-sonnet-4-5",
        "messages": [{"role": "user", "content": "hi"}],
        "stream": stream,
    });
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", "Bearer client-key")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("build request")
}

#[tokio::test]
async fn test_rate_limited_three_times_then_success_on_same_credential() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let app = Router::new().route(
        "/generateAssistantResponse",
        post(move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                    (StatusCode::TOO_MANY_REQUESTS, "slow down").into_response()
                } else {
                    (StatusCode::OK, std::str::from_utf8(KIRO_BODY).unwrap_or_default()).into_response()
                }
            }
        }),
    );
    let (base_url, server) = serve(app).await;
    let dir = credential_dir();
    let file = write_credential(&dir, "only", "token-only");
    let state = build_state(&base_url, &[("kiro-only", file)]).await;

    let response = dispatch_request(state.clone(), Arc::<str>::from(""), chat_request(false))
        .await
        .expect("dispatch");
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    let payload: serde_json::Value = serde_json::from_slice(&body).expect("json payload");
    assert_eq!(payload["choices"][0]["message"]["content"], "Hello world");
    assert_eq!(payload["choices"][0]["finish_reason"], "stop");
    assert_eq!(hits.load(Ordering::SeqCst), 4);

    let snapshot = state.pool.snapshot();
    assert!(snapshot[0].healthy);
    assert!(!snapshot[0].needs_refresh);

    server.abort();
    let _ = std::fs::remove_dir_all(dir);
}

fn counting_flaky_app(hits: Arc<AtomicUsize>) -> Router {
    Router::new().route(
        "/generateAssistantResponse",
        post(move || {
            let counter = hits.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                    (StatusCode::TOO_MANY_REQUESTS, "slow down").into_response()
                } else {
                    (StatusCode::OK, std::str::from_utf8(KIRO_BODY).unwrap_or_default()).into_response()
                }
            }
        }),
    )
}

#[tokio::test]
async fn test_rate_limited_stream_reaches_client_as_one_stream() {
    let hits = Arc::new(AtomicUsize::new(0));
    let (base_url, server) = serve(counting_flaky_app(hits.clone())).await;
    let dir = credential_dir();
    let file = write_credential(&dir, "only", "token-only");
    let state = build_state(&base_url, &[("kiro-only", file)]).await;

    let response = dispatch_request(state.clone(), Arc::<str>::from(""), chat_request(true))
        .await
        .expect("dispatch");
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    let text = String::from_utf8(body.to_vec()).expect("utf8 body");
    assert_eq!(text.matches("data: [DONE]").count(), 1);
    assert!(text.contains("\"content\":\"Hello\""));
    assert!(text.contains("\"content\":\" world\""));
    assert!(!text.contains("\"error\""));
    assert_eq!(text.matches("\"finish_reason\":\"stop\"").count(), 1);
    assert_eq!(hits.load(Ordering::SeqCst), 4);
    assert!(state.pool.snapshot()[0].healthy);

    server.abort();
    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn test_quota_exhausted_credential_waits_for_next_month() {
    let app = Router::new().route(
        "/generateAssistantResponse",
        post(|headers: HeaderMap| async move {
            let bearer = headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            if bearer == "Bearer token-quota" {
                (StatusCode::PAYMENT_REQUIRED, "monthly quota reached").into_response()
            } else {
                (StatusCode::OK, std::str::from_utf8(KIRO_BODY).unwrap_or_default()).into_response()
            }
        }),
    );
    let (base_url, server) = serve(app).await;
    let dir = credential_dir();
    let quota = write_credential(&dir, "quota", "token-quota");
    let spare = write_credential(&dir, "spare", "token-spare");
    let state = build_state(&base_url, &[("kiro-quota", quota), ("kiro-spare", spare)]).await;

    let response = dispatch_request(state.clone(), Arc::<str>::from(""), chat_request(false))
        .await
        .expect("dispatch");
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    let payload: serde_json::Value = serde_json::from_slice(&body).expect("json payload");
    assert_eq!(payload["choices"][0]["message"]["content"], "Hello world");

    let snapshot = state.pool.snapshot();
    let quota = snapshot
        .iter()
        .find(|status| status.credential_id == "kiro-quota")
        .expect("quota credential");
    assert!(!quota.healthy);
    assert!(!quota.needs_refresh);
    let recover_at = quota.recover_at.expect("recovery time");
    assert!(recover_at > chrono::Utc::now());
    assert_eq!(recover_at.format("%d %H:%M:%S").to_string(), "01 00:00:00");
    let spare = snapshot
        .iter()
        .find(|status| status.credential_id == "kiro-spare")
        .expect("spare credential");
    assert!(spare.healthy);
    assert_eq!(spare.usage_count, 1);

    server.abort();
    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn test_rejected_credential_rotates_and_is_flagged_once() {
    let app = Router::new().route(
        "/generateAssistantResponse",
        post(|headers: HeaderMap| async move {
            let bearer = headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            if bearer == "Bearer token-bad" {
                (StatusCode::UNAUTHORIZED, "expired token").into_response()
            } else {
                (StatusCode::OK, std::str::from_utf8(KIRO_BODY).unwrap_or_default()).into_response()
            }
        }),
    );
    let (base_url, server) = serve(app).await;
    let dir = credential_dir();
    let bad = write_credential(&dir, "bad", "token-bad");
    let good = write_credential(&dir, "good", "token-good");
    let state = build_state(&base_url, &[("kiro-bad", bad), ("kiro-good", good)]).await;

    let response = dispatch_request(state.clone(), Arc::<str>::from(""), chat_request(true))
        .await
        .expect("dispatch");
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    let text = String::from_utf8(body.to_vec()).expect("utf8 body");
    assert_eq!(text.matches("data: [DONE]").count(), 1);
    assert!(text.contains("Hello"));

    let flagged: Vec<_> = state
        .pool
        .snapshot()
        .into_iter()
        .filter(|status| status.needs_refresh)
        .collect();
    // Round robin starts at the first configured credential.
    assert_eq!(flagged.len(), 1);
    assert_eq!(flagged[0].credential_id, "kiro-bad");

    server.abort();
    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn test_all_credentials_rejected_surfaces_auth_error() {
    let app = Router::new().route(
        "/generateAssistantResponse",
        post(|| async { (StatusCode::FORBIDDEN, "suspended") }),
    );
    let (base_url, server) = serve(app).await;
    let dir = credential_dir();
    let a = write_credential(&dir, "a", "token-a");
    let b = write_credential(&dir, "b", "token-b");
    let state = build_state(&base_url, &[("kiro-a", a), ("kiro-b", b)]).await;

    let response = dispatch_request(state.clone(), Arc::<str>::from(""), chat_request(false))
        .await
        .expect("dispatch");
    assert!(response.status().is_client_error() || response.status().is_server_error());
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    let payload: serde_json::Value = serde_json::from_slice(&body).expect("json payload");
    assert!(payload["error"]["message"].is_string());

    let snapshot = state.pool.snapshot();
    assert!(snapshot.iter().all(|status| status.needs_refresh));

    server.abort();
    let _ = std::fs::remove_dir_all(dir);
}
