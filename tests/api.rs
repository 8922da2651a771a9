use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use bytes::Bytes;
use chatrelay::config::{BackendUrls, RuntimeConfig, StaticCredentials};
use futures_util::{StreamExt, stream};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::ServiceExt;

const GEMINI_KEY: &str = "g-test-key";
const OPENAI_KEY: &str = "sk-test-key";

const GEMINI_SSE: &str = concat!(
    "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"Hel\"}]}}]}\r\n\r\n",
    "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"lo\"}]}}]}\n\n",
);

const OPENAI_SSE: &str = concat!(
    "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"},\"index\":0,\"finish_reason\":null}]}\n\n",
    "data: {\"choices\":[{\"delta\":{},\"index\":0,\"finish_reason\":\"stop\"}]}\n\n",
);

#[derive(Default)]
struct Upstream {
    hits: AtomicUsize,
    bodies: Mutex<Vec<Value>>,
    authorization: Mutex<Vec<String>>,
}

impl Upstream {
    fn record(&self, body: &Value) {
        self.hits.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut lock) = self.bodies.lock() {
            lock.push(body.clone());
        }
    }

    fn last_body(&self) -> Value {
        self.bodies
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("upstream saw a request")
    }
}

struct TestContext {
    router: Router,
    upstream: Arc<Upstream>,
}

fn last_gemini_text(body: &Value) -> String {
    body["contents"]
        .as_array()
        .and_then(|contents| contents.last())
        .and_then(|turn| turn["parts"][0]["text"].as_str())
        .unwrap_or_default()
        .to_string()
}

fn event_stream(body: &'static str) -> Response {
    ([(CONTENT_TYPE, "text/event-stream")], body).into_response()
}

async fn gemini_models(
    State(upstream): State<Arc<Upstream>>,
    Path(call): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> Response {
    upstream.record(&body);
    if query.get("key").map(String::as_str) != Some(GEMINI_KEY) {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"error": {"message": "API key not valid"}})),
        )
            .into_response();
    }
    let text = last_gemini_text(&body);
    if text == "stall" {
        tokio::time::sleep(Duration::from_secs(30)).await;
    }
    if text == "stream then stall" {
        let first = GEMINI_SSE.split_inclusive("\r\n\r\n").next().unwrap_or_default();
        let body = stream::iter(vec![Ok::<Bytes, Infallible>(Bytes::from_static(
            first.as_bytes(),
        ))])
        .chain(stream::pending());
        return ([(CONTENT_TYPE, "text/event-stream")], Body::from_stream(body)).into_response();
    }
    if text == "please rate limit me" {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"error": {"code": 429, "message": "Resource has been exhausted"}})),
        )
            .into_response();
    }
    if text == "blocked" {
        return Json(json!({"promptFeedback": {"blockReason": "SAFETY"}})).into_response();
    }
    let hello = json!({"candidates": [{"content": {"role": "model", "parts": [{"text": "hello"}]}}]});
    if call.ends_with(":streamGenerateContent") {
        if query.get("alt").map(String::as_str) != Some("sse") || text == "no sse please" {
            return Json(json!([hello])).into_response();
        }
        return event_stream(GEMINI_SSE);
    }
    Json(hello).into_response()
}

async fn openai_chat(
    State(upstream): State<Arc<Upstream>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    upstream.record(&body);
    if let Some(v) = headers.get(AUTHORIZATION).and_then(|h| h.to_str().ok()) {
        if let Ok(mut lock) = upstream.authorization.lock() {
            lock.push(v.to_string());
        }
    }
    if body["stream"].as_bool() == Some(true) {
        return event_stream(OPENAI_SSE);
    }
    Json(json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "choices": [{"index": 0, "message": {"role": "assistant", "content": "hi from openai"}, "finish_reason": "stop"}]
    }))
    .into_response()
}

async fn start_upstream() -> (SocketAddr, Arc<Upstream>) {
    let upstream = Arc::new(Upstream::default());
    let app = Router::new()
        .route("/v1beta/models/{call}", post(gemini_models))
        .route("/v1/chat/completions", post(openai_chat))
        .route("/health", get(|| async { "ok" }))
        .with_state(upstream.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, upstream)
}

async fn setup_with(credentials: StaticCredentials, system_prompt: Option<&str>) -> TestContext {
    let system_prompt = system_prompt.map(str::to_string);
    setup_with_runtime(credentials, |runtime| runtime.system_prompt = system_prompt).await
}

async fn setup_with_runtime(
    credentials: StaticCredentials,
    tweak: impl FnOnce(&mut RuntimeConfig),
) -> TestContext {
    let (addr, upstream) = start_upstream().await;
    let mut runtime = RuntimeConfig {
        listen: "127.0.0.1:0".to_string(),
        backends: BackendUrls {
            gemini: format!("http://{addr}/v1beta"),
            openai: format!("http://{addr}/v1"),
            ollama: format!("http://{addr}/v1"),
        },
        ..RuntimeConfig::default()
    };
    tweak(&mut runtime);
    let state = chatrelay::app::load_state_with(runtime, Arc::new(credentials))
        .await
        .expect("load state");
    TestContext {
        router: chatrelay::app::build_app(state),
        upstream,
    }
}

async fn setup() -> TestContext {
    setup_with(
        StaticCredentials::new()
            .with("gemini", GEMINI_KEY)
            .with("openai", OPENAI_KEY),
        None,
    )
    .await
}

async fn send(ctx: &TestContext, req: Request<Body>) -> (StatusCode, HeaderMap, String) {
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let headers = resp.headers().clone();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    (status, headers, String::from_utf8_lossy(&bytes).to_string())
}

async fn post_chat(ctx: &TestContext, body: Value) -> (StatusCode, HeaderMap, String) {
    let req = Request::builder()
        .method("POST")
        .uri("/api/chat")
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    send(ctx, req).await
}

fn canonical(text: &str) -> String {
    format!(
        "data: {}\n\n",
        json!({"choices": [{"delta": {"content": text}, "index": 0, "finish_reason": null}]})
    )
}

#[tokio::test]
async fn gemini_buffered_reply_is_unwrapped() {
    let ctx = setup().await;
    let (status, _, body) = post_chat(
        &ctx,
        json!({"model": "gemini-2.0-flash", "messages": [{"role": "user", "content": "hi"}]}),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let value: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value, json!({"reply": "hello"}));

    let sent = ctx.upstream.last_body();
    assert_eq!(sent["contents"][0]["role"], "user");
    assert_eq!(sent["contents"][0]["parts"][0]["text"], "hi");
}

#[tokio::test]
async fn upstream_rate_limit_maps_to_429() {
    let ctx = setup().await;
    let (status, _, body) = post_chat(
        &ctx,
        json!({"model": "gemini-2.0-flash", "messages": [{"role": "user", "content": "please rate limit me"}]}),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    let value: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["code"], "rate_limited");
    assert_eq!(
        value["error"],
        "upstream rate limit reached, please try again later"
    );
}

#[tokio::test]
async fn openai_request_carries_spliced_image() {
    let ctx = setup().await;
    let (status, _, body) = post_chat(
        &ctx,
        json!({
            "model": "gpt-4o-mini",
            "messages": [
                {"role": "user", "content": "first"},
                {"role": "assistant", "content": "ok"},
                {"role": "user", "content": "what is this?"}
            ],
            "image": "data:image/png;base64,AAAA"
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let value: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["reply"], "hi from openai");

    let sent = ctx.upstream.last_body();
    let messages = sent["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0]["content"], "first");
    assert_eq!(
        messages[2]["content"],
        json!([
            {"type": "text", "text": "what is this?"},
            {"type": "image_url", "image_url": {"url": "data:image/png;base64,AAAA"}}
        ])
    );
    let auth = ctx.upstream.authorization.lock().unwrap().clone();
    assert_eq!(auth, vec![format!("Bearer {OPENAI_KEY}")]);
}

#[tokio::test]
async fn malformed_image_degrades_to_text_only() {
    let ctx = setup().await;
    let (status, _, _) = post_chat(
        &ctx,
        json!({
            "model": "gpt-4o-mini",
            "messages": [{"role": "user", "content": "look"}],
            "image": "not-a-data-url"
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let sent = ctx.upstream.last_body();
    assert_eq!(sent["messages"][0]["content"], "look");
}

#[tokio::test]
async fn gemini_stream_is_normalized_and_terminated() {
    let ctx = setup().await;
    let (status, headers, body) = post_chat(
        &ctx,
        json!({
            "model": "gemini-2.0-flash",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );
    let expected = format!("{}{}data: [DONE]\n\n", canonical("Hel"), canonical("lo"));
    assert_eq!(body, expected);
}

#[tokio::test]
async fn gemini_stream_without_sse_is_synthesized() {
    let ctx = setup().await;
    let (status, _, body) = post_chat(
        &ctx,
        json!({
            "model": "gemini-2.0-flash",
            "messages": [{"role": "user", "content": "no sse please"}],
            "stream": true
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, format!("{}data: [DONE]\n\n", canonical("hello")));
}

#[tokio::test]
async fn openai_stream_passes_through_with_terminator() {
    let ctx = setup().await;
    let (status, _, body) = post_chat(
        &ctx,
        json!({
            "model": "gpt-4o-mini",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.starts_with(OPENAI_SSE), "{body}");
    assert!(body.ends_with("data: [DONE]\n\n"), "{body}");
    assert_eq!(body.matches("[DONE]").count(), 1);
    assert_eq!(ctx.upstream.last_body()["stream"], true);
}

#[tokio::test]
async fn empty_messages_rejected_without_upstream_call() {
    let ctx = setup().await;
    let (status, _, body) =
        post_chat(&ctx, json!({"model": "gemini-2.0-flash", "messages": []})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let value: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["code"], "invalid_request");
    assert!(value["error"].as_str().is_some_and(|s| !s.is_empty()));
    assert_eq!(ctx.upstream.hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn history_without_user_turn_is_rejected() {
    let ctx = setup().await;
    let (status, _, body) = post_chat(
        &ctx,
        json!({"model": "gemini-2.0-flash", "messages": [{"role": "assistant", "content": "hello?"}]}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let value: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["code"], "invalid_history");
    assert_eq!(ctx.upstream.hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn gemini_history_is_repaired_before_dispatch() {
    let ctx = setup().await;
    let (status, _, _) = post_chat(
        &ctx,
        json!({
            "model": "gemini-2.0-flash",
            "messages": [
                {"role": "assistant", "content": "welcome"},
                {"role": "user", "content": "one"},
                {"role": "user", "content": "two"},
                {"role": "assistant", "content": "   "},
                {"role": "user", "content": "three"}
            ]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let sent = ctx.upstream.last_body();
    let contents = sent["contents"].as_array().unwrap();
    assert_eq!(contents.len(), 1);
    assert_eq!(contents[0]["parts"][0]["text"], "one\ntwo\nthree");
}

#[tokio::test]
async fn blocked_prompt_is_an_unexpected_shape() {
    let ctx = setup().await;
    let (status, _, body) = post_chat(
        &ctx,
        json!({"model": "gemini-2.0-flash", "messages": [{"role": "user", "content": "blocked"}]}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    let value: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["code"], "unexpected_response_shape");
    assert!(value["error"].as_str().unwrap().contains("SAFETY"));
}

#[tokio::test]
async fn rejected_key_surfaces_upstream_body() {
    let ctx = setup_with(StaticCredentials::new().with("gemini", "wrong"), None).await;
    let (status, _, body) = post_chat(
        &ctx,
        json!({"model": "gemini-2.0-flash", "messages": [{"role": "user", "content": "hi"}]}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    let value: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["code"], "upstream_rejected");
    let message = value["error"].as_str().unwrap();
    assert!(message.contains("403"), "{message}");
    assert!(message.contains("API key not valid"), "{message}");
    assert!(!message.contains("wrong"), "{message}");
}

#[tokio::test]
async fn missing_credential_is_a_server_error() {
    let ctx = setup_with(StaticCredentials::new(), None).await;
    let (status, _, body) = post_chat(
        &ctx,
        json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "hi"}]}),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let value: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["code"], "missing_credential");
    assert_eq!(ctx.upstream.hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn self_hosted_backend_works_without_credentials() {
    let ctx = setup_with(StaticCredentials::new(), None).await;
    let (status, _, body) = post_chat(
        &ctx,
        json!({"model": "ollama/llama3.2", "messages": [{"role": "user", "content": "hi"}]}),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(ctx.upstream.last_body()["model"], "llama3.2");
    assert!(ctx.upstream.authorization.lock().unwrap().is_empty());
}

#[tokio::test]
async fn system_prompt_is_injected_per_family() {
    let ctx = setup_with(
        StaticCredentials::new()
            .with("gemini", GEMINI_KEY)
            .with("openai", OPENAI_KEY),
        Some("be brief"),
    )
    .await;
    let messages = json!([{"role": "user", "content": "hi"}]);

    post_chat(&ctx, json!({"model": "gemini-2.0-flash", "messages": messages})).await;
    let sent = ctx.upstream.last_body();
    assert_eq!(sent["systemInstruction"]["parts"][0]["text"], "be brief");

    post_chat(&ctx, json!({"model": "gpt-4o-mini", "messages": messages})).await;
    let sent = ctx.upstream.last_body();
    assert_eq!(sent["messages"][0], json!({"role": "system", "content": "be brief"}));
    assert_eq!(sent["messages"][1]["content"], "hi");
}

#[tokio::test]
async fn unknown_model_is_rejected() {
    let ctx = setup().await;
    let (status, _, body) = post_chat(
        &ctx,
        json!({"model": "claude-3-haiku", "messages": [{"role": "user", "content": "hi"}]}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let value: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["code"], "unsupported_provider");
}

#[tokio::test]
async fn non_json_content_type_is_415() {
    let ctx = setup().await;
    let req = Request::builder()
        .method("POST")
        .uri("/api/chat")
        .header(CONTENT_TYPE, "text/plain")
        .body(Body::from("hi"))
        .unwrap();
    let (status, _, body) = send(&ctx, req).await;
    assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    let value: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["code"], "unsupported_media_type");
}

#[tokio::test]
async fn malformed_json_is_400() {
    let ctx = setup().await;
    let req = Request::builder()
        .method("POST")
        .uri("/api/chat")
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from("{\"model\": "))
        .unwrap();
    let (status, _, body) = send(&ctx, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let value: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["code"], "malformed_request");
}

#[tokio::test]
async fn models_endpoint_lists_routes() {
    let ctx = setup_with(StaticCredentials::new().with("gemini", GEMINI_KEY), None).await;
    let req = Request::builder()
        .method("GET")
        .uri("/api/models")
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(&ctx, req).await;
    assert_eq!(status, StatusCode::OK);
    let value: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["object"], "list");
    let data = value["data"].as_array().unwrap();
    assert_eq!(data.len(), 3);
    assert_eq!(data[0]["family"], "gemini");
    assert_eq!(data[0]["credential_configured"], true);
    assert_eq!(data[1]["backend"], "openai");
    assert_eq!(data[1]["credential_configured"], false);
}

#[tokio::test]
async fn responses_carry_request_id() {
    let ctx = setup().await;
    let req = Request::builder()
        .method("GET")
        .uri("/api/models")
        .header("x-request-id", "req-123")
        .body(Body::empty())
        .unwrap();
    let (_, headers, _) = send(&ctx, req).await;
    assert_eq!(
        headers.get("x-request-id").and_then(|v| v.to_str().ok()),
        Some("req-123")
    );
}

#[tokio::test]
async fn metrics_endpoint_renders_counters() {
    let ctx = setup().await;
    post_chat(
        &ctx,
        json!({"model": "gemini-2.0-flash", "messages": [{"role": "user", "content": "hi"}]}),
    )
    .await;
    let req = Request::builder()
        .method("GET")
        .uri("/metrics")
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(&ctx, req).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("chatrelay_requests_total"), "{body}");
}

fn gemini_credentials() -> StaticCredentials {
    StaticCredentials::new().with("gemini", GEMINI_KEY)
}

#[tokio::test]
async fn stalled_upstream_times_out_for_buffered_and_streamed_calls() {
    let ctx = setup_with_runtime(gemini_credentials(), |runtime| {
        runtime.request_timeout_ms = 300;
        runtime.stream_idle_timeout_ms = 300;
    })
    .await;
    for stream in [false, true] {
        let call = post_chat(
            &ctx,
            json!({
                "model": "gemini-2.0-flash",
                "messages": [{"role": "user", "content": "stall"}],
                "stream": stream
            }),
        );
        let (status, _, body) = tokio::time::timeout(Duration::from_secs(5), call)
            .await
            .unwrap_or_else(|_| panic!("stream={stream}: request against stalled upstream never returned"));
        assert_eq!(status, StatusCode::BAD_GATEWAY, "stream={stream}: {body}");
        let value: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["code"], "upstream_unreachable");
        assert!(value["error"].as_str().unwrap().contains("timed out"), "{body}");
    }
}

#[tokio::test]
async fn refused_connection_is_upstream_unreachable() {
    let closed = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let closed_addr = closed.local_addr().unwrap();
    drop(closed);

    let ctx = setup_with_runtime(gemini_credentials(), |runtime| {
        runtime.backends.gemini = format!("http://{closed_addr}/v1beta");
    })
    .await;
    let (status, _, body) = post_chat(
        &ctx,
        json!({"model": "gemini-2.0-flash", "messages": [{"role": "user", "content": "hi"}]}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY, "{body}");
    let value: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["code"], "upstream_unreachable");
    assert!(!value["error"].as_str().unwrap().contains(GEMINI_KEY), "{body}");
}

#[tokio::test]
async fn idle_stream_closes_with_single_terminator() {
    let ctx = setup_with_runtime(gemini_credentials(), |runtime| {
        runtime.stream_idle_timeout_ms = 300;
    })
    .await;
    let call = post_chat(
        &ctx,
        json!({
            "model": "gemini-2.0-flash",
            "messages": [{"role": "user", "content": "stream then stall"}],
            "stream": true
        }),
    );
    let (status, _, body) = tokio::time::timeout(Duration::from_secs(5), call)
        .await
        .expect("idle stream was never closed");
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, format!("{}data: [DONE]\n\n", canonical("Hel")));
}

#[tokio::test]
async fn oversized_body_gets_error_envelope() {
    let ctx = setup_with_runtime(gemini_credentials(), |runtime| {
        runtime.max_body_bytes = 1024;
    })
    .await;
    let (status, _, body) = post_chat(
        &ctx,
        json!({
            "model": "gemini-2.0-flash",
            "messages": [{"role": "user", "content": "x".repeat(4096)}]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    let value: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["code"], "payload_too_large");
    assert!(value["error"].as_str().unwrap().contains("1024"));
    assert_eq!(ctx.upstream.hits.load(Ordering::SeqCst), 0);
}
