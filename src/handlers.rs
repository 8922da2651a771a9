use crate::adapters::ProviderAdapter;
use crate::app::AppState;
use crate::chat::{ChatRequestBody, UnifiedChatRequest};
use crate::error::{AppResult, ChatError};
use crate::stream;
use crate::upstream::{self, Deadline, UpstreamResponse};
use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::extract::rejection::BytesRejection;
use axum::http::header::{CACHE_CONTROL, CONNECTION, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde_json::{Value, json};
use std::convert::Infallible;
use std::time::{Duration, Instant};

const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

pub async fn list_models(State(state): State<AppState>) -> Response {
    let data = state.providers.describe(state.credentials.as_ref());
    Json(json!({ "object": "list", "data": data })).into_response()
}

/// `POST /api/chat`: one conversation turn, buffered or streamed.
pub async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> AppResult<Response> {
    let started_at = Instant::now();
    let outcome = match body {
        Ok(body) => handle_chat(&state, &headers, &body).await,
        Err(rejection) => Err(body_rejection(rejection, state.runtime.max_body_bytes)),
    };
    match outcome {
        Ok(resp) => {
            metrics::counter!("chatrelay_requests_total", "outcome" => "ok").increment(1);
            Ok(resp)
        }
        Err(err) => {
            metrics::counter!("chatrelay_requests_total", "outcome" => err.code()).increment(1);
            if err.status().is_server_error() {
                tracing::warn!(
                    code = err.code(),
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    "chat request failed: {err}"
                );
            } else {
                tracing::debug!(code = err.code(), "chat request rejected: {err}");
            }
            Err(err.into())
        }
    }
}

async fn handle_chat(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, ChatError> {
    ensure_json_content_type(headers)?;
    let raw: Value =
        serde_json::from_slice(body).map_err(|err| ChatError::MalformedRequest(err.to_string()))?;
    let parsed: ChatRequestBody = serde_json::from_value(raw)
        .map_err(|err| ChatError::InvalidRequest(format!("invalid chat request: {err}")))?;
    let req = UnifiedChatRequest::try_from(parsed)?;

    let call = state.providers.prepare(
        &req,
        state.credentials.as_ref(),
        state.runtime.system_prompt.as_deref(),
    )?;
    tracing::debug!(
        family = call.adapter.family(),
        backend = %call.backend,
        upstream_model = %call.upstream_model,
        stream = req.wants_stream,
        turns = req.turns.len(),
        has_image = req.attachment.is_some(),
        "dispatching chat request"
    );

    let request_timeout = Duration::from_millis(state.runtime.request_timeout_ms);
    let deadline = if req.wants_stream {
        Deadline::Headers(request_timeout)
    } else {
        Deadline::Total(request_timeout)
    };
    let upstream =
        upstream::dispatch(&state.http, &call.backend, &call.descriptor, deadline).await?;

    if req.wants_stream {
        let idle = Duration::from_millis(state.runtime.stream_idle_timeout_ms);
        return stream_reply(call.adapter, upstream, idle).await;
    }
    let value = upstream.into_json().await?;
    let reply = call.adapter.unwrap_reply(&value)?;
    Ok(Json(json!({ "reply": reply })).into_response())
}

async fn stream_reply(
    adapter: ProviderAdapter,
    upstream: UpstreamResponse,
    idle_timeout: Duration,
) -> Result<Response, ChatError> {
    if !upstream.is_event_stream() {
        tracing::debug!(
            content_type = ?upstream.content_type(),
            "upstream answered a streaming request without SSE, synthesizing frames"
        );
        let value = upstream.into_json().await?;
        let frames = stream::synthesize_frames(adapter, &value)?;
        let body = futures_util::stream::iter(frames.into_iter().map(Ok::<Bytes, Infallible>));
        return Ok(event_stream_response(Body::from_stream(body)));
    }
    let frames = stream::spawn_normalized(adapter, upstream, idle_timeout);
    Ok(event_stream_response(Body::from_stream(frames)))
}

fn event_stream_response(body: Body) -> Response {
    (
        [
            (CONTENT_TYPE, "text/event-stream"),
            (CACHE_CONTROL, "no-cache"),
            (CONNECTION, "keep-alive"),
            (X_ACCEL_BUFFERING, "no"),
        ],
        body,
    )
        .into_response()
}

fn body_rejection(rejection: BytesRejection, limit: usize) -> ChatError {
    if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ChatError::PayloadTooLarge { limit }
    } else {
        ChatError::MalformedRequest(rejection.body_text())
    }
}

fn ensure_json_content_type(headers: &HeaderMap) -> Result<(), ChatError> {
    let raw = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let parsed: Option<mime::Mime> = raw.parse().ok();
    let is_json = parsed.is_some_and(|m| {
        m.type_() == mime::APPLICATION
            && (m.subtype() == mime::JSON || m.suffix() == Some(mime::JSON))
    });
    if is_json {
        Ok(())
    } else if raw.is_empty() {
        Err(ChatError::UnsupportedMediaType("missing content-type".to_string()))
    } else {
        Err(ChatError::UnsupportedMediaType(raw.to_string()))
    }
}
