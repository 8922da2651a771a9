use crate::adapters::ProviderRequestDescriptor;
use crate::error::ChatError;
use axum::http::StatusCode;
use bytes::Bytes;
use futures_util::Stream;
use serde_json::Value;
use std::time::Duration;

/// Upstream error bodies are cut to this many characters before surfacing.
pub const ERROR_BODY_LIMIT: usize = 500;

/// A successful upstream answer whose body has not been read yet.
///
/// The body can be consumed exactly once: every consuming method takes `self`.
/// Code that needs to look at the payload before choosing how to forward it
/// must go through [`UpstreamResponse::into_json`] and work on the returned copy.
#[derive(Debug)]
pub struct UpstreamResponse {
    inner: reqwest::Response,
}

impl UpstreamResponse {
    pub fn status(&self) -> StatusCode {
        self.inner.status()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.inner
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
    }

    pub fn is_event_stream(&self) -> bool {
        self.content_type()
            .and_then(|ct| ct.split(';').next())
            .map(str::trim)
            .is_some_and(|ct| ct.eq_ignore_ascii_case("text/event-stream"))
    }

    pub async fn into_json(self) -> Result<Value, ChatError> {
        let text = self.inner.text().await.map_err(|err| {
            ChatError::UpstreamUnreachable(format!(
                "reading upstream body failed: {}",
                err.without_url()
            ))
        })?;
        serde_json::from_str(&text).map_err(|err| {
            ChatError::UnexpectedResponseShape(format!(
                "upstream body is not JSON ({err}): {}",
                truncate_chars(&text, ERROR_BODY_LIMIT)
            ))
        })
    }

    pub fn into_bytes_stream(self) -> impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static {
        self.inner.bytes_stream()
    }
}

/// How long an upstream exchange may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// Bounds the whole exchange, body included.
    Total(Duration),
    /// Bounds only the wait for response headers; the body is read under the
    /// stream idle timeout instead.
    Headers(Duration),
}

/// Sends the described request and classifies the outcome.
pub async fn dispatch(
    client: &reqwest::Client,
    backend: &str,
    descriptor: &ProviderRequestDescriptor,
    deadline: Deadline,
) -> Result<UpstreamResponse, ChatError> {
    let mut req = client.request(descriptor.method.clone(), &descriptor.url);
    for (name, value) in &descriptor.headers {
        req = req.header(name.as_str(), value.as_str());
    }
    req = req.json(&descriptor.body);

    let sent = match deadline {
        Deadline::Total(limit) => req.timeout(limit).send().await,
        Deadline::Headers(limit) => match tokio::time::timeout(limit, req.send()).await {
            Ok(sent) => sent,
            Err(_) => {
                count_transport_error(backend);
                return Err(ChatError::UpstreamUnreachable(format!(
                    "request timed out after {} ms waiting for response headers",
                    limit.as_millis()
                )));
            }
        },
    };
    let resp = sent.map_err(|err| {
        count_transport_error(backend);
        ChatError::UpstreamUnreachable(describe_transport_error(err))
    })?;
    let status = resp.status();
    metrics::counter!(
        "chatrelay_upstream_responses_total",
        "backend" => backend.to_string(),
        "status" => status.as_u16().to_string()
    )
    .increment(1);

    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        let body = truncate_chars(&text, ERROR_BODY_LIMIT);
        tracing::warn!(backend, status = status.as_u16(), body = %body, "upstream rejected request");
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ChatError::RateLimited { status, body });
        }
        return Err(ChatError::UpstreamRejected { status, body });
    }
    Ok(UpstreamResponse { inner: resp })
}

fn count_transport_error(backend: &str) {
    metrics::counter!(
        "chatrelay_upstream_responses_total",
        "backend" => backend.to_string(),
        "status" => "transport_error"
    )
    .increment(1);
}

fn describe_transport_error(err: reqwest::Error) -> String {
    let timed_out = err.is_timeout();
    let err = err.without_url();
    if timed_out {
        format!("request timed out: {err}")
    } else {
        err.to_string()
    }
}

pub fn truncate_chars(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
