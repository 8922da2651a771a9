//! Conversion of upstream streaming bodies into canonical SSE delta frames:
//! `data: {"choices":[{"delta":{"content":..},..}]}\n\n` terminated by
//! `data: [DONE]\n\n`.

use crate::adapters::{ProviderAdapter, gemini};
use crate::error::ChatError;
use crate::upstream::UpstreamResponse;
use bytes::{Bytes, BytesMut};
use eventsource_stream::{Event, Eventsource};
use futures_util::{Stream, StreamExt, future, stream};
use serde::Serialize;
use serde_json::Value;
use std::convert::Infallible;
use std::fmt::Display;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";

/// Largest single SSE event handed to the event parser.
pub const MAX_PENDING_BYTES: usize = 4 * 1024 * 1024;

const EVENT_BOUNDARY: &[u8] = b"\n\n";

#[derive(Serialize)]
struct CanonicalChunk<'a> {
    choices: [CanonicalChoice<'a>; 1],
}

#[derive(Serialize)]
struct CanonicalChoice<'a> {
    delta: CanonicalDelta<'a>,
    index: u32,
    finish_reason: Option<&'a str>,
}

#[derive(Serialize)]
struct CanonicalDelta<'a> {
    content: &'a str,
}

pub fn canonical_frame(fragment: &str) -> Option<Bytes> {
    let chunk = CanonicalChunk {
        choices: [CanonicalChoice {
            delta: CanonicalDelta { content: fragment },
            index: 0,
            finish_reason: None,
        }],
    };
    match serde_json::to_string(&chunk) {
        Ok(json) => Some(Bytes::from(format!("data: {json}\n\n"))),
        Err(err) => {
            tracing::warn!(error = %err, "failed to encode canonical frame");
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizerState {
    /// No fragment emitted yet.
    AwaitingEvent,
    /// At least one canonical frame emitted.
    Emitting,
    /// End of body handled and the terminator emitted.
    Finished,
}

/// Rewrites the data of Gemini `alt=sse` events into canonical frames.
#[derive(Debug, Default)]
pub struct GeminiStreamNormalizer {
    emitted: usize,
    finished: bool,
}

impl GeminiStreamNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> NormalizerState {
        if self.finished {
            NormalizerState::Finished
        } else if self.emitted == 0 {
            NormalizerState::AwaitingEvent
        } else {
            NormalizerState::Emitting
        }
    }

    /// One frame per event; upstream `[DONE]`, error objects and malformed
    /// JSON yield nothing.
    pub fn convert(&mut self, data: &str) -> Option<Bytes> {
        if self.finished {
            return None;
        }
        let payload = data.trim();
        if payload.is_empty() || payload == "[DONE]" {
            return None;
        }
        let value: Value = match serde_json::from_str(payload) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    event_bytes = payload.len(),
                    "skipping malformed gemini stream event"
                );
                return None;
            }
        };
        if let Some(err) = value.get("error") {
            tracing::warn!(error = %err, "gemini reported an error mid-stream");
            return None;
        }
        let fragment = gemini::candidate_text(&value).unwrap_or_default();
        let frame = canonical_frame(&fragment)?;
        self.emitted += 1;
        Some(frame)
    }

    /// The terminator, exactly once.
    pub fn finish(&mut self) -> Option<Bytes> {
        if self.finished {
            return None;
        }
        self.finished = true;
        Some(Bytes::from_static(DONE_FRAME))
    }
}

/// Caps how many bytes of one event reach the SSE parser.
///
/// Past the limit the rest of the event is dropped up to its blank line, and a
/// blank line is fed in its place: the parser then flushes a truncated prefix
/// that fails JSON decoding and is skipped.
#[derive(Debug)]
struct EventSizeGuard {
    limit: usize,
    /// Bytes admitted since the last blank line.
    pending: usize,
    /// Last byte other than CR was LF; carried across chunks.
    after_lf: bool,
    discarding: bool,
}

impl EventSizeGuard {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            pending: 0,
            after_lf: false,
            discarding: false,
        }
    }

    fn admit(&mut self, chunk: Bytes) -> Option<Bytes> {
        let mut first_end = None;
        let mut last_end = None;
        for (idx, byte) in chunk.iter().enumerate() {
            match byte {
                b'\n' if self.after_lf => {
                    first_end.get_or_insert(idx + 1);
                    last_end = Some(idx + 1);
                    self.after_lf = false;
                }
                b'\n' => self.after_lf = true,
                b'\r' => {}
                _ => self.after_lf = false,
            }
        }

        if self.discarding {
            let resume = first_end?;
            self.discarding = false;
            self.pending = chunk.len() - last_end.unwrap_or(resume);
            let mut out = BytesMut::with_capacity(EVENT_BOUNDARY.len() + chunk.len() - resume);
            out.extend_from_slice(EVENT_BOUNDARY);
            out.extend_from_slice(&chunk[resume..]);
            return Some(out.freeze());
        }

        self.pending = match last_end {
            Some(end) => chunk.len() - end,
            None => self.pending + chunk.len(),
        };
        if self.pending <= self.limit {
            return Some(chunk);
        }
        tracing::warn!(
            pending_bytes = self.pending,
            limit = self.limit,
            "dropping oversized gemini stream event"
        );
        self.discarding = true;
        self.pending = 0;
        last_end.map(|end| chunk.slice(..end))
    }
}

/// SSE events of a Gemini body. A blank line is appended at end of body so an
/// unterminated last event is still delivered.
fn gemini_events<S, E>(body: S) -> impl Stream<Item = Result<Event, String>>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    let mut guard = EventSizeGuard::new(MAX_PENDING_BYTES);
    body.filter_map(move |item| {
        future::ready(match item {
            Ok(chunk) => guard.admit(chunk).map(Ok),
            Err(err) => Some(Err(err)),
        })
    })
    .chain(stream::once(future::ready(Ok(Bytes::from_static(
        EVENT_BOUNDARY,
    )))))
    .eventsource()
    .map(|item| item.map_err(|err| err.to_string()))
}

/// Remembers how a passthrough stream ended so a missing terminator can be added.
#[derive(Debug, Default)]
struct PassthroughTail {
    tail: Vec<u8>,
}

impl PassthroughTail {
    const KEEP: usize = 32;

    fn observe(&mut self, chunk: &[u8]) {
        let chunk = &chunk[chunk.len().saturating_sub(Self::KEEP)..];
        self.tail.extend(chunk.iter().copied().filter(|b| *b != b'\r'));
        if self.tail.len() > Self::KEEP {
            let excess = self.tail.len() - Self::KEEP;
            self.tail.drain(..excess);
        }
    }

    fn closing_frames(&self) -> Vec<Bytes> {
        let trimmed = self.tail.trim_ascii_end();
        if trimmed.ends_with(b"data: [DONE]") || trimmed.ends_with(b"data:[DONE]") {
            return Vec::new();
        }
        let mut frames = Vec::new();
        if !self.tail.is_empty() && !self.tail.ends_with(EVENT_BOUNDARY) {
            frames.push(Bytes::from_static(EVENT_BOUNDARY));
        }
        frames.push(Bytes::from_static(DONE_FRAME));
        frames
    }
}

enum Pull<T> {
    Item(T),
    Ended,
    ClientGone,
}

/// Next upstream item, unless the client left or the upstream stayed silent
/// for `idle_timeout`.
async fn pull<S>(stream: &mut S, tx: &mpsc::Sender<Bytes>, idle_timeout: Duration) -> Pull<S::Item>
where
    S: Stream + Unpin,
{
    tokio::select! {
        _ = tx.closed() => Pull::ClientGone,
        next = tokio::time::timeout(idle_timeout, stream.next()) => match next {
            Ok(Some(item)) => Pull::Item(item),
            Ok(None) => Pull::Ended,
            Err(_) => {
                tracing::warn!(
                    idle_timeout_ms = idle_timeout.as_millis() as u64,
                    "upstream stream went idle"
                );
                Pull::Ended
            }
        },
    }
}

async fn pump_gemini<S, E>(body: S, tx: &mpsc::Sender<Bytes>, idle_timeout: Duration)
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    let mut events = Box::pin(gemini_events(body));
    let mut normalizer = GeminiStreamNormalizer::new();
    loop {
        let event = match pull(&mut events, tx, idle_timeout).await {
            Pull::Item(Ok(event)) => event,
            Pull::Item(Err(err)) => {
                tracing::warn!(error = %err, "gemini stream read failed");
                break;
            }
            Pull::Ended => break,
            Pull::ClientGone => {
                tracing::debug!("client disconnected, aborting upstream stream");
                return;
            }
        };
        if let Some(frame) = normalizer.convert(&event.data) {
            if tx.send(frame).await.is_err() {
                return;
            }
        }
    }
    drop(events);
    if let Some(done) = normalizer.finish() {
        let _ = tx.send(done).await;
    }
}

async fn pump_passthrough<S, E>(body: S, tx: &mpsc::Sender<Bytes>, idle_timeout: Duration)
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    let mut body = Box::pin(body);
    let mut tail = PassthroughTail::default();
    loop {
        let chunk = match pull(&mut body, tx, idle_timeout).await {
            Pull::Item(Ok(chunk)) => chunk,
            Pull::Item(Err(err)) => {
                tracing::warn!(error = %err, "upstream stream read failed");
                break;
            }
            Pull::Ended => break,
            Pull::ClientGone => {
                tracing::debug!("client disconnected, aborting upstream stream");
                return;
            }
        };
        tail.observe(&chunk);
        if tx.send(chunk).await.is_err() {
            return;
        }
    }
    drop(body);
    for frame in tail.closing_frames() {
        if tx.send(frame).await.is_err() {
            return;
        }
    }
}

/// Pumps an upstream body through the adapter's normalizer on a task of its own.
///
/// The task stops as soon as the receiving side is dropped (client gone),
/// dropping the upstream body with it; no terminator is sent in that case.
pub fn spawn_pump<S, E>(
    adapter: ProviderAdapter,
    body: S,
    idle_timeout: Duration,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<Bytes>(64);
    tokio::spawn(async move {
        if adapter.is_natively_canonical_stream() {
            pump_passthrough(body, &tx, idle_timeout).await;
        } else {
            pump_gemini(body, &tx, idle_timeout).await;
        }
    });
    ReceiverStream::new(rx).map(Ok::<Bytes, Infallible>)
}

pub fn spawn_normalized(
    adapter: ProviderAdapter,
    upstream: UpstreamResponse,
    idle_timeout: Duration,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    let body = upstream
        .into_bytes_stream()
        .map(|item| item.map_err(reqwest::Error::without_url));
    spawn_pump(adapter, body, idle_timeout)
}

/// Canonical frames for an upstream that answered a streaming request with a
/// plain JSON body. A JSON array (Gemini's non-SSE stream form) yields one
/// frame per element.
pub fn synthesize_frames(adapter: ProviderAdapter, body: &Value) -> Result<Vec<Bytes>, ChatError> {
    let fragments: Vec<String> = match (adapter, body) {
        (ProviderAdapter::Gemini, Value::Array(items)) => items
            .iter()
            .map(|item| gemini::candidate_text(item).unwrap_or_default())
            .collect(),
        _ => vec![adapter.unwrap_reply(body)?],
    };
    let mut frames: Vec<Bytes> = fragments
        .iter()
        .filter_map(|fragment| canonical_frame(fragment))
        .collect();
    frames.push(Bytes::from_static(DONE_FRAME));
    Ok(frames)
}
