//! Client-side consumer for `/api/chat-stream`
//!
//! [`stream_chat`] posts a message, reads the SSE response incrementally and
//! dispatches each frame to a [`StreamHandler`]. It understands every framing
//! convention the relay has used over time:
//!
//! - an explicit `event:` field (`event: delta` / `data: Hel`)
//! - a bracketed prefix in the payload (`data: [delta] Hel`)
//! - a `type` field in a JSON payload (`data: {"type":"delta","content":"Hel"}`)
//!
//! The order in which these are consulted is configurable through [`FrameParser`].
//! Payloads that match none of them are treated as plain delta text.
//!
//! ```no_run
//! use companion_relay::client::{Callbacks, StreamOptions, stream_chat};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let options = StreamOptions::new("http://localhost:8080/api/chat-stream", "hi");
//! let stream = stream_chat(
//!     options,
//!     Callbacks::default()
//!         .on_token(|token| print!("{token}"))
//!         .on_error(|err| eprintln!("{err}")),
//! );
//! stream.finished().await;
//! # }
//! ```

use futures::StreamExt;
use regex::Regex;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::backoff::{self, BackoffPolicy};
use crate::error::ErrorResponse;
use crate::event::{EventKind, MemoryMode, NormalizedStreamEvent, now_millis};
use crate::processor::ChatStreamRequest;
use crate::sse::{SseDecoder, SseFrame};

static BRACKET_MARKER: OnceLock<Regex> = OnceLock::new();

/// Where a frame's marker may come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerSource {
    EventField,
    BracketPrefix,
    JsonType,
}

/// Maps raw frames onto normalized events
#[derive(Debug, Clone)]
pub struct FrameParser {
    precedence: Vec<MarkerSource>,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self {
            precedence: vec![MarkerSource::EventField, MarkerSource::BracketPrefix, MarkerSource::JsonType],
        }
    }
}

impl FrameParser {
    /// Consult marker sources in the given order. Sources left out are ignored.
    #[must_use]
    pub fn with_precedence(precedence: Vec<MarkerSource>) -> Self {
        Self { precedence }
    }

    /// Classify one frame. Returns `None` for frames that carry nothing.
    #[must_use]
    pub fn classify(
        &self,
        frame: &SseFrame,
    ) -> Option<NormalizedStreamEvent> {
        for source in &self.precedence {
            if let Some((kind, payload)) = Self::marker(*source, frame) {
                return Some(build_event(kind, payload));
            }
        }

        if frame.data.is_empty() {
            return None;
        }
        Some(NormalizedStreamEvent::delta(frame.data.clone()))
    }

    fn marker(
        source: MarkerSource,
        frame: &SseFrame,
    ) -> Option<(EventKind, &str)> {
        match source {
            MarkerSource::EventField => {
                let kind = EventKind::from_str(frame.event.as_deref()?.trim()).ok()?;
                Some((kind, frame.data.as_str()))
            }
            MarkerSource::BracketPrefix => {
                let pattern = BRACKET_MARKER.get_or_init(|| {
                    Regex::new(r"^\[(telemetry|delta|heartbeat|done|error)\] ?").expect("valid marker pattern")
                });
                let captures = pattern.captures(&frame.data)?;
                let kind = EventKind::from_str(captures.get(1)?.as_str()).ok()?;
                let rest = &frame.data[captures.get(0)?.end()..];
                Some((kind, rest))
            }
            MarkerSource::JsonType => {
                let value: Value = serde_json::from_str(&frame.data).ok()?;
                let kind = EventKind::from_str(value.get("type")?.as_str()?).ok()?;
                Some((kind, frame.data.as_str()))
            }
        }
    }
}

/// Build an event from its marker and whatever payload accompanied it.
fn build_event(
    kind: EventKind,
    payload: &str,
) -> NormalizedStreamEvent {
    let json: Option<Value> = serde_json::from_str(payload).ok();
    let field = |name: &str| json.as_ref().and_then(|v| v.get(name)).cloned();

    match kind {
        EventKind::Telemetry => NormalizedStreamEvent::Telemetry {
            timestamp: field("timestamp").and_then(|v| v.as_u64()).unwrap_or_else(now_millis),
            memory_count: field("memoryCount")
                .and_then(|v| v.as_u64())
                .and_then(|n| usize::try_from(n).ok())
                .unwrap_or(0),
            memory_mode: field("memoryMode")
                .and_then(|v| v.as_str().and_then(|s| MemoryMode::from_str(s).ok()))
                .unwrap_or(MemoryMode::Off),
        },
        EventKind::Delta => {
            let content = match &json {
                Some(Value::String(text)) => text.clone(),
                Some(Value::Object(map)) => match map.get("content") {
                    Some(Value::String(text)) => text.clone(),
                    _ => payload.to_string(),
                },
                _ => payload.to_string(),
            };
            NormalizedStreamEvent::delta(content)
        }
        EventKind::Heartbeat => NormalizedStreamEvent::Heartbeat {},
        EventKind::Done => NormalizedStreamEvent::Done {},
        EventKind::Error => {
            let message = field("message")
                .or_else(|| field("error"))
                .and_then(|v| v.as_str().map(str::to_string))
                .or_else(|| json.as_ref().and_then(|v| v.as_str().map(str::to_string)))
                .unwrap_or_else(|| payload.trim().to_string());
            NormalizedStreamEvent::error(if message.is_empty() { "stream error".to_string() } else { message })
        }
    }
}

/// Telemetry as delivered to [`StreamHandler::on_telemetry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Telemetry {
    pub timestamp: u64,
    pub memory_count: usize,
    pub memory_mode: MemoryMode,
}

/// Why a stream ended without `done`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// Failed before the first byte of the stream
    NotStarted { status: Option<u16>, message: String },
    /// Error event or read failure after streaming began
    MidStream(String),
    /// No frame arrived within the heartbeat window
    Timeout(Duration),
}

impl fmt::Display for StreamError {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            StreamError::NotStarted {
                status: Some(status),
                message,
            } => write!(f, "Stream not started (HTTP {}): {}", status, message),
            StreamError::NotStarted { status: None, message } => write!(f, "Stream not started: {}", message),
            StreamError::MidStream(message) => write!(f, "Stream failed: {}", message),
            StreamError::Timeout(window) => write!(f, "No frame for {}ms", window.as_millis()),
        }
    }
}

impl std::error::Error for StreamError {}

impl StreamError {
    /// Whether any part of the stream was received
    #[must_use]
    pub const fn started(&self) -> bool {
        !matches!(self, StreamError::NotStarted { .. })
    }
}

/// Receives stream callbacks. Every method defaults to a no-op.
pub trait StreamHandler: Send + 'static {
    fn on_token(
        &mut self,
        _token: &str,
    ) {
    }

    fn on_telemetry(
        &mut self,
        _telemetry: &Telemetry,
    ) {
    }

    fn on_heartbeat(&mut self) {}

    fn on_done(&mut self) {}

    fn on_error(
        &mut self,
        _error: &StreamError,
    ) {
    }
}

/// Closure-based [`StreamHandler`]
#[derive(Default)]
pub struct Callbacks {
    token: Option<Box<dyn FnMut(&str) + Send>>,
    telemetry: Option<Box<dyn FnMut(&Telemetry) + Send>>,
    heartbeat: Option<Box<dyn FnMut() + Send>>,
    done: Option<Box<dyn FnMut() + Send>>,
    error: Option<Box<dyn FnMut(&StreamError) + Send>>,
}

impl Callbacks {
    #[must_use]
    pub fn on_token(
        mut self,
        f: impl FnMut(&str) + Send + 'static,
    ) -> Self {
        self.token = Some(Box::new(f));
        self
    }

    #[must_use]
    pub fn on_telemetry(
        mut self,
        f: impl FnMut(&Telemetry) + Send + 'static,
    ) -> Self {
        self.telemetry = Some(Box::new(f));
        self
    }

    #[must_use]
    pub fn on_heartbeat(
        mut self,
        f: impl FnMut() + Send + 'static,
    ) -> Self {
        self.heartbeat = Some(Box::new(f));
        self
    }

    #[must_use]
    pub fn on_done(
        mut self,
        f: impl FnMut() + Send + 'static,
    ) -> Self {
        self.done = Some(Box::new(f));
        self
    }

    #[must_use]
    pub fn on_error(
        mut self,
        f: impl FnMut(&StreamError) + Send + 'static,
    ) -> Self {
        self.error = Some(Box::new(f));
        self
    }
}

impl StreamHandler for Callbacks {
    fn on_token(
        &mut self,
        token: &str,
    ) {
        if let Some(f) = self.token.as_mut() {
            f(token);
        }
    }

    fn on_telemetry(
        &mut self,
        telemetry: &Telemetry,
    ) {
        if let Some(f) = self.telemetry.as_mut() {
            f(telemetry);
        }
    }

    fn on_heartbeat(&mut self) {
        if let Some(f) = self.heartbeat.as_mut() {
            f();
        }
    }

    fn on_done(&mut self) {
        if let Some(f) = self.done.as_mut() {
            f();
        }
    }

    fn on_error(
        &mut self,
        error: &StreamError,
    ) {
        if let Some(f) = self.error.as_mut() {
            f(error);
        }
    }
}

/// Connection settings for [`stream_chat`]
#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub endpoint: String,
    pub request: ChatStreamRequest,
    /// Cancel with [`StreamError::Timeout`] when no frame arrives for this long
    pub heartbeat_timeout: Option<Duration>,
    /// Retry policy for the initial POST; no retries by default
    pub retry: BackoffPolicy,
    pub parser: FrameParser,
    pub http: reqwest::Client,
}

impl StreamOptions {
    pub fn new(
        endpoint: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            request: ChatStreamRequest::new(message),
            heartbeat_timeout: None,
            retry: BackoffPolicy::none(),
            parser: FrameParser::default(),
            http: reqwest::Client::new(),
        }
    }

    #[must_use]
    pub fn with_user_id(
        mut self,
        user_id: impl Into<String>,
    ) -> Self {
        self.request.user_id = Some(user_id.into());
        self
    }

    #[must_use]
    pub fn with_agent(
        mut self,
        agent: impl Into<String>,
    ) -> Self {
        self.request.agent = Some(agent.into());
        self
    }

    #[must_use]
    pub const fn with_heartbeat_timeout(
        mut self,
        window: Duration,
    ) -> Self {
        self.heartbeat_timeout = Some(window);
        self
    }

    #[must_use]
    pub fn with_retry(
        mut self,
        retry: BackoffPolicy,
    ) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_parser(
        mut self,
        parser: FrameParser,
    ) -> Self {
        self.parser = parser;
        self
    }
}

/// How a consumed stream ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// `done` marker or EOF reached
    Completed,
    /// Never started, or the read failed
    Failed,
    TimedOut,
    Cancelled,
}

/// Handle to a running stream
pub struct ChatStream {
    cancelled: Arc<AtomicBool>,
    task: JoinHandle<StreamOutcome>,
}

impl ChatStream {
    /// Stop reading.
    ///
    /// No new callback starts after this returns, and `on_done`/`on_error` will not
    /// fire. A callback already running on the stream's task may still finish.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.task.abort();
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the stream to end.
    pub async fn finished(self) -> StreamOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(_) => StreamOutcome::Cancelled,
        }
    }
}

/// Gates every callback behind the cancellation flag
struct Dispatcher<H> {
    handler: H,
    cancelled: Arc<AtomicBool>,
}

impl<H: StreamHandler> Dispatcher<H> {
    fn live(&self) -> bool {
        !self.cancelled.load(Ordering::SeqCst)
    }

    fn error(
        &mut self,
        error: &StreamError,
    ) {
        if self.live() {
            tracing::debug!("Chat stream error: {}", error);
            self.handler.on_error(error);
        }
    }

    fn done(&mut self) {
        if self.live() {
            self.handler.on_done();
        }
    }

    /// Returns `true` when the event ends the stream.
    fn dispatch(
        &mut self,
        event: NormalizedStreamEvent,
    ) -> bool {
        if !self.live() {
            return true;
        }
        match event {
            NormalizedStreamEvent::Telemetry {
                timestamp,
                memory_count,
                memory_mode,
            } => self.handler.on_telemetry(&Telemetry {
                timestamp,
                memory_count,
                memory_mode,
            }),
            NormalizedStreamEvent::Delta { content } => self.handler.on_token(&content),
            NormalizedStreamEvent::Heartbeat {} => self.handler.on_heartbeat(),
            NormalizedStreamEvent::Error { message } => self.error(&StreamError::MidStream(message)),
            NormalizedStreamEvent::Done {} => {
                self.done();
                return true;
            }
        }
        false
    }
}

/// Start streaming a chat turn. Callbacks run on a spawned task.
pub fn stream_chat<H: StreamHandler>(
    options: StreamOptions,
    handler: H,
) -> ChatStream {
    let cancelled = Arc::new(AtomicBool::new(false));
    let dispatcher = Dispatcher {
        handler,
        cancelled: cancelled.clone(),
    };

    let task = tokio::spawn(consume(options, dispatcher));
    ChatStream { cancelled, task }
}

async fn consume<H: StreamHandler>(
    options: StreamOptions,
    mut dispatcher: Dispatcher<H>,
) -> StreamOutcome {
    let StreamOptions {
        endpoint,
        request,
        heartbeat_timeout,
        retry,
        parser,
        http,
    } = options;

    let sent = backoff::issue(&retry, || {
        http.post(&endpoint)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&request)
            .send()
    })
    .await;

    let response = match sent {
        Ok(response) if response.status().is_success() => response,
        Ok(response) => {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorResponse>(&body)
                .map(|e| e.error)
                .unwrap_or(body);
            dispatcher.error(&StreamError::NotStarted {
                status: Some(status),
                message,
            });
            return StreamOutcome::Failed;
        }
        Err(e) => {
            dispatcher.error(&StreamError::NotStarted {
                status: None,
                message: e.to_string(),
            });
            return StreamOutcome::Failed;
        }
    };

    let mut body = Box::pin(response.bytes_stream());
    let mut decoder = SseDecoder::new();
    // The watchdog only moves on complete frames, so a trickle of bytes that
    // never finishes a frame still times out.
    let mut deadline = heartbeat_timeout.map(|window| (window, Instant::now() + window));

    loop {
        let next = match deadline {
            Some((window, at)) => match tokio::time::timeout_at(at, body.next()).await {
                Ok(next) => next,
                Err(_) => {
                    dispatcher.error(&StreamError::Timeout(window));
                    return StreamOutcome::TimedOut;
                }
            },
            None => body.next().await,
        };

        let (frames, eof): (Vec<SseFrame>, bool) = match next {
            Some(Ok(chunk)) => (decoder.push(&chunk), false),
            Some(Err(e)) => {
                dispatcher.error(&StreamError::MidStream(e.to_string()));
                return StreamOutcome::Failed;
            }
            None => (decoder.finish().into_iter().collect(), true),
        };

        if !frames.is_empty() {
            if let Some((window, at)) = deadline.as_mut() {
                *at = Instant::now() + *window;
            }
        }

        for event in frames.iter().filter_map(|frame| parser.classify(frame)) {
            if dispatcher.dispatch(event) {
                return if dispatcher.live() {
                    StreamOutcome::Completed
                } else {
                    StreamOutcome::Cancelled
                };
            }
        }

        if eof {
            dispatcher.done();
            return StreamOutcome::Completed;
        }
    }
}
