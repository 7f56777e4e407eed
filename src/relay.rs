//! Server-side SSE relay
//!
//! Turns the upstream provider's byte stream into normalized events. The stream
//! always opens with one `telemetry` event and always closes with exactly one
//! `done`, so a client never waits on a stream that will not finish.

use futures::stream::{Stream, StreamExt};
use std::fmt::Display;
use std::pin::Pin;
use std::time::Duration;

use crate::event::NormalizedStreamEvent;
use crate::sse::{SseDecoder, SseFrame};
use crate::upstream::{Decoded, UpstreamFormat};

/// Type alias for the stream returned by [`relay_events`]
pub type EventStream = Pin<Box<dyn Stream<Item = NormalizedStreamEvent> + Send>>;

/// Lifecycle of one relayed request
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum RelayPhase {
    AwaitingUpstream,
    Streaming,
    Closed,
    Failed,
}

enum Outcome {
    Eof,
    Finished,
    Failed(String),
}

/// Relay an upstream SSE byte stream as normalized events.
///
/// Deltas are emitted as soon as their record is complete, in arrival order. Records
/// that cannot be decoded are skipped. When `heartbeat` is set, a `heartbeat` event is
/// emitted whenever the upstream stays silent for that long.
#[must_use]
pub fn relay_events<S, B, E>(
    upstream: S,
    format: UpstreamFormat,
    telemetry: NormalizedStreamEvent,
    heartbeat: Option<Duration>,
) -> EventStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let events = async_stream::stream! {
        let mut upstream = Box::pin(upstream);
        let mut decoder = SseDecoder::new();
        let mut deltas = 0_usize;
        let mut skipped = 0_usize;
        let mut outcome = Outcome::Eof;

        tracing::debug!(phase = %RelayPhase::Streaming, %format, "Relay streaming");
        yield telemetry;

        'read: loop {
            let next = match heartbeat {
                Some(interval) => match tokio::time::timeout(interval, upstream.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        yield NormalizedStreamEvent::Heartbeat {};
                        continue;
                    }
                },
                None => upstream.next().await,
            };

            let (frames, eof): (Vec<SseFrame>, bool) = match next {
                Some(Ok(chunk)) => (decoder.push(chunk.as_ref()), false),
                Some(Err(e)) => {
                    outcome = Outcome::Failed(format!("Upstream stream interrupted: {e}"));
                    break;
                }
                None => (decoder.finish().into_iter().collect(), true),
            };

            for frame in frames {
                match format.decode(&frame) {
                    Decoded::Text(text) => {
                        deltas += 1;
                        yield NormalizedStreamEvent::delta(text);
                    }
                    Decoded::Skip => {
                        skipped += 1;
                        tracing::debug!(data = %frame.data, "Skipping undecodable upstream record");
                    }
                    Decoded::Finished => {
                        outcome = Outcome::Finished;
                        break 'read;
                    }
                    Decoded::Failed(message) => {
                        outcome = Outcome::Failed(message);
                        break 'read;
                    }
                }
            }

            if eof {
                break;
            }
        }

        match outcome {
            Outcome::Failed(message) => {
                tracing::warn!(phase = %RelayPhase::Failed, deltas, skipped, "Relay failed mid-stream: {}", message);
                yield NormalizedStreamEvent::error(message);
            }
            Outcome::Finished | Outcome::Eof => {
                tracing::info!(phase = %RelayPhase::Closed, deltas, skipped, "Relay completed");
            }
        }

        yield NormalizedStreamEvent::Done {};
    };

    Box::pin(events)
}

/// Relay a live `reqwest` response body
#[must_use]
pub fn relay_response(
    response: reqwest::Response,
    format: UpstreamFormat,
    telemetry: NormalizedStreamEvent,
    heartbeat: Option<Duration>,
) -> EventStream {
    relay_events(response.bytes_stream(), format, telemetry, heartbeat)
}

/// Drain an event stream into a single SSE body
pub async fn collect_sse(mut events: EventStream) -> String {
    let mut output = String::new();
    while let Some(event) = events.next().await {
        output.push_str(&event.to_sse());
    }
    output
}
