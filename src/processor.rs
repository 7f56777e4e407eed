//! Request pipeline shared by the standalone server and the serverless function
//!
//! Everything that can fail before a stream is committed happens here: body
//! validation, rate-limit admission, memory recall and opening the upstream request.
//! A caller that gets `Ok` back owns a stream that is guaranteed to end with `done`.

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::Instrument;
use uuid::Uuid;

use crate::error::RelayError;
use crate::event::{MemoryMode, NormalizedStreamEvent};
use crate::memory::recall_for;
use crate::relay::{EventStream, relay_response};
use crate::state::AppState;
use crate::template::TemplateEngine;

/// Memory snippets requested per turn
const MEMORY_LIMIT: usize = 5;

/// Body of `POST /api/chat-stream` and `POST /api/chat`
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "server", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct ChatStreamRequest {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
}

impl ChatStreamRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            user_id: None,
            agent: None,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawChatRequest {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    agent: Option<String>,
}

/// Response of the non-streaming `POST /api/chat`
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "server", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct ChatReply {
    pub reply: String,
    pub memory_count: usize,
    pub memory_mode: MemoryMode,
}

/// Parse and validate a request body.
///
/// # Errors
///
/// `BadJson` when the body is not a JSON object of the right shape, `MissingMessage`
/// when `message` is absent or blank.
pub fn parse_chat_request(body: &[u8]) -> Result<ChatStreamRequest, RelayError> {
    let raw: RawChatRequest = serde_json::from_slice(body).map_err(|e| RelayError::bad_json(e.to_string()))?;

    let message = raw
        .message
        .filter(|m| !m.trim().is_empty())
        .ok_or(RelayError::MissingMessage)?;

    Ok(ChatStreamRequest {
        message,
        user_id: raw.user_id,
        agent: raw.agent,
    })
}

/// Rate-limit key for a caller: first forwarded hop, then the real-IP header, then
/// the socket peer.
#[must_use]
pub fn client_key(
    forwarded_for: Option<&str>,
    real_ip: Option<&str>,
    peer: Option<&str>,
) -> String {
    forwarded_for
        .and_then(|value| value.split(',').next())
        .into_iter()
        .chain(real_ip)
        .chain(peer)
        .map(str::trim)
        .find(|candidate| !candidate.is_empty())
        .unwrap_or("anonymous")
        .to_string()
}

fn admit(
    state: &AppState,
    key: &str,
) -> Result<(), RelayError> {
    if state.limiter.check(key) {
        return Ok(());
    }
    tracing::warn!(key, "Rate limited");
    Err(RelayError::RateLimited {
        retry_after: state.limiter.retry_after(key),
    })
}

/// Run everything up to the first streamed byte and hand back the event stream.
///
/// # Errors
///
/// Returns `RateLimited`, `UpstreamConnect` or `UpstreamStatus`; no stream is opened
/// in any of those cases.
pub async fn open_relay(
    state: &AppState,
    key: &str,
    request: &ChatStreamRequest,
) -> Result<EventStream, RelayError> {
    let span = tracing::info_span!("chat_stream", request_id = %Uuid::new_v4(), key);

    let opened = async {
        tracing::info!(agent = ?request.agent, "Opening chat stream");
        admit(state, key)?;

        let recall =
            recall_for(state.memory.as_ref(), request.user_id.as_deref(), &request.message, MEMORY_LIMIT).await;
        let messages = TemplateEngine::build_messages(
            &request.message,
            request.agent.as_deref(),
            &state.config.default_agent,
            &recall.snippets,
        );

        let response = state.upstream.open_stream(&messages).await?;
        tracing::info!(status = %response.status(), "Upstream stream opened");
        Ok::<_, RelayError>((response, recall))
    }
    .instrument(span.clone())
    .await;
    let (response, recall) = opened?;

    let mut events = relay_response(
        response,
        state.upstream.format(),
        NormalizedStreamEvent::telemetry(recall.snippets.len(), recall.mode),
        state.config.heartbeat_interval,
    );

    // keep the request span entered whenever the relay is polled
    Ok(Box::pin(futures::stream::poll_fn(move |cx| {
        let _entered = span.enter();
        events.poll_next_unpin(cx)
    })))
}

/// Non-streaming counterpart of [`open_relay`]
///
/// # Errors
///
/// Same failure modes as [`open_relay`].
pub async fn complete_chat(
    state: &AppState,
    key: &str,
    request: &ChatStreamRequest,
) -> Result<ChatReply, RelayError> {
    let span = tracing::info_span!("chat", request_id = %Uuid::new_v4(), key);

    async {
        tracing::info!("Processing chat completion");
        admit(state, key)?;

        let recall =
            recall_for(state.memory.as_ref(), request.user_id.as_deref(), &request.message, MEMORY_LIMIT).await;
        let messages = TemplateEngine::build_messages(
            &request.message,
            request.agent.as_deref(),
            &state.config.default_agent,
            &recall.snippets,
        );

        let reply = state.upstream.complete(&messages).await?;

        Ok(ChatReply {
            reply,
            memory_count: recall.snippets.len(),
            memory_mode: recall.mode,
        })
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_request() {
        let request = parse_chat_request(br#"{"message":"hi","userId":"u1","agent":"Nova"}"#).unwrap();
        assert_eq!(request.message, "hi");
        assert_eq!(request.user_id.as_deref(), Some("u1"));
        assert_eq!(request.agent.as_deref(), Some("Nova"));
    }

    #[test]
    fn test_parse_rejects_bad_json() {
        for body in [&b"{"[..], b"", b"\"hi\"", br#"{"message": 5}"#] {
            let err = parse_chat_request(body).unwrap_err();
            assert_eq!(err.code(), "bad_json", "body {:?}", String::from_utf8_lossy(body));
        }
    }

    #[test]
    fn test_parse_rejects_missing_message() {
        for body in [&br#"{}"#[..], br#"{"message":""}"#, br#"{"message":"   "}"#, br#"{"message":null}"#] {
            let err = parse_chat_request(body).unwrap_err();
            assert_eq!(err.code(), "missing_message");
        }
    }

    #[test]
    fn test_request_serializes_camel_case() {
        let mut request = ChatStreamRequest::new("hi");
        request.user_id = Some("u1".to_string());
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            serde_json::json!({ "message": "hi", "userId": "u1" })
        );
    }

    #[test]
    fn test_client_key_precedence() {
        assert_eq!(client_key(Some("203.0.113.7, 10.0.0.1"), Some("10.0.0.2"), Some("127.0.0.1")), "203.0.113.7");
        assert_eq!(client_key(None, Some("10.0.0.2"), Some("127.0.0.1")), "10.0.0.2");
        assert_eq!(client_key(Some(" "), None, Some("127.0.0.1")), "127.0.0.1");
        assert_eq!(client_key(None, None, None), "anonymous");
    }
}
