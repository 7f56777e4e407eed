//! # companion-relay
//!
//! A streaming chat relay for companion apps. It accepts a chat message from a
//! browser, forwards it to an LLM provider, and re-emits the provider's incremental
//! output as a uniform Server-Sent Events stream.
//!
//! ## Features
//!
//! - **Normalized events**: every provider's envelope becomes `telemetry`, `delta`,
//!   `heartbeat`, `done` or `error`, and every stream ends with exactly one `done`
//! - **Per-client rate limiting**: token buckets keyed by client address
//! - **Upstream retries**: bounded exponential backoff with jitter on 429/5xx
//! - **Multiple providers**: OpenAI-compatible and Anthropic streaming formats
//! - **Client consumer**: a Rust consumer that understands every framing convention
//!   the relay has emitted
//!
//! ## Library Usage
//!
//! The relay core has no HTTP server dependency:
//!
//! ```toml
//! [dependencies]
//! companion-relay = { version = "0.1", default-features = false }
//! ```
//!
//! ### Consuming a stream
//!
//! ```rust,no_run
//! use companion_relay::client::{Callbacks, StreamOptions, stream_chat};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let options = StreamOptions::new("http://localhost:8080/api/chat-stream", "How was your day?")
//!         .with_user_id("user-42")
//!         .with_heartbeat_timeout(Duration::from_secs(30));
//!
//!     let stream = stream_chat(
//!         options,
//!         Callbacks::default()
//!             .on_token(|token| print!("{token}"))
//!             .on_done(|| println!())
//!             .on_error(|err| eprintln!("{err}")),
//!     );
//!
//!     stream.finished().await;
//! }
//! ```
//!
//! ### Relaying a provider stream
//!
//! ```rust,no_run
//! use companion_relay::chat::ChatMessage;
//! use companion_relay::config::{RelayConfig, UpstreamConfig};
//! use companion_relay::event::{MemoryMode, NormalizedStreamEvent};
//! use companion_relay::relay::{collect_sse, relay_response};
//! use companion_relay::upstream::{UpstreamClient, UpstreamFormat};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let config = RelayConfig::new(UpstreamConfig::new(
//!         UpstreamFormat::OpenAi,
//!         "https://api.openai.com/v1",
//!         Some("your-api-key".to_string()),
//!     ));
//!     let upstream = UpstreamClient::new(config.upstream.clone(), config.backoff.clone());
//!
//!     let response = upstream.open_stream(&[ChatMessage::user("hi")]).await?;
//!     let events = relay_response(
//!         response,
//!         upstream.format(),
//!         NormalizedStreamEvent::telemetry(0, MemoryMode::Off),
//!         config.heartbeat_interval,
//!     );
//!
//!     print!("{}", collect_sse(events).await);
//!     Ok(())
//! }
//! ```
//!
//! ## Server Mode
//!
//! The `server` feature (enabled by default) adds the actix-web routes and the
//! Vercel function. Run the standalone server with:
//!
//! ```bash
//! OPENAI_API_KEY=... cargo run
//! ```

// Core modules - always available
pub mod backoff;
pub mod chat;
pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod memory;
pub mod processor;
pub mod rate_limit;
pub mod relay;
pub mod sse;
pub mod state;
pub mod template;
pub mod upstream;

// Re-export commonly used types for easier access
pub use chat::{ChatMessage, ChatRole};
pub use client::{ChatStream, StreamError, StreamHandler, StreamOptions, stream_chat};
pub use config::RelayConfig;
pub use error::{ErrorResponse, RelayError};
pub use event::{MemoryMode, NormalizedStreamEvent};
pub use processor::{ChatReply, ChatStreamRequest};
pub use rate_limit::RateLimiter;
pub use state::AppState;

// Server-specific modules - only when server feature is enabled
#[cfg(feature = "server")]
pub mod server;
#[cfg(feature = "server")]
pub mod vercel;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_shapes() {
        assert_eq!(
            NormalizedStreamEvent::delta("Hel").to_json(),
            r#"{"type":"delta","content":"Hel"}"#
        );
        assert_eq!(NormalizedStreamEvent::Done {}.to_sse(), "data: {\"type\":\"done\"}\n\n");

        let telemetry = NormalizedStreamEvent::Telemetry {
            timestamp: 1_700_000_000_000,
            memory_count: 2,
            memory_mode: MemoryMode::Recall,
        };
        assert_eq!(
            serde_json::to_value(&telemetry).unwrap(),
            serde_json::json!({
                "type": "telemetry",
                "timestamp": 1_700_000_000_000_u64,
                "memoryCount": 2,
                "memoryMode": "recall"
            })
        );
    }

    #[test]
    fn test_error_response_structure() {
        let error = RelayError::RateLimited {
            retry_after: std::time::Duration::from_secs(3),
        };
        let body = error.to_error_response();

        assert_eq!(body.error, "rate_limited");
        assert_eq!(body.detail, None);
        assert_eq!(error.http_status(), 429);
    }

    #[test]
    fn test_request_defaults() {
        let request: ChatStreamRequest = serde_json::from_str(r#"{"message":"hi"}"#).unwrap();
        assert_eq!(request, ChatStreamRequest::new("hi"));
    }
}
