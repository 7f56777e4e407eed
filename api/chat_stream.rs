//! Vercel serverless function for the companion chat stream
//!
//! Same contract as `POST /api/chat-stream` on the standalone server, with the
//! event stream buffered into a single response body.

use companion_relay::vercel::{handle_chat_stream, shared_state};
use tracing_subscriber::EnvFilter;
use vercel_runtime::{Body, Error, Request, Response, run};

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!("Starting chat stream serverless function");

    run(handler).await
}

/// Handles incoming HTTP requests for the chat stream
///
/// # Errors
///
/// Returns an error if response building fails
pub async fn handler(req: Request) -> Result<Response<Body>, Error> {
    handle_chat_stream(shared_state(), req).await
}
