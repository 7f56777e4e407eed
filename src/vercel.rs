//! Vercel serverless function adapter module
//!
//! Vercel functions cannot hold a response open, so the event stream is drained
//! into one SSE body before returning. Status codes, headers and error JSON are the
//! same as the standalone server.

use std::sync::OnceLock;
use vercel_runtime::{Body, Error, Request, Response, StatusCode};

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::processor::{client_key, open_relay, parse_chat_request};
use crate::relay::collect_sse;
use crate::state::AppState;

static STATE: OnceLock<AppState> = OnceLock::new();

/// Process-wide state; limiter buckets survive across warm invocations.
pub fn shared_state() -> &'static AppState {
    STATE.get_or_init(|| AppState::new(RelayConfig::from_env()))
}

fn header<'a>(
    req: &'a Request,
    name: &str,
) -> Option<&'a str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

fn allow_origin(
    state: &AppState,
    req: &Request,
) -> String {
    state.config.allow_origin(header(req, "origin"))
}

/// JSON error with CORS headers
///
/// # Errors
///
/// Returns an error if the response cannot be built.
pub fn error_response(
    err: &RelayError,
    origin: &str,
) -> Result<Response<Body>, Error> {
    let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = serde_json::to_string(&err.to_error_response()).unwrap_or_else(|_| "{}".to_string());

    let mut builder = Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", origin);
    if let Some(secs) = err.retry_after_secs() {
        builder = builder.header("Retry-After", secs.to_string());
    }
    if matches!(err, RelayError::MethodNotAllowed) {
        builder = builder.header("Allow", "POST, OPTIONS");
    }
    Ok(builder.body(body.into())?)
}

/// Handle one invocation of the `chat_stream` function.
///
/// # Errors
///
/// Returns an error only if a response cannot be built.
pub async fn handle_chat_stream(
    state: &AppState,
    req: Request,
) -> Result<Response<Body>, Error> {
    tracing::info!("Received request: {} {}", req.method(), req.uri().path());
    let origin = allow_origin(state, &req);

    if req.method() == "OPTIONS" {
        return Ok(Response::builder()
            .status(StatusCode::NO_CONTENT)
            .header("Access-Control-Allow-Origin", origin.as_str())
            .header("Access-Control-Allow-Methods", "POST, OPTIONS")
            .header("Access-Control-Allow-Headers", "Content-Type, Authorization")
            .header("Access-Control-Max-Age", "86400")
            .body(Body::Empty)?);
    }

    if req.method() != "POST" {
        return error_response(&RelayError::MethodNotAllowed, &origin);
    }

    let request = match parse_chat_request(req.body()) {
        Ok(request) => request,
        Err(e) => {
            tracing::error!("Rejected request body: {}", e);
            return error_response(&e, &origin);
        }
    };

    let key = client_key(header(&req, "x-forwarded-for"), header(&req, "x-real-ip"), None);
    let events = match open_relay(state, &key, &request).await {
        Ok(events) => events,
        Err(e) => return error_response(&e, &origin),
    };

    let output = collect_sse(events).await;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache, no-transform")
        .header("Connection", "keep-alive")
        .header("Access-Control-Allow-Origin", origin.as_str())
        .header("Access-Control-Allow-Methods", "POST, OPTIONS")
        .body(output.into())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_rate_limited() {
        let err = RelayError::RateLimited {
            retry_after: std::time::Duration::from_millis(1500),
        };
        let response = error_response(&err, "*").unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get("Retry-After").unwrap(), "2");
        assert_eq!(response.headers().get("Access-Control-Allow-Origin").unwrap(), "*");
    }

    #[test]
    fn test_error_response_body() {
        let response = error_response(&RelayError::MissingMessage, "https://app.example").unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers().get("Content-Type").unwrap(), "application/json");
        assert_eq!(
            response.headers().get("Access-Control-Allow-Origin").unwrap(),
            "https://app.example"
        );
    }

    #[test]
    fn test_method_not_allowed_lists_methods() {
        let response = error_response(&RelayError::MethodNotAllowed, "*").unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers().get("Allow").unwrap(), "POST, OPTIONS");
    }
}
