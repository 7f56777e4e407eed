#![allow(dead_code)]

use actix_web::http::StatusCode;
use actix_web::{App, HttpResponse, HttpServer, web};
use companion_relay::backoff::BackoffPolicy;
use companion_relay::config::{RateLimitConfig, RelayConfig, UpstreamConfig};
use companion_relay::event::NormalizedStreamEvent;
use companion_relay::sse::SseDecoder;
use companion_relay::upstream::UpstreamFormat;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Scripted LLM provider
#[derive(Clone)]
pub struct FakeUpstream {
    pub status: u16,
    pub sse: String,
    pub reply: String,
    pub attempts: Arc<AtomicU32>,
    pub last_body: Arc<Mutex<Option<Value>>>,
}

impl FakeUpstream {
    pub fn streaming(sse: impl Into<String>) -> Self {
        Self {
            status: 200,
            sse: sse.into(),
            reply: "Hello there".to_string(),
            attempts: Arc::new(AtomicU32::new(0)),
            last_body: Arc::new(Mutex::new(None)),
        }
    }

    pub fn failing(status: u16) -> Self {
        Self {
            status,
            ..Self::streaming("")
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn last_body(&self) -> Value {
        self.last_body.lock().unwrap().clone().expect("upstream was called")
    }
}

pub fn openai_sse(parts: &[&str]) -> String {
    let mut body: String = parts
        .iter()
        .map(|part| format!("data: {}\n\n", json!({ "choices": [{ "index": 0, "delta": { "content": part } }] })))
        .collect();
    body.push_str("data: [DONE]\n\n");
    body
}

async fn completions(
    body: web::Json<Value>,
    fake: web::Data<FakeUpstream>,
) -> HttpResponse {
    fake.attempts.fetch_add(1, Ordering::SeqCst);
    *fake.last_body.lock().unwrap() = Some(body.0.clone());

    if fake.status != 200 {
        return HttpResponse::build(StatusCode::from_u16(fake.status).unwrap())
            .content_type("application/json")
            .body(r#"{"error":{"message":"upstream exploded"}}"#);
    }

    if body.get("stream") == Some(&Value::Bool(true)) {
        return HttpResponse::Ok()
            .content_type("text/event-stream")
            .body(fake.sse.clone());
    }

    HttpResponse::Ok().json(json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "created": 1_700_000_000,
        "model": "gpt-4o-mini",
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": fake.reply },
            "finish_reason": "stop"
        }],
        "usage": { "prompt_tokens": 10, "completion_tokens": 2, "total_tokens": 12 }
    }))
}

/// Serve `fake` on an ephemeral port and return its base URL.
pub fn start_upstream(fake: FakeUpstream) -> String {
    let data = web::Data::new(fake);
    let server = HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .route("/v1/chat/completions", web::post().to(completions))
            .route("/v1/messages", web::post().to(completions))
    })
    .workers(1)
    .bind(("127.0.0.1", 0))
    .unwrap();

    let addr = server.addrs()[0];
    actix_web::rt::spawn(server.run());
    format!("http://{addr}/v1")
}

pub fn relay_config(
    format: UpstreamFormat,
    base_url: &str,
) -> RelayConfig {
    let mut config = RelayConfig::new(UpstreamConfig::new(format, base_url, Some("test-key".to_string())));
    config.backoff = BackoffPolicy {
        max_retries: 2,
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        jitter: Duration::ZERO,
    };
    config.rate_limit = RateLimitConfig {
        capacity: 5,
        refill_per_second: 0.001,
        ..RateLimitConfig::default()
    };
    config.heartbeat_interval = None;
    config
}

/// Parse a buffered SSE body into events
pub fn parse_events(body: &[u8]) -> Vec<NormalizedStreamEvent> {
    let mut decoder = SseDecoder::new();
    let mut frames = decoder.push(body);
    frames.extend(decoder.finish());
    frames
        .iter()
        .map(|frame| serde_json::from_str(&frame.data).expect("normalized event"))
        .collect()
}
