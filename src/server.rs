//! HTTP surface of the relay
//!
//! Routes are registered through [`configure`] so the binary and the integration
//! tests build the exact same app.

use actix_web::http::header::{self, HeaderValue};
use actix_web::http::{Method, StatusCode};
use actix_web::{HttpRequest, HttpResponse, Responder, ResponseError, web};
use actix_web_lab::sse::{self, Sse};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use utoipa::{OpenApi, ToSchema};

use crate::error::{ErrorResponse, RelayError};
use crate::event::MemoryMode;
use crate::processor::{ChatReply, ChatStreamRequest, client_key, complete_chat, open_relay, parse_chat_request};
use crate::state::AppState;

pub const ALLOWED_METHODS: &str = "POST, OPTIONS";
pub const ALLOWED_HEADERS: &str = "Content-Type, Authorization";

#[derive(Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(OpenApi)]
#[openapi(
    paths(chat_stream, chat, health),
    components(schemas(ChatStreamRequest, ChatReply, MemoryMode, ErrorResponse, HealthResponse))
)]
pub struct ApiDoc;

/// Register every relay route.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::resource("/api/chat-stream")
            .route(web::post().to(chat_stream))
            .route(web::method(Method::OPTIONS).to(preflight))
            .default_service(web::to(method_not_allowed)),
    )
    .service(
        web::resource("/api/chat")
            .route(web::post().to(chat))
            .route(web::method(Method::OPTIONS).to(preflight))
            .default_service(web::to(method_not_allowed)),
    )
    .service(web::resource("/api/health").route(web::get().to(health)));
}

fn header_str<'a>(
    req: &'a HttpRequest,
    name: &str,
) -> Option<&'a str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

fn request_key(req: &HttpRequest) -> String {
    let peer = req.peer_addr().map(|addr| addr.ip().to_string());
    client_key(
        header_str(req, "x-forwarded-for"),
        header_str(req, "x-real-ip"),
        peer.as_deref(),
    )
}

fn with_cors(
    req: &HttpRequest,
    state: &AppState,
    mut response: HttpResponse,
) -> HttpResponse {
    let origin = state.config.allow_origin(header_str(req, "origin"));
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&origin) {
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
    }
    headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static(ALLOWED_METHODS));
    headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static(ALLOWED_HEADERS));
    if origin != "*" {
        headers.insert(header::VARY, HeaderValue::from_static("Origin"));
    }
    response
}

#[utoipa::path(
    post,
    path = "/api/chat-stream",
    request_body = ChatStreamRequest,
    responses(
        (status = 200, description = "Normalized chat events", content_type = "text/event-stream"),
        (status = 400, description = "Invalid request body", body = ErrorResponse),
        (status = 429, description = "Rate limited", body = ErrorResponse),
        (status = 502, description = "Upstream failed before streaming", body = ErrorResponse)
    )
)]
pub async fn chat_stream(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> HttpResponse {
    let opened = match parse_chat_request(&body) {
        Ok(request) => open_relay(&state, &request_key(&req), &request).await,
        Err(e) => Err(e),
    };

    let response = match opened {
        Ok(events) => {
            let frames =
                events.map(|event| Ok::<_, actix_web::Error>(sse::Event::Data(sse::Data::new(event.to_json()))));

            Sse::from_stream(frames)
                .customize()
                .insert_header((header::CACHE_CONTROL, "no-cache, no-transform"))
                .insert_header((header::CONNECTION, "keep-alive"))
                .respond_to(&req)
                .map_into_boxed_body()
        }
        Err(e) => {
            tracing::warn!("Chat stream rejected: {}", e);
            e.error_response()
        }
    };

    with_cors(&req, &state, response)
}

#[utoipa::path(
    post,
    path = "/api/chat",
    request_body = ChatStreamRequest,
    responses(
        (status = 200, description = "Complete reply", body = ChatReply),
        (status = 400, description = "Invalid request body", body = ErrorResponse),
        (status = 429, description = "Rate limited", body = ErrorResponse),
        (status = 502, description = "Upstream failure", body = ErrorResponse)
    )
)]
pub async fn chat(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> HttpResponse {
    let completed = match parse_chat_request(&body) {
        Ok(request) => complete_chat(&state, &request_key(&req), &request).await,
        Err(e) => Err(e),
    };

    let response = match completed {
        Ok(reply) => HttpResponse::Ok().json(reply),
        Err(e) => {
            tracing::warn!("Chat rejected: {}", e);
            e.error_response()
        }
    };

    with_cors(&req, &state, response)
}

#[utoipa::path(
    get,
    path = "/api/health",
    responses((status = 200, description = "Service is up", body = HealthResponse))
)]
pub async fn health() -> web::Json<HealthResponse> {
    web::Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn preflight(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> HttpResponse {
    let response = HttpResponse::build(StatusCode::NO_CONTENT)
        .insert_header((header::ACCESS_CONTROL_MAX_AGE, "86400"))
        .finish();
    with_cors(&req, &state, response)
}

async fn method_not_allowed(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> HttpResponse {
    let mut response = RelayError::MethodNotAllowed.error_response();
    response
        .headers_mut()
        .insert(header::ALLOW, HeaderValue::from_static(ALLOWED_METHODS));
    with_cors(&req, &state, response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RelayConfig, UpstreamConfig};
    use crate::upstream::UpstreamFormat;
    use actix_web::{App, test};

    fn state(origin: &str) -> AppState {
        // nothing listens on port 9, so no test here may reach the upstream
        let mut config = RelayConfig::new(UpstreamConfig::new(
            UpstreamFormat::OpenAi,
            "http://127.0.0.1:9/v1",
            Some("test-key".to_string()),
        ));
        config.cors_allow_origin = origin.to_string();
        AppState::new(config)
    }

    #[actix_web::test]
    async fn test_preflight() {
        let app = test::init_service(App::new().app_data(web::Data::new(state("*"))).configure(configure)).await;
        let req = test::TestRequest::default()
            .method(Method::OPTIONS)
            .uri("/api/chat-stream")
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert_eq!(resp.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), "*");
        assert_eq!(resp.headers().get(header::ACCESS_CONTROL_ALLOW_METHODS).unwrap(), ALLOWED_METHODS);
    }

    #[actix_web::test]
    async fn test_echoed_origin() {
        let app = test::init_service(App::new().app_data(web::Data::new(state("echo"))).configure(configure)).await;
        let req = test::TestRequest::default()
            .method(Method::OPTIONS)
            .uri("/api/chat")
            .insert_header((header::ORIGIN, "https://app.example"))
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(
            resp.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "https://app.example"
        );
        assert_eq!(resp.headers().get(header::VARY).unwrap(), "Origin");
    }

    #[actix_web::test]
    async fn test_method_not_allowed() {
        let app = test::init_service(App::new().app_data(web::Data::new(state("*"))).configure(configure)).await;
        let req = test::TestRequest::get().uri("/api/chat-stream").to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(resp.headers().get(header::ALLOW).unwrap(), ALLOWED_METHODS);
        let body: ErrorResponse = test::read_body_json(resp).await;
        assert_eq!(body.error, "method_not_allowed");
    }

    #[actix_web::test]
    async fn test_validation_happens_before_upstream() {
        let app = test::init_service(App::new().app_data(web::Data::new(state("*"))).configure(configure)).await;

        let req = test::TestRequest::post()
            .uri("/api/chat-stream")
            .set_payload("{not json")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(resp.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), "*");
        let body: ErrorResponse = test::read_body_json(resp).await;
        assert_eq!(body.error, "bad_json");

        let req = test::TestRequest::post()
            .uri("/api/chat")
            .set_payload(r#"{"message":"  "}"#)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: ErrorResponse = test::read_body_json(resp).await;
        assert_eq!(body.error, "missing_message");
    }

    #[actix_web::test]
    async fn test_health() {
        let app = test::init_service(App::new().app_data(web::Data::new(state("*"))).configure(configure)).await;
        let req = test::TestRequest::get().uri("/api/health").to_request();
        let body: HealthResponse = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body.status, "ok");
    }

    #[test]
    fn test_openapi_lists_routes() {
        let doc = ApiDoc::openapi();
        assert!(doc.paths.paths.contains_key("/api/chat-stream"));
        assert!(doc.paths.paths.contains_key("/api/chat"));
        assert!(doc.paths.paths.contains_key("/api/health"));
    }
}
