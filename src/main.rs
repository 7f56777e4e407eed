use actix_web::{App, HttpServer, web};
use companion_relay::config::RelayConfig;
use companion_relay::server::{ApiDoc, configure};
use companion_relay::state::AppState;
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = RelayConfig::from_env();
    if config.upstream.api_key.is_none() {
        tracing::warn!("No upstream API key configured; chat requests will fail upstream");
    }

    let bind_addr = config.bind_addr.clone();
    tracing::info!(
        format = %config.upstream.format,
        model = %config.upstream.model,
        "Starting server at http://{}/swagger-ui/",
        bind_addr
    );

    let state = web::Data::new(AppState::new(config));

    // Swagger UI at /swagger-ui/, OpenAPI document at /api-doc/openapi.json
    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .configure(configure)
            .service(SwaggerUi::new("/swagger-ui/{_:.*}").url("/api-doc/openapi.json", ApiDoc::openapi()))
    })
    .bind(bind_addr)?
    .run()
    .await
}
