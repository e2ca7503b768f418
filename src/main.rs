//! Chat relay server

use axum::http::{header, HeaderValue, Method};
use chat_relay::api::{create_router, AppState};
use chat_relay::bridge::Bridge;
use chat_relay::config::ServerConfig;
use chat_relay::llm::{GeminiService, LlmConfig, LoggingService};
use chat_relay::relay::{Relay, RelayConfig};
use chat_relay::transcript::Transcript;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chat_relay=info,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(false),
        )
        .init();

    // Configuration
    let server_config = ServerConfig::from_env();
    let llm_config = LlmConfig::from_env();
    let relay_config = RelayConfig::from_env();

    tracing::info!(
        model = %llm_config.model,
        api_key = if llm_config.has_api_key() { "set" } else { "not set" },
        "Generation backend configured"
    );
    if !llm_config.has_api_key() {
        tracing::warn!("GOOGLE_API_KEY is not set; every reply will fail in-band");
    }

    let llm = Arc::new(LoggingService::new(Arc::new(GeminiService::new(&llm_config)?)));
    let bridge = Bridge::new(llm, relay_config.bridge);

    // The one conversation this process serves
    let transcript = Arc::new(Transcript::new());
    let state = AppState::new(Relay::new(transcript, bridge, relay_config));

    let cors = CorsLayer::new()
        .allow_origin(server_config.cors_origin.parse::<HeaderValue>()?)
        .allow_methods([Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    let app = create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], server_config.port));
    tracing::info!("Chat relay listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
