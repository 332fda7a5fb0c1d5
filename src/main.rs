//! # Voice Turn Backend - Main Application Entry Point
//!
//! Real-time voice conversation server. Each WebSocket connection is one conversation:
//! the client streams audio, the server transcribes it, asks a language model for a
//! reply, and streams the reply back as text and synthesized speech, one turn at a time.
//!
//! ## Application Architecture:
//! - **config**: application configuration (TOML file + environment variables)
//! - **state**: shared application state and session metrics
//! - **services**: STT, LLM and TTS provider clients
//! - **conversation**: turn orchestration (sink, aggregator, relays, turn controller, session loop)
//! - **websocket**: the `/ws` endpoint that connects a client to a session loop
//! - **health** / **handlers**: health, metrics and runtime configuration endpoints
//! - **error**: HTTP and conversation error types

mod config;
mod conversation;
mod error;
mod handlers;
mod health;
mod services;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::{read_shared, AppConfig, SharedConfig};
use conversation::Services;
use services::{ConversationHistory, DeepgramSpeak, DeepgramStt, GroqChat};
use state::AppState;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging** for debugging and monitoring
/// 3. **Builds the provider clients** shared by every voice session
/// 4. **Configures the HTTP server** with middleware and routes
/// 5. **Handles graceful shutdown** when receiving system signals
#[actix_web::main]
async fn main() -> Result<()> {
    // It's fine if there's no .env file
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-turn-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    if config.stt.api_key.is_empty() || config.llm.api_key.is_empty() || config.tts.api_key.is_empty() {
        warn!("One or more provider API keys are empty; sessions will fail when they reach that provider");
    }

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    let shared_config: SharedConfig = Arc::new(RwLock::new(config));
    let app_state = AppState::with_shared_config(shared_config.clone(), build_services(&shared_config));

    let shutdown = CancellationToken::new();
    setup_signal_handlers(shutdown.clone());

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config)),
            )
            .route("/health", web::get().to(health::health_check))
            .route("/ws", web::get().to(websocket::conversation_websocket))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = shutdown.cancelled() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// The provider clients every session shares. Endpoints and keys are fixed here; the
/// LLM client keeps the shared handle to pick up prompt and history changes.
fn build_services(shared: &SharedConfig) -> Services {
    let config = read_shared(shared);
    Services {
        stt: Arc::new(DeepgramStt::new(config.stt)),
        llm: Arc::new(GroqChat::new(shared.clone(), Arc::new(ConversationHistory::new()))),
        tts: Arc::new(DeepgramSpeak::new(config.tts)),
    }
}

/// Initialize the tracing (logging) system.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "voice_turn_backend=trace")
/// - If not set, defaults to "voice_turn_backend=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_turn_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Cancel `shutdown` on SIGTERM or SIGINT.
///
/// Graceful shutdown lets the server finish in-flight requests; open voice sessions
/// see their connections close and tear down their turns.
fn setup_signal_handlers(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let signals = (
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()),
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()),
        );
        let (mut sigterm, mut sigint) = match signals {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to install signal handlers, falling back to Ctrl+C: {}", e);
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to listen for Ctrl+C: {}", e);
                    return;
                }
                shutdown.cancel();
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }

        shutdown.cancel();
    });
}
