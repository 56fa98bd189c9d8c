//! Counsel Gateway - HTTP service for the dialogue session manager.
//!
//! This crate exposes the dialogue core over HTTP:
//! - Chat endpoint running the per-message pipeline
//! - Session lifecycle (close, escalate, clear, retitle, delete)
//! - Message log reads
//! - OpenAI-compatible generation backend with retry
//!
//! ## Architecture
//!
//! ```text
//! Client → Gateway (routes) → SessionManager → SessionStore (SQLite)
//!                                   ↓
//!                          Generator (chat completions, retried)
//! ```

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod provider;
pub mod routes;

pub use provider::{build_generator, ChatCompletionsGenerator, RetryConfig, RetryingGenerator};
pub use routes::{build_all_routes, AppState};

use anyhow::Context;
use axum::Router;
use counsel_common::config::Config;
use counsel_dialogue::{
    Generator, InMemorySessionStore, SessionManager, SessionStore, SqliteSessionStore,
};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Open the session store named by the configuration.
pub fn build_store(config: &Config) -> anyhow::Result<Arc<dyn SessionStore>> {
    match config.storage.backend.as_str() {
        "memory" => Ok(Arc::new(InMemorySessionStore::new())),
        _ => {
            let path = config.storage.db_path();
            let store = SqliteSessionStore::open(&path)
                .with_context(|| format!("Failed to open session store at {}", path.display()))?;
            tracing::info!(path = %path.display(), "Session store opened");
            Ok(Arc::new(store))
        }
    }
}

/// Assemble application state from configuration and a generator.
pub fn build_state(config: &Config, generator: Arc<dyn Generator>) -> anyhow::Result<AppState> {
    let store = build_store(config)?;
    let manager = SessionManager::new(store, generator, &config.dialogue, &config.safety)?;
    Ok(AppState::new(Arc::new(manager)))
}

/// Build the gateway router with all routes and middleware.
pub fn build_router(config: &Config, state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    routes::build_all_routes(state).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(TimeoutLayer::new(Duration::from_secs(
                config.gateway.request_timeout_secs,
            )))
            .layer(cors),
    )
}

/// Start the gateway server.
pub async fn start_server(config: &Config) -> anyhow::Result<()> {
    let addr = config.bind_address();

    let generator = build_generator(&config.llm)?;
    if let Err(e) = generator.warmup().await {
        tracing::warn!(error = %e, "Generator warmup failed");
    }

    let state = build_state(config, generator)?;
    let router = build_router(config, state);

    tracing::info!("Starting Counsel Gateway on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr.as_str())
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    tracing::info!("Shutdown signal received");
}
