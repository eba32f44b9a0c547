//! HTTP server
//!
//! Routes:
//! - `GET /health`
//! - `POST /chat/stream`: streamed reply as server-sent events
//! - `POST /chat/complete`: single JSON reply

mod chat;
mod error;

pub use chat::{ChatRequest, ConversationRecorder};
pub use error::{ApiError, UPSTREAM_FAILURE_MESSAGE};

use axum::{
    Json, Router,
    routing::{get, post},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::error::{ChatRelayError, Result};
use crate::relay::RelaySettings;
use crate::store::{ConversationStore, MemoryStore};
use crate::title::TitleGenerator;
use crate::upstream::UpstreamClient;

/// Shared application state for all handlers
pub struct AppState {
    pub config: Config,
    /// Gateway client shared by relay sessions and title generation
    pub upstream: UpstreamClient,
    pub store: Arc<dyn ConversationStore>,
    /// `None` when title generation is disabled
    pub titles: Option<Arc<TitleGenerator>>,
    pub relay: RelaySettings,
}

impl AppState {
    pub fn new(config: Config, upstream: UpstreamClient, store: Arc<dyn ConversationStore>) -> Self {
        let titles = config
            .title
            .enabled
            .then(|| Arc::new(TitleGenerator::new(upstream.clone(), &config.title)));
        let relay = RelaySettings::from_config(&config.relay);

        Self {
            config,
            upstream,
            store,
            titles,
            relay,
        }
    }
}

/// The chat relay server
pub struct ChatServer {
    config: Config,
}

impl ChatServer {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Bind the listen address and serve until Ctrl+C or SIGTERM
    pub async fn serve(self) -> Result<()> {
        let addr: SocketAddr = self
            .config
            .server
            .listen_addr
            .parse()
            .map_err(|e| ChatRelayError::Config(format!("Invalid listen address: {e}")))?;

        let upstream = UpstreamClient::from_config(&self.config)?;
        let store: Arc<dyn ConversationStore> = Arc::new(MemoryStore::new());

        if self.config.title.enabled {
            tracing::info!("Title generation enabled with model {}", self.config.title.model);
        } else {
            tracing::info!("Title generation disabled");
        }

        let app = create_router(Arc::new(AppState::new(self.config, upstream, store)));

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ChatRelayError::General(format!("Failed to bind to {addr}: {e}")))?;
        tracing::info!("Listening on {addr}");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| ChatRelayError::General(format!("Server error: {e}")))?;

        tracing::info!("Server shut down gracefully");
        Ok(())
    }
}

/// Create the router with all routes configured
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/chat/stream", post(chat::chat_stream))
        .route("/chat/complete", post(chat::chat_complete))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        },
    }
}
