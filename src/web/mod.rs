//! Web layer
//!
//! Axum router plus the shared handler state. The server is started with a
//! readiness signal so the caller knows the socket is bound, and shuts down
//! when the provided cancellation token fires.

pub mod handlers;
pub mod responses;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    routing::{delete, get, post},
};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tracing::info;

use crate::errors::{AppError, AppResult};
use crate::services::metrics_aggregator::MetricsAggregator;
use crate::services::session_manager::SessionManager;

pub use responses::ApiResponse;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub metrics: Arc<MetricsAggregator>,
}

pub fn create_router(state: AppState, request_timeout: Duration) -> Router {
    Router::new()
        .route("/attach", post(handlers::attach))
        .route("/session/{session_key}", delete(handlers::detach))
        .route("/session/{session_key}/stop", post(handlers::stop))
        .route("/stats", get(handlers::stats))
        .route("/health", get(handlers::health))
        .layer(TimeoutLayer::new(request_timeout))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub struct WebServer {
    host: String,
    port: u16,
    request_timeout: Duration,
}

impl WebServer {
    pub fn new(host: impl Into<String>, port: u16, request_timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            request_timeout,
        }
    }

    /// Bind and serve until `shutdown` fires. Sends the bound local address
    /// through `ready` once the listener is up (the port may be 0 in tests).
    pub async fn serve_with_signal(
        &self,
        state: AppState,
        ready: tokio::sync::oneshot::Sender<std::net::SocketAddr>,
        shutdown: CancellationToken,
    ) -> AppResult<()> {
        let addr = format!("{}:{}", self.host, self.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| AppError::internal(format!("failed to bind {addr}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| AppError::internal(format!("failed to read local addr: {e}")))?;

        info!("web server listening on http://{local_addr}");
        let _ = ready.send(local_addr);

        axum::serve(listener, create_router(state, self.request_timeout))
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| AppError::internal(format!("web server error: {e}")))?;

        info!("web server stopped");
        Ok(())
    }
}
