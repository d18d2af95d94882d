//! HTTP gateway
//!
//! Exposes the engine over a small JSON + SSE API:
//! - `GET /health`
//! - `POST /api/prompt` buffered generation
//! - `POST /api/stream` streamed generation (server-sent events)
//! - `GET /api/models`, `GET /api/current-model`, `POST /api/select-model`

use axum::{middleware::from_fn, response::IntoResponse, routing::get, Json, Router};
use chrono::Local;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::info;

pub mod middleware;
pub mod routes;
pub mod sse;
pub mod state;

pub use state::ServerState;

/// Create the main application router
pub fn create_app(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .nest("/api", routes::create_router())
        // Last layer is outermost
        .layer(from_fn(middleware::security_headers))
        .layer(from_fn(middleware::request_span))
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "OK",
        "time": Local::now(),
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Serve the gateway until Ctrl-C
pub async fn start_server(addr: SocketAddr, state: ServerState) -> std::io::Result<()> {
    let app = create_app(state);

    let listener = TcpListener::bind(addr).await?;
    info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
