//! Health endpoint.
//!
//! A small HTTP server reporting liveness and per-queue counters. It runs
//! alongside the consumer when `HEALTH_PORT` is set and stops with it.

pub mod handlers;

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::consumer::shutdown_requested;

pub use handlers::{health, AppState, HealthResponse};

/// Build the HTTP router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the health endpoint until `shutdown` is requested.
pub async fn serve(port: u16, state: AppState, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!(address = %addr, "health_server_listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown_requested(&mut shutdown).await })
        .await
        .context("Server error")?;

    info!("health_server_stopped");
    Ok(())
}
