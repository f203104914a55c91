//! HTTP + WebSocket surface for observing and driving runs.

pub mod api;
pub mod ws;

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;

use crate::config::ServerConfig;
use crate::controller::RunController;
use api::AppState;

pub fn build_router(controller: Arc<RunController>) -> Router {
    let state = Arc::new(AppState { controller });
    api::api_router()
        .route("/ws/run", get(ws::run_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until `shutdown` resolves, then cancel whatever run is active.
pub async fn start_server(
    controller: Arc<RunController>,
    config: &ServerConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = build_router(Arc::clone(&controller));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, "harness server listening");
    println!("Challenge harness listening on http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("Server error")?;

    if let Some(run_id) = controller.cancel() {
        tracing::info!(%run_id, "cancelled active run on shutdown");
    }
    tracing::info!("server shut down");
    Ok(())
}

/// Resolves on Ctrl+C.
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
