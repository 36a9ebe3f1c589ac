mod errors;
pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::engine::pipeline::Orchestrator;

/// Shared application state accessible by all handlers.
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

/// Build the REST API router. Exposed separately from `serve` so tests can
/// drive it without binding a socket.
pub fn router(state: Arc<AppState>, max_body: usize) -> Router {
    Router::new()
        .route("/workflows", post(handlers::start_workflow))
        .route("/workflows", get(handlers::list_workflows))
        .route("/workflows/{id}", get(handlers::get_workflow))
        .route("/workflows/{id}/resume", post(handlers::resume_workflow))
        .route("/callbacks", post(handlers::ingest_callback))
        .route("/health", get(handlers::health))
        .layer(DefaultBodyLimit::max(max_body))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the REST API server, plus the periodic sweep that converts expired
/// suspension points into FAILED workflows.
pub async fn serve(
    orchestrator: Arc<Orchestrator>,
    host: &str,
    port: u16,
    max_body: usize,
    sweep_interval_s: Option<u64>,
) -> Result<()> {
    if let Some(interval_s) = sweep_interval_s {
        let sweeper = orchestrator.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_s));
            // First tick fires immediately; skip it so startup stays quiet.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = sweeper.sweep().await {
                    warn!(error = %e, "sweep failed");
                }
            }
        });
    }

    let state = Arc::new(AppState { orchestrator });
    let app = router(state, max_body);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("AnchorFlow API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
