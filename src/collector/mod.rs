//! Receiving side of the exit beacon.

pub mod country;
pub mod handlers;
pub mod useragent;

use anyhow::{Context, Result};
use axum::{
    http::{header, Method},
    routing::{get, post},
    Router,
};
use log::info;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

use crate::{config::CollectorConfig, db::Database};

#[derive(Clone)]
pub struct CollectorState {
    pub db: Database,
}

pub fn router(state: CollectorState) -> Router {
    // Beacons arrive from whatever site embeds the agent.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .route("/track", post(handlers::track))
        .route("/log/time", post(handlers::log_time))
        .route("/api/analytics", get(handlers::analytics))
        .route("/api/health", get(|| async { "OK" }))
        .layer(cors)
        .with_state(state)
}

/// Serves on an already bound listener until the task is dropped.
pub async fn serve(listener: TcpListener, state: CollectorState) -> Result<()> {
    axum::serve(listener, router(state))
        .await
        .context("collector server stopped")
}

pub async fn start_server(config: CollectorConfig) -> Result<()> {
    let db = Database::new(config.db_path.clone())?;
    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    info!("Collector listening on {}", config.bind_addr);
    serve(listener, CollectorState { db }).await
}
