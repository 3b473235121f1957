//! HTTP server implementation using Axum.

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use punchclock_core::config::GatewayConfig;
use punchclock_scheduler::FlowEngine;

/// Shared state for the gateway server.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<FlowEngine>,
    /// Required in the run payload when non-empty.
    pub job_secret: String,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(engine: Arc<FlowEngine>, job_secret: impl Into<String>) -> Self {
        Self {
            engine,
            job_secret: job_secret.into(),
            start_time: std::time::Instant::now(),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let shared = Arc::new(state);
    Router::new()
        .route("/health", get(super::routes::health_check))
        .route("/jobs", get(super::routes::list_jobs))
        .route("/run/{job}", post(super::routes::run_job))
        .route("/status", get(super::routes::get_status))
        .route("/events", get(super::routes::list_events))
        .route("/history", get(super::routes::click_history))
        .route("/retry", post(super::routes::retry_failed))
        .route("/reset-session", post(super::routes::reset_session))
        .route(
            "/settings",
            get(super::routes::get_settings).put(super::routes::update_settings),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

/// Bind and serve until the engine's shutdown signal fires.
pub async fn start_server(
    config: &GatewayConfig,
    state: AppState,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let engine = state.engine.clone();
    let app = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("🌐 Gateway server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { engine.wait_for_shutdown().await })
        .await?;
    Ok(())
}
