//! Application setup and server configuration.

use std::sync::Arc;

use axum::{
    extract::Extension,
    routing::{get, post},
    Router,
};
use sqlx::PgPool;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::domains::dispatch::{DispatchTrigger, Supervisor};
use crate::domains::runs::CallbackIngestor;
use crate::kernel::ServerKernel;
use crate::server::routes::{
    create_run_handler, health_handler, run_status_handler, update_run_handler,
};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub db_pool: PgPool,
    pub kernel: Arc<ServerKernel>,
    pub ingestor: Arc<CallbackIngestor>,
    pub supervisor: Arc<Supervisor>,
    pub trigger: DispatchTrigger,
}

/// Build the axum application. The HTTP surface is deliberately thin:
/// enqueue, status query, the machine callback, and health.
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/run", post(create_run_handler))
        .route("/api/run/:job_id", get(run_status_handler))
        .route("/api/update-run", post(update_run_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(Extension(state))
}
