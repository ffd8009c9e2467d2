//! HTTP application wiring.

pub mod routes;

use axum::extract::Extension;
use axum::routing::{get, post};
use axum::Router;
use sqlx::PgPool;
use tower_http::trace::TraceLayer;

use crate::kernel::JobKernel;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub kernel: JobKernel,
    /// Present when the kernel runs on Postgres; drives the health check.
    pub pool: Option<PgPool>,
}

/// Build the router for the collaborator surface.
pub fn build_app(kernel: JobKernel, pool: Option<PgPool>) -> Router {
    let state = AppState { kernel, pool };
    Router::new()
        .route("/health", get(routes::health_handler))
        .route("/api/jobs", post(routes::create_job_handler))
        .route("/api/jobs/:id", get(routes::get_job_handler))
        .route("/api/jobs/:id/signal", post(routes::signal_handler))
        .route("/api/jobs/:id/stop", post(routes::stop_handler))
        .route("/api/jobs/:id/events", get(routes::events_handler))
        .route("/api/jobs/:id/watch", get(routes::watch_handler))
        .route("/api/jobs/:id/replay", get(routes::replay_handler))
        .route("/api/jobs/:id/trace", get(routes::trace_handler))
        .layer(Extension(state))
        .layer(TraceLayer::new_for_http())
}
