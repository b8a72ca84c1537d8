//! HTTP router construction.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::api;
use crate::state::AppState;

/// Build the application router with all routes and middleware.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .route("/download_file", post(api::download_file))
        .route("/job_status", get(api::job_status))
        .route("/job_cancel", get(api::job_cancel))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
