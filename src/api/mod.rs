//! API module for Mediaspool
//!
//! This module contains all HTTP handlers, middleware, and routing.

pub mod handlers;
pub mod middleware;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::config::Settings;
use crate::manager::DownloadManager;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<DownloadManager>,
    pub settings: Settings,
}

impl AppState {
    pub fn new(manager: Arc<DownloadManager>, settings: Settings) -> Self {
        Self { manager, settings }
    }
}

/// Build the main application router
pub fn router(state: AppState) -> Router {
    // The web UI and the browser extension call the API cross-origin
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health::health_check))
        .nest("/api", api_router(state.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// API routes, all behind the token middleware
fn api_router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/download", post(handlers::jobs::submit))
        .route("/download/bulk", post(handlers::jobs::submit_bulk))
        .route(
            "/jobs",
            get(handlers::jobs::list).delete(handlers::jobs::delete_all),
        )
        .route(
            "/jobs/{id}",
            get(handlers::jobs::get).delete(handlers::jobs::delete),
        )
        .route("/jobs/{id}/stream", get(handlers::stream::stream))
        .route("/jobs/{id}/retry", post(handlers::jobs::retry))
        .route("/auth", get(handlers::auth::check))
        .route_layer(axum::middleware::from_fn_with_state(
            state,
            middleware::auth::require_token,
        ))
}
