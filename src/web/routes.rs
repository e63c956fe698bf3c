//! Route definitions for the dashboard

use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::HttpConfig;
use crate::AppState;

use super::api;

/// Create the main router with all routes
pub fn create_router(app_state: Arc<AppState>, config: &HttpConfig) -> Router {
    let cors = if config.cors_enabled {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/api/status", get(api::get_status))
        .route("/api/config", get(api::get_config))
        .route("/api/graph.svg", get(api::get_graph))
        .route("/api/stream", get(api::probability_stream))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}
