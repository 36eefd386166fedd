pub mod cleanup;
pub mod compare;
pub mod duplicates;
pub mod files;
pub mod health;
pub mod utils;

use crate::state::AppState;
use axum::http::HeaderValue;
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

fn cors_layer(state: &AppState) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods(Any)
        .allow_headers(Any);
    if state.config.cors_allowed_origins.iter().any(|o| o == "*") {
        layer.allow_origin(Any)
    } else {
        let origins: Vec<HeaderValue> = state
            .config
            .cors_allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        layer.allow_origin(origins)
    }
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(health::router(state.clone()))
        .nest("/api/files", files::router(state.clone()))
        .nest("/api/duplicates", duplicates::router(state.clone()))
        .nest("/api/compare", compare::router(state.clone()))
        .nest("/api/cleanup", cleanup::router(state.clone()))
        .nest("/api/utils", utils::router(state.clone()))
        .layer(cors_layer(&state))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
