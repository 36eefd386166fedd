use crate::error::AppError;
use crate::state::AppState;
use crate::storage::ROOT_FOLDER_ID;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/health/db", get(health_db))
        .route("/health/storage", get(health_storage))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn health_db(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>, AppError> {
    let db = state.db.clone();
    tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok::<_, anyhow::Error>(())
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))?
    .map_err(|e| AppError::ServiceUnavailable(format!("database unavailable: {}", e)))?;

    Ok(Json(serde_json::json!({ "status": "ok", "database": "reachable" })))
}

async fn health_storage(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, AppError> {
    state
        .provider
        .get_folder(ROOT_FOLDER_ID)
        .await
        .map_err(|e| AppError::ServiceUnavailable(format!("storage provider unavailable: {}", e)))?;
    Ok(Json(serde_json::json!({ "status": "ok", "storage": "reachable" })))
}
