use crate::error::AppError;
use crate::state::AppState;
use crate::utils::folder_id::extract_folder_id;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new().route("/extract-folder-id", post(extract))
}

#[derive(Deserialize)]
struct ExtractRequest {
    url: String,
}

async fn extract(Json(body): Json<ExtractRequest>) -> Result<Json<serde_json::Value>, AppError> {
    match extract_folder_id(&body.url) {
        Some(folder_id) => Ok(Json(serde_json::json!({ "folderId": folder_id }))),
        None => Err(AppError::BadRequest(format!(
            "could not extract a folder id from '{}'",
            body.url
        ))),
    }
}
