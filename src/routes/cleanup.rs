use crate::error::AppError;
use crate::models::progress::OperationKind;
use crate::services::cleanup::{CleanupEngine, DeleteOptions};
use crate::services::jobs;
use crate::services::progress::ProgressService;
use crate::state::AppState;
use crate::utils::folder_id::extract_folder_id;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/files", post(delete_files))
        .route("/duplicates", post(delete_duplicates))
        .route("/pattern", post(cleanup_pattern))
        .route("/search", post(search_pattern))
        .route("/folders", post(cleanup_folders))
        .route("/progress", get(cleanup_progress))
}

fn delete_options(state: &AppState, batch_size: Option<usize>, cleanup_folders: bool, safety_checks: bool) -> DeleteOptions {
    DeleteOptions {
        batch_size: batch_size.unwrap_or(state.config.deletion_batch_size),
        worker_count: if state.config.deletion_parallel {
            state.config.deletion_worker_count
        } else {
            1
        },
        safety_checks,
        cleanup_folders,
    }
}

fn build_engine(state: &Arc<AppState>) -> CleanupEngine {
    CleanupEngine::new(
        state.db.clone(),
        state.provider.clone(),
        ProgressService::new(state.db.clone()),
    )
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteFilesRequest {
    file_ids: Vec<String>,
    #[serde(default)]
    cleanup_folders: bool,
    #[serde(default = "default_true")]
    safety_checks: bool,
    batch_size: Option<usize>,
}

fn default_true() -> bool {
    true
}

async fn delete_files(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DeleteFilesRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    if req.file_ids.is_empty() {
        return Err(AppError::BadRequest("fileIds must not be empty".into()));
    }

    let kind = OperationKind::Cleanup;
    if let Some(current) = jobs::active_progress(&state, kind).await? {
        return Ok(Json(json!({ "progress": current, "alreadyRunning": true })));
    }

    let progress = ProgressService::new(state.db.clone());
    let row = progress.start(kind, req.file_ids.len() as i64).await?;
    let progress_id = row.id;

    let engine = build_engine(&state);
    let opts = delete_options(&state, req.batch_size, req.cleanup_folders, req.safety_checks);
    let ids = req.file_ids;
    jobs::spawn_job(state.clone(), kind, progress_id, async move {
        engine.delete_files(progress_id, ids, opts).await.map(|_| ())
    });

    Ok(Json(json!({ "progress": row })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteDuplicatesRequest {
    group_id: i64,
    keep_file_id: String,
    #[serde(default)]
    cleanup_folders: bool,
}

async fn delete_duplicates(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DeleteDuplicatesRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    if req.keep_file_id.is_empty() {
        return Err(AppError::BadRequest("keepFileId is required".into()));
    }

    let kind = OperationKind::Cleanup;
    if let Some(current) = jobs::active_progress(&state, kind).await? {
        return Ok(Json(json!({ "progress": current, "alreadyRunning": true })));
    }

    let progress = ProgressService::new(state.db.clone());
    let row = progress.start(kind, 0).await?;
    let progress_id = row.id;

    let engine = build_engine(&state);
    let opts = delete_options(&state, None, req.cleanup_folders, true);
    let group_id = req.group_id;
    let keeper = req.keep_file_id;
    jobs::spawn_job(state.clone(), kind, progress_id, async move {
        engine
            .delete_duplicates_from_group(progress_id, group_id, keeper, opts)
            .await
            .map(|_| ())
    });

    Ok(Json(json!({ "progress": row })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PatternRequest {
    folder_id: String,
    pattern: String,
    #[serde(default)]
    recursive: bool,
    #[serde(default = "default_true")]
    dry_run: bool,
    #[serde(default)]
    cleanup_folders: bool,
}

async fn run_pattern(
    state: Arc<AppState>,
    req: PatternRequest,
    force_dry_run: bool,
) -> Result<Json<serde_json::Value>, AppError> {
    if req.folder_id.is_empty() {
        return Err(AppError::BadRequest("folderId is required".into()));
    }
    if req.pattern.is_empty() {
        return Err(AppError::BadRequest("pattern is required".into()));
    }
    let folder_id = extract_folder_id(&req.folder_id).unwrap_or(req.folder_id);
    let dry_run = force_dry_run || req.dry_run;

    let progress = ProgressService::new(state.db.clone());
    let row = progress.start(OperationKind::Cleanup, 0).await?;

    // Pattern jobs answer synchronously: the caller wants the matched
    // candidates (dry run) or the deletion tally in the response
    let engine = build_engine(&state);
    let opts = delete_options(&state, None, req.cleanup_folders, false);
    let outcome = match engine
        .cleanup_by_pattern(
            row.id,
            &folder_id,
            &req.pattern,
            req.recursive,
            dry_run,
            req.cleanup_folders,
            opts,
        )
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            let _ = progress.fail(row.id, format!("{}", e)).await;
            return Err(e.into());
        }
    };

    Ok(Json(json!({ "progressId": row.id, "outcome": outcome })))
}

async fn cleanup_pattern(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PatternRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    run_pattern(state, req, false).await
}

/// Forced dry-run variant of the pattern cleanup.
async fn search_pattern(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PatternRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    run_pattern(state, req, true).await
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct FoldersRequest {
    root_folder_id: Option<String>,
    recursive: Option<bool>,
}

async fn cleanup_folders(
    State(state): State<Arc<AppState>>,
    body: Option<Json<FoldersRequest>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let req = body.map(|Json(b)| b).unwrap_or_default();

    let kind = OperationKind::Cleanup;
    if let Some(current) = jobs::active_progress(&state, kind).await? {
        return Ok(Json(json!({ "progress": current, "alreadyRunning": true })));
    }

    let progress = ProgressService::new(state.db.clone());
    let row = progress.start(kind, 0).await?;
    let progress_id = row.id;

    let root = req
        .root_folder_id
        .filter(|r| !r.is_empty())
        .map(|r| extract_folder_id(&r).unwrap_or(r));
    let recursive = req.recursive.unwrap_or(true);
    let engine = build_engine(&state);
    jobs::spawn_job(state.clone(), kind, progress_id, async move {
        engine
            .sweep_empty_folders(progress_id, root, recursive)
            .await
            .map(|_| ())
    });

    Ok(Json(json!({ "progress": row })))
}

async fn cleanup_progress(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let progress = ProgressService::new(state.db.clone());
    match progress.latest_by_kind(OperationKind::Cleanup).await? {
        Some(row) => Ok(Json(json!({ "progress": row }))),
        None => Err(AppError::NotFound("no cleanup has been started".into())),
    }
}
