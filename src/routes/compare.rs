use crate::error::AppError;
use crate::models::comparison;
use crate::models::file;
use crate::models::progress::OperationKind;
use crate::services::cleanup::{CleanupEngine, DeleteOptions};
use crate::services::comparison::{CompareParams, ComparisonEngine};
use crate::services::jobs;
use crate::services::progress::ProgressService;
use crate::state::AppState;
use crate::utils::folder_id::extract_folder_id;
use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/folders", post(compare_folders))
        .route("/progress", get(compare_progress))
        .route("/results/recent", get(recent_results))
        .route("/result/load", get(load_result))
        .route("/resume", post(resume_comparison))
        .route("/delete/target-folder", post(delete_target_folder))
        .route("/delete/duplicate-files", post(delete_duplicate_files))
}

fn build_engine(state: &Arc<AppState>, worker_count: usize) -> ComparisonEngine {
    ComparisonEngine::new(
        state.db.clone(),
        state.provider.clone(),
        ProgressService::new(state.db.clone()),
        state.hash_service(),
        worker_count,
    )
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompareFoldersRequest {
    source_folder_id: String,
    target_folder_id: String,
    #[serde(default = "default_true")]
    include_subfolders: bool,
    #[serde(default = "default_true")]
    deep_comparison: bool,
    #[serde(default)]
    force_new_comparison: bool,
    #[serde(default)]
    min_file_size: i64,
    worker_count: Option<usize>,
}

fn default_true() -> bool {
    true
}

async fn compare_folders(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CompareFoldersRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    if req.source_folder_id.is_empty() || req.target_folder_id.is_empty() {
        return Err(AppError::BadRequest(
            "sourceFolderId and targetFolderId are required".into(),
        ));
    }
    let source = extract_folder_id(&req.source_folder_id).unwrap_or(req.source_folder_id);
    let target = extract_folder_id(&req.target_folder_id).unwrap_or(req.target_folder_id);
    if source == target {
        return Err(AppError::BadRequest(
            "sourceFolderId and targetFolderId must be distinct".into(),
        ));
    }

    // One stored result per folder pair; a repeat run needs the caller
    // to opt into replacing it
    if !req.force_new_comparison {
        let db = state.db.clone();
        let (s, t) = (source.clone(), target.clone());
        let existing = tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            comparison::find_by_pair(&conn, &s, &t)
        })
        .await
        .map_err(|e| anyhow::anyhow!(e))??;
        if existing.is_some() {
            return Err(AppError::Conflict(
                "a comparison for this folder pair already exists; set forceNewComparison to replace it".into(),
            ));
        }
    }

    let kind = OperationKind::FolderComparison;
    if let Some(current) = jobs::active_progress(&state, kind).await? {
        return Ok(Json(json!({ "progress": current, "alreadyRunning": true })));
    }

    let progress = ProgressService::new(state.db.clone());
    let row = progress.start(kind, 0).await?;
    let progress_id = row.id;

    let params = CompareParams {
        source_folder_id: source,
        target_folder_id: target,
        include_subfolders: req.include_subfolders,
        deep_comparison: req.deep_comparison,
        min_file_size: req.min_file_size,
    };
    let engine = build_engine(
        &state,
        req.worker_count.unwrap_or(state.config.hash_worker_count),
    );
    jobs::spawn_job(state.clone(), kind, progress_id, async move {
        engine.record_params(progress_id, &params).await?;
        engine.run(progress_id, params).await.map(|_| ())
    });

    Ok(Json(json!({ "progress": row })))
}

async fn compare_progress(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let progress = ProgressService::new(state.db.clone());
    match progress.latest_by_kind(OperationKind::FolderComparison).await? {
        Some(row) => Ok(Json(json!({ "progress": row }))),
        None => Err(AppError::NotFound("no folder comparison has been started".into())),
    }
}

#[derive(Debug, Deserialize)]
struct RecentQuery {
    limit: Option<i64>,
}

async fn recent_results(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecentQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let limit = query.limit.unwrap_or(10).clamp(1, 100);
    let db = state.db.clone();
    let results = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        comparison::find_recent(&conn, limit)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;
    Ok(Json(json!({ "results": results })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PairQuery {
    source_folder_id: String,
    target_folder_id: String,
}

async fn load_result(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PairQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let db = state.db.clone();
    let result = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        comparison::find_by_pair(&conn, &query.source_folder_id, &query.target_folder_id)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;
    match result {
        Some(r) => Ok(Json(json!({ "result": r }))),
        None => Err(AppError::NotFound("no comparison stored for this folder pair".into())),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResumeRequest {
    progress_id: i64,
}

async fn resume_comparison(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ResumeRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let progress = ProgressService::new(state.db.clone());
    let row = progress
        .get(req.progress_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("progress {} not found", req.progress_id)))?;
    if row.operation_type != OperationKind::FolderComparison {
        return Err(AppError::BadRequest(format!(
            "progress {} is not a folder comparison",
            req.progress_id
        )));
    }

    let kind = OperationKind::FolderComparison;
    if let Some(current) = jobs::active_progress(&state, kind).await? {
        return Ok(Json(json!({ "progress": current, "alreadyRunning": true })));
    }

    let engine = build_engine(&state, state.config.hash_worker_count);
    let (run_id, params) = engine
        .prepare_resume(req.progress_id)
        .await
        .map_err(AppError::from)?;
    jobs::spawn_job(state.clone(), kind, run_id, async move {
        engine.run(run_id, params).await.map(|_| ())
    });

    let row = progress.get(run_id).await?.or(Some(row));
    Ok(Json(json!({ "progress": row, "resumed": true })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteTargetRequest {
    source_folder_id: String,
    target_folder_id: String,
}

/// Remove the whole target folder. Only legal when the stored
/// comparison proved every target file duplicates the source.
async fn delete_target_folder(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DeleteTargetRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let db = state.db.clone();
    let (s, t) = (req.source_folder_id.clone(), req.target_folder_id.clone());
    let result = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        comparison::find_by_pair(&conn, &s, &t)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??
    .ok_or_else(|| AppError::NotFound("no comparison stored for this folder pair".into()))?;

    if !result.target_fully_duplicated {
        return Err(AppError::BadRequest(format!(
            "target folder is only {:.1}% duplicated; full duplication is required",
            result.duplication_percent
        )));
    }

    state
        .provider
        .delete_folder(&result.target_folder_id)
        .await
        .map_err(crate::error::EngineError::from)
        .map_err(AppError::from)?;

    // Drop the mirrored rows (recorded duplicates plus anything else
    // tracked directly under the folder) and the now-stale comparison
    let db = state.db.clone();
    let mut ids = result.duplicate_file_ids.clone();
    let target_id = result.target_folder_id.clone();
    let result_id = result.id;
    tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        ids.extend(file::find_by_parent(&conn, &target_id)?.into_iter().map(|f| f.id));
        ids.sort();
        ids.dedup();
        for id in &ids {
            file::delete(&conn, id)?;
        }
        comparison::delete(&conn, result_id)?;
        Ok::<_, anyhow::Error>(())
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;

    tracing::info!(folder = %result.target_folder_id, "Deleted fully-duplicated target folder");
    Ok(Json(json!({
        "deleted": true,
        "folderId": result.target_folder_id,
        "filesRemoved": result.duplicate_file_ids.len(),
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteDuplicatesRequest {
    source_folder_id: String,
    target_folder_id: String,
    #[serde(default)]
    cleanup_folders: bool,
}

/// Delete the target-side duplicates recorded by a comparison,
/// keeping the source copies.
async fn delete_duplicate_files(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DeleteDuplicatesRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let db = state.db.clone();
    let (s, t) = (req.source_folder_id.clone(), req.target_folder_id.clone());
    let result = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        comparison::find_by_pair(&conn, &s, &t)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??
    .ok_or_else(|| AppError::NotFound("no comparison stored for this folder pair".into()))?;

    if result.duplicate_file_ids.is_empty() {
        return Ok(Json(json!({ "deleted": 0, "message": "no duplicates recorded" })));
    }

    let kind = OperationKind::Cleanup;
    if let Some(current) = jobs::active_progress(&state, kind).await? {
        return Ok(Json(json!({ "progress": current, "alreadyRunning": true })));
    }

    let progress = ProgressService::new(state.db.clone());
    let row = progress.start(kind, result.duplicate_file_ids.len() as i64).await?;
    let progress_id = row.id;

    let engine = CleanupEngine::new(state.db.clone(), state.provider.clone(), progress.clone());
    let opts = DeleteOptions {
        batch_size: state.config.deletion_batch_size,
        worker_count: if state.config.deletion_parallel {
            state.config.deletion_worker_count
        } else {
            1
        },
        safety_checks: true,
        cleanup_folders: req.cleanup_folders,
    };
    let ids = result.duplicate_file_ids.clone();
    jobs::spawn_job(state.clone(), kind, progress_id, async move {
        engine.delete_files(progress_id, ids, opts).await.map(|_| ())
    });

    Ok(Json(json!({ "progress": row, "candidates": result.duplicate_file_ids.len() })))
}
