use crate::error::AppError;
use crate::models::file;
use crate::models::progress::{OperationKind, ProgressStatus, META_LAST_PAGE_INDEX, META_LAST_PAGE_TOKEN};
use crate::services::hash_pipeline::{HashPipeline, MAX_WORKERS, MIN_WORKERS};
use crate::services::jobs;
use crate::services::progress::ProgressService;
use crate::services::scan::ScanEngine;
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
        .route("/scan", post(start_scan))
        .route("/scan/folder", post(start_folder_scan))
        .route("/scan/progress", get(scan_progress))
        .route("/progress/active", get(progress_overview))
        .route("/clear-failed-progress", post(clear_failed))
        .route("/hash/calculate", post(calculate_hashes))
}

fn validate_worker_count(count: Option<usize>) -> Result<(), AppError> {
    if let Some(w) = count {
        if !(MIN_WORKERS..=MAX_WORKERS).contains(&w) {
            return Err(AppError::BadRequest(format!(
                "workerCount must be between {} and {}",
                MIN_WORKERS, MAX_WORKERS
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct ScanRequest {
    resume_from_progress: bool,
    batch_size: Option<usize>,
    worker_count: Option<usize>,
}

async fn start_scan(
    State(state): State<Arc<AppState>>,
    body: Option<Json<ScanRequest>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let req = body.map(|Json(b)| b).unwrap_or_default();
    validate_worker_count(req.worker_count)?;

    let kind = OperationKind::FileScan;
    if let Some(current) = jobs::active_progress(&state, kind).await? {
        return Ok(Json(json!({ "progress": current, "alreadyRunning": true })));
    }

    let progress = ProgressService::new(state.db.clone());
    let (progress_id, resume) = if req.resume_from_progress {
        match progress.latest_by_kind(kind).await? {
            Some(prev) => {
                let token = progress.get_metadata(prev.id, META_LAST_PAGE_TOKEN).await?;
                let has_checkpoint = token.as_deref().map(|t| !t.is_empty()).unwrap_or(false);
                match (prev.status, has_checkpoint) {
                    (ProgressStatus::Paused, true) | (ProgressStatus::Running, true) => {
                        (prev.id, true)
                    }
                    (ProgressStatus::Failed, true) => {
                        // Failed rows stay failed; the checkpoint moves
                        // to a fresh row so transitions stay monotonic
                        let fresh = progress.start(kind, 0).await?;
                        progress
                            .set_metadata(fresh.id, META_LAST_PAGE_TOKEN, token.unwrap_or_default())
                            .await?;
                        if let Some(index) =
                            progress.get_metadata(prev.id, META_LAST_PAGE_INDEX).await?
                        {
                            progress
                                .set_metadata(fresh.id, META_LAST_PAGE_INDEX, index)
                                .await?;
                        }
                        (fresh.id, true)
                    }
                    _ => (progress.start(kind, 0).await?.id, false),
                }
            }
            None => (progress.start(kind, 0).await?.id, false),
        }
    } else {
        (progress.start(kind, 0).await?.id, false)
    };

    let batch_size = req.batch_size.unwrap_or(state.config.processing_batch_size);
    let engine = ScanEngine::new(
        state.db.clone(),
        state.provider.clone(),
        progress.clone(),
        batch_size,
    );
    jobs::spawn_job(state.clone(), kind, progress_id, async move {
        engine.run_full_scan(progress_id, resume).await.map(|_| ())
    });

    let row = progress.get(progress_id).await?;
    Ok(Json(json!({ "progress": row, "resume": resume })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FolderScanRequest {
    folder_id: String,
    #[serde(default)]
    recursive: bool,
    #[serde(default)]
    update_paths: bool,
}

async fn start_folder_scan(
    State(state): State<Arc<AppState>>,
    Json(req): Json<FolderScanRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    if req.folder_id.is_empty() {
        return Err(AppError::BadRequest("folderId is required".into()));
    }
    let folder_id = extract_folder_id(&req.folder_id).unwrap_or(req.folder_id);

    let kind = OperationKind::FileScan;
    if let Some(current) = jobs::active_progress(&state, kind).await? {
        return Ok(Json(json!({ "progress": current, "alreadyRunning": true })));
    }

    let progress = ProgressService::new(state.db.clone());
    let row = progress.start(kind, 0).await?;
    let progress_id = row.id;

    let engine = ScanEngine::new(
        state.db.clone(),
        state.provider.clone(),
        progress.clone(),
        state.config.processing_batch_size,
    );
    let recursive = req.recursive;
    let update_paths = req.update_paths;
    jobs::spawn_job(state.clone(), kind, progress_id, async move {
        engine
            .run_folder_scan(progress_id, &folder_id, recursive, update_paths)
            .await
            .map(|_| ())
    });

    Ok(Json(json!({ "progress": row })))
}

async fn scan_progress(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let progress = ProgressService::new(state.db.clone());
    match progress.latest_by_kind(OperationKind::FileScan).await? {
        Some(row) => Ok(Json(json!({ "progress": row }))),
        None => Err(AppError::NotFound("no file scan has been started".into())),
    }
}

#[derive(Debug, Deserialize, Default)]
struct ActiveQuery {
    kind: Option<String>,
    #[serde(rename = "stuckMinutes")]
    stuck_minutes: Option<i64>,
}

/// Operator view of in-flight work: active rows, jobs running longer
/// than an hour, and rows that stopped writing updates.
async fn progress_overview(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ActiveQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let progress = ProgressService::new(state.db.clone());

    if let Some(kind_str) = query.kind {
        let kind: OperationKind = kind_str
            .parse()
            .map_err(|e: anyhow::Error| AppError::BadRequest(e.to_string()))?;
        let rows = progress.get_by_kind(kind).await?;
        return Ok(Json(json!({ "progress": rows })));
    }

    let minutes = query.stuck_minutes.unwrap_or(10).max(1);
    let active = progress.get_active().await?;
    let long_running = progress.get_long_running(60).await?;
    let stuck = progress.get_stuck(minutes).await?;
    Ok(Json(json!({
        "active": active,
        "longRunning": long_running,
        "stuck": stuck,
    })))
}

async fn clear_failed(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let progress = ProgressService::new(state.db.clone());
    let deleted = progress.clear_failed().await?;
    Ok(Json(json!({ "deleted": deleted })))
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct HashCalculateRequest {
    file_ids: Option<Vec<String>>,
    force_recalculate: bool,
    worker_count: Option<usize>,
}

async fn calculate_hashes(
    State(state): State<Arc<AppState>>,
    body: Option<Json<HashCalculateRequest>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let req = body.map(|Json(b)| b).unwrap_or_default();
    validate_worker_count(req.worker_count)?;

    let kind = OperationKind::HashCalc;
    if let Some(current) = jobs::active_progress(&state, kind).await? {
        return Ok(Json(json!({ "progress": current, "alreadyRunning": true })));
    }

    let progress = ProgressService::new(state.db.clone());
    let row = progress.start(kind, 0).await?;
    let progress_id = row.id;

    let worker_count = req.worker_count.unwrap_or(state.config.hash_worker_count);
    let pipeline = HashPipeline::new(
        state.db.clone(),
        state.hash_service(),
        progress.clone(),
        worker_count,
    );
    let db = state.db.clone();
    let file_ids = req.file_ids;
    let force = req.force_recalculate;
    let progress2 = progress.clone();
    jobs::spawn_job(state.clone(), kind, progress_id, async move {
        progress2.mark_running(progress_id).await?;
        let pending = tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            let rows = match file_ids {
                Some(ids) => file::find_by_ids(&conn, &ids)?,
                None => {
                    if force {
                        let mut all = file::find_with_hash(&conn)?;
                        all.extend(file::find_without_hash(&conn)?);
                        all
                    } else {
                        file::find_without_hash(&conn)?
                    }
                }
            };
            Ok::<_, anyhow::Error>(
                rows.into_iter()
                    .filter(|f| f.size > 0 && (force || !f.hash_calculated))
                    .collect::<Vec<_>>(),
            )
        })
        .await
        .map_err(|e| anyhow::anyhow!(e))??;

        progress2.set_total(progress_id, pending.len() as i64).await?;
        pipeline.run(progress_id, pending).await?;
        progress2.complete(progress_id).await?;
        Ok(())
    });

    Ok(Json(json!({ "progress": row })))
}
