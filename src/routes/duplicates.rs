use crate::error::AppError;
use crate::models::duplicate_group;
use crate::models::file;
use crate::models::progress::OperationKind;
use crate::services::duplicates::{DuplicateEngine, SearchParams, DEFAULT_MAX_RESULTS, DEFAULT_MIN_FILE_SIZE};
use crate::services::jobs;
use crate::services::progress::ProgressService;
use crate::state::AppState;
use crate::utils::folder_id::extract_folder_id;
use axum::extract::{Query, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

const MAX_PAGE_LIMIT: i64 = 100;

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/find", post(find_duplicates))
        .route("/find/folder", post(find_folder_duplicates))
        .route("/groups", get(list_groups))
        .route("/group", get(get_group))
        .route("/group/delete", delete(delete_group))
        .route("/progress", get(duplicates_progress))
        .route("/file/path", get(file_path))
}

fn build_engine(state: &Arc<AppState>, worker_count: usize) -> DuplicateEngine {
    DuplicateEngine::new(
        state.db.clone(),
        state.provider.clone(),
        ProgressService::new(state.db.clone()),
        state.hash_service(),
        worker_count,
    )
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct FindRequest {
    calculate_hashes: Option<bool>,
    force_recalculate: bool,
    min_file_size: Option<i64>,
    max_results: Option<usize>,
}

async fn find_duplicates(
    State(state): State<Arc<AppState>>,
    body: Option<Json<FindRequest>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let req = body.map(|Json(b)| b).unwrap_or_default();

    let kind = OperationKind::DuplicateSearch;
    if let Some(current) = jobs::active_progress(&state, kind).await? {
        return Ok(Json(json!({ "progress": current, "alreadyRunning": true })));
    }

    let progress = ProgressService::new(state.db.clone());
    let row = progress.start(kind, 0).await?;
    let progress_id = row.id;

    let params = SearchParams {
        calculate_hashes: req.calculate_hashes.unwrap_or(true),
        force_recalculate: req.force_recalculate,
        min_file_size: req.min_file_size.unwrap_or(DEFAULT_MIN_FILE_SIZE),
        max_results: req.max_results.unwrap_or(DEFAULT_MAX_RESULTS),
    };
    let engine = build_engine(&state, state.config.hash_worker_count);
    jobs::spawn_job(state.clone(), kind, progress_id, async move {
        engine.run_search(progress_id, params).await.map(|_| ())
    });

    Ok(Json(json!({ "progress": row })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FolderFindRequest {
    folder_id: String,
    #[serde(default = "default_true")]
    recursive: bool,
    min_file_size: Option<i64>,
}

fn default_true() -> bool {
    true
}

async fn find_folder_duplicates(
    State(state): State<Arc<AppState>>,
    Json(req): Json<FolderFindRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    if req.folder_id.is_empty() {
        return Err(AppError::BadRequest("folderId is required".into()));
    }
    let folder_id = extract_folder_id(&req.folder_id).unwrap_or(req.folder_id);

    let kind = OperationKind::SingleFolderDup;
    if let Some(current) = jobs::active_progress(&state, kind).await? {
        return Ok(Json(json!({ "progress": current, "alreadyRunning": true })));
    }

    let progress = ProgressService::new(state.db.clone());
    let row = progress.start(kind, 0).await?;
    let progress_id = row.id;

    let min_file_size = req.min_file_size.unwrap_or(DEFAULT_MIN_FILE_SIZE);
    let recursive = req.recursive;
    let engine = build_engine(&state, state.config.hash_worker_count);
    jobs::spawn_job(state.clone(), kind, progress_id, async move {
        engine
            .run_folder_search(progress_id, &folder_id, recursive, min_file_size)
            .await
            .map(|_| ())
    });

    Ok(Json(json!({ "progress": row })))
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    page: Option<i64>,
    limit: Option<i64>,
}

async fn list_groups(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PageQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let page = query.page.unwrap_or(1);
    let limit = query.limit.unwrap_or(20);
    if page < 1 {
        return Err(AppError::BadRequest("page must be >= 1".into()));
    }
    if !(1..=MAX_PAGE_LIMIT).contains(&limit) {
        return Err(AppError::BadRequest(format!(
            "limit must be between 1 and {}",
            MAX_PAGE_LIMIT
        )));
    }

    let db = state.db.clone();
    let (groups, total) = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        duplicate_group::list_page(&conn, page, limit)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;

    let page_count = if total == 0 { 0 } else { (total + limit - 1) / limit };
    let groups_json: Vec<serde_json::Value> = groups
        .iter()
        .map(|g| {
            let mut value = serde_json::to_value(g).unwrap_or(serde_json::Value::Null);
            if let Some(obj) = value.as_object_mut() {
                obj.insert("wastedBytes".into(), json!(g.wasted_bytes()));
            }
            value
        })
        .collect();
    Ok(Json(json!({
        "groups": groups_json,
        "totalCount": total,
        "page": page,
        "limit": limit,
        "pageCount": page_count,
        "hasNext": page < page_count,
        "hasPrev": page > 1 && total > 0,
    })))
}

#[derive(Debug, Deserialize)]
struct GroupQuery {
    id: i64,
}

async fn get_group(
    State(state): State<Arc<AppState>>,
    Query(query): Query<GroupQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let db = state.db.clone();
    let group = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        duplicate_group::find_by_id(&conn, query.id)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;

    match group {
        Some(g) => Ok(Json(json!({ "group": g }))),
        None => Err(AppError::NotFound(format!("duplicate group {} not found", query.id))),
    }
}

async fn delete_group(
    State(state): State<Arc<AppState>>,
    Query(query): Query<GroupQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let db = state.db.clone();
    let deleted = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        duplicate_group::delete_group(&conn, query.id)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;

    if deleted {
        Ok(Json(json!({ "deleted": true, "id": query.id })))
    } else {
        Err(AppError::NotFound(format!("duplicate group {} not found", query.id)))
    }
}

async fn duplicates_progress(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let progress = ProgressService::new(state.db.clone());
    let whole = progress.latest_by_kind(OperationKind::DuplicateSearch).await?;
    let folder = progress.latest_by_kind(OperationKind::SingleFolderDup).await?;
    // Latest of the two variants wins
    let latest = match (whole, folder) {
        (Some(a), Some(b)) => Some(if a.id >= b.id { a } else { b }),
        (a, b) => a.or(b),
    };
    match latest {
        Some(row) => Ok(Json(json!({ "progress": row }))),
        None => Err(AppError::NotFound("no duplicate search has been started".into())),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FilePathQuery {
    file_id: String,
}

/// Resolve (and cache) the display path of a file through the
/// provider's folder hierarchy.
async fn file_path(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FilePathQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let db = state.db.clone();
    let id = query.file_id.clone();
    let row = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        file::find_by_id(&conn, &id)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??
    .ok_or_else(|| AppError::NotFound(format!("file {} not found", query.file_id)))?;

    if !row.path.is_empty() {
        return Ok(Json(json!({ "fileId": row.id, "path": row.path })));
    }

    let parent = row
        .parents
        .first()
        .cloned()
        .unwrap_or_else(|| crate::storage::ROOT_FOLDER_ID.to_string());
    let base = state
        .provider
        .folder_path(&parent)
        .await
        .map_err(crate::error::EngineError::from)
        .map_err(AppError::from)?;
    let path = format!("{}/{}", base.trim_end_matches('/'), row.name);

    let db = state.db.clone();
    let id = row.id.clone();
    let cached = path.clone();
    tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        file::set_path(&conn, &id, &cached)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;

    Ok(Json(json!({ "fileId": row.id, "path": path })))
}
