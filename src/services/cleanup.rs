use crate::db::connection::DbPool;
use crate::error::EngineError;
use crate::models::duplicate_group;
use crate::models::file;
use crate::services::progress::ProgressService;
use crate::storage::{self, StorageError, StorageProvider, ROOT_FOLDER_ID};
use futures_util::StreamExt;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

const DELETE_RETRY_ATTEMPTS: u32 = 2;

#[derive(Debug, Clone)]
pub struct DeleteOptions {
    pub batch_size: usize,
    pub worker_count: usize,
    pub safety_checks: bool,
    pub cleanup_folders: bool,
}

impl Default for DeleteOptions {
    fn default() -> Self {
        Self {
            batch_size: 50,
            worker_count: 5,
            safety_checks: true,
            cleanup_folders: false,
        }
    }
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupOutcome {
    pub requested: usize,
    pub deleted: usize,
    pub bytes_saved: i64,
    pub folders_removed: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternCandidate {
    pub id: String,
    pub name: String,
    pub size: i64,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternOutcome {
    pub dry_run: bool,
    pub candidates: Vec<PatternCandidate>,
    pub total_bytes: i64,
    pub deleted: usize,
    pub folders_removed: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepOutcome {
    pub checked: usize,
    pub removed: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone)]
struct DeletePlan {
    id: String,
    size: i64,
    parents: Vec<String>,
}

/// Deletes files in bounded-concurrency batches, then optionally
/// prunes ancestor folders that became empty. Children always go
/// before parents.
pub struct CleanupEngine {
    db: DbPool,
    provider: Arc<dyn StorageProvider>,
    progress: ProgressService,
}

impl CleanupEngine {
    pub fn new(db: DbPool, provider: Arc<dyn StorageProvider>, progress: ProgressService) -> Self {
        Self {
            db,
            provider,
            progress,
        }
    }

    async fn is_folder_empty(&self, folder_id: &str) -> Result<bool, StorageError> {
        let page = self.provider.list_children(folder_id, None, 1).await?;
        Ok(page.files.is_empty())
    }

    async fn delete_one(&self, plan: DeletePlan) -> Result<DeletePlan, (String, String)> {
        let id = plan.id.clone();
        let deleted = storage::with_retries(DELETE_RETRY_ATTEMPTS, || {
            self.provider.delete_file(&id)
        })
        .await;
        match deleted {
            // Already gone upstream counts as deleted; the row still
            // has to go
            Ok(()) | Err(StorageError::NotFound(_)) => {
                let db = self.db.clone();
                let row_id = plan.id.clone();
                let removed = tokio::task::spawn_blocking(move || {
                    let conn = db.get()?;
                    file::delete(&conn, &row_id)
                })
                .await
                .map_err(|e| anyhow::anyhow!(e))
                .and_then(|r| r);
                match removed {
                    Ok(_) => Ok(plan),
                    Err(e) => Err((plan.id, format!("provider delete ok, row delete failed: {}", e))),
                }
            }
            Err(e) => Err((plan.id, e.to_string())),
        }
    }

    /// Shared delete executor: batches of `batch_size`, at most
    /// `worker_count` provider calls in flight per batch.
    async fn execute_deletes(
        &self,
        progress_id: i64,
        plans: Vec<DeletePlan>,
        opts: &DeleteOptions,
    ) -> anyhow::Result<CleanupOutcome> {
        let mut outcome = CleanupOutcome {
            requested: plans.len(),
            ..CleanupOutcome::default()
        };

        let parent_folders: HashSet<String> = if opts.cleanup_folders {
            plans.iter().flat_map(|p| p.parents.iter().cloned()).collect()
        } else {
            HashSet::new()
        };

        let concurrency = opts.worker_count.max(1);
        let mut processed: i64 = 0;
        for batch in plans.chunks(opts.batch_size.max(1)) {
            let results: Vec<Result<DeletePlan, (String, String)>> =
                futures_util::stream::iter(batch.iter().cloned())
                    .map(|plan| self.delete_one(plan))
                    .buffer_unordered(concurrency)
                    .collect()
                    .await;

            for result in results {
                processed += 1;
                match result {
                    Ok(plan) => {
                        outcome.deleted += 1;
                        outcome.bytes_saved += plan.size;
                    }
                    Err((id, error)) => outcome.errors.push(format!("{}: {}", id, error)),
                }
            }
            self.progress
                .update(
                    progress_id,
                    processed,
                    format!("deleted {}/{} files", outcome.deleted, outcome.requested),
                )
                .await?;
        }

        if opts.cleanup_folders && !parent_folders.is_empty() {
            outcome.folders_removed = self.cleanup_parent_folders(parent_folders).await;
        }

        Ok(outcome)
    }

    /// Walk each ancestor chain upwards, deleting folders the provider
    /// now reports empty, stopping at the first non-empty ancestor or
    /// the account root.
    async fn cleanup_parent_folders(&self, folders: HashSet<String>) -> usize {
        let mut removed = 0;
        for start in folders {
            let mut current = start;
            loop {
                if current == ROOT_FOLDER_ID {
                    break;
                }
                let meta = match self.provider.get_folder(&current).await {
                    Ok(m) => m,
                    // Already gone (possibly via a sibling's walk)
                    Err(StorageError::NotFound(_)) => break,
                    Err(e) => {
                        tracing::warn!(folder = %current, error = %e, "Parent lookup failed during cleanup");
                        break;
                    }
                };
                if meta.parents.is_empty() {
                    break;
                }
                match self.is_folder_empty(&current).await {
                    Ok(true) => {
                        if let Err(e) = self.provider.delete_folder(&current).await {
                            tracing::warn!(folder = %current, error = %e, "Empty folder delete failed");
                            break;
                        }
                        removed += 1;
                        tracing::info!(folder = %current, "Removed empty parent folder");
                        current = meta.parents[0].clone();
                    }
                    Ok(false) => break,
                    Err(e) => {
                        tracing::warn!(folder = %current, error = %e, "Emptiness check failed");
                        break;
                    }
                }
            }
        }
        removed
    }

    async fn plans_from_ids(
        &self,
        file_ids: &[String],
        safety_checks: bool,
    ) -> anyhow::Result<(Vec<DeletePlan>, Vec<String>)> {
        let ids = file_ids.to_vec();
        let db = self.db.clone();
        let rows = tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            file::find_by_ids(&conn, &ids)
        })
        .await
        .map_err(|e| anyhow::anyhow!(e))??;

        let known: HashSet<&str> = rows.iter().map(|f| f.id.as_str()).collect();
        let mut errors = Vec::new();
        let mut plans: Vec<DeletePlan> = rows
            .iter()
            .map(|f| DeletePlan {
                id: f.id.clone(),
                size: f.size,
                parents: f.parents.clone(),
            })
            .collect();

        for id in file_ids {
            if !known.contains(id.as_str()) {
                if safety_checks {
                    errors.push(format!("{}: not tracked in metadata store, skipped", id));
                } else {
                    plans.push(DeletePlan {
                        id: id.clone(),
                        size: 0,
                        parents: Vec::new(),
                    });
                }
            }
        }
        Ok((plans, errors))
    }

    pub async fn delete_files(
        &self,
        progress_id: i64,
        file_ids: Vec<String>,
        opts: DeleteOptions,
    ) -> Result<CleanupOutcome, EngineError> {
        self.progress.mark_running(progress_id).await?;
        self.progress.set_total(progress_id, file_ids.len() as i64).await?;

        let (plans, skip_errors) = self.plans_from_ids(&file_ids, opts.safety_checks).await?;
        let mut outcome = self.execute_deletes(progress_id, plans, &opts).await?;
        outcome.requested = file_ids.len();
        outcome.errors.extend(skip_errors);

        self.progress.complete(progress_id).await?;
        tracing::info!(
            progress_id,
            deleted = outcome.deleted,
            bytes_saved = outcome.bytes_saved,
            folders_removed = outcome.folders_removed,
            errors = outcome.errors.len(),
            "File cleanup completed"
        );
        Ok(outcome)
    }

    /// Delete every member of a duplicate group except the keeper.
    pub async fn delete_duplicates_from_group(
        &self,
        progress_id: i64,
        group_id: i64,
        keep_file_id: String,
        opts: DeleteOptions,
    ) -> Result<CleanupOutcome, EngineError> {
        let db = self.db.clone();
        let group = tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            duplicate_group::find_by_id(&conn, group_id)
        })
        .await
        .map_err(|e| anyhow::anyhow!(e))??
        .ok_or_else(|| EngineError::NotFound(format!("duplicate group {} not found", group_id)))?;

        if !group.files.iter().any(|f| f.id == keep_file_id) {
            return Err(EngineError::BadInput(format!(
                "keeper {} is not a member of group {}",
                keep_file_id, group_id
            )));
        }

        let victims: Vec<String> = group
            .files
            .iter()
            .filter(|f| f.id != keep_file_id)
            .map(|f| f.id.clone())
            .collect();

        let outcome = self.delete_files(progress_id, victims, opts).await?;

        // The group now has a single member and no longer qualifies
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            duplicate_group::cleanup_empty_groups(&conn)
        })
        .await
        .map_err(|e| anyhow::anyhow!(e))??;

        Ok(outcome)
    }

    /// List a folder, match file names against a user regex, and either
    /// report the candidates (dry run) or delete them.
    pub async fn cleanup_by_pattern(
        &self,
        progress_id: i64,
        folder_id: &str,
        pattern: &str,
        recursive: bool,
        dry_run: bool,
        cleanup_folders: bool,
        opts: DeleteOptions,
    ) -> Result<PatternOutcome, EngineError> {
        let matcher = regex::Regex::new(pattern)
            .map_err(|e| EngineError::BadInput(format!("invalid pattern: {}", e)))?;

        self.progress.mark_running(progress_id).await?;

        let files =
            storage::collect_folder_files(self.provider.as_ref(), folder_id, recursive, 1000)
                .await?;
        let matched: Vec<_> = files
            .into_iter()
            .filter(|f| matcher.is_match(&f.name))
            .collect();

        let mut outcome = PatternOutcome {
            dry_run,
            total_bytes: matched.iter().map(|f| f.size).sum(),
            candidates: matched
                .iter()
                .map(|f| PatternCandidate {
                    id: f.id.clone(),
                    name: f.name.clone(),
                    size: f.size,
                })
                .collect(),
            ..PatternOutcome::default()
        };

        if dry_run {
            self.progress.set_total(progress_id, matched.len() as i64).await?;
            self.progress
                .update(
                    progress_id,
                    matched.len() as i64,
                    format!("dry run matched {} files", matched.len()),
                )
                .await?;
            self.progress.complete(progress_id).await?;
            return Ok(outcome);
        }

        self.progress.set_total(progress_id, matched.len() as i64).await?;
        let plans: Vec<DeletePlan> = matched
            .iter()
            .map(|f| DeletePlan {
                id: f.id.clone(),
                size: f.size,
                parents: f.parents.clone(),
            })
            .collect();
        let delete_opts = DeleteOptions {
            cleanup_folders,
            ..opts
        };
        let deleted = self.execute_deletes(progress_id, plans, &delete_opts).await?;
        outcome.deleted = deleted.deleted;
        outcome.folders_removed = deleted.folders_removed;
        outcome.errors = deleted.errors;

        self.progress.complete(progress_id).await?;
        Ok(outcome)
    }

    async fn subtree_folders(
        &self,
        root: &str,
        recursive: bool,
    ) -> Result<Vec<(String, usize)>, StorageError> {
        let mut found = Vec::new();
        let mut stack = vec![(root.to_string(), 0usize)];
        while let Some((current, depth)) = stack.pop() {
            let mut page_token: Option<String> = None;
            loop {
                let token = page_token.clone();
                let page = storage::with_retries(3, || {
                    self.provider.list_children(&current, token.clone(), 1000)
                })
                .await?;
                for item in page.files {
                    if item.is_folder() {
                        found.push((item.id.clone(), depth + 1));
                        if recursive {
                            stack.push((item.id, depth + 1));
                        }
                    }
                }
                match page.next_page_token {
                    Some(t) => page_token = Some(t),
                    None => break,
                }
            }
        }
        Ok(found)
    }

    /// Remove empty folders, deepest first so a parent emptied by its
    /// children's removal is caught in the same pass. With a root the
    /// walk is scoped to that subtree; without one every folder in the
    /// account is considered.
    pub async fn sweep_empty_folders(
        &self,
        progress_id: i64,
        root_folder_id: Option<String>,
        recursive: bool,
    ) -> Result<SweepOutcome, EngineError> {
        self.progress.mark_running(progress_id).await?;

        let mut folders: Vec<(String, usize)> = match &root_folder_id {
            Some(root) => self.subtree_folders(root, recursive).await?,
            None => {
                let mut all = Vec::new();
                let mut page_token: Option<String> = None;
                loop {
                    let token = page_token.clone();
                    let page = storage::with_retries(3, || {
                        self.provider.list_all(token.clone(), 1000)
                    })
                    .await?;
                    for item in page.files {
                        if item.is_folder() {
                            let depth = match self.provider.folder_path(&item.id).await {
                                Ok(path) => path.matches('/').count(),
                                Err(_) => 1,
                            };
                            all.push((item.id, depth));
                        }
                    }
                    match page.next_page_token {
                        Some(t) => page_token = Some(t),
                        None => break,
                    }
                }
                all
            }
        };

        folders.sort_by(|a, b| b.1.cmp(&a.1));

        let mut outcome = SweepOutcome::default();
        self.progress.set_total(progress_id, folders.len() as i64).await?;
        for (index, (folder_id, _)) in folders.iter().enumerate() {
            outcome.checked += 1;
            match self.is_folder_empty(folder_id).await {
                Ok(true) => match self.provider.delete_folder(folder_id).await {
                    Ok(()) | Err(StorageError::NotFound(_)) => {
                        outcome.removed += 1;
                        tracing::info!(folder = %folder_id, "Removed empty folder");
                    }
                    Err(e) => outcome.errors.push(format!("{}: {}", folder_id, e)),
                },
                Ok(false) => {}
                Err(StorageError::NotFound(_)) => {}
                Err(e) => outcome.errors.push(format!("{}: {}", folder_id, e)),
            }
            self.progress
                .update(
                    progress_id,
                    (index + 1) as i64,
                    format!("checked {} folders, removed {}", outcome.checked, outcome.removed),
                )
                .await?;
        }

        self.progress.complete(progress_id).await?;
        Ok(outcome)
    }
}
