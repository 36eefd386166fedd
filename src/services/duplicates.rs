use crate::db::connection::DbPool;
use crate::error::EngineError;
use crate::models::duplicate_group;
use crate::models::file::{self, FileEntry};
use crate::models::progress::META_CURRENT_PHASE;
use crate::services::hash::HashService;
use crate::services::hash_pipeline::HashPipeline;
use crate::services::progress::ProgressService;
use crate::storage::{self, StorageProvider};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

pub const DEFAULT_MIN_FILE_SIZE: i64 = 1024;
pub const DEFAULT_MAX_RESULTS: usize = 1000;

#[derive(Debug, Clone)]
pub struct SearchParams {
    pub calculate_hashes: bool,
    pub force_recalculate: bool,
    pub min_file_size: i64,
    pub max_results: usize,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            calculate_hashes: true,
            force_recalculate: false,
            min_file_size: DEFAULT_MIN_FILE_SIZE,
            max_results: DEFAULT_MAX_RESULTS,
        }
    }
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateReport {
    pub total_files: i64,
    pub files_with_digest: i64,
    pub total_groups: i64,
    pub total_duplicate_files: i64,
    pub total_wasted_bytes: i64,
    pub hashes_calculated: usize,
    pub hashes_skipped: usize,
    pub errors: Vec<String>,
}

/// Whole-corpus duplicate discovery: digest whatever is missing one,
/// bucket by digest, rank by recoverable bytes, persist the winning
/// groups.
pub struct DuplicateEngine {
    db: DbPool,
    provider: Arc<dyn StorageProvider>,
    progress: ProgressService,
    hasher: Arc<HashService>,
    worker_count: usize,
}

impl DuplicateEngine {
    pub fn new(
        db: DbPool,
        provider: Arc<dyn StorageProvider>,
        progress: ProgressService,
        hasher: Arc<HashService>,
        worker_count: usize,
    ) -> Self {
        Self {
            db,
            provider,
            progress,
            hasher,
            worker_count,
        }
    }

    /// Bucket by digest, keep real duplicates, rank by wasted bytes
    /// descending and cap the result count.
    fn group_by_digest(
        files: Vec<FileEntry>,
        min_file_size: i64,
        max_results: usize,
    ) -> Vec<(String, Vec<FileEntry>)> {
        let mut buckets: HashMap<String, Vec<FileEntry>> = HashMap::new();
        for f in files {
            if f.size <= 0 || f.size < min_file_size || f.hash.is_empty() {
                continue;
            }
            buckets.entry(f.hash.clone()).or_default().push(f);
        }

        let mut groups: Vec<(String, Vec<FileEntry>)> = buckets
            .into_iter()
            .filter(|(_, members)| members.len() >= 2)
            .collect();
        groups.sort_by_key(|(hash, members)| {
            let wasted = (members.len() as i64 - 1) * members[0].size;
            (std::cmp::Reverse(wasted), hash.clone())
        });
        groups.truncate(max_results);
        groups
    }

    async fn persist_groups(&self, groups: Vec<(String, Vec<FileEntry>)>) -> anyhow::Result<usize> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = db.get()?;
            let saved = groups.len();
            for (hash, members) in groups {
                let ids: Vec<String> = members.into_iter().map(|f| f.id).collect();
                duplicate_group::save_group(&mut conn, &hash, &ids)?;
            }
            duplicate_group::cleanup_empty_groups(&conn)?;
            Ok::<_, anyhow::Error>(saved)
        })
        .await
        .map_err(|e| anyhow::anyhow!(e))?
    }

    async fn hash_missing(
        &self,
        progress_id: i64,
        files: Vec<FileEntry>,
    ) -> anyhow::Result<(usize, usize, Vec<String>)> {
        if files.is_empty() {
            return Ok((0, 0, Vec::new()));
        }
        self.progress.set_total(progress_id, files.len() as i64).await?;
        let pipeline = HashPipeline::new(
            self.db.clone(),
            self.hasher.clone(),
            self.progress.clone(),
            self.worker_count,
        );
        let stats = pipeline.run(progress_id, files).await?;
        Ok((stats.succeeded, stats.skipped_too_large, stats.errors))
    }

    async fn build_report(
        &self,
        hashes_calculated: usize,
        hashes_skipped: usize,
        errors: Vec<String>,
    ) -> anyhow::Result<DuplicateReport> {
        let db = self.db.clone();
        let (stats, total_files, files_with_digest) = tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            Ok::<_, anyhow::Error>((
                duplicate_group::stats(&conn)?,
                file::count(&conn)?,
                file::count_with_hash(&conn)?,
            ))
        })
        .await
        .map_err(|e| anyhow::anyhow!(e))??;
        Ok(DuplicateReport {
            total_files,
            files_with_digest,
            total_groups: stats.total_groups,
            total_duplicate_files: stats.total_duplicate_files,
            total_wasted_bytes: stats.total_wasted_bytes,
            hashes_calculated,
            hashes_skipped,
            errors,
        })
    }

    pub async fn run_search(
        &self,
        progress_id: i64,
        params: SearchParams,
    ) -> Result<DuplicateReport, EngineError> {
        self.progress.mark_running(progress_id).await?;

        let mut hashes_calculated = 0;
        let mut hashes_skipped = 0;
        let mut errors = Vec::new();

        if params.calculate_hashes {
            self.progress
                .set_metadata(progress_id, META_CURRENT_PHASE, "calculating_hashes")
                .await?;
            let force = params.force_recalculate;
            let db = self.db.clone();
            let pending = tokio::task::spawn_blocking(move || {
                let conn = db.get()?;
                if force {
                    Ok::<_, anyhow::Error>(
                        file::find_with_hash(&conn)?
                            .into_iter()
                            .chain(file::find_without_hash(&conn)?)
                            .filter(|f| f.size > 0)
                            .collect::<Vec<_>>(),
                    )
                } else {
                    file::find_without_hash(&conn)
                }
            })
            .await
            .map_err(|e| anyhow::anyhow!(e))??;

            let (calculated, skipped, hash_errors) =
                self.hash_missing(progress_id, pending).await?;
            hashes_calculated = calculated;
            hashes_skipped = skipped;
            errors = hash_errors;
        }

        self.progress
            .set_metadata(progress_id, META_CURRENT_PHASE, "grouping")
            .await?;
        self.progress
            .update(progress_id, 0, "grouping files by digest")
            .await
            .ok();

        let db = self.db.clone();
        let digested = tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            file::find_with_hash(&conn)
        })
        .await
        .map_err(|e| anyhow::anyhow!(e))??;

        let groups = Self::group_by_digest(digested, params.min_file_size, params.max_results);

        self.progress
            .set_metadata(progress_id, META_CURRENT_PHASE, "saving_groups")
            .await?;
        let saved = self.persist_groups(groups).await?;

        self.progress
            .update(progress_id, saved as i64, format!("saved {} duplicate groups", saved))
            .await?;
        self.progress.complete(progress_id).await?;

        let report = self.build_report(hashes_calculated, hashes_skipped, errors).await?;
        tracing::info!(
            progress_id,
            groups = report.total_groups,
            wasted_bytes = report.total_wasted_bytes,
            "Duplicate search completed"
        );
        Ok(report)
    }

    /// Intra-folder variant: digest and bucket only the files living
    /// under one folder.
    pub async fn run_folder_search(
        &self,
        progress_id: i64,
        folder_id: &str,
        recursive: bool,
        min_file_size: i64,
    ) -> Result<DuplicateReport, EngineError> {
        self.progress.mark_running(progress_id).await?;
        self.progress
            .set_metadata(progress_id, META_CURRENT_PHASE, "scanning_folder")
            .await?;

        // Materialize the subtree so digests have rows to land on
        let collected: Vec<FileEntry> =
            storage::collect_folder_files(self.provider.as_ref(), folder_id, recursive, 1000)
                .await?
                .iter()
                .map(crate::services::scan::ScanEngine::remote_to_entry)
                .collect();

        let db = self.db.clone();
        let to_store = collected.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = db.get()?;
            let tx = conn.transaction()?;
            for f in &to_store {
                file::upsert(&tx, f)?;
            }
            tx.commit()?;
            Ok::<_, anyhow::Error>(())
        })
        .await
        .map_err(|e| anyhow::anyhow!(e))??;

        self.progress
            .set_metadata(progress_id, META_CURRENT_PHASE, "calculating_hashes")
            .await?;
        let ids: Vec<String> = collected.iter().map(|f| f.id.clone()).collect();
        let db = self.db.clone();
        let ids2 = ids.clone();
        let pending = tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            let rows = file::find_by_ids(&conn, &ids2)?;
            Ok::<_, anyhow::Error>(
                rows.into_iter()
                    .filter(|f| !f.hash_calculated && f.size > 0)
                    .collect::<Vec<_>>(),
            )
        })
        .await
        .map_err(|e| anyhow::anyhow!(e))??;

        let (hashes_calculated, hashes_skipped, errors) =
            self.hash_missing(progress_id, pending).await?;

        self.progress
            .set_metadata(progress_id, META_CURRENT_PHASE, "grouping")
            .await?;
        let db = self.db.clone();
        let scoped = tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            let rows = file::find_by_ids(&conn, &ids)?;
            Ok::<_, anyhow::Error>(
                rows.into_iter().filter(|f| f.hash_calculated).collect::<Vec<_>>(),
            )
        })
        .await
        .map_err(|e| anyhow::anyhow!(e))??;

        let groups = Self::group_by_digest(scoped, min_file_size, DEFAULT_MAX_RESULTS);

        self.progress
            .set_metadata(progress_id, META_CURRENT_PHASE, "saving_groups")
            .await?;
        self.persist_groups(groups).await?;
        self.progress.complete(progress_id).await?;

        self.build_report(hashes_calculated, hashes_skipped, errors)
            .await
            .map_err(EngineError::from)
    }
}
