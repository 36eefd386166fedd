use crate::db::connection::DbPool;
use crate::error::EngineError;
use crate::models::comparison::{self, ComparisonResult, NewComparisonResult};
use crate::models::file::{self, FileEntry};
use crate::models::progress::META_CURRENT_PHASE;
use crate::services::hash::HashService;
use crate::services::hash_pipeline::HashPipeline;
use crate::services::progress::ProgressService;
use crate::services::scan::ScanEngine;
use crate::storage::{self, StorageProvider};
use std::collections::HashSet;
use std::sync::Arc;

const META_SOURCE_FOLDER: &str = "sourceFolderId";
const META_TARGET_FOLDER: &str = "targetFolderId";
const META_INCLUDE_SUBFOLDERS: &str = "includeSubfolders";
const META_DEEP_COMPARISON: &str = "deepComparison";
const META_MIN_FILE_SIZE: &str = "minFileSize";

/// Checkpointed phases of a folder comparison. The current phase is
/// persisted in the progress metadata so an interrupted job restarts
/// from the earliest unfinished step, not from wherever the process
/// happened to die.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ComparePhase {
    Initialized,
    ScanningSource,
    SourceCompleted,
    ScanningTarget,
    TargetCompleted,
    CalculatingHashes,
    HashesCompleted,
    ComparingFiles,
    SavingResults,
    Completed,
}

impl ComparePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComparePhase::Initialized => "initialized",
            ComparePhase::ScanningSource => "scanning_source",
            ComparePhase::SourceCompleted => "source_completed",
            ComparePhase::ScanningTarget => "scanning_target",
            ComparePhase::TargetCompleted => "target_completed",
            ComparePhase::CalculatingHashes => "calculating_hashes",
            ComparePhase::HashesCompleted => "hashes_completed",
            ComparePhase::ComparingFiles => "comparing_files",
            ComparePhase::SavingResults => "saving_results",
            ComparePhase::Completed => "completed",
        }
    }
}

impl std::str::FromStr for ComparePhase {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initialized" => Ok(ComparePhase::Initialized),
            "scanning_source" => Ok(ComparePhase::ScanningSource),
            "source_completed" => Ok(ComparePhase::SourceCompleted),
            "scanning_target" => Ok(ComparePhase::ScanningTarget),
            "target_completed" => Ok(ComparePhase::TargetCompleted),
            "calculating_hashes" => Ok(ComparePhase::CalculatingHashes),
            "hashes_completed" => Ok(ComparePhase::HashesCompleted),
            "comparing_files" => Ok(ComparePhase::ComparingFiles),
            "saving_results" => Ok(ComparePhase::SavingResults),
            "completed" => Ok(ComparePhase::Completed),
            other => Err(EngineError::Phase(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompareParams {
    pub source_folder_id: String,
    pub target_folder_id: String,
    pub include_subfolders: bool,
    pub deep_comparison: bool,
    pub min_file_size: i64,
}

/// Folder-vs-folder comparison: list both subtrees, digest what is
/// missing one, and record which target files duplicate something in
/// the source.
pub struct ComparisonEngine {
    db: DbPool,
    provider: Arc<dyn StorageProvider>,
    progress: ProgressService,
    hasher: Arc<HashService>,
    worker_count: usize,
}

impl ComparisonEngine {
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

    async fn enter_phase(&self, progress_id: i64, phase: ComparePhase) -> anyhow::Result<()> {
        self.progress
            .set_metadata(progress_id, META_CURRENT_PHASE, phase.as_str())
            .await?;
        self.progress
            .update(progress_id, 0, format!("phase: {}", phase.as_str()))
            .await
            .ok();
        Ok(())
    }

    /// Persist the request parameters so a resume can rebuild them.
    pub async fn record_params(&self, progress_id: i64, params: &CompareParams) -> anyhow::Result<()> {
        self.progress
            .set_metadata(progress_id, META_SOURCE_FOLDER, &params.source_folder_id)
            .await?;
        self.progress
            .set_metadata(progress_id, META_TARGET_FOLDER, &params.target_folder_id)
            .await?;
        self.progress
            .set_metadata(
                progress_id,
                META_INCLUDE_SUBFOLDERS,
                params.include_subfolders.to_string(),
            )
            .await?;
        self.progress
            .set_metadata(
                progress_id,
                META_DEEP_COMPARISON,
                params.deep_comparison.to_string(),
            )
            .await?;
        self.progress
            .set_metadata(progress_id, META_MIN_FILE_SIZE, params.min_file_size.to_string())
            .await?;
        self.progress
            .set_metadata(progress_id, META_CURRENT_PHASE, ComparePhase::Initialized.as_str())
            .await?;
        Ok(())
    }

    async fn load_params(&self, progress_id: i64) -> Result<CompareParams, EngineError> {
        let source = self
            .progress
            .get_metadata(progress_id, META_SOURCE_FOLDER)
            .await?
            .ok_or_else(|| EngineError::Phase("missing sourceFolderId checkpoint".into()))?;
        let target = self
            .progress
            .get_metadata(progress_id, META_TARGET_FOLDER)
            .await?
            .ok_or_else(|| EngineError::Phase("missing targetFolderId checkpoint".into()))?;
        let include_subfolders = self
            .progress
            .get_metadata(progress_id, META_INCLUDE_SUBFOLDERS)
            .await?
            .map(|v| v == "true")
            .unwrap_or(true);
        let deep_comparison = self
            .progress
            .get_metadata(progress_id, META_DEEP_COMPARISON)
            .await?
            .map(|v| v == "true")
            .unwrap_or(true);
        let min_file_size = self
            .progress
            .get_metadata(progress_id, META_MIN_FILE_SIZE)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        Ok(CompareParams {
            source_folder_id: source,
            target_folder_id: target,
            include_subfolders,
            deep_comparison,
            min_file_size,
        })
    }

    async fn scan_side(
        &self,
        progress_id: i64,
        folder_id: &str,
        include_subfolders: bool,
        min_file_size: i64,
        phase: ComparePhase,
        done_phase: ComparePhase,
    ) -> Result<Vec<FileEntry>, EngineError> {
        self.enter_phase(progress_id, phase).await?;
        let entries: Vec<FileEntry> = storage::collect_folder_files(
            self.provider.as_ref(),
            folder_id,
            include_subfolders,
            1000,
        )
        .await?
        .iter()
        .filter(|f| f.size >= min_file_size)
        .map(ScanEngine::remote_to_entry)
        .collect();

        // Rows land before any dependent record references them
        let db = self.db.clone();
        let to_store = entries.clone();
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

        self.enter_phase(progress_id, done_phase).await?;
        Ok(entries)
    }

    async fn reload(&self, ids: Vec<String>) -> anyhow::Result<Vec<FileEntry>> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            file::find_by_ids(&conn, &ids)
        })
        .await
        .map_err(|e| anyhow::anyhow!(e))?
    }

    pub async fn run(
        &self,
        progress_id: i64,
        params: CompareParams,
    ) -> Result<ComparisonResult, EngineError> {
        if params.source_folder_id == params.target_folder_id {
            return Err(EngineError::BadInput(
                "source and target folders must be distinct".into(),
            ));
        }

        self.progress.mark_running(progress_id).await?;

        let source_folder = self.provider.get_folder(&params.source_folder_id).await?;
        let target_folder = self.provider.get_folder(&params.target_folder_id).await?;

        let source = self
            .scan_side(
                progress_id,
                &params.source_folder_id,
                params.include_subfolders,
                params.min_file_size,
                ComparePhase::ScanningSource,
                ComparePhase::SourceCompleted,
            )
            .await?;
        if self.progress.is_paused(progress_id).await {
            return Err(EngineError::Phase("paused".into()));
        }
        let target = self
            .scan_side(
                progress_id,
                &params.target_folder_id,
                params.include_subfolders,
                params.min_file_size,
                ComparePhase::ScanningTarget,
                ComparePhase::TargetCompleted,
            )
            .await?;

        let source_ids: Vec<String> = source.iter().map(|f| f.id.clone()).collect();
        let target_ids: Vec<String> = target.iter().map(|f| f.id.clone()).collect();

        if params.deep_comparison {
            self.enter_phase(progress_id, ComparePhase::CalculatingHashes).await?;
            let mut all_ids = source_ids.clone();
            all_ids.extend(target_ids.iter().cloned());
            let pending: Vec<FileEntry> = self
                .reload(all_ids)
                .await?
                .into_iter()
                .filter(|f| !f.hash_calculated && f.size > 0)
                .collect();
            if !pending.is_empty() {
                self.progress.set_total(progress_id, pending.len() as i64).await?;
                let pipeline = HashPipeline::new(
                    self.db.clone(),
                    self.hasher.clone(),
                    self.progress.clone(),
                    self.worker_count,
                );
                pipeline.run(progress_id, pending).await?;
            }
            self.enter_phase(progress_id, ComparePhase::HashesCompleted).await?;
        }

        self.enter_phase(progress_id, ComparePhase::ComparingFiles).await?;
        let source_rows = self.reload(source_ids).await?;
        let target_rows = self.reload(target_ids).await?;

        let duplicates: Vec<String> = if params.deep_comparison {
            let source_digests: HashSet<&str> = source_rows
                .iter()
                .filter(|f| f.hash_calculated)
                .map(|f| f.hash.as_str())
                .collect();
            target_rows
                .iter()
                .filter(|f| f.hash_calculated && source_digests.contains(f.hash.as_str()))
                .map(|f| f.id.clone())
                .collect()
        } else {
            // Shallow mode keys on (name, size); used when hashing is
            // disabled or infeasible
            let source_keys: HashSet<(&str, i64)> = source_rows
                .iter()
                .map(|f| (f.name.as_str(), f.size))
                .collect();
            target_rows
                .iter()
                .filter(|f| source_keys.contains(&(f.name.as_str(), f.size)))
                .map(|f| f.id.clone())
                .collect()
        };

        self.enter_phase(progress_id, ComparePhase::SavingResults).await?;

        // Every referenced file row must already be persisted before
        // the dependent result row is written
        let persisted: HashSet<String> = self
            .reload(duplicates.clone())
            .await?
            .into_iter()
            .map(|f| f.id)
            .collect();
        if let Some(missing) = duplicates.iter().find(|id| !persisted.contains(*id)) {
            return Err(EngineError::Integrity(format!(
                "duplicate file {} is not persisted in the metadata store",
                missing
            )));
        }

        let data = NewComparisonResult {
            source_folder_id: params.source_folder_id.clone(),
            source_folder_name: source_folder.name,
            target_folder_id: params.target_folder_id.clone(),
            target_folder_name: target_folder.name,
            source_file_count: source_rows.len() as i64,
            source_total_size: source_rows.iter().map(|f| f.size).sum(),
            target_file_count: target_rows.len() as i64,
            target_total_size: target_rows.iter().map(|f| f.size).sum(),
            duplicate_file_ids: duplicates,
        };
        let db = self.db.clone();
        let result = tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            comparison::save(&conn, &data)
        })
        .await
        .map_err(|e| anyhow::anyhow!(e))??;

        self.progress
            .set_metadata(progress_id, META_CURRENT_PHASE, ComparePhase::Completed.as_str())
            .await?;
        self.progress.complete(progress_id).await?;

        tracing::info!(
            progress_id,
            source = %result.source_folder_id,
            target = %result.target_folder_id,
            duplicates = result.duplicate_file_ids.len(),
            percent = result.duplication_percent,
            "Folder comparison completed"
        );
        Ok(result)
    }

    /// Pick up an interrupted comparison. Listings are recomputed (the
    /// provider is the source of truth) while digests computed before
    /// the interruption are reused from the files table, so the run
    /// effectively continues at the earliest unfinished phase.
    ///
    /// Returns the progress row id the rerun executes under together
    /// with the reloaded parameters. A paused row is resumed in place;
    /// a failed row stays failed (terminal) and its checkpoint moves to
    /// a fresh row.
    pub async fn prepare_resume(
        &self,
        progress_id: i64,
    ) -> Result<(i64, CompareParams), EngineError> {
        use crate::models::progress::{OperationKind, ProgressStatus};

        let row = self
            .progress
            .get(progress_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("progress {} not found", progress_id)))?;
        let phase: ComparePhase = self
            .progress
            .get_metadata(progress_id, META_CURRENT_PHASE)
            .await?
            .unwrap_or_else(|| ComparePhase::Initialized.as_str().to_string())
            .parse()?;
        if phase == ComparePhase::Completed || row.status == ProgressStatus::Completed {
            return Err(EngineError::Conflict(format!(
                "comparison {} already completed",
                progress_id
            )));
        }

        let params = self.load_params(progress_id).await?;
        let run_id = match row.status {
            ProgressStatus::Paused => {
                self.progress.resume(progress_id).await?;
                progress_id
            }
            ProgressStatus::Pending | ProgressStatus::Running => progress_id,
            ProgressStatus::Failed => {
                tracing::info!(
                    progress_id,
                    phase = phase.as_str(),
                    "Retrying failed comparison on a fresh progress row"
                );
                let fresh = self
                    .progress
                    .start(OperationKind::FolderComparison, 0)
                    .await?;
                self.record_params(fresh.id, &params).await?;
                fresh.id
            }
            ProgressStatus::Completed => unreachable!("handled above"),
        };
        Ok((run_id, params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrate::test_pool;
    use crate::models::progress::{OperationKind, ProgressStatus};
    use crate::services::hash::HashAlgorithm;
    use crate::storage::mock::MockProvider;

    fn engine(pool: &DbPool, provider: Arc<MockProvider>) -> ComparisonEngine {
        let progress = ProgressService::new(pool.clone());
        let hasher = Arc::new(HashService::new(
            provider.clone(),
            HashAlgorithm::Sha256,
            10 * 1024 * 1024,
            64 * 1024,
        ));
        ComparisonEngine::new(pool.clone(), provider, progress, hasher, 3)
    }

    fn params(deep: bool) -> CompareParams {
        CompareParams {
            source_folder_id: "src".into(),
            target_folder_id: "dst".into(),
            include_subfolders: true,
            deep_comparison: deep,
            min_file_size: 0,
        }
    }

    fn mirrored_provider() -> Arc<MockProvider> {
        let provider = Arc::new(MockProvider::new());
        provider.add_folder("src", "Source", "root");
        provider.add_folder("dst", "Target", "root");
        provider.add_file("p", "p.doc", "src", b"alpha content");
        provider.add_file("q", "q.doc", "src", b"beta content");
        provider.add_file("r", "r.doc", "src", b"gamma content");
        provider.add_file("p2", "p-copy.doc", "dst", b"alpha content");
        provider.add_file("q2", "q-copy.doc", "dst", b"beta content");
        provider.add_file("r2", "r-copy.doc", "dst", b"gamma content");
        provider
    }

    #[tokio::test]
    async fn test_fully_duplicated_target() -> anyhow::Result<()> {
        let pool = test_pool();
        let provider = mirrored_provider();
        let progress = ProgressService::new(pool.clone());
        let eng = engine(&pool, provider);

        let p = progress.start(OperationKind::FolderComparison, 0).await?;
        eng.record_params(p.id, &params(true)).await?;
        let result = eng.run(p.id, params(true)).await?;

        assert_eq!(result.duplication_percent, 100.0);
        assert!(result.target_fully_duplicated);
        assert_eq!(result.duplicate_file_ids.len(), 3);

        let done = progress.get(p.id).await?.unwrap();
        assert_eq!(done.status, ProgressStatus::Completed);
        assert_eq!(
            progress.get_metadata(p.id, META_CURRENT_PHASE).await?.as_deref(),
            Some("completed")
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_partial_duplication_percentage() -> anyhow::Result<()> {
        let pool = test_pool();
        let provider = Arc::new(MockProvider::new());
        provider.add_folder("src", "Source", "root");
        provider.add_folder("dst", "Target", "root");
        provider.add_file("s1", "a.txt", "src", b"shared bytes");
        provider.add_file("t1", "a-copy.txt", "dst", b"shared bytes");
        provider.add_file("t2", "unique.txt", "dst", b"only here");

        let progress = ProgressService::new(pool.clone());
        let eng = engine(&pool, provider);
        let p = progress.start(OperationKind::FolderComparison, 0).await?;
        let result = eng.run(p.id, params(true)).await?;

        assert_eq!(result.duplicate_file_ids, vec!["t1".to_string()]);
        assert_eq!(result.duplication_percent, 50.0);
        assert!(!result.target_fully_duplicated);
        Ok(())
    }

    #[tokio::test]
    async fn test_shallow_comparison_keys_on_name_and_size() -> anyhow::Result<()> {
        let pool = test_pool();
        let provider = Arc::new(MockProvider::new());
        provider.add_folder("src", "Source", "root");
        provider.add_folder("dst", "Target", "root");
        // Same name and size, different bytes: shallow calls it a match
        provider.add_file("s1", "same.txt", "src", b"AAAA");
        provider.add_file("t1", "same.txt", "dst", b"BBBB");
        provider.add_file("t2", "other.txt", "dst", b"CCCC");

        let progress = ProgressService::new(pool.clone());
        let eng = engine(&pool, provider);
        let p = progress.start(OperationKind::FolderComparison, 0).await?;
        let result = eng.run(p.id, params(false)).await?;

        assert_eq!(result.duplicate_file_ids, vec!["t1".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn test_rejects_identical_folder_pair() {
        let pool = test_pool();
        let provider = Arc::new(MockProvider::new());
        provider.add_folder("src", "Source", "root");
        let progress = ProgressService::new(pool.clone());
        let eng = engine(&pool, provider);

        let p = progress.start(OperationKind::FolderComparison, 0).await.unwrap();
        let mut bad = params(true);
        bad.target_folder_id = "src".into();
        assert!(matches!(
            eng.run(p.id, bad).await,
            Err(EngineError::BadInput(_))
        ));
    }

    #[tokio::test]
    async fn test_resume_reuses_stored_digests() -> anyhow::Result<()> {
        let pool = test_pool();
        let provider = mirrored_provider();
        let progress = ProgressService::new(pool.clone());
        let eng = engine(&pool, provider.clone());

        let p = progress.start(OperationKind::FolderComparison, 0).await?;
        eng.record_params(p.id, &params(true)).await?;

        // Simulate a crash mid-hashing: the p/p2 pair already has
        // stored digests, the job row was left paused
        progress.mark_running(p.id).await?;
        {
            let conn = pool.get()?;
            for (id, name, parent) in [("p", "p.doc", "src"), ("p2", "p-copy.doc", "dst")] {
                let mut e = FileEntry::new(id, name, 13);
                e.parents = vec![parent.into()];
                file::upsert(&conn, &e)?;
                file::set_hash(&conn, id, "digest-p")?;
            }
        }
        progress
            .set_metadata(p.id, META_CURRENT_PHASE, ComparePhase::CalculatingHashes.as_str())
            .await?;
        progress.pause(p.id).await?;

        let (run_id, loaded) = eng.prepare_resume(p.id).await?;
        assert_eq!(run_id, p.id);
        let result = eng.run(run_id, loaded).await?;
        assert_eq!(result.duplication_percent, 100.0);

        // The pre-seeded digest survived instead of being recomputed
        let conn = pool.get()?;
        let p_row = file::find_by_id(&conn, "p")?.unwrap();
        assert_eq!(p_row.hash, "digest-p");
        Ok(())
    }

    #[tokio::test]
    async fn test_resume_completed_conflicts() -> anyhow::Result<()> {
        let pool = test_pool();
        let provider = mirrored_provider();
        let progress = ProgressService::new(pool.clone());
        let eng = engine(&pool, provider);

        let p = progress.start(OperationKind::FolderComparison, 0).await?;
        eng.record_params(p.id, &params(true)).await?;
        eng.run(p.id, params(true)).await?;

        assert!(matches!(
            eng.prepare_resume(p.id).await,
            Err(EngineError::Conflict(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_resume_failed_row_moves_to_fresh_row() -> anyhow::Result<()> {
        let pool = test_pool();
        let provider = mirrored_provider();
        let progress = ProgressService::new(pool.clone());
        let eng = engine(&pool, provider);

        let p = progress.start(OperationKind::FolderComparison, 0).await?;
        eng.record_params(p.id, &params(true)).await?;
        progress.mark_running(p.id).await?;
        progress.fail(p.id, "simulated crash").await?;

        let (run_id, loaded) = eng.prepare_resume(p.id).await?;
        assert_ne!(run_id, p.id);
        let result = eng.run(run_id, loaded).await?;
        assert_eq!(result.duplication_percent, 100.0);

        // The failed row keeps its terminal state
        let old = progress.get(p.id).await?.unwrap();
        assert_eq!(old.status, ProgressStatus::Failed);
        Ok(())
    }
}
