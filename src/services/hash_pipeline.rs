use crate::db::connection::DbPool;
use crate::error::EngineError;
use crate::models::file::{self, FileEntry};
use crate::services::hash::HashService;
use crate::services::progress::ProgressService;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};

pub const MIN_WORKERS: usize = 1;
pub const MAX_WORKERS: usize = 20;

// Throttle DB writes: progress persists every this-many results or
// every 5 seconds, whichever comes first
const PROGRESS_EVERY: usize = 20;
const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
pub struct PipelineStats {
    pub processed: usize,
    pub succeeded: usize,
    pub skipped_too_large: usize,
    pub errors: Vec<String>,
}

struct HashOutcome {
    file_id: String,
    result: Result<String, EngineError>,
}

/// Worker pool that digests a batch of files. Workers pull from a
/// shared job channel, persist each digest as it lands, and report
/// outcomes unordered on the result channel.
pub struct HashPipeline {
    db: DbPool,
    hasher: Arc<HashService>,
    progress: ProgressService,
    worker_count: usize,
}

impl HashPipeline {
    pub fn new(
        db: DbPool,
        hasher: Arc<HashService>,
        progress: ProgressService,
        worker_count: usize,
    ) -> Self {
        Self {
            db,
            hasher,
            progress,
            worker_count: worker_count.clamp(MIN_WORKERS, MAX_WORKERS),
        }
    }

    pub async fn run(
        &self,
        progress_id: i64,
        files: Vec<FileEntry>,
    ) -> anyhow::Result<PipelineStats> {
        let total = files.len();
        let mut stats = PipelineStats::default();
        if total == 0 {
            return Ok(stats);
        }

        let (job_tx, job_rx) = mpsc::channel::<FileEntry>(self.worker_count * 2);
        let job_rx = Arc::new(Mutex::new(job_rx));
        let (result_tx, mut result_rx) = mpsc::channel::<HashOutcome>(self.worker_count * 2);

        for _ in 0..self.worker_count {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            let hasher = self.hasher.clone();
            let db = self.db.clone();
            tokio::spawn(async move {
                loop {
                    let job = { job_rx.lock().await.recv().await };
                    let Some(entry) = job else { break };
                    let result = match hasher.digest(&entry).await {
                        Ok(digest) => {
                            let db = db.clone();
                            let id = entry.id.clone();
                            let digest2 = digest.clone();
                            let persisted = tokio::task::spawn_blocking(move || {
                                let conn = db.get()?;
                                file::set_hash(&conn, &id, &digest2)
                            })
                            .await
                            .map_err(|e| anyhow::anyhow!(e))
                            .and_then(|r| r);
                            match persisted {
                                Ok(()) => Ok(digest),
                                Err(e) => Err(EngineError::Internal(e)),
                            }
                        }
                        Err(e) => Err(e),
                    };
                    if result_tx
                        .send(HashOutcome {
                            file_id: entry.id,
                            result,
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            });
        }
        drop(result_tx);

        let feeder = tokio::spawn(async move {
            for f in files {
                if job_tx.send(f).await.is_err() {
                    break;
                }
            }
        });

        let mut last_flush = Instant::now();
        while let Some(outcome) = result_rx.recv().await {
            stats.processed += 1;
            match outcome.result {
                Ok(_) => stats.succeeded += 1,
                Err(EngineError::HashTooLarge { size, max }) => {
                    stats.skipped_too_large += 1;
                    stats.errors.push(format!(
                        "{}: skipped, size {} exceeds hash limit {}",
                        outcome.file_id, size, max
                    ));
                }
                Err(e) => {
                    stats.errors.push(format!("{}: {}", outcome.file_id, e));
                }
            }

            let first = stats.processed == 1;
            let last = stats.processed == total;
            if first
                || last
                || stats.processed % PROGRESS_EVERY == 0
                || last_flush.elapsed() >= PROGRESS_INTERVAL
            {
                self.progress
                    .update(
                        progress_id,
                        stats.processed as i64,
                        format!("hashed {}/{} files", stats.processed, total),
                    )
                    .await?;
                last_flush = Instant::now();
            }
        }

        let _ = feeder.await;

        tracing::info!(
            progress_id,
            processed = stats.processed,
            succeeded = stats.succeeded,
            skipped = stats.skipped_too_large,
            errors = stats.errors.len(),
            "Hash pipeline finished"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrate::test_pool;
    use crate::models::progress::OperationKind;
    use crate::services::hash::HashAlgorithm;
    use crate::storage::mock::MockProvider;

    fn entry(id: &str, size: i64) -> FileEntry {
        FileEntry::new(id, format!("{}.bin", id), size)
    }

    #[tokio::test]
    async fn test_pipeline_hashes_and_persists_all_files() -> anyhow::Result<()> {
        let pool = test_pool();
        let provider = Arc::new(MockProvider::new());
        let progress = ProgressService::new(pool.clone());

        let mut files = Vec::new();
        {
            let conn = pool.get()?;
            for i in 0..10 {
                let id = format!("f{}", i);
                provider.add_file(&id, &format!("{}.dat", id), "root", format!("body-{}", i).as_bytes());
                let e = entry(&id, 7);
                file::upsert(&conn, &e)?;
                files.push(e);
            }
        }

        let hasher = Arc::new(HashService::new(
            provider,
            HashAlgorithm::Sha256,
            1024,
            64 * 1024,
        ));
        let p = progress.start(OperationKind::HashCalc, files.len() as i64).await?;
        progress.mark_running(p.id).await?;

        let pipeline = HashPipeline::new(pool.clone(), hasher, progress.clone(), 4);
        let stats = pipeline.run(p.id, files).await?;

        assert_eq!(stats.processed, 10);
        assert_eq!(stats.succeeded, 10);
        assert!(stats.errors.is_empty());

        let conn = pool.get()?;
        assert_eq!(file::count_with_hash(&conn)?, 10);
        // Distinct content yields distinct digests
        let with_hash = file::find_with_hash(&conn)?;
        let unique: std::collections::HashSet<_> = with_hash.iter().map(|f| &f.hash).collect();
        assert_eq!(unique.len(), 10);

        let final_progress = progress.get(p.id).await?.unwrap();
        assert_eq!(final_progress.processed_items, 10);
        Ok(())
    }

    #[tokio::test]
    async fn test_pipeline_skips_oversized_files() -> anyhow::Result<()> {
        let pool = test_pool();
        let provider = Arc::new(MockProvider::new());
        let progress = ProgressService::new(pool.clone());

        let mut files = Vec::new();
        {
            let conn = pool.get()?;
            provider.add_file("small", "small.bin", "root", b"ok");
            let small = entry("small", 2);
            file::upsert(&conn, &small)?;
            files.push(small);

            // Metadata claims a size above the 16-byte cap below
            provider.add_file("big", "big.bin", "root", b"too big for the cap");
            let big = entry("big", 1000);
            file::upsert(&conn, &big)?;
            files.push(big);
        }

        let hasher = Arc::new(HashService::new(provider, HashAlgorithm::Sha256, 16, 64 * 1024));
        let p = progress.start(OperationKind::HashCalc, 2).await?;
        progress.mark_running(p.id).await?;

        let pipeline = HashPipeline::new(pool.clone(), hasher, progress.clone(), 2);
        let stats = pipeline.run(p.id, files).await?;

        assert_eq!(stats.processed, 2);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.skipped_too_large, 1);
        assert_eq!(stats.errors.len(), 1);

        // The job keeps going; only the oversized file is left undigested
        let conn = pool.get()?;
        let big = file::find_by_id(&conn, "big")?.unwrap();
        assert!(!big.hash_calculated);
        Ok(())
    }
}
