use crate::db::connection::DbPool;
use crate::error::EngineError;
use crate::models::file::{self, FileEntry};
use crate::models::progress::{META_LAST_PAGE_INDEX, META_LAST_PAGE_TOKEN};
use crate::services::progress::ProgressService;
use crate::storage::{self, RemoteFile, StorageProvider, FOLDER_MIME};
use std::sync::Arc;

const LIST_RETRY_ATTEMPTS: u32 = 3;

// A failure after this many clean pages pauses (resumable) instead of failing
const PAUSE_THRESHOLD_PAGES: usize = 5;

#[derive(Debug, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanOutcome {
    pub new_files: usize,
    pub updated_files: usize,
    pub pages: usize,
    pub resumed_from_page: usize,
}

/// Walks the provider's full inventory (or a folder subtree) page by
/// page and mirrors it into the files table. The page cursor is
/// checkpointed after every page so a dead job restarts where it
/// stopped.
pub struct ScanEngine {
    db: DbPool,
    provider: Arc<dyn StorageProvider>,
    progress: ProgressService,
    batch_size: usize,
}

impl ScanEngine {
    pub fn new(
        db: DbPool,
        provider: Arc<dyn StorageProvider>,
        progress: ProgressService,
        batch_size: usize,
    ) -> Self {
        Self {
            db,
            provider,
            progress,
            batch_size: batch_size.max(1),
        }
    }

    pub(crate) fn remote_to_entry(remote: &RemoteFile) -> FileEntry {
        FileEntry {
            mime_type: remote.mime_type.clone(),
            modified_time: remote.modified_time.clone(),
            parents: remote.parents.clone(),
            web_view_link: remote.web_view_link.clone(),
            ..FileEntry::new(remote.id.clone(), remote.name.clone(), remote.size)
        }
    }

    async fn persist_page(&self, entries: Vec<FileEntry>) -> anyhow::Result<(usize, usize)> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = db.get()?;
            let tx = conn.transaction()?;
            let mut new_files = 0;
            let mut updated = 0;
            for entry in &entries {
                if file::upsert(&tx, entry)? {
                    new_files += 1;
                } else {
                    updated += 1;
                }
            }
            tx.commit()?;
            Ok::<_, anyhow::Error>((new_files, updated))
        })
        .await
        .map_err(|e| anyhow::anyhow!(e))?
    }

    /// Full-corpus scan. With `resume`, listing restarts from the page
    /// token stored in the progress row's metadata; rows persisted by
    /// the earlier run are simply upserted again.
    pub async fn run_full_scan(
        &self,
        progress_id: i64,
        resume: bool,
    ) -> Result<ScanOutcome, EngineError> {
        self.progress.mark_running(progress_id).await?;

        let mut outcome = ScanOutcome::default();
        let mut page_token: Option<String> = None;
        let mut page_index: usize = 0;
        let mut processed: i64 = 0;

        if resume {
            page_token = self
                .progress
                .get_metadata(progress_id, META_LAST_PAGE_TOKEN)
                .await?
                .filter(|t| !t.is_empty());
            page_index = self
                .progress
                .get_metadata(progress_id, META_LAST_PAGE_INDEX)
                .await?
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            outcome.resumed_from_page = page_index;
            if let Some(p) = self.progress.get(progress_id).await? {
                processed = p.processed_items;
            }
            tracing::info!(progress_id, page_index, "Resuming file scan from checkpoint");
        }

        loop {
            if self.progress.is_paused(progress_id).await {
                tracing::info!(progress_id, "File scan paused, exiting at page boundary");
                return Ok(outcome);
            }

            let token = page_token.clone();
            let page = match storage::with_retries(LIST_RETRY_ATTEMPTS, || {
                self.provider.list_all(token.clone(), self.batch_size)
            })
            .await
            {
                Ok(page) => page,
                Err(e) => {
                    if outcome.pages >= PAUSE_THRESHOLD_PAGES {
                        tracing::warn!(
                            progress_id,
                            pages = outcome.pages,
                            error = %e,
                            "Scan interrupted after a clean prefix; pausing for resume"
                        );
                        self.progress.pause(progress_id).await?;
                        return Ok(outcome);
                    }
                    self.progress.fail(progress_id, format!("scan failed: {}", e)).await?;
                    return Err(e.into());
                }
            };

            page_index += 1;
            outcome.pages += 1;

            let entries: Vec<FileEntry> = page
                .files
                .iter()
                .filter(|f| !f.is_folder() && f.size > 0)
                .map(Self::remote_to_entry)
                .collect();
            processed += entries.len() as i64;

            let (new_files, updated) = self.persist_page(entries).await?;
            outcome.new_files += new_files;
            outcome.updated_files += updated;

            self.progress
                .update(progress_id, processed, format!("scanned page {}", page_index))
                .await?;
            self.progress
                .set_metadata(
                    progress_id,
                    META_LAST_PAGE_TOKEN,
                    page.next_page_token.clone().unwrap_or_default(),
                )
                .await?;
            self.progress
                .set_metadata(progress_id, META_LAST_PAGE_INDEX, page_index.to_string())
                .await?;

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        self.progress.set_total(progress_id, processed).await?;
        self.progress.complete(progress_id).await?;
        tracing::info!(
            progress_id,
            new_files = outcome.new_files,
            updated_files = outcome.updated_files,
            pages = outcome.pages,
            "File scan completed"
        );
        Ok(outcome)
    }

    /// Folder-scoped scan. Recurses depth-first into folder children
    /// when requested; optionally backfills the cached display path of
    /// every file row it touches.
    pub async fn run_folder_scan(
        &self,
        progress_id: i64,
        folder_id: &str,
        recursive: bool,
        update_paths: bool,
    ) -> Result<ScanOutcome, EngineError> {
        self.progress.mark_running(progress_id).await?;

        let mut outcome = ScanOutcome::default();
        let mut processed: i64 = 0;
        let mut stack = vec![folder_id.to_string()];

        while let Some(current) = stack.pop() {
            if self.progress.is_paused(progress_id).await {
                tracing::info!(progress_id, "Folder scan paused, exiting at folder boundary");
                return Ok(outcome);
            }

            let folder_path = if update_paths {
                match self.provider.folder_path(&current).await {
                    Ok(p) => Some(p),
                    Err(e) => {
                        tracing::warn!(folder = %current, error = %e, "Failed to resolve folder path");
                        None
                    }
                }
            } else {
                None
            };

            let mut page_token: Option<String> = None;
            loop {
                let token = page_token.clone();
                let page = match storage::with_retries(LIST_RETRY_ATTEMPTS, || {
                    self.provider
                        .list_children(&current, token.clone(), self.batch_size)
                })
                .await
                {
                    Ok(page) => page,
                    Err(e) => {
                        self.progress
                            .fail(progress_id, format!("folder scan failed: {}", e))
                            .await?;
                        return Err(e.into());
                    }
                };

                outcome.pages += 1;

                let mut entries = Vec::new();
                for item in &page.files {
                    if item.mime_type == FOLDER_MIME {
                        if recursive {
                            stack.push(item.id.clone());
                        }
                        continue;
                    }
                    if item.size <= 0 {
                        continue;
                    }
                    let mut entry = Self::remote_to_entry(item);
                    if let Some(base) = &folder_path {
                        entry.path = format!("{}/{}", base.trim_end_matches('/'), entry.name);
                    }
                    entries.push(entry);
                }
                processed += entries.len() as i64;

                let (new_files, updated) = self.persist_page(entries).await?;
                outcome.new_files += new_files;
                outcome.updated_files += updated;

                self.progress
                    .update(
                        progress_id,
                        processed,
                        format!("scanning folder {}", current),
                    )
                    .await?;

                match page.next_page_token {
                    Some(t) => page_token = Some(t),
                    None => break,
                }
            }
        }

        self.progress.set_total(progress_id, processed).await?;
        self.progress.complete(progress_id).await?;
        Ok(outcome)
    }
}
