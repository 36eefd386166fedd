pub mod drive;
#[cfg(test)]
pub mod mock;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// MIME type the provider uses to mark folders.
pub const FOLDER_MIME: &str = "application/vnd.google-apps.folder";

/// Alias the provider accepts for the account root folder.
pub const ROOT_FOLDER_ID: &str = "root";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFile {
    pub id: String,
    pub name: String,
    pub size: i64,
    pub mime_type: String,
    pub modified_time: String,
    pub parents: Vec<String>,
    pub web_view_link: String,
}

impl RemoteFile {
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME
    }
}

#[derive(Debug, Clone)]
pub struct FilePage {
    pub files: Vec<RemoteFile>,
    pub next_page_token: Option<String>,
}

pub type ByteStream = BoxStream<'static, Result<Bytes, StorageError>>;

#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("rate limited by provider")]
    RateLimited,

    #[error("provider server error (status {0})")]
    Server(u16),

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("unexpected provider response: {0}")]
    InvalidResponse(String),
}

impl StorageError {
    /// Transient errors are worth retrying; the rest fail immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::RateLimited
                | StorageError::Server(_)
                | StorageError::Network(_)
                | StorageError::Timeout
        )
    }
}

impl From<reqwest::Error> for StorageError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            StorageError::Timeout
        } else {
            StorageError::Network(e.to_string())
        }
    }
}

/// Capability surface of the hierarchical object store. Engines only
/// ever see this trait; the concrete REST client lives in `drive`.
#[async_trait::async_trait]
pub trait StorageProvider: Send + Sync {
    /// One page of every non-trashed item in the account.
    async fn list_all(
        &self,
        page_token: Option<String>,
        page_size: usize,
    ) -> Result<FilePage, StorageError>;

    /// One page of the direct children of a folder (files and folders).
    async fn list_children(
        &self,
        folder_id: &str,
        page_token: Option<String>,
        page_size: usize,
    ) -> Result<FilePage, StorageError>;

    async fn get_file(&self, id: &str) -> Result<RemoteFile, StorageError>;

    async fn get_folder(&self, id: &str) -> Result<RemoteFile, StorageError>;

    /// Streaming content download.
    async fn download(&self, id: &str) -> Result<ByteStream, StorageError>;

    async fn delete_file(&self, id: &str) -> Result<(), StorageError>;

    async fn delete_folder(&self, id: &str) -> Result<(), StorageError>;

    /// Human-readable "/a/b/c" path via repeated parent lookup.
    async fn folder_path(&self, folder_id: &str) -> Result<String, StorageError>;
}

/// Run a provider call with bounded exponential backoff (1s, 2s, 4s…)
/// on transient errors. Non-transient errors return immediately.
pub async fn with_retries<T, Fut, F>(max_attempts: u32, mut op: F) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, StorageError>>,
{
    let mut delay = Duration::from_secs(1);
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                tracing::warn!(attempt, error = %e, "Transient storage error, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Depth-first listing of every file under a folder. Folders are
/// descended into when `recursive` is set and never returned
/// themselves; zero-byte files are dropped.
pub async fn collect_folder_files(
    provider: &dyn StorageProvider,
    folder_id: &str,
    recursive: bool,
    page_size: usize,
) -> Result<Vec<RemoteFile>, StorageError> {
    let mut collected = Vec::new();
    let mut stack = vec![folder_id.to_string()];
    while let Some(current) = stack.pop() {
        let mut page_token: Option<String> = None;
        loop {
            let token = page_token.clone();
            let page = with_retries(3, || {
                provider.list_children(&current, token.clone(), page_size)
            })
            .await?;
            for item in page.files {
                if item.is_folder() {
                    if recursive {
                        stack.push(item.id);
                    }
                    continue;
                }
                if item.size > 0 {
                    collected.push(item);
                }
            }
            match page.next_page_token {
                Some(t) => page_token = Some(t),
                None => break,
            }
        }
    }
    Ok(collected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_with_retries_recovers_from_transient() {
        let calls = AtomicU32::new(0);
        let result = with_retries(3, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(StorageError::Server(503))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retries_fails_fast_on_permanent() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retries(3, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StorageError::NotFound("gone".into())) }
        })
        .await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
