//! In-memory provider used by engine tests. Supports failure
//! injection for listing pages and downloads to exercise retry and
//! resume paths.

use crate::storage::{
    ByteStream, FilePage, RemoteFile, StorageError, StorageProvider, FOLDER_MIME, ROOT_FOLDER_ID,
};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

#[derive(Default)]
struct MockState {
    items: BTreeMap<String, RemoteFile>,
    contents: HashMap<String, Vec<u8>>,
    deleted: Vec<String>,
    // List calls (1-based, counted across retries) that return a 503
    fail_list_calls: std::collections::HashSet<usize>,
    list_calls: usize,
    // Per-file count of transient download failures still to serve
    download_failures: HashMap<String, u32>,
}

#[derive(Default)]
pub struct MockProvider {
    state: Mutex<MockState>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&self, id: &str, name: &str, parent: &str, content: &[u8]) {
        let mut state = self.state.lock().unwrap();
        state.items.insert(
            id.to_string(),
            RemoteFile {
                id: id.to_string(),
                name: name.to_string(),
                size: content.len() as i64,
                mime_type: "application/octet-stream".into(),
                modified_time: "2024-01-01T00:00:00Z".into(),
                parents: vec![parent.to_string()],
                web_view_link: format!("https://example.com/view/{}", id),
            },
        );
        state.contents.insert(id.to_string(), content.to_vec());
    }

    pub fn add_folder(&self, id: &str, name: &str, parent: &str) {
        let mut state = self.state.lock().unwrap();
        state.items.insert(
            id.to_string(),
            RemoteFile {
                id: id.to_string(),
                name: name.to_string(),
                size: 0,
                mime_type: FOLDER_MIME.into(),
                modified_time: "2024-01-01T00:00:00Z".into(),
                parents: vec![parent.to_string()],
                web_view_link: String::new(),
            },
        );
    }

    pub fn fail_list_calls(&self, calls: &[usize]) {
        self.state
            .lock()
            .unwrap()
            .fail_list_calls
            .extend(calls.iter().copied());
    }

    pub fn fail_downloads(&self, id: &str, times: u32) {
        self.state
            .lock()
            .unwrap()
            .download_failures
            .insert(id.to_string(), times);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.state.lock().unwrap().items.contains_key(id)
    }

    pub fn deleted_ids(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }

    pub fn item_count(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    fn paginate(
        state: &mut MockState,
        matching: Vec<RemoteFile>,
        page_token: Option<String>,
        page_size: usize,
    ) -> Result<FilePage, StorageError> {
        state.list_calls += 1;
        if state.fail_list_calls.contains(&state.list_calls) {
            return Err(StorageError::Server(503));
        }

        let offset: usize = page_token
            .as_deref()
            .and_then(|t| t.strip_prefix("offset:"))
            .and_then(|t| t.parse().ok())
            .unwrap_or(0);
        let files: Vec<RemoteFile> = matching.iter().skip(offset).take(page_size).cloned().collect();
        let next = offset + files.len();
        let next_page_token = if next < matching.len() {
            Some(format!("offset:{}", next))
        } else {
            None
        };
        Ok(FilePage {
            files,
            next_page_token,
        })
    }
}

#[async_trait::async_trait]
impl StorageProvider for MockProvider {
    async fn list_all(
        &self,
        page_token: Option<String>,
        page_size: usize,
    ) -> Result<FilePage, StorageError> {
        let mut state = self.state.lock().unwrap();
        let all: Vec<RemoteFile> = state.items.values().cloned().collect();
        Self::paginate(&mut state, all, page_token, page_size)
    }

    async fn list_children(
        &self,
        folder_id: &str,
        page_token: Option<String>,
        page_size: usize,
    ) -> Result<FilePage, StorageError> {
        let mut state = self.state.lock().unwrap();
        let children: Vec<RemoteFile> = state
            .items
            .values()
            .filter(|f| f.parents.iter().any(|p| p == folder_id))
            .cloned()
            .collect();
        Self::paginate(&mut state, children, page_token, page_size)
    }

    async fn get_file(&self, id: &str) -> Result<RemoteFile, StorageError> {
        self.state
            .lock()
            .unwrap()
            .items
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }

    async fn get_folder(&self, id: &str) -> Result<RemoteFile, StorageError> {
        if id == ROOT_FOLDER_ID {
            return Ok(RemoteFile {
                id: ROOT_FOLDER_ID.into(),
                name: "My Drive".into(),
                size: 0,
                mime_type: FOLDER_MIME.into(),
                modified_time: String::new(),
                parents: Vec::new(),
                web_view_link: String::new(),
            });
        }
        self.get_file(id).await
    }

    async fn download(&self, id: &str) -> Result<ByteStream, StorageError> {
        let content = {
            let mut state = self.state.lock().unwrap();
            if let Some(remaining) = state.download_failures.get_mut(id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(StorageError::Network("connection reset".into()));
                }
            }
            state
                .contents
                .get(id)
                .cloned()
                .ok_or_else(|| StorageError::NotFound(id.to_string()))?
        };
        // Deliver in small chunks so streaming consumers see several reads
        let chunks: Vec<Result<Bytes, StorageError>> = content
            .chunks(4)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(Box::pin(futures_util::stream::iter(chunks)))
    }

    async fn delete_file(&self, id: &str) -> Result<(), StorageError> {
        let mut state = self.state.lock().unwrap();
        if state.items.remove(id).is_none() {
            return Err(StorageError::NotFound(id.to_string()));
        }
        state.contents.remove(id);
        state.deleted.push(id.to_string());
        Ok(())
    }

    async fn delete_folder(&self, id: &str) -> Result<(), StorageError> {
        self.delete_file(id).await
    }

    async fn folder_path(&self, folder_id: &str) -> Result<String, StorageError> {
        let state = self.state.lock().unwrap();
        let mut segments = Vec::new();
        let mut current = folder_id.to_string();
        for _ in 0..64 {
            if current == ROOT_FOLDER_ID {
                break;
            }
            match state.items.get(&current) {
                Some(item) => {
                    segments.push(item.name.clone());
                    match item.parents.first() {
                        Some(p) => current = p.clone(),
                        None => break,
                    }
                }
                None => return Err(StorageError::NotFound(current)),
            }
        }
        segments.reverse();
        Ok(format!("/{}", segments.join("/")))
    }
}
