use crate::config::AppConfig;
use crate::storage::{
    ByteStream, FilePage, RemoteFile, StorageError, StorageProvider, ROOT_FOLDER_ID,
};
use dashmap::DashMap;
use futures_util::StreamExt;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;

const LIST_FIELDS: &str =
    "nextPageToken, files(id, name, size, mimeType, modifiedTime, parents, webViewLink)";
const FILE_FIELDS: &str = "id, name, size, mimeType, modifiedTime, parents, webViewLink";

/// Drive-v3-style REST client. Listing and metadata calls carry a 30s
/// timeout; downloads run on a client without one and rely on the
/// caller's retry budget.
pub struct DriveProvider {
    http: reqwest::Client,
    download_http: reqwest::Client,
    base: String,
    api_key: Option<String>,
    access_token: Option<String>,
    folder_cache: DashMap<String, CachedFolder>,
}

#[derive(Clone)]
struct CachedFolder {
    name: String,
    parents: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiFile {
    id: String,
    #[serde(default)]
    name: String,
    // The API serializes int64 values as JSON strings
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    modified_time: String,
    #[serde(default)]
    parents: Vec<String>,
    #[serde(default)]
    web_view_link: String,
}

impl From<ApiFile> for RemoteFile {
    fn from(f: ApiFile) -> Self {
        RemoteFile {
            id: f.id,
            name: f.name,
            size: f.size.and_then(|s| s.parse().ok()).unwrap_or(0),
            mime_type: f.mime_type,
            modified_time: f.modified_time,
            parents: f.parents,
            web_view_link: f.web_view_link,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiFileList {
    #[serde(default)]
    next_page_token: Option<String>,
    #[serde(default)]
    files: Vec<ApiFile>,
}

impl DriveProvider {
    pub fn new(config: &AppConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build HTTP client");
        let download_http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build download HTTP client");
        Self {
            http,
            download_http,
            base: config.drive_api_base.trim_end_matches('/').to_string(),
            api_key: config.drive_api_key.clone(),
            access_token: config.drive_access_token.clone(),
            folder_cache: DashMap::new(),
        }
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        self.decorate(self.http.request(method, url))
    }

    fn decorate(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(token) = &self.access_token {
            req = req.bearer_auth(token);
        }
        if let Some(key) = &self.api_key {
            req = req.query(&[("key", key.as_str())]);
        }
        req
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, StorageError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let detail = resp.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::NOT_FOUND => StorageError::NotFound(detail),
            StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => {
                StorageError::PermissionDenied(detail)
            }
            StatusCode::TOO_MANY_REQUESTS => StorageError::RateLimited,
            s if s.is_server_error() => StorageError::Server(s.as_u16()),
            s => StorageError::InvalidResponse(format!("status {}: {}", s, detail)),
        })
    }

    async fn list(
        &self,
        query: &str,
        page_token: Option<String>,
        page_size: usize,
    ) -> Result<FilePage, StorageError> {
        let mut req = self
            .request(reqwest::Method::GET, format!("{}/files", self.base))
            .query(&[
                ("q", query),
                ("fields", LIST_FIELDS),
                ("pageSize", &page_size.to_string()),
            ]);
        if let Some(token) = page_token {
            req = req.query(&[("pageToken", token.as_str())]);
        }

        let resp = Self::check(req.send().await?).await?;
        let list: ApiFileList = resp
            .json()
            .await
            .map_err(|e| StorageError::InvalidResponse(e.to_string()))?;
        Ok(FilePage {
            files: list.files.into_iter().map(RemoteFile::from).collect(),
            next_page_token: list.next_page_token.filter(|t| !t.is_empty()),
        })
    }

    async fn get_metadata(&self, id: &str) -> Result<RemoteFile, StorageError> {
        let resp = self
            .request(reqwest::Method::GET, format!("{}/files/{}", self.base, id))
            .query(&[("fields", FILE_FIELDS)])
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        let file: ApiFile = resp
            .json()
            .await
            .map_err(|e| StorageError::InvalidResponse(e.to_string()))?;
        Ok(file.into())
    }

    async fn cached_folder(&self, id: &str) -> Result<CachedFolder, StorageError> {
        if let Some(hit) = self.folder_cache.get(id) {
            return Ok(hit.clone());
        }
        let meta = self.get_metadata(id).await?;
        let cached = CachedFolder {
            name: meta.name,
            parents: meta.parents,
        };
        self.folder_cache.insert(id.to_string(), cached.clone());
        Ok(cached)
    }
}

#[async_trait::async_trait]
impl StorageProvider for DriveProvider {
    async fn list_all(
        &self,
        page_token: Option<String>,
        page_size: usize,
    ) -> Result<FilePage, StorageError> {
        self.list("trashed = false", page_token, page_size).await
    }

    async fn list_children(
        &self,
        folder_id: &str,
        page_token: Option<String>,
        page_size: usize,
    ) -> Result<FilePage, StorageError> {
        let query = format!("'{}' in parents and trashed = false", folder_id);
        self.list(&query, page_token, page_size).await
    }

    async fn get_file(&self, id: &str) -> Result<RemoteFile, StorageError> {
        self.get_metadata(id).await
    }

    async fn get_folder(&self, id: &str) -> Result<RemoteFile, StorageError> {
        self.get_metadata(id).await
    }

    async fn download(&self, id: &str) -> Result<ByteStream, StorageError> {
        let req = self.decorate(
            self.download_http
                .get(format!("{}/files/{}", self.base, id))
                .query(&[("alt", "media")]),
        );
        let resp = Self::check(req.send().await?).await?;
        let stream = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(StorageError::from));
        Ok(Box::pin(stream))
    }

    async fn delete_file(&self, id: &str) -> Result<(), StorageError> {
        let resp = self
            .request(reqwest::Method::DELETE, format!("{}/files/{}", self.base, id))
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn delete_folder(&self, id: &str) -> Result<(), StorageError> {
        // Folders are items with a folder MIME; the delete call is shared
        self.delete_file(id).await
    }

    async fn folder_path(&self, folder_id: &str) -> Result<String, StorageError> {
        let mut segments = Vec::new();
        let mut current = folder_id.to_string();
        // Bounded walk so a parent cycle in provider metadata cannot hang us
        for _ in 0..64 {
            if current == ROOT_FOLDER_ID {
                break;
            }
            let folder = self.cached_folder(&current).await?;
            segments.push(folder.name.clone());
            match folder.parents.first() {
                Some(parent) => current = parent.clone(),
                None => break,
            }
        }
        segments.reverse();
        Ok(format!("/{}", segments.join("/")))
    }
}
