//! Cloud-folder seam and the Google Drive REST implementation.
//!
//! The watcher and the drive-sourced audio path only depend on the
//! `DriveFolder` trait. The concrete client lists a folder's children and
//! downloads file content over the Drive v3 REST API with a bearer token
//! read from the configured credentials file; token refresh is handled by
//! whatever provisions that file.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use tracing::debug;

use crate::config::DriveConfig;
use crate::errors::{PipelineError, Result};

const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";

/// One child file of the watched folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveFile {
    pub id: String,
    pub name: String,
}

#[async_trait]
pub trait DriveFolder: Send + Sync {
    /// Snapshot of the watched folder's child files.
    async fn list_files(&self) -> Result<Vec<DriveFile>>;

    /// Raw content of one file.
    async fn download(&self, file_id: &str) -> Result<Vec<u8>>;
}

#[derive(Debug)]
pub struct DriveApiClient {
    http: reqwest::Client,
    folder_id: String,
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct Credentials {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct FileListResponse {
    #[serde(default)]
    files: Vec<FileEntry>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileEntry {
    id: String,
    name: String,
}

impl DriveApiClient {
    pub fn from_credentials(http: reqwest::Client, cfg: &DriveConfig) -> Result<Self> {
        let path = Path::new(&cfg.credentials_file);
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::DriveWatch(format!(
                "cannot read drive credentials {}: {e}",
                path.display()
            ))
        })?;
        let credentials: Credentials = serde_json::from_str(&content).map_err(|e| {
            PipelineError::DriveWatch(format!(
                "drive credentials {} unparseable: {e}",
                path.display()
            ))
        })?;

        Ok(Self {
            http,
            folder_id: cfg.folder_id.clone(),
            access_token: credentials.access_token,
        })
    }
}

#[async_trait]
impl DriveFolder for DriveApiClient {
    async fn list_files(&self) -> Result<Vec<DriveFile>> {
        let query = format!("'{}' in parents and trashed = false", self.folder_id);
        let mut results = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .http
                .get(format!("{DRIVE_API_BASE}/files"))
                .bearer_auth(&self.access_token)
                .query(&[
                    ("q", query.as_str()),
                    ("fields", "nextPageToken, files(id, name)"),
                    ("pageSize", "100"),
                ]);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }

            let response = request
                .send()
                .await
                .map_err(|e| PipelineError::DriveWatch(format!("folder listing failed: {e}")))?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(PipelineError::DriveWatch(format!(
                    "folder listing returned HTTP {status}: {}",
                    body.chars().take(200).collect::<String>()
                )));
            }

            let page: FileListResponse = response
                .json()
                .await
                .map_err(|e| PipelineError::DriveWatch(format!("folder listing parse: {e}")))?;

            results.extend(page.files.into_iter().map(|entry| DriveFile {
                id: entry.id,
                name: entry.name,
            }));

            page_token = page.next_page_token;
            if page_token.is_none() {
                break;
            }
        }

        debug!("Drive listing returned {} files", results.len());
        Ok(results)
    }

    async fn download(&self, file_id: &str) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(format!("{DRIVE_API_BASE}/files/{file_id}"))
            .bearer_auth(&self.access_token)
            .query(&[("alt", "media")])
            .send()
            .await
            .map_err(|e| PipelineError::DriveWatch(format!("file download failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::DriveWatch(format!(
                "file download returned HTTP {status} for {file_id}"
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| PipelineError::DriveWatch(format!("file download read: {e}")))?;
        debug!("Downloaded {} bytes for drive file {file_id}", bytes.len());
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_file_must_exist() {
        let mut cfg = DriveConfig::default();
        cfg.credentials_file = "/nonexistent/credentials.json".to_string();
        let err = DriveApiClient::from_credentials(reqwest::Client::new(), &cfg).unwrap_err();
        assert!(matches!(err, PipelineError::DriveWatch(_)));
    }

    #[test]
    fn credentials_parse_access_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        std::fs::write(&path, r#"{"access_token": "ya29.token", "expiry": "later"}"#).unwrap();

        let mut cfg = DriveConfig::default();
        cfg.credentials_file = path.to_string_lossy().into_owned();
        cfg.folder_id = "folder123".to_string();

        let client = DriveApiClient::from_credentials(reqwest::Client::new(), &cfg).unwrap();
        assert_eq!(client.access_token, "ya29.token");
        assert_eq!(client.folder_id, "folder123");
    }

    #[test]
    fn list_response_shape() {
        let body = r#"{"files":[{"id":"f1","name":"craig_a.aac.zip"}],"nextPageToken":"t2"}"#;
        let parsed: FileListResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.files.len(), 1);
        assert_eq!(parsed.next_page_token.as_deref(), Some("t2"));
    }
}
