//! Google Drive client (v3 resumable uploads).
//!
//! The session URI is the continuation token. After an ambiguous failure
//! the session is probed with an empty `PUT` carrying
//! `Content-Range: bytes */*`: `308` reports the persisted range, `200`
//! or `201` means the upload already completed, `404` means start over.

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use serde_json::json;

use stowage_core::error::AppError;
use stowage_core::result::AppResult;
use stowage_entity::package::ResumeToken;
use stowage_entity::storage::{
    GDriveSettings, OAuthToken, StorageEntity, StorageKind, StorageSettings,
};

use super::digest::md5_hex;
use super::http::{build_client, content_range, error_for, transport_error, within_slice};
use super::oauth::OAuthSession;
use crate::chunked::read_range;
use crate::client::{
    ChunkProgress, ChunkRequest, ChunkedTransferClient, RemoteObject, TransferError,
    TransferResult,
};
use crate::registry::{ApiEndpoints, ClientContext, ClientFactory};

const FOLDER_MIME: &str = "application/vnd.google-apps.folder";

/// Google keeps resumable sessions for about a week.
const SESSION_LIFETIME_DAYS: i64 = 7;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    md5_checksum: Option<String>,
    #[serde(default)]
    created_time: Option<DateTime<Utc>>,
    #[serde(default)]
    modified_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    #[serde(default)]
    next_page_token: Option<String>,
}

/// What the session reported.
#[derive(Debug, PartialEq, Eq)]
enum SessionState {
    /// Bytes `0..n` are persisted.
    Incomplete(u64),
    /// The file exists; its id.
    Complete(String),
    /// The session is unknown or expired.
    Gone,
}

/// Google Drive transfer client.
#[derive(Debug)]
pub struct GDriveClient {
    auth: OAuthSession,
    endpoints: ApiEndpoints,
    folder_path: String,
    folder_id: Option<String>,
    chunk_size: u64,
}

impl GDriveClient {
    /// Create a client for the given settings.
    pub fn new(settings: &GDriveSettings, context: &ClientContext) -> AppResult<Self> {
        let http = build_client(&context.transfer)?;
        Ok(Self {
            auth: OAuthSession::new(
                http,
                &context.endpoints.google_token,
                &settings.client_id,
                &settings.client_secret,
                settings.token.clone(),
            ),
            endpoints: context.endpoints.clone(),
            folder_path: settings.storage_folder.trim_matches('/').to_string(),
            folder_id: None,
            chunk_size: context.transfer.gdrive_chunk_size(),
        })
    }

    /// Resolve (creating as needed) the id of the storage folder.
    async fn folder_id(&mut self) -> TransferResult<String> {
        if let Some(id) = &self.folder_id {
            return Ok(id.clone());
        }
        let mut parent = "root".to_string();
        let segments: Vec<String> = self
            .folder_path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        for segment in segments {
            parent = match self.find_child(&parent, &segment, true).await? {
                Some(file) => file.id,
                None => self.create_folder(&parent, &segment).await?,
            };
        }
        self.folder_id = Some(parent.clone());
        Ok(parent)
    }

    async fn find_child(
        &mut self,
        parent: &str,
        name: &str,
        folder: bool,
    ) -> TransferResult<Option<DriveFile>> {
        let mime = if folder {
            format!(" and mimeType = '{FOLDER_MIME}'")
        } else {
            format!(" and mimeType != '{FOLDER_MIME}'")
        };
        let query = format!(
            "name = '{}' and '{}' in parents and trashed = false{mime}",
            escape_query(name),
            escape_query(parent)
        );
        let url = format!("{}/files", self.endpoints.google_api);
        let response = self
            .auth
            .send("Drive lookup", |http| {
                http.get(&url).query(&[
                    ("q", query.as_str()),
                    ("fields", "files(id,name,size,md5Checksum,createdTime,modifiedTime)"),
                    ("spaces", "drive"),
                ])
            })
            .await?;
        if !response.status().is_success() {
            return Err(error_for("Drive lookup", response).await);
        }
        let list: FileList = response
            .json()
            .await
            .map_err(|e| transport_error("Drive lookup response", e))?;
        Ok(list.files.into_iter().next())
    }

    async fn create_folder(&mut self, parent: &str, name: &str) -> TransferResult<String> {
        let url = format!("{}/files", self.endpoints.google_api);
        let body = json!({ "name": name, "mimeType": FOLDER_MIME, "parents": [parent] });
        let response = self
            .auth
            .send("Drive create folder", |http| {
                http.post(&url).query(&[("fields", "id")]).json(&body)
            })
            .await?;
        if !response.status().is_success() {
            return Err(error_for("Drive create folder", response).await);
        }
        let file: DriveFile = response
            .json()
            .await
            .map_err(|e| transport_error("Drive create folder response", e))?;
        tracing::debug!(folder = name, id = %file.id, "Created Drive folder");
        Ok(file.id)
    }

    /// Open a resumable session for `name`, replacing an existing file.
    async fn open_session(&mut self, name: &str, size: u64) -> TransferResult<ResumeToken> {
        let folder_id = self.folder_id().await?;
        if let Some(existing) = self.find_child(&folder_id, name, false).await? {
            self.delete_file(&existing.id).await?;
        }

        let url = format!("{}/files", self.endpoints.google_upload);
        let body = json!({ "name": name, "parents": [folder_id] });
        let response = self
            .auth
            .send("Drive session start", |http| {
                http.post(&url)
                    .query(&[("uploadType", "resumable"), ("fields", "id,md5Checksum")])
                    .header("X-Upload-Content-Type", "application/octet-stream")
                    .header("X-Upload-Content-Length", size)
                    .json(&body)
            })
            .await?;
        if !response.status().is_success() {
            return Err(error_for("Drive session start", response).await);
        }
        let uri = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| TransferError::recoverable("Drive session start returned no Location"))?
            .to_string();
        Ok(ResumeToken::ResumableUri {
            uri,
            expires_at: Some(Utc::now() + ChronoDuration::days(SESSION_LIFETIME_DAYS)),
        })
    }

    /// Interpret a response to a chunk PUT or a status probe.
    async fn session_state(&self, response: Response) -> TransferResult<SessionState> {
        match response.status() {
            StatusCode::PERMANENT_REDIRECT => Ok(SessionState::Incomplete(
                persisted_bytes(
                    response
                        .headers()
                        .get(reqwest::header::RANGE)
                        .and_then(|v| v.to_str().ok()),
                ),
            )),
            StatusCode::OK | StatusCode::CREATED => {
                let file: DriveFile = response
                    .json()
                    .await
                    .map_err(|e| transport_error("Drive upload response", e))?;
                Ok(SessionState::Complete(file.id))
            }
            StatusCode::NOT_FOUND | StatusCode::GONE => Ok(SessionState::Gone),
            _ => Err(error_for("Drive upload", response).await),
        }
    }

    /// Ask the session how far it got.
    async fn probe(&mut self, uri: &str) -> TransferResult<SessionState> {
        let response = self
            .auth
            .send("Drive status probe", |http| {
                http.put(uri)
                    .header(reqwest::header::CONTENT_RANGE, "bytes */*")
                    .header(reqwest::header::CONTENT_LENGTH, 0)
            })
            .await?;
        self.session_state(response).await
    }

    async fn put_chunk(
        &mut self,
        uri: &str,
        offset: u64,
        body: Bytes,
        total: u64,
    ) -> TransferResult<SessionState> {
        let range = content_range(offset, body.len() as u64, total);
        let response = self
            .auth
            .send_body("Drive chunk", body, |http| {
                http.put(uri).header(reqwest::header::CONTENT_RANGE, range.clone())
            })
            .await?;
        self.session_state(response).await
    }

    /// Compare the stored MD5 with the local file.
    async fn verify(&mut self, file_id: &str, source: &Path) -> TransferResult<()> {
        let url = format!("{}/files/{file_id}", self.endpoints.google_api);
        let response = self
            .auth
            .send("Drive checksum", |http| {
                http.get(&url).query(&[("fields", "id,md5Checksum")])
            })
            .await?;
        if !response.status().is_success() {
            return Err(error_for("Drive checksum", response).await);
        }
        let file: DriveFile = response
            .json()
            .await
            .map_err(|e| transport_error("Drive checksum response", e))?;
        let Some(remote) = file.md5_checksum else {
            return Ok(());
        };
        let local = md5_hex(source).await?;
        if !remote.eq_ignore_ascii_case(&local) {
            return Err(TransferError::fatal(format!(
                "Drive checksum mismatch: local {local}, remote {remote}"
            )));
        }
        Ok(())
    }

    async fn delete_file(&mut self, id: &str) -> TransferResult<bool> {
        let url = format!("{}/files/{id}", self.endpoints.google_api);
        let response = self
            .auth
            .send("Drive delete", |http| http.delete(&url))
            .await?;
        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(error_for("Drive delete", response).await),
        }
    }

    fn live_uri(token: &ResumeToken) -> Option<&str> {
        match token {
            ResumeToken::ResumableUri { uri, expires_at } => {
                if expires_at.is_some_and(|at| at <= Utc::now()) {
                    None
                } else {
                    Some(uri)
                }
            }
            _ => None,
        }
    }
}

/// Bytes persisted according to a `Range: bytes=0-N` header.
fn persisted_bytes(range: Option<&str>) -> u64 {
    range
        .and_then(|r| r.trim().strip_prefix("bytes="))
        .and_then(|r| r.split('-').nth(1))
        .and_then(|end| end.trim().parse::<u64>().ok())
        .map_or(0, |end| end + 1)
}

fn escape_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

#[async_trait]
impl ChunkedTransferClient for GDriveClient {
    fn kind(&self) -> StorageKind {
        StorageKind::GDrive
    }

    async fn upload_whole(&mut self, source: &Path, dest: &str) -> TransferResult<()> {
        let data = Bytes::from(tokio::fs::read(source).await?);
        let total = data.len() as u64;
        let token = self.open_session(dest, total).await?;
        let Some(uri) = Self::live_uri(&token).map(str::to_string) else {
            return Err(TransferError::recoverable("Drive session expired immediately"));
        };
        match self.put_chunk(&uri, 0, data, total).await? {
            SessionState::Complete(id) => self.verify(&id, source).await,
            other => Err(TransferError::recoverable(format!(
                "Drive single-shot upload did not complete: {other:?}"
            ))),
        }
    }

    async fn upload_chunk(&mut self, request: ChunkRequest<'_>) -> TransferResult<ChunkProgress> {
        if request.remaining().is_zero() {
            return Err(TransferError::timeout("No time left for a Drive chunk"));
        }

        let (token, offset) = match Self::live_uri(&request.token) {
            Some(_) => (request.token.clone(), request.offset),
            None => (self.open_session(request.dest, request.file_size).await?, 0),
        };
        let Some(uri) = Self::live_uri(&token).map(str::to_string) else {
            return Err(TransferError::recoverable("Drive session expired immediately"));
        };

        let len = self.chunk_size.min(request.file_size.saturating_sub(offset));
        let body = Bytes::from(read_range(request.source, offset, len).await?);
        let put = self.put_chunk(&uri, offset, body, request.file_size);
        let state = within_slice(request.remaining(), "Drive chunk", put).await?;
        let progress = match state {
            SessionState::Incomplete(next) => ChunkProgress::partial(next.min(request.file_size), token),
            SessionState::Complete(id) => {
                self.verify(&id, request.source).await?;
                ChunkProgress::finished(request.file_size)
            }
            SessionState::Gone => {
                tracing::warn!("Drive upload session gone, restarting");
                ChunkProgress::partial(0, ResumeToken::None)
            }
        };
        if !request.throttle.is_zero() {
            tokio::time::sleep(request.throttle).await;
        }
        Ok(progress)
    }

    async fn recover_offset(
        &mut self,
        _dest: &str,
        file_size: u64,
        token: &ResumeToken,
    ) -> TransferResult<ChunkProgress> {
        let Some(uri) = Self::live_uri(token).map(str::to_string) else {
            return Ok(ChunkProgress::partial(0, ResumeToken::None));
        };
        match self.probe(&uri).await? {
            SessionState::Incomplete(next) => {
                Ok(ChunkProgress::partial(next.min(file_size), token.clone()))
            }
            SessionState::Complete(_) => Ok(ChunkProgress::finished(file_size)),
            SessionState::Gone => Ok(ChunkProgress::partial(0, ResumeToken::None)),
        }
    }

    async fn abort(&mut self, _dest: &str, token: &ResumeToken) -> TransferResult<()> {
        if let ResumeToken::ResumableUri { uri, .. } = token {
            let uri = uri.clone();
            // Drive answers a cancelled session with 499; any answer will do.
            self.auth
                .send("Drive session cancel", |http| http.delete(&uri))
                .await?;
        }
        Ok(())
    }

    async fn delete(&mut self, name: &str) -> TransferResult<bool> {
        let folder_id = self.folder_id().await?;
        match self.find_child(&folder_id, name, false).await? {
            Some(file) => self.delete_file(&file.id).await,
            None => Ok(false),
        }
    }

    async fn list_objects(&mut self) -> TransferResult<Vec<RemoteObject>> {
        let folder_id = self.folder_id().await?;
        let url = format!("{}/files", self.endpoints.google_api);
        let query = format!(
            "'{}' in parents and trashed = false and mimeType != '{FOLDER_MIME}'",
            escape_query(&folder_id)
        );

        let mut objects = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut params = vec![
                ("q", query.clone()),
                (
                    "fields",
                    "nextPageToken,files(id,name,size,createdTime,modifiedTime)".to_string(),
                ),
                ("pageSize", "1000".to_string()),
            ];
            if let Some(token) = &page_token {
                params.push(("pageToken", token.clone()));
            }
            let response = self
                .auth
                .send("Drive list", |http| http.get(&url).query(&params))
                .await?;
            if !response.status().is_success() {
                return Err(error_for("Drive list", response).await);
            }
            let page: FileList = response
                .json()
                .await
                .map_err(|e| transport_error("Drive list response", e))?;
            objects.extend(page.files.into_iter().map(|f| RemoteObject {
                size: f.size.as_deref().and_then(|s| s.parse().ok()).unwrap_or(0),
                modified: f.created_time.or(f.modified_time),
                name: f.name,
            }));
            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }
        Ok(objects)
    }

    fn refreshed_token(&self) -> Option<OAuthToken> {
        self.auth.refreshed_token()
    }
}

/// Factory for Google Drive storages.
#[derive(Debug, Clone, Copy)]
pub struct GDriveFactory;

#[async_trait]
impl ClientFactory for GDriveFactory {
    fn kind(&self) -> StorageKind {
        StorageKind::GDrive
    }

    async fn build(
        &self,
        storage: &StorageEntity,
        context: &ClientContext,
    ) -> AppResult<Box<dyn ChunkedTransferClient>> {
        match &storage.settings {
            StorageSettings::GDrive(settings) => Ok(Box::new(GDriveClient::new(settings, context)?)),
            other => Err(AppError::validation(format!(
                "Google Drive factory cannot build a {} storage",
                other.kind()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_header_parses() {
        assert_eq!(persisted_bytes(Some("bytes=0-4194303")), 4_194_304);
        assert_eq!(persisted_bytes(None), 0);
        assert_eq!(persisted_bytes(Some("garbage")), 0);
    }

    #[test]
    fn expired_sessions_are_not_resumed() {
        let expired = ResumeToken::ResumableUri {
            uri: "https://x".into(),
            expires_at: Some(Utc::now() - ChronoDuration::minutes(1)),
        };
        assert!(GDriveClient::live_uri(&expired).is_none());
        let live = ResumeToken::ResumableUri {
            uri: "https://x".into(),
            expires_at: None,
        };
        assert_eq!(GDriveClient::live_uri(&live), Some("https://x"));
    }

    #[test]
    fn query_values_escape_quotes() {
        assert_eq!(escape_query("it's"), "it\\'s");
    }
}
