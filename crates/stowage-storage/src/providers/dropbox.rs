//! Dropbox client (HTTP API v2 upload sessions).
//!
//! The session id is the only continuation token. Dropbox offers no offset
//! query, so recovery appends an empty body at the believed offset and
//! reads the `incorrect_offset` correction if there is one.

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};

use stowage_core::error::AppError;
use stowage_core::result::AppResult;
use stowage_entity::package::ResumeToken;
use stowage_entity::storage::{
    DropboxSettings, OAuthToken, StorageEntity, StorageKind, StorageSettings,
};

use super::digest::{dropbox_content_hash, dropbox_content_hash_bytes};
use super::http::{build_client, error_for, transport_error, within_slice};
use super::oauth::OAuthSession;
use crate::chunked::read_range;
use crate::client::{
    ChunkProgress, ChunkRequest, ChunkedTransferClient, RemoteObject, TransferError,
    TransferResult, join_remote,
};
use crate::registry::{ApiEndpoints, ClientContext, ClientFactory};

#[derive(Debug, Deserialize)]
struct SessionStart {
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct FileMetadata {
    #[serde(default)]
    content_hash: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListFolder {
    entries: Vec<Value>,
    cursor: String,
    has_more: bool,
}

/// Outcome of an append against the session.
enum Append {
    Accepted,
    WrongOffset(u64),
    SessionGone,
}

/// Dropbox transfer client.
#[derive(Debug)]
pub struct DropboxClient {
    auth: OAuthSession,
    endpoints: ApiEndpoints,
    folder: String,
    chunk_size: u64,
}

impl DropboxClient {
    /// Create a client for the given settings.
    pub fn new(
        settings: &DropboxSettings,
        context: &ClientContext,
    ) -> AppResult<Self> {
        let http = build_client(&context.transfer)?;
        let auth = OAuthSession::new(
            http,
            &context.endpoints.dropbox_token,
            &settings.app_key,
            &settings.app_secret,
            settings.token.clone(),
        );
        Ok(Self {
            auth,
            endpoints: context.endpoints.clone(),
            folder: normalize_folder(&settings.storage_folder),
            chunk_size: context.transfer.dropbox_chunk_size_bytes.max(1),
        })
    }

    fn path_of(&self, name: &str) -> String {
        format!("/{}", join_remote(self.folder.trim_start_matches('/'), name))
    }

    async fn start_session(&mut self, body: Bytes) -> TransferResult<String> {
        let url = format!("{}/files/upload_session/start", self.endpoints.dropbox_content);
        let arg = json!({ "close": false }).to_string();
        let response = self
            .auth
            .send_body("Dropbox session start", body, |http| {
                http.post(&url)
                    .header("Dropbox-API-Arg", arg.clone())
                    .header("Content-Type", "application/octet-stream")
            })
            .await?;
        if !response.status().is_success() {
            return Err(error_for("Dropbox session start", response).await);
        }
        let start: SessionStart = response
            .json()
            .await
            .map_err(|e| transport_error("Dropbox session start response", e))?;
        Ok(start.session_id)
    }

    async fn append(&mut self, session_id: &str, offset: u64, body: Bytes) -> TransferResult<Append> {
        let url = format!("{}/files/upload_session/append_v2", self.endpoints.dropbox_content);
        let arg = json!({
            "cursor": { "session_id": session_id, "offset": offset },
            "close": false,
        })
        .to_string();
        let response = self
            .auth
            .send_body("Dropbox append", body, |http| {
                http.post(&url)
                    .header("Dropbox-API-Arg", arg.clone())
                    .header("Content-Type", "application/octet-stream")
            })
            .await?;
        if response.status().is_success() {
            return Ok(Append::Accepted);
        }
        if response.status() == StatusCode::CONFLICT {
            let body = response.text().await.unwrap_or_default();
            return lookup_session_error(&body)
                .ok_or_else(|| TransferError::recoverable(format!("Dropbox append: {body}")));
        }
        Err(error_for("Dropbox append", response).await)
    }

    async fn finish(
        &mut self,
        session_id: &str,
        offset: u64,
        body: Bytes,
        dest: &str,
    ) -> TransferResult<Result<FileMetadata, Append>> {
        let url = format!("{}/files/upload_session/finish", self.endpoints.dropbox_content);
        let arg = json!({
            "cursor": { "session_id": session_id, "offset": offset },
            "commit": commit(&self.path_of(dest)),
        })
        .to_string();
        let response = self
            .auth
            .send_body("Dropbox finish", body, |http| {
                http.post(&url)
                    .header("Dropbox-API-Arg", arg.clone())
                    .header("Content-Type", "application/octet-stream")
            })
            .await?;
        if response.status() == StatusCode::CONFLICT {
            let body = response.text().await.unwrap_or_default();
            return match lookup_session_error(&body) {
                Some(append) => Ok(Err(append)),
                None => Err(TransferError::fatal(format!("Dropbox finish rejected: {body}"))),
            };
        }
        if !response.status().is_success() {
            return Err(error_for("Dropbox finish", response).await);
        }
        let meta: FileMetadata = response
            .json()
            .await
            .map_err(|e| transport_error("Dropbox finish response", e))?;
        Ok(Ok(meta))
    }

    async fn verify(&self, source: &Path, meta: &FileMetadata) -> TransferResult<()> {
        let Some(remote) = meta.content_hash.as_deref() else {
            return Ok(());
        };
        let local = dropbox_content_hash(source).await?;
        if !remote.eq_ignore_ascii_case(&local) {
            return Err(TransferError::fatal(format!(
                "Dropbox content hash mismatch: local {local}, remote {remote}"
            )));
        }
        Ok(())
    }
}

fn commit(path: &str) -> Value {
    json!({ "path": path, "mode": "overwrite", "autorename": false, "mute": true })
}

fn normalize_folder(folder: &str) -> String {
    folder.trim_matches('/').to_string()
}

/// Interpret a 409 from an upload-session call.
fn lookup_session_error(body: &str) -> Option<Append> {
    let value: Value = serde_json::from_str(body).ok()?;
    let error = value.get("error")?;
    let lookup = error.get("lookup_failed").unwrap_or(error);
    match lookup.get(".tag").and_then(Value::as_str)? {
        "incorrect_offset" => lookup
            .get("correct_offset")
            .and_then(Value::as_u64)
            .map(Append::WrongOffset),
        "not_found" | "closed" | "not_closed" => Some(Append::SessionGone),
        _ => None,
    }
}

#[async_trait]
impl ChunkedTransferClient for DropboxClient {
    fn kind(&self) -> StorageKind {
        StorageKind::Dropbox
    }

    async fn upload_whole(&mut self, source: &Path, dest: &str) -> TransferResult<()> {
        let data = Bytes::from(tokio::fs::read(source).await?);
        let url = format!("{}/files/upload", self.endpoints.dropbox_content);
        let arg = commit(&self.path_of(dest)).to_string();
        let expected = dropbox_content_hash_bytes(&data);
        let response = self
            .auth
            .send_body("Dropbox upload", data, |http| {
                http.post(&url)
                    .header("Dropbox-API-Arg", arg.clone())
                    .header("Content-Type", "application/octet-stream")
            })
            .await?;
        if !response.status().is_success() {
            return Err(error_for("Dropbox upload", response).await);
        }
        let meta: FileMetadata = response
            .json()
            .await
            .map_err(|e| transport_error("Dropbox upload response", e))?;
        if let Some(remote) = meta.content_hash.as_deref()
            && !remote.eq_ignore_ascii_case(&expected)
        {
            return Err(TransferError::fatal(format!(
                "Dropbox content hash mismatch for {dest}"
            )));
        }
        Ok(())
    }

    async fn upload_chunk(&mut self, request: ChunkRequest<'_>) -> TransferResult<ChunkProgress> {
        if request.remaining().is_zero() {
            return Err(TransferError::timeout("No time left for a Dropbox chunk"));
        }

        let (session_id, offset) = match &request.token {
            ResumeToken::Session { session_id } => (Some(session_id.clone()), request.offset),
            _ => (None, 0),
        };
        let len = self.chunk_size.min(request.file_size - offset.min(request.file_size));
        let body = Bytes::from(read_range(request.source, offset, len).await?);
        let sent = body.len() as u64;
        let end = offset + sent;

        let Some(session_id) = session_id else {
            let start = self.start_session(body);
            let session_id = within_slice(request.remaining(), "Dropbox session start", start).await?;
            tracing::debug!(session_id, "Opened Dropbox upload session");
            // Committed by the next step with an empty final append.
            return Ok(ChunkProgress::partial(end, ResumeToken::Session { session_id }));
        };

        if end >= request.file_size {
            let finish = self.finish(&session_id, offset, body, request.dest);
            return match within_slice(request.remaining(), "Dropbox finish", finish).await? {
                Ok(meta) => {
                    self.verify(request.source, &meta).await?;
                    Ok(ChunkProgress::finished(request.file_size))
                }
                Err(Append::WrongOffset(correct)) => Ok(ChunkProgress::partial(
                    correct.min(request.file_size),
                    ResumeToken::Session { session_id },
                )),
                Err(_) => Ok(ChunkProgress::partial(0, ResumeToken::None)),
            };
        }

        let append = self.append(&session_id, offset, body);
        let progress = match within_slice(request.remaining(), "Dropbox append", append).await? {
            Append::Accepted => ChunkProgress::partial(end, ResumeToken::Session { session_id }),
            Append::WrongOffset(correct) => {
                tracing::debug!(offset, correct, "Dropbox corrected the session offset");
                ChunkProgress::partial(
                    correct.min(request.file_size),
                    ResumeToken::Session { session_id },
                )
            }
            Append::SessionGone => {
                tracing::warn!("Dropbox upload session expired, restarting");
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
        let ResumeToken::Session { session_id } = token else {
            return Ok(ChunkProgress::partial(0, ResumeToken::None));
        };
        // The empty append at the end of the file tells where the session is.
        match self.append(session_id, file_size, Bytes::new()).await? {
            Append::WrongOffset(correct) => Ok(ChunkProgress::partial(
                correct.min(file_size),
                token.clone(),
            )),
            Append::SessionGone => Ok(ChunkProgress::partial(0, ResumeToken::None)),
            // Every byte is in the session; the next step commits it.
            Append::Accepted => Ok(ChunkProgress::partial(file_size, token.clone())),
        }
    }

    async fn abort(&mut self, _dest: &str, _token: &ResumeToken) -> TransferResult<()> {
        // Unfinished sessions expire on their own and never become files.
        Ok(())
    }

    async fn delete(&mut self, name: &str) -> TransferResult<bool> {
        let url = format!("{}/files/delete_v2", self.endpoints.dropbox_api);
        let body = json!({ "path": self.path_of(name) });
        let response = self
            .auth
            .send("Dropbox delete", |http| http.post(&url).json(&body))
            .await?;
        if response.status() == StatusCode::CONFLICT {
            let text = response.text().await.unwrap_or_default();
            if text.contains("not_found") {
                return Ok(false);
            }
            return Err(TransferError::recoverable(format!("Dropbox delete: {text}")));
        }
        if !response.status().is_success() {
            return Err(error_for("Dropbox delete", response).await);
        }
        Ok(true)
    }

    async fn list_objects(&mut self) -> TransferResult<Vec<RemoteObject>> {
        let first_url = format!("{}/files/list_folder", self.endpoints.dropbox_api);
        let next_url = format!("{}/files/list_folder/continue", self.endpoints.dropbox_api);
        let folder = if self.folder.is_empty() {
            String::new()
        } else {
            format!("/{}", self.folder)
        };

        let body = json!({ "path": folder });
        let response = self
            .auth
            .send("Dropbox list", |http| http.post(&first_url).json(&body))
            .await?;
        if response.status() == StatusCode::CONFLICT {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(error_for("Dropbox list", response).await);
        }
        let mut page: ListFolder = response
            .json()
            .await
            .map_err(|e| transport_error("Dropbox list response", e))?;

        let mut objects = Vec::new();
        loop {
            objects.extend(page.entries.iter().filter_map(file_entry));
            if !page.has_more {
                break;
            }
            let body = json!({ "cursor": page.cursor });
            let response = self
                .auth
                .send("Dropbox list", |http| http.post(&next_url).json(&body))
                .await?;
            if !response.status().is_success() {
                return Err(error_for("Dropbox list", response).await);
            }
            page = response
                .json()
                .await
                .map_err(|e| transport_error("Dropbox list response", e))?;
        }
        Ok(objects)
    }

    fn refreshed_token(&self) -> Option<OAuthToken> {
        self.auth.refreshed_token()
    }
}

fn file_entry(entry: &Value) -> Option<RemoteObject> {
    if entry.get(".tag").and_then(Value::as_str) != Some("file") {
        return None;
    }
    Some(RemoteObject {
        name: entry.get("name")?.as_str()?.to_string(),
        size: entry.get("size").and_then(Value::as_u64).unwrap_or(0),
        modified: entry
            .get("server_modified")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc)),
    })
}

/// Factory for Dropbox storages.
#[derive(Debug, Clone, Copy)]
pub struct DropboxFactory;

#[async_trait]
impl ClientFactory for DropboxFactory {
    fn kind(&self) -> StorageKind {
        StorageKind::Dropbox
    }

    async fn build(
        &self,
        storage: &StorageEntity,
        context: &ClientContext,
    ) -> AppResult<Box<dyn ChunkedTransferClient>> {
        match &storage.settings {
            StorageSettings::Dropbox(settings) => Ok(Box::new(DropboxClient::new(settings, context)?)),
            other => Err(AppError::validation(format!(
                "Dropbox factory cannot build a {} storage",
                other.kind()
            ))),
        }
    }
}
