//! OneDrive client (Microsoft Graph upload sessions).
//!
//! The upload URL is pre-authorized, so chunk PUTs go out without a bearer
//! token. `GET` on the upload URL reports `nextExpectedRanges`, which is
//! the offset oracle after an ambiguous failure.

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use serde_json::json;

use stowage_core::error::AppError;
use stowage_core::result::AppResult;
use stowage_entity::package::ResumeToken;
use stowage_entity::storage::{
    OAuthToken, OneDriveSettings, StorageEntity, StorageKind, StorageSettings,
};

use super::digest::sha256_hex;
use super::http::{
    build_client, content_range, encode_path, error_for, transport_error, within_slice,
};
use super::oauth::OAuthSession;
use crate::chunked::read_range;
use crate::client::{
    ChunkProgress, ChunkRequest, ChunkedTransferClient, RemoteObject, TransferError,
    TransferResult, join_remote,
};
use crate::registry::{ApiEndpoints, ClientContext, ClientFactory};

/// Largest file Graph accepts on the simple upload endpoint.
const SIMPLE_UPLOAD_LIMIT: u64 = 4 * 1024 * 1024;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadSession {
    upload_url: String,
    #[serde(default)]
    expiration_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    next_expected_ranges: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Hashes {
    #[serde(default)]
    sha256_hash: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileFacet {
    #[serde(default)]
    hashes: Hashes,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveItem {
    #[serde(default)]
    name: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    created_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    last_modified_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    file: Option<FileFacet>,
}

#[derive(Debug, Deserialize)]
struct Children {
    #[serde(default)]
    value: Vec<DriveItem>,
    #[serde(rename = "@odata.nextLink", default)]
    next_link: Option<String>,
}

/// OneDrive transfer client.
#[derive(Debug)]
pub struct OneDriveClient {
    auth: OAuthSession,
    endpoints: ApiEndpoints,
    folder: String,
    is_business: bool,
    chunk_size: u64,
}

impl OneDriveClient {
    /// Create a client for the given settings.
    pub fn new(settings: &OneDriveSettings, context: &ClientContext) -> AppResult<Self> {
        let http = build_client(&context.transfer)?;
        Ok(Self {
            auth: OAuthSession::new(
                http,
                &context.endpoints.microsoft_token,
                &settings.client_id,
                &settings.client_secret,
                settings.token.clone(),
            ),
            endpoints: context.endpoints.clone(),
            folder: settings.storage_folder.trim_matches('/').to_string(),
            is_business: settings.is_business,
            chunk_size: context.transfer.onedrive_chunk_size(),
        })
    }

    fn item_url(&self, name: &str) -> String {
        let path = encode_path(&join_remote(&self.folder, name));
        format!("{}/me/drive/root:/{path}", self.endpoints.graph)
    }

    async fn create_session(&mut self, name: &str) -> TransferResult<ResumeToken> {
        let url = format!("{}:/createUploadSession", self.item_url(name));
        let body = json!({ "item": { "@microsoft.graph.conflictBehavior": "replace" } });
        let response = self
            .auth
            .send("OneDrive session start", |http| http.post(&url).json(&body))
            .await?;
        if !response.status().is_success() {
            return Err(error_for("OneDrive session start", response).await);
        }
        let session: UploadSession = response
            .json()
            .await
            .map_err(|e| transport_error("OneDrive session start response", e))?;
        Ok(ResumeToken::ResumableUri {
            uri: session.upload_url,
            expires_at: session.expiration_date_time,
        })
    }

    /// PUT one range to the upload URL. Returns the next expected offset,
    /// or `None` once the item is complete.
    async fn put_range(
        &self,
        uri: &str,
        offset: u64,
        body: Bytes,
        total: u64,
    ) -> TransferResult<RangeReply> {
        let len = body.len() as u64;
        let response = self
            .auth
            .http()
            .put(uri)
            .header(reqwest::header::CONTENT_RANGE, content_range(offset, len, total))
            .header(reqwest::header::CONTENT_LENGTH, len)
            .body(body)
            .send()
            .await
            .map_err(|e| transport_error("OneDrive chunk", e))?;
        range_reply(response).await
    }

    async fn probe(&self, uri: &str) -> TransferResult<RangeReply> {
        let response = self
            .auth
            .http()
            .get(uri)
            .send()
            .await
            .map_err(|e| transport_error("OneDrive status probe", e))?;
        range_reply(response).await
    }

    /// Compare the stored SHA-256 with the local file.
    async fn verify(
        &mut self,
        name: &str,
        item: Option<DriveItem>,
        source: &Path,
    ) -> TransferResult<()> {
        let remote = match item.and_then(|i| i.file).and_then(|f| f.hashes.sha256_hash) {
            Some(hash) => Some(hash),
            None => self.fetch_hash(name).await?,
        };
        // Business accounts only report quickXorHash.
        let Some(remote) = remote else {
            return Ok(());
        };
        let local = sha256_hex(source).await?;
        if !remote.eq_ignore_ascii_case(&local) {
            return Err(TransferError::fatal(format!(
                "OneDrive checksum mismatch: local {local}, remote {remote}"
            )));
        }
        Ok(())
    }

    async fn fetch_hash(&mut self, name: &str) -> TransferResult<Option<String>> {
        let url = self.item_url(name);
        let response = self
            .auth
            .send("OneDrive item", |http| http.get(&url))
            .await?;
        if response.status() == StatusCode::NOT_FOUND && self.is_business {
            // Business libraries can lag before the item becomes visible.
            tracing::warn!(file = name, "OneDrive item not yet visible, skipping hash check");
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(error_for("OneDrive item", response).await);
        }
        let item: DriveItem = response
            .json()
            .await
            .map_err(|e| transport_error("OneDrive item response", e))?;
        Ok(item.file.and_then(|f| f.hashes.sha256_hash))
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

/// Answer to a range PUT or status probe.
#[derive(Debug)]
enum RangeReply {
    /// The service expects this offset next.
    Next(u64),
    /// The item is complete.
    Done(Option<DriveItem>),
    /// The session no longer exists.
    Gone,
    /// Accepted, but the reply did not say which byte comes next.
    Unknown,
}

async fn range_reply(response: Response) -> TransferResult<RangeReply> {
    match response.status() {
        StatusCode::ACCEPTED | StatusCode::OK
            if response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .is_some_and(|v| v.as_bytes().starts_with(b"application/json")) =>
        {
            let status = response.status();
            let body: serde_json::Value = response
                .json()
                .await
                .map_err(|e| transport_error("OneDrive range response", e))?;
            if let Some(ranges) = body.get("nextExpectedRanges").and_then(|r| r.as_array()) {
                let ranges: Vec<String> = ranges
                    .iter()
                    .filter_map(|r| r.as_str().map(str::to_string))
                    .collect();
                return Ok(next_expected(&ranges).map_or(RangeReply::Unknown, RangeReply::Next));
            }
            if status == StatusCode::ACCEPTED {
                return Ok(RangeReply::Unknown);
            }
            Ok(RangeReply::Done(serde_json::from_value(body).ok()))
        }
        StatusCode::ACCEPTED => Ok(RangeReply::Unknown),
        StatusCode::OK | StatusCode::CREATED => Ok(RangeReply::Done(response.json().await.ok())),
        StatusCode::NOT_FOUND | StatusCode::GONE => Ok(RangeReply::Gone),
        _ => Err(error_for("OneDrive chunk", response).await),
    }
}

/// First offset of `nextExpectedRanges` (`"N-"` or `"N-M"`).
fn next_expected(ranges: &[String]) -> Option<u64> {
    ranges
        .iter()
        .filter_map(|r| r.split('-').next())
        .filter_map(|start| start.trim().parse::<u64>().ok())
        .min()
}

#[async_trait]
impl ChunkedTransferClient for OneDriveClient {
    fn kind(&self) -> StorageKind {
        StorageKind::OneDrive
    }

    async fn upload_whole(&mut self, source: &Path, dest: &str) -> TransferResult<()> {
        let size = tokio::fs::metadata(source).await?.len();
        if size <= SIMPLE_UPLOAD_LIMIT {
            let data = Bytes::from(tokio::fs::read(source).await?);
            let url = format!("{}:/content", self.item_url(dest));
            let response = self
                .auth
                .send_body("OneDrive upload", data, |http| {
                    http.put(&url)
                        .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                })
                .await?;
            if !response.status().is_success() {
                return Err(error_for("OneDrive upload", response).await);
            }
            let item: Option<DriveItem> = response.json().await.ok();
            return self.verify(dest, item, source).await;
        }

        let token = self.create_session(dest).await?;
        let Some(uri) = Self::live_uri(&token).map(str::to_string) else {
            return Err(TransferError::recoverable("OneDrive session expired immediately"));
        };
        let mut offset = 0;
        loop {
            let len = self.chunk_size.min(size - offset);
            let body = Bytes::from(read_range(source, offset, len).await?);
            match self.put_range(&uri, offset, body, size).await? {
                RangeReply::Next(next) if next > offset => offset = next,
                RangeReply::Next(_) | RangeReply::Unknown => {
                    return Err(TransferError::recoverable("OneDrive did not advance the upload"));
                }
                RangeReply::Done(item) => return self.verify(dest, item, source).await,
                RangeReply::Gone => {
                    return Err(TransferError::recoverable("OneDrive upload session vanished"));
                }
            }
        }
    }

    async fn upload_chunk(&mut self, request: ChunkRequest<'_>) -> TransferResult<ChunkProgress> {
        if request.remaining().is_zero() {
            return Err(TransferError::timeout("No time left for a OneDrive chunk"));
        }

        let (token, offset) = match Self::live_uri(&request.token) {
            Some(_) => (request.token.clone(), request.offset),
            None => (self.create_session(request.dest).await?, 0),
        };
        let Some(uri) = Self::live_uri(&token).map(str::to_string) else {
            return Err(TransferError::recoverable("OneDrive session expired immediately"));
        };

        let len = self.chunk_size.min(request.file_size.saturating_sub(offset));
        let body = Bytes::from(read_range(request.source, offset, len).await?);
        let put = self.put_range(&uri, offset, body, request.file_size);
        let reply = within_slice(request.remaining(), "OneDrive chunk", put).await?;
        let progress = match reply {
            RangeReply::Next(next) => ChunkProgress::partial(next.min(request.file_size), token),
            RangeReply::Unknown => {
                return Err(TransferError::recoverable(
                    "OneDrive accepted the chunk without reporting the next expected range",
                ));
            }
            RangeReply::Done(item) => {
                self.verify(request.dest, item, request.source).await?;
                ChunkProgress::finished(request.file_size)
            }
            RangeReply::Gone => {
                tracing::warn!("OneDrive upload session gone, restarting");
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
            RangeReply::Next(next) => Ok(ChunkProgress::partial(next.min(file_size), token.clone())),
            RangeReply::Done(_) => Ok(ChunkProgress::finished(file_size)),
            RangeReply::Gone => Ok(ChunkProgress::partial(0, ResumeToken::None)),
            RangeReply::Unknown => Err(TransferError::recoverable(
                "OneDrive status probe did not report the next expected range",
            )),
        }
    }

    async fn abort(&mut self, _dest: &str, token: &ResumeToken) -> TransferResult<()> {
        if let ResumeToken::ResumableUri { uri, .. } = token {
            self.auth
                .http()
                .delete(uri)
                .send()
                .await
                .map_err(|e| transport_error("OneDrive session cancel", e))?;
        }
        Ok(())
    }

    async fn delete(&mut self, name: &str) -> TransferResult<bool> {
        let url = self.item_url(name);
        let response = self
            .auth
            .send("OneDrive delete", |http| http.delete(&url))
            .await?;
        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(error_for("OneDrive delete", response).await),
        }
    }

    async fn list_objects(&mut self) -> TransferResult<Vec<RemoteObject>> {
        let mut url = if self.folder.is_empty() {
            format!("{}/me/drive/root/children", self.endpoints.graph)
        } else {
            format!(
                "{}/me/drive/root:/{}:/children",
                self.endpoints.graph,
                encode_path(&self.folder)
            )
        };

        let mut objects = Vec::new();
        loop {
            let response = self
                .auth
                .send("OneDrive list", |http| http.get(&url))
                .await?;
            if response.status() == StatusCode::NOT_FOUND {
                break;
            }
            if !response.status().is_success() {
                return Err(error_for("OneDrive list", response).await);
            }
            let page: Children = response
                .json()
                .await
                .map_err(|e| transport_error("OneDrive list response", e))?;
            objects.extend(page.value.into_iter().filter(|i| i.file.is_some()).map(|i| {
                RemoteObject {
                    modified: i.created_date_time.or(i.last_modified_date_time),
                    size: i.size,
                    name: i.name,
                }
            }));
            match page.next_link {
                Some(next) => url = next,
                None => break,
            }
        }
        Ok(objects)
    }

    fn refreshed_token(&self) -> Option<OAuthToken> {
        self.auth.refreshed_token()
    }
}

/// Factory for OneDrive storages.
#[derive(Debug, Clone, Copy)]
pub struct OneDriveFactory;

#[async_trait]
impl ClientFactory for OneDriveFactory {
    fn kind(&self) -> StorageKind {
        StorageKind::OneDrive
    }

    async fn build(
        &self,
        storage: &StorageEntity,
        context: &ClientContext,
    ) -> AppResult<Box<dyn ChunkedTransferClient>> {
        match &storage.settings {
            StorageSettings::OneDrive(settings) => {
                Ok(Box::new(OneDriveClient::new(settings, context)?))
            }
            other => Err(AppError::validation(format!(
                "OneDrive factory cannot build a {} storage",
                other.kind()
            ))),
        }
    }
}
