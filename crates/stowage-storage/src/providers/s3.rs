//! Amazon S3 and S3-compatible client (multipart uploads).
//!
//! The multipart upload id and the acknowledged part list form the
//! continuation token. `ListParts` is the offset oracle: only the
//! contiguous run of parts from part 1 counts.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::Region;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::{
    BehaviorVersion, Credentials, RequestChecksumCalculation, ResponseChecksumValidation,
};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, StorageClass};
use chrono::{DateTime, Utc};

use stowage_core::error::AppError;
use stowage_core::result::AppResult;
use stowage_entity::package::{ResumeToken, UploadedPart};
use stowage_entity::storage::{S3Settings, StorageEntity, StorageKind, StorageSettings};

use crate::chunked::read_range;
use crate::client::{
    ChunkProgress, ChunkRequest, ChunkedTransferClient, RemoteObject, TransferError,
    TransferResult, join_remote,
};
use crate::registry::{ClientContext, ClientFactory};

/// Error codes that will not go away by retrying.
const FATAL_CODES: &[&str] = &[
    "NoSuchBucket",
    "InvalidAccessKeyId",
    "SignatureDoesNotMatch",
    "AccessDenied",
    "InvalidBucketName",
    "AccountProblem",
];

/// S3 transfer client.
#[derive(Debug)]
pub struct S3Client {
    kind: StorageKind,
    client: Client,
    bucket: String,
    folder: String,
    storage_class: Option<StorageClass>,
    part_size: u64,
}

impl S3Client {
    /// Create a client for the given settings.
    pub fn new(kind: StorageKind, settings: &S3Settings, context: &ClientContext) -> Self {
        let region = if settings.region.is_empty() {
            "us-east-1".to_string()
        } else {
            settings.region.clone()
        };
        let credentials = Credentials::new(
            &settings.access_key,
            &settings.secret_key,
            None,
            None,
            "stowage-settings",
        );
        let mut builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region))
            .credentials_provider(credentials)
            .force_path_style(settings.force_path_style || kind != StorageKind::S3);
        if kind != StorageKind::S3 {
            // Many compatible services reject the SDK's default CRC headers.
            builder = builder
                .request_checksum_calculation(RequestChecksumCalculation::WhenRequired)
                .response_checksum_validation(ResponseChecksumValidation::WhenRequired);
        }
        if !settings.endpoint.is_empty() {
            builder = builder.endpoint_url(&settings.endpoint);
        }

        Self {
            kind,
            client: Client::from_conf(builder.build()),
            bucket: settings.bucket.clone(),
            folder: settings.storage_folder.trim_matches('/').to_string(),
            storage_class: (!settings.storage_class.is_empty())
                .then(|| StorageClass::from(settings.storage_class.as_str())),
            part_size: context.transfer.s3_part_size(),
        }
    }

    fn key(&self, name: &str) -> String {
        join_remote(&self.folder, name)
    }

    fn prefix(&self) -> String {
        if self.folder.is_empty() {
            String::new()
        } else {
            format!("{}/", self.folder)
        }
    }

    async fn put_whole(&self, source: &Path, key: &str) -> TransferResult<()> {
        let body = ByteStream::from_path(source)
            .await
            .map_err(|e| TransferError::recoverable(format!("Cannot read {}: {e}", source.display())))?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .set_storage_class(self.storage_class.clone())
            .body(body)
            .send()
            .await
            .map_err(|e| classify("PutObject", e))?;
        Ok(())
    }

    async fn start_multipart(&self, key: &str) -> TransferResult<String> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .set_storage_class(self.storage_class.clone())
            .send()
            .await
            .map_err(|e| classify("CreateMultipartUpload", e))?;
        let upload_id = output
            .upload_id()
            .ok_or_else(|| TransferError::recoverable("CreateMultipartUpload returned no upload id"))?
            .to_string();
        tracing::debug!(bucket = %self.bucket, key, upload_id = %upload_id, "Started multipart upload");
        Ok(upload_id)
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[UploadedPart],
    ) -> TransferResult<()> {
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(
                parts
                    .iter()
                    .map(|p| {
                        CompletedPart::builder()
                            .e_tag(&p.etag)
                            .part_number(p.part_number)
                            .build()
                    })
                    .collect(),
            ))
            .build();
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| classify("CompleteMultipartUpload", e))?;
        Ok(())
    }

    /// Parts the service holds for an upload, or `None` if the upload is
    /// gone.
    async fn list_parts(&self, key: &str, upload_id: &str) -> TransferResult<Option<Vec<UploadedPart>>> {
        let mut parts = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let result = self
                .client
                .list_parts()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .set_part_number_marker(marker.clone())
                .send()
                .await;
            let output = match result {
                Ok(output) => output,
                Err(e) if e.code() == Some("NoSuchUpload") => return Ok(None),
                Err(e) => return Err(classify("ListParts", e)),
            };
            parts.extend(output.parts().iter().filter_map(|p| {
                Some(UploadedPart {
                    part_number: p.part_number()?,
                    etag: p.e_tag()?.to_string(),
                })
            }));
            if output.is_truncated() == Some(true) {
                marker = output.next_part_number_marker().map(String::from);
                if marker.is_none() {
                    break;
                }
            } else {
                break;
            }
        }
        Ok(Some(contiguous_parts(parts)))
    }

    /// Send one part within the slice. `None` if the upload is gone.
    async fn send_part(
        &self,
        request: &ChunkRequest<'_>,
        key: &str,
        upload_id: &str,
        part_number: i32,
        offset: u64,
    ) -> TransferResult<Option<String>> {
        let len = self.part_size.min(request.file_size - offset);
        let data = read_range(request.source, offset, len).await?;
        let send = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(data))
            .send();
        let output = match tokio::time::timeout(request.remaining(), send).await {
            Err(_) => return Err(TransferError::timeout("UploadPart ran past the time slice")),
            Ok(Err(e)) if e.code() == Some("NoSuchUpload") => return Ok(None),
            Ok(Err(e)) => return Err(classify("UploadPart", e)),
            Ok(Ok(output)) => output,
        };
        output
            .e_tag()
            .map(|etag| Some(etag.to_string()))
            .ok_or_else(|| TransferError::recoverable("UploadPart returned no ETag"))
    }

    /// Abort an upload no step will resume. Best effort.
    async fn abandon(&self, key: &str, upload_id: &str) {
        let result = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await;
        match result {
            Ok(_) => tracing::debug!(key, upload_id, "Abandoned multipart upload aborted"),
            Err(e) => tracing::warn!(key, upload_id, error = %DisplayErrorContext(&e), "Abandoned multipart upload left for the sweep"),
        }
    }

    async fn remote_size(&self, key: &str) -> TransferResult<Option<u64>> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => Ok(output.content_length().map(|len| len.max(0) as u64)),
            Err(e) if e.as_service_error().is_some_and(|svc| svc.is_not_found()) => Ok(None),
            Err(e) => Err(classify("HeadObject", e)),
        }
    }
}

/// Keep the run of parts numbered 1, 2, 3... and drop the rest.
fn contiguous_parts(mut parts: Vec<UploadedPart>) -> Vec<UploadedPart> {
    parts.sort_by_key(|p| p.part_number);
    parts.dedup_by_key(|p| p.part_number);
    let run = parts
        .iter()
        .enumerate()
        .take_while(|(i, p)| p.part_number == *i as i32 + 1)
        .count();
    parts.truncate(run);
    parts
}

/// Classify an SDK failure.
fn classify<E, R>(context: &str, err: SdkError<E, R>) -> TransferError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    let code = err.code().map(str::to_string);
    let message = format!("{context}: {}", DisplayErrorContext(&err));
    match (&err, code.as_deref()) {
        (SdkError::TimeoutError(_), _) => TransferError::recoverable(message),
        (_, Some(code)) if FATAL_CODES.contains(&code) => TransferError::fatal(message),
        _ => TransferError::recoverable(message),
    }
}

fn to_chrono(time: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(time.secs(), time.subsec_nanos())
}

#[async_trait]
impl ChunkedTransferClient for S3Client {
    fn kind(&self) -> StorageKind {
        self.kind
    }

    async fn upload_whole(&mut self, source: &Path, dest: &str) -> TransferResult<()> {
        let key = self.key(dest);
        self.put_whole(source, &key).await
    }

    async fn upload_chunk(&mut self, request: ChunkRequest<'_>) -> TransferResult<ChunkProgress> {
        let remaining = request.remaining();
        if remaining.is_zero() {
            return Err(TransferError::timeout("No time left for an S3 part"));
        }
        let key = self.key(request.dest);

        if request.token.is_none() && request.offset == 0 && request.file_size <= self.part_size {
            tokio::time::timeout(remaining, self.put_whole(request.source, &key))
                .await
                .map_err(|_| TransferError::timeout("PutObject ran past the time slice"))??;
            return Ok(ChunkProgress::finished(request.file_size));
        }

        let (upload_id, mut parts, opened_here) = match &request.token {
            ResumeToken::Multipart { upload_id, parts } => (upload_id.clone(), parts.clone(), false),
            _ => (self.start_multipart(&key).await?, Vec::new(), true),
        };

        let offset = parts.len() as u64 * self.part_size;
        if offset < request.file_size {
            let part_number = parts.len() as i32 + 1;
            let sent = self
                .send_part(&request, &key, &upload_id, part_number, offset)
                .await;
            let etag = match sent {
                Ok(Some(etag)) => etag,
                Ok(None) => {
                    tracing::warn!(key = %key, upload_id = %upload_id, "Multipart upload vanished, restarting");
                    return Ok(ChunkProgress::partial(0, ResumeToken::None));
                }
                // A failed step persists no token, so this upload id is lost.
                Err(e) if opened_here => {
                    self.abandon(&key, &upload_id).await;
                    return Err(e);
                }
                Err(e) => return Err(e),
            };
            parts.push(UploadedPart { part_number, etag });
        }

        let next = (parts.len() as u64 * self.part_size).min(request.file_size);
        if next >= request.file_size {
            self.complete_multipart(&key, &upload_id, &parts).await?;
            return Ok(ChunkProgress::finished(request.file_size));
        }
        if !request.throttle.is_zero() {
            tokio::time::sleep(request.throttle).await;
        }
        Ok(ChunkProgress::partial(
            next,
            ResumeToken::Multipart { upload_id, parts },
        ))
    }

    async fn recover_offset(
        &mut self,
        dest: &str,
        file_size: u64,
        token: &ResumeToken,
    ) -> TransferResult<ChunkProgress> {
        let key = self.key(dest);
        let ResumeToken::Multipart { upload_id, .. } = token else {
            return Ok(match self.remote_size(&key).await? {
                Some(size) if size == file_size => ChunkProgress::finished(file_size),
                _ => ChunkProgress::partial(0, ResumeToken::None),
            });
        };

        match self.list_parts(&key, upload_id).await? {
            Some(parts) => {
                let next = (parts.len() as u64 * self.part_size).min(file_size);
                Ok(ChunkProgress::partial(
                    next,
                    ResumeToken::Multipart {
                        upload_id: upload_id.clone(),
                        parts,
                    },
                ))
            }
            // Completed uploads disappear from ListParts too.
            None => Ok(match self.remote_size(&key).await? {
                Some(size) if size == file_size => ChunkProgress::finished(file_size),
                _ => ChunkProgress::partial(0, ResumeToken::None),
            }),
        }
    }

    async fn abort(&mut self, dest: &str, token: &ResumeToken) -> TransferResult<()> {
        let ResumeToken::Multipart { upload_id, .. } = token else {
            return Ok(());
        };
        match self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(self.key(dest))
            .upload_id(upload_id)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("NoSuchUpload") => Ok(()),
            Err(e) => Err(classify("AbortMultipartUpload", e)),
        }
    }

    async fn delete(&mut self, name: &str) -> TransferResult<bool> {
        let key = self.key(name);
        if self.remote_size(&key).await?.is_none() {
            return Ok(false);
        }
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| classify("DeleteObject", e))?;
        Ok(true)
    }

    async fn list_objects(&mut self) -> TransferResult<Vec<RemoteObject>> {
        let prefix = self.prefix();
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .set_continuation_token(continuation.clone())
                .send()
                .await
                .map_err(|e| classify("ListObjectsV2", e))?;
            for object in output.contents() {
                let Some(name) = object.key().and_then(|k| k.strip_prefix(&prefix)) else {
                    continue;
                };
                if name.is_empty() || name.contains('/') {
                    continue;
                }
                objects.push(RemoteObject {
                    name: name.to_string(),
                    size: object.size().unwrap_or(0).max(0) as u64,
                    modified: object.last_modified().and_then(to_chrono),
                });
            }
            if output.is_truncated() == Some(true) {
                continuation = output.next_continuation_token().map(String::from);
                if continuation.is_none() {
                    break;
                }
            } else {
                break;
            }
        }
        Ok(objects)
    }

    async fn sweep_stale_uploads(&mut self, max_age: Duration) -> TransferResult<usize> {
        let prefix = self.prefix();
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::days(1));
        let mut stale = Vec::new();
        let mut key_marker: Option<String> = None;
        let mut upload_marker: Option<String> = None;
        loop {
            let output = self
                .client
                .list_multipart_uploads()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .set_key_marker(key_marker.clone())
                .set_upload_id_marker(upload_marker.clone())
                .send()
                .await
                .map_err(|e| classify("ListMultipartUploads", e))?;
            for upload in output.uploads() {
                let initiated = upload.initiated().and_then(to_chrono);
                if let (Some(key), Some(id), Some(at)) = (upload.key(), upload.upload_id(), initiated) {
                    if at < cutoff {
                        stale.push((key.to_string(), id.to_string()));
                    }
                }
            }
            if output.is_truncated() == Some(true) {
                key_marker = output.next_key_marker().map(String::from);
                upload_marker = output.next_upload_id_marker().map(String::from);
                if key_marker.is_none() {
                    break;
                }
            } else {
                break;
            }
        }

        let mut aborted = 0;
        for (key, upload_id) in stale {
            match self
                .client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(&key)
                .upload_id(&upload_id)
                .send()
                .await
            {
                Ok(_) => {
                    tracing::info!(bucket = %self.bucket, key = %key, upload_id = %upload_id, "Aborted stale multipart upload");
                    aborted += 1;
                }
                Err(e) => {
                    let error = classify("AbortMultipartUpload", e);
                    tracing::warn!(key = %key, error = %error, "Failed to abort stale multipart upload");
                }
            }
        }
        Ok(aborted)
    }
}

/// Factory for one S3 flavour.
#[derive(Debug, Clone, Copy)]
pub struct S3Factory {
    kind: StorageKind,
}

impl S3Factory {
    /// Create a factory serving `kind`.
    pub fn new(kind: StorageKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl ClientFactory for S3Factory {
    fn kind(&self) -> StorageKind {
        self.kind
    }

    async fn build(
        &self,
        storage: &StorageEntity,
        context: &ClientContext,
    ) -> AppResult<Box<dyn ChunkedTransferClient>> {
        match &storage.settings {
            StorageSettings::S3(settings)
            | StorageSettings::S3Compatible(settings)
            | StorageSettings::Backblaze(settings) => {
                if settings.bucket.is_empty() {
                    return Err(AppError::validation("S3 bucket is required"));
                }
                Ok(Box::new(S3Client::new(self.kind, settings, context)))
            }
            other => Err(AppError::validation(format!(
                "S3 factory cannot build a {} storage",
                other.kind()
            ))),
        }
    }
}
