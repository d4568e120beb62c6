//! Local filesystem client.
//!
//! Serves both the default-local storage (rooted at the backup directory)
//! and additional local directories. Package steps for these kinds go
//! through the chunked copy engine; this client covers the retention,
//! test and cleanup paths and a plain chunked upload.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;

use stowage_core::error::AppError;
use stowage_core::result::AppResult;
use stowage_entity::package::ResumeToken;
use stowage_entity::storage::{StorageEntity, StorageKind, StorageSettings};

use crate::chunked::copy_range;
use crate::client::{
    ChunkProgress, ChunkRequest, ChunkedTransferClient, RemoteObject, TransferError,
    TransferResult,
};
use crate::registry::{ClientContext, ClientFactory};

/// Client for a directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalClient {
    kind: StorageKind,
    root: PathBuf,
    chunk_size: u64,
}

impl LocalClient {
    /// Create a client rooted at `root`.
    pub fn new(kind: StorageKind, root: impl Into<PathBuf>, chunk_size: u64) -> Self {
        Self {
            kind,
            root: root.into(),
            chunk_size: chunk_size.max(1),
        }
    }

    /// The directory files are stored in.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, name: &str) -> PathBuf {
        self.root.join(name.trim_start_matches('/'))
    }

    async fn ensure_root(&self) -> TransferResult<()> {
        fs::create_dir_all(&self.root).await.map_err(|e| {
            TransferError::fatal(format!(
                "Cannot create folder {}: {e}",
                self.root.display()
            ))
        })
    }
}

#[async_trait]
impl ChunkedTransferClient for LocalClient {
    fn kind(&self) -> StorageKind {
        self.kind
    }

    async fn upload_whole(&mut self, source: &Path, dest: &str) -> TransferResult<()> {
        self.ensure_root().await?;
        let target = self.resolve(dest);
        if target == source {
            return Ok(());
        }
        fs::copy(source, &target).await?;
        Ok(())
    }

    async fn upload_chunk(&mut self, request: ChunkRequest<'_>) -> TransferResult<ChunkProgress> {
        if request.remaining().is_zero() {
            return Err(TransferError::timeout("No time left for a local chunk"));
        }
        self.ensure_root().await?;
        let target = self.resolve(request.dest);
        let copied = copy_range(request.source, &target, request.offset, self.chunk_size).await?;
        let next = request.offset + copied;
        if next >= request.file_size {
            return Ok(ChunkProgress::finished(request.file_size));
        }
        if !request.throttle.is_zero() {
            tokio::time::sleep(request.throttle).await;
        }
        Ok(ChunkProgress::partial(next, ResumeToken::None))
    }

    async fn recover_offset(
        &mut self,
        dest: &str,
        file_size: u64,
        _token: &ResumeToken,
    ) -> TransferResult<ChunkProgress> {
        let len = match fs::metadata(self.resolve(dest)).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        // Never reported complete: the next chunk rewrites from the cursor.
        Ok(ChunkProgress::partial(len.min(file_size), ResumeToken::None))
    }

    async fn abort(&mut self, dest: &str, _token: &ResumeToken) -> TransferResult<()> {
        self.delete(dest).await.map(|_| ())
    }

    async fn delete(&mut self, name: &str) -> TransferResult<bool> {
        match fs::remove_file(self.resolve(name)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_objects(&mut self) -> TransferResult<Vec<RemoteObject>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut objects = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            objects.push(RemoteObject {
                name: entry.file_name().to_string_lossy().into_owned(),
                size: meta.len(),
                modified: meta.modified().ok().map(DateTime::<Utc>::from),
            });
        }
        Ok(objects)
    }
}

/// Factory for the two local kinds.
#[derive(Debug, Clone, Copy)]
pub struct LocalFactory {
    kind: StorageKind,
}

impl LocalFactory {
    /// Create a factory for `kind` (default-local or local).
    pub fn new(kind: StorageKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl ClientFactory for LocalFactory {
    fn kind(&self) -> StorageKind {
        self.kind
    }

    async fn build(
        &self,
        storage: &StorageEntity,
        context: &ClientContext,
    ) -> AppResult<Box<dyn ChunkedTransferClient>> {
        let root = match &storage.settings {
            StorageSettings::DefaultLocal(_) => context.backup_dir.clone(),
            StorageSettings::Local(settings) => PathBuf::from(&settings.folder),
            other => {
                return Err(AppError::validation(format!(
                    "Local factory cannot build a {} storage",
                    other.kind()
                )));
            }
        };
        Ok(Box::new(LocalClient::new(
            self.kind,
            root,
            context.transfer.local_chunk_size_bytes,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::Instant;

    #[tokio::test]
    async fn test_chunked_upload_and_listing() {
        let src_dir = tempfile::tempdir().unwrap();
        let dst_dir = tempfile::tempdir().unwrap();
        let source = src_dir.path().join("x_archive.zip");
        fs::write(&source, vec![7u8; 25]).await.unwrap();

        let mut client = LocalClient::new(StorageKind::Local, dst_dir.path(), 10);
        let mut offset = 0;
        let mut steps = 0;
        loop {
            steps += 1;
            let progress = client
                .upload_chunk(ChunkRequest {
                    source: &source,
                    dest: "x_archive.zip",
                    file_size: 25,
                    offset,
                    token: ResumeToken::None,
                    deadline: Instant::now() + Duration::from_secs(5),
                    throttle: Duration::ZERO,
                })
                .await
                .unwrap();
            offset = progress.next_offset;
            if progress.complete {
                break;
            }
        }
        assert_eq!(steps, 3);

        let objects = client.list_objects().await.unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].size, 25);
        assert!(client.delete("x_archive.zip").await.unwrap());
        assert!(!client.delete("x_archive.zip").await.unwrap());
    }

    #[tokio::test]
    async fn test_recover_offset_reads_destination_length() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("p_archive.zip"), vec![0u8; 12])
            .await
            .unwrap();
        let mut client = LocalClient::new(StorageKind::Local, dir.path(), 10);
        let progress = client
            .recover_offset("p_archive.zip", 100, &ResumeToken::None)
            .await
            .unwrap();
        assert_eq!(progress.next_offset, 12);
        let missing = client
            .recover_offset("q_archive.zip", 100, &ResumeToken::None)
            .await
            .unwrap();
        assert_eq!(missing.next_offset, 0);
    }
}
