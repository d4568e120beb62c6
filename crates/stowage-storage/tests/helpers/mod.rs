//! Shared fixtures for the storage integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::Utc;

use stowage_entity::package::{Package, PackageStatus, ResumeToken, UploadInfo};
use stowage_entity::storage::StorageKind;
use stowage_storage::client::{
    ChunkProgress, ChunkRequest, ChunkedTransferClient, RemoteObject, TransferError,
    TransferResult,
};

pub const MIB: u64 = 1024 * 1024;

/// Write a package's installer and an archive of `archive_size` bytes into
/// `dir` and return the package, queued for `storage_id`.
pub async fn write_package(dir: &Path, archive_size: u64, storage_id: i64) -> Package {
    let (archive_name, installer_name) = Package::default_file_names("site", "20261019_ab12");
    tokio::fs::write(dir.join(&installer_name), b"<?php // installer\n")
        .await
        .unwrap();
    let archive: Vec<u8> = (0..archive_size).map(|i| (i % 251) as u8).collect();
    tokio::fs::write(dir.join(&archive_name), archive).await.unwrap();

    Package {
        id: 1,
        name: "site".into(),
        hash: "20261019_ab12".into(),
        local_dir: dir.to_path_buf(),
        archive_name,
        installer_name,
        status: PackageStatus::StoragePending,
        cancel_pending: false,
        upload_infos: vec![UploadInfo::new(storage_id)],
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

/// Create a file and backdate its modification time.
pub fn write_aged(path: &Path, age: Duration) {
    std::fs::write(path, b"x").unwrap();
    let file = std::fs::File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() - age).unwrap();
}

/// Sorted names of the regular files in `dir`.
pub fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.path().is_file())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

/// A client that replays canned answers and counts calls.
#[derive(Debug)]
pub struct ScriptedClient {
    pub kind: StorageKind,
    pub installer: VecDeque<TransferResult<()>>,
    pub chunks: VecDeque<TransferResult<ChunkProgress>>,
    pub recovers: VecDeque<TransferResult<ChunkProgress>>,
    pub listing: Vec<RemoteObject>,
    pub installer_calls: usize,
    pub chunk_calls: usize,
    pub list_calls: usize,
    pub aborted: Vec<String>,
    pub offsets_seen: Vec<u64>,
}

impl ScriptedClient {
    pub fn new(kind: StorageKind) -> Self {
        Self {
            kind,
            installer: VecDeque::new(),
            chunks: VecDeque::new(),
            recovers: VecDeque::new(),
            listing: Vec::new(),
            installer_calls: 0,
            chunk_calls: 0,
            list_calls: 0,
            aborted: Vec::new(),
            offsets_seen: Vec::new(),
        }
    }

    pub fn installer(mut self, result: TransferResult<()>) -> Self {
        self.installer.push_back(result);
        self
    }

    pub fn chunk(mut self, result: TransferResult<ChunkProgress>) -> Self {
        self.chunks.push_back(result);
        self
    }

    pub fn recover(mut self, result: TransferResult<ChunkProgress>) -> Self {
        self.recovers.push_back(result);
        self
    }
}

#[async_trait]
impl ChunkedTransferClient for ScriptedClient {
    fn kind(&self) -> StorageKind {
        self.kind
    }

    async fn upload_whole(&mut self, _source: &Path, _dest: &str) -> TransferResult<()> {
        self.installer_calls += 1;
        self.installer.pop_front().unwrap_or(Ok(()))
    }

    async fn upload_chunk(&mut self, request: ChunkRequest<'_>) -> TransferResult<ChunkProgress> {
        self.chunk_calls += 1;
        self.offsets_seen.push(request.offset);
        self.chunks
            .pop_front()
            .unwrap_or_else(|| Err(TransferError::recoverable("script exhausted")))
    }

    async fn recover_offset(
        &mut self,
        _dest: &str,
        _file_size: u64,
        token: &ResumeToken,
    ) -> TransferResult<ChunkProgress> {
        self.recovers
            .pop_front()
            .unwrap_or_else(|| Ok(ChunkProgress::partial(0, token.clone())))
    }

    async fn abort(&mut self, dest: &str, _token: &ResumeToken) -> TransferResult<()> {
        self.aborted.push(dest.to_string());
        Ok(())
    }

    async fn delete(&mut self, name: &str) -> TransferResult<bool> {
        let before = self.listing.len();
        self.listing.retain(|o| o.name != name);
        Ok(self.listing.len() != before)
    }

    async fn list_objects(&mut self) -> TransferResult<Vec<RemoteObject>> {
        self.list_calls += 1;
        Ok(self.listing.clone())
    }
}
