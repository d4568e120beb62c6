//! Worker invocations against a migrated SQLite database.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use tokio::sync::{Notify, Semaphore};

use stowage_core::config::{StorageConfig, TransferConfig};
use stowage_core::result::AppResult;
use stowage_database::migration::run_migrations;
use stowage_database::repositories::{LeaseRepository, PackageRepository, StorageRepository};
use stowage_entity::package::{NewPackage, PackageStatus, ResumeToken};
use stowage_entity::storage::{
    LocalSettings, NewStorage, SftpSettings, StorageEntity, StorageKind, StorageSettings,
};
use stowage_storage::client::{
    ChunkProgress, ChunkRequest, ChunkedTransferClient, RemoteObject, TransferError,
    TransferResult,
};
use stowage_storage::engine::StepOutcome;
use stowage_storage::registry::{ApiEndpoints, ClientContext, ClientFactory, StorageRegistry};
use stowage_storage::StorageManager;
use stowage_worker::TransferWorker;

const MIB: usize = 1024 * 1024;

struct Fixture {
    worker: TransferWorker,
    manager: Arc<StorageManager>,
    backup: tempfile::TempDir,
}

async fn fixture(registry: StorageRegistry, transfer: TransferConfig) -> Fixture {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    run_migrations(&pool).await.unwrap();

    let backup = tempfile::tempdir().unwrap();
    let storage_config = StorageConfig {
        backup_dir: backup.path().to_string_lossy().into_owned(),
        ..StorageConfig::default()
    };
    let context = ClientContext {
        transfer: transfer.clone(),
        backup_dir: backup.path().to_path_buf(),
        endpoints: ApiEndpoints::default(),
    };
    let manager = Arc::new(StorageManager::new(
        StorageRepository::new(pool.clone(), None),
        PackageRepository::new(pool.clone()),
        LeaseRepository::new(pool),
        Arc::new(registry),
        context,
        storage_config,
    ));
    let worker = TransferWorker::new(manager.clone(), "daemon", transfer);
    Fixture {
        worker,
        manager,
        backup,
    }
}

async fn local_storage(manager: &StorageManager, folder: &Path) -> i64 {
    manager
        .storages()
        .create(&NewStorage {
            name: "nas".into(),
            notes: String::new(),
            settings: StorageSettings::Local(LocalSettings {
                folder: folder.to_string_lossy().into_owned(),
                max_packages: 5,
            }),
        })
        .await
        .unwrap()
        .id
}

async fn build_package(fixture: &Fixture, archive_size: usize, storage_ids: &[i64]) -> i64 {
    let package = fixture
        .manager
        .packages()
        .create(&NewPackage {
            name: "site".into(),
            hash: "20261019_ab12".into(),
            local_dir: fixture.backup.path().to_path_buf(),
            storage_ids: storage_ids.to_vec(),
        })
        .await
        .unwrap();
    let dir = fixture.backup.path();
    tokio::fs::write(dir.join(&package.installer_name), b"<?php // installer\n")
        .await
        .unwrap();
    let archive: Vec<u8> = (0..archive_size).map(|i| (i % 251) as u8).collect();
    tokio::fs::write(dir.join(&package.archive_name), archive)
        .await
        .unwrap();
    package.id
}

#[tokio::test]
async fn test_invocation_completes_local_transfer() {
    let fixture = fixture(StorageRegistry::with_defaults().unwrap(), TransferConfig::default()).await;
    let dest = tempfile::tempdir().unwrap();
    let storage_id = local_storage(&fixture.manager, dest.path()).await;
    let package_id = build_package(&fixture, 5 * MIB, &[storage_id]).await;

    let report = fixture.worker.run_package(package_id).await.unwrap();
    assert_eq!(report.status, PackageStatus::Completed);
    assert_eq!(report.steps.last(), Some(&(storage_id, StepOutcome::Completed)));

    let stored = fixture.manager.packages().get(package_id).await.unwrap();
    assert_eq!(stored.status, PackageStatus::Completed);
    let info = stored.upload_info(storage_id).unwrap();
    assert!(info.copied_installer);
    assert!(info.copied_archive);
    assert_eq!(info.progress, 100);

    let copied = tokio::fs::metadata(dest.path().join(&stored.archive_name))
        .await
        .unwrap();
    assert_eq!(copied.len(), (5 * MIB) as u64);
    assert!(dest.path().join(&stored.installer_name).exists());
}

#[tokio::test]
async fn test_run_pending_skips_finished_packages() {
    let fixture = fixture(StorageRegistry::with_defaults().unwrap(), TransferConfig::default()).await;
    let dest = tempfile::tempdir().unwrap();
    let storage_id = local_storage(&fixture.manager, dest.path()).await;
    let package_id = build_package(&fixture, MIB, &[storage_id]).await;

    let first = fixture.worker.run_pending().await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].package_id, package_id);

    let second = fixture.worker.run_pending().await.unwrap();
    assert!(second.is_empty());
}

#[tokio::test]
async fn test_cancel_flag_finishes_package_as_cancelled() {
    let transfer = TransferConfig {
        local_chunk_size_bytes: MIB as u64,
        ..TransferConfig::default()
    };
    let fixture = fixture(StorageRegistry::with_defaults().unwrap(), transfer).await;
    let dest = tempfile::tempdir().unwrap();
    let storage_id = local_storage(&fixture.manager, dest.path()).await;
    let package_id = build_package(&fixture, 4 * MIB, &[storage_id]).await;

    assert!(fixture
        .manager
        .packages()
        .set_cancel_pending(package_id, true)
        .await
        .unwrap());

    let report = fixture.worker.run_package(package_id).await.unwrap();
    assert_eq!(report.steps, vec![(storage_id, StepOutcome::Cancelled)]);
    assert_eq!(report.status, PackageStatus::Cancelled);

    let stored = fixture.manager.packages().get(package_id).await.unwrap();
    assert_eq!(stored.status, PackageStatus::Cancelled);
    assert!(stored.upload_info(storage_id).unwrap().cancelled);
    assert!(!dest.path().join(&stored.archive_name).exists());
}

#[tokio::test]
async fn test_busy_transfer_is_skipped() {
    let fixture = fixture(StorageRegistry::with_defaults().unwrap(), TransferConfig::default()).await;
    let dest = tempfile::tempdir().unwrap();
    let storage_id = local_storage(&fixture.manager, dest.path()).await;
    let package_id = build_package(&fixture, MIB, &[storage_id]).await;

    let lease = fixture
        .worker
        .locks()
        .try_acquire(package_id, storage_id)
        .await
        .unwrap()
        .unwrap();
    let report = fixture.worker.run_package(package_id).await.unwrap();
    assert!(report.steps.is_empty());
    assert_eq!(report.skipped, vec![storage_id]);
    assert_eq!(report.status, PackageStatus::StoragePending);

    lease.release().await;
    let report = fixture.worker.run_package(package_id).await.unwrap();
    assert_eq!(report.status, PackageStatus::Completed);
}

/// A remote whose chunk uploads never succeed and which never holds a byte.
#[derive(Debug)]
struct UnreachableRemote;

#[async_trait]
impl ChunkedTransferClient for UnreachableRemote {
    fn kind(&self) -> StorageKind {
        StorageKind::Sftp
    }

    async fn upload_whole(&mut self, _source: &Path, _dest: &str) -> TransferResult<()> {
        Ok(())
    }

    async fn upload_chunk(&mut self, _request: ChunkRequest<'_>) -> TransferResult<ChunkProgress> {
        Err(TransferError::recoverable("connection reset by peer"))
    }

    async fn recover_offset(
        &mut self,
        _dest: &str,
        _file_size: u64,
        token: &ResumeToken,
    ) -> TransferResult<ChunkProgress> {
        Ok(ChunkProgress::partial(0, token.clone()))
    }

    async fn abort(&mut self, _dest: &str, _token: &ResumeToken) -> TransferResult<()> {
        Ok(())
    }

    async fn delete(&mut self, _name: &str) -> TransferResult<bool> {
        Ok(false)
    }

    async fn list_objects(&mut self) -> TransferResult<Vec<RemoteObject>> {
        Ok(Vec::new())
    }
}

#[derive(Debug)]
struct UnreachableFactory;

#[async_trait]
impl ClientFactory for UnreachableFactory {
    fn kind(&self) -> StorageKind {
        StorageKind::Sftp
    }

    async fn build(
        &self,
        _storage: &StorageEntity,
        _context: &ClientContext,
    ) -> AppResult<Box<dyn ChunkedTransferClient>> {
        Ok(Box::new(UnreachableRemote))
    }
}

async fn sftp_storage(manager: &StorageManager, name: &str) -> i64 {
    manager
        .storages()
        .create(&NewStorage {
            name: name.into(),
            notes: String::new(),
            settings: StorageSettings::Sftp(SftpSettings {
                server: "backup.example.net".into(),
                port: 22,
                username: "stowage".into(),
                password: "secret".into(),
                private_key: String::new(),
                private_key_password: String::new(),
                storage_folder: "/srv/backups".into(),
                timeout_seconds: 30,
                max_packages: 10,
            }),
        })
        .await
        .unwrap()
        .id
}

#[tokio::test]
async fn test_retry_ceiling_fails_transfer() {
    let mut registry = StorageRegistry::new();
    registry.register(Arc::new(UnreachableFactory)).unwrap();
    let transfer = TransferConfig {
        max_storage_retries: 2,
        ..TransferConfig::default()
    };
    let fixture = fixture(registry, transfer).await;
    let storage_id = sftp_storage(&fixture.manager, "offsite").await;
    let package_id = build_package(&fixture, MIB, &[storage_id]).await;

    for attempt in 1..=2 {
        let report = fixture.worker.run_package(package_id).await.unwrap();
        assert_eq!(report.status, PackageStatus::StoragePending);
        assert_eq!(report.steps.last(), Some(&(storage_id, StepOutcome::RecoverableError)));
        let stored = fixture.manager.packages().get(package_id).await.unwrap();
        assert_eq!(stored.upload_info(storage_id).unwrap().failure_count, attempt);
    }

    let report = fixture.worker.run_package(package_id).await.unwrap();
    assert_eq!(report.steps, vec![(storage_id, StepOutcome::Failed)]);
    assert_eq!(report.status, PackageStatus::CompletedWithErrors);

    let stored = fixture.manager.packages().get(package_id).await.unwrap();
    let info = stored.upload_info(storage_id).unwrap();
    assert!(info.failed);
    assert!(info.status_message.contains("connection reset by peer"), "{}", info.status_message);
}

/// Upload counters shared by every client a [`GatedFactory`] builds.
#[derive(Debug, Default)]
struct UploadCounts {
    installers: AtomicUsize,
    archives: AtomicUsize,
}

/// A remote whose very first installer upload waits until the test opens
/// the gate. Everything else succeeds at once.
#[derive(Debug, Clone)]
struct GatedRemote {
    counts: Arc<UploadCounts>,
    entered: Arc<Notify>,
    gate: Arc<Semaphore>,
}

#[async_trait]
impl ChunkedTransferClient for GatedRemote {
    fn kind(&self) -> StorageKind {
        StorageKind::Sftp
    }

    async fn upload_whole(&mut self, _source: &Path, _dest: &str) -> TransferResult<()> {
        if self.counts.installers.fetch_add(1, Ordering::SeqCst) == 0 {
            self.entered.notify_one();
            let _permit = self.gate.acquire().await.unwrap();
        }
        Ok(())
    }

    async fn upload_chunk(&mut self, request: ChunkRequest<'_>) -> TransferResult<ChunkProgress> {
        self.counts.archives.fetch_add(1, Ordering::SeqCst);
        Ok(ChunkProgress::finished(request.file_size))
    }

    async fn recover_offset(
        &mut self,
        _dest: &str,
        _file_size: u64,
        token: &ResumeToken,
    ) -> TransferResult<ChunkProgress> {
        Ok(ChunkProgress::partial(0, token.clone()))
    }

    async fn abort(&mut self, _dest: &str, _token: &ResumeToken) -> TransferResult<()> {
        Ok(())
    }

    async fn delete(&mut self, _name: &str) -> TransferResult<bool> {
        Ok(false)
    }

    async fn list_objects(&mut self) -> TransferResult<Vec<RemoteObject>> {
        Ok(Vec::new())
    }
}

#[derive(Debug)]
struct GatedFactory(GatedRemote);

#[async_trait]
impl ClientFactory for GatedFactory {
    fn kind(&self) -> StorageKind {
        StorageKind::Sftp
    }

    async fn build(
        &self,
        _storage: &StorageEntity,
        _context: &ClientContext,
    ) -> AppResult<Box<dyn ChunkedTransferClient>> {
        Ok(Box::new(self.0.clone()))
    }
}

#[tokio::test]
async fn test_second_worker_never_drives_a_leased_transfer() {
    let remote = GatedRemote {
        counts: Arc::new(UploadCounts::default()),
        entered: Arc::new(Notify::new()),
        gate: Arc::new(Semaphore::new(0)),
    };
    let mut registry = StorageRegistry::new();
    registry.register(Arc::new(GatedFactory(remote.clone()))).unwrap();
    let fixture = fixture(registry, TransferConfig::default()).await;
    let first = sftp_storage(&fixture.manager, "offsite-a").await;
    let second = sftp_storage(&fixture.manager, "offsite-b").await;
    let package_id = build_package(&fixture, MIB, &[first, second]).await;

    let daemon = fixture.worker.clone();
    let daemon_run = tokio::spawn(async move { daemon.run_package(package_id).await });
    remote.entered.notified().await;

    // An operator's manual step from another process while the daemon is
    // inside the first storage's installer upload.
    let cli = TransferWorker::new(fixture.manager.clone(), "cli", TransferConfig::default());
    let report = cli.run_package(package_id).await.unwrap();
    assert_eq!(report.skipped, vec![first]);
    assert!(report.steps.iter().all(|(storage, _)| *storage == second));
    assert_eq!(report.steps.last(), Some(&(second, StepOutcome::Completed)));
    assert_eq!(report.status, PackageStatus::StoragePending);

    remote.gate.add_permits(1);
    let report = daemon_run.await.unwrap().unwrap();
    assert!(report.steps.iter().all(|(storage, _)| *storage == first));
    assert_eq!(report.steps.last(), Some(&(first, StepOutcome::Completed)));
    assert_eq!(report.status, PackageStatus::Completed);

    assert_eq!(remote.counts.installers.load(Ordering::SeqCst), 2);
    assert_eq!(remote.counts.archives.load(Ordering::SeqCst), 2);
    let stored = fixture.manager.packages().get(package_id).await.unwrap();
    assert_eq!(stored.status, PackageStatus::Completed);
    assert!(stored.upload_info(first).unwrap().copied_archive);
    assert!(stored.upload_info(second).unwrap().copied_archive);
    assert!(fixture.manager.leases().holder(package_id, first).await.unwrap().is_none());
}
