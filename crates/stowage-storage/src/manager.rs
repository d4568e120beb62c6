//! Storage manager: resolves storages and advances package transfers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use stowage_core::config::{AppConfig, StorageConfig};
use stowage_core::crypt::ConfigCipher;
use stowage_core::error::AppError;
use stowage_core::result::AppResult;
use stowage_database::DatabasePool;
use stowage_database::repositories::{LeaseRepository, PackageRepository, StorageRepository};
use stowage_entity::package::Package;
use stowage_entity::storage::{OAuthToken, StorageEntity};

use crate::engine::{StepContext, StepOutcome};
use crate::handle::{StorageHandle, TestLog};
use crate::registry::{ApiEndpoints, ClientContext, StorageRegistry};

/// Central entry point for transfers and storage maintenance.
#[derive(Debug, Clone)]
pub struct StorageManager {
    storages: StorageRepository,
    packages: PackageRepository,
    leases: LeaseRepository,
    registry: Arc<StorageRegistry>,
    context: ClientContext,
    storage_config: StorageConfig,
}

impl StorageManager {
    /// Create a new storage manager.
    pub fn new(
        storages: StorageRepository,
        packages: PackageRepository,
        leases: LeaseRepository,
        registry: Arc<StorageRegistry>,
        context: ClientContext,
        storage_config: StorageConfig,
    ) -> Self {
        Self {
            storages,
            packages,
            leases,
            registry,
            context,
            storage_config,
        }
    }

    /// Wire a manager with every compiled-in provider over an open database.
    pub fn from_config(db: &DatabasePool, config: &AppConfig) -> AppResult<Self> {
        let cipher = ConfigCipher::from_config(&config.security)?;
        let registry = StorageRegistry::with_defaults()?;
        let context = ClientContext {
            transfer: config.transfer.clone(),
            backup_dir: PathBuf::from(&config.storage.backup_dir),
            endpoints: ApiEndpoints::default(),
        };
        Ok(Self::new(
            StorageRepository::new(db.pool().clone(), cipher),
            PackageRepository::new(db.pool().clone()),
            LeaseRepository::new(db.pool().clone()),
            Arc::new(registry),
            context,
            config.storage.clone(),
        ))
    }

    /// The storage repository.
    pub fn storages(&self) -> &StorageRepository {
        &self.storages
    }

    /// The package repository.
    pub fn packages(&self) -> &PackageRepository {
        &self.packages
    }

    /// The transfer lease repository.
    pub fn leases(&self) -> &LeaseRepository {
        &self.leases
    }

    /// The type registry.
    pub fn registry(&self) -> &StorageRegistry {
        &self.registry
    }

    /// Context handed to client factories.
    pub fn context(&self) -> &ClientContext {
        &self.context
    }

    /// Return the default-local storage, creating it if absent.
    pub async fn ensure_default(&self) -> AppResult<StorageEntity> {
        self.storages
            .ensure_default_local(&self.storage_config)
            .await
    }

    /// Build a handle for a storage.
    pub async fn open(&self, storage_id: i64) -> AppResult<StorageHandle> {
        let entity = self.storages.get(storage_id).await?;
        StorageHandle::open(&self.registry, entity, &self.context).await
    }

    /// Advance the transfer of `package` to `storage_id` by one step.
    ///
    /// Never fails: every problem is recorded on the package's upload info,
    /// which the caller persists.
    pub async fn process_package(
        &self,
        package: &mut Package,
        storage_id: i64,
        step: &StepContext,
    ) -> StepOutcome {
        let Some(mut info) = package.upload_info(storage_id).cloned() else {
            tracing::warn!(package_id = package.id, storage_id, "Package is not queued for storage");
            return StepOutcome::NoOp;
        };
        if info.is_finished() {
            return StepOutcome::NoOp;
        }

        let outcome = self.step(package, &mut info, step).await;
        if let Some(slot) = package.upload_info_mut(storage_id) {
            *slot = info;
        }
        outcome
    }

    async fn step(
        &self,
        package: &Package,
        info: &mut stowage_entity::package::UploadInfo,
        step: &StepContext,
    ) -> StepOutcome {
        let storage_id = info.storage_id;
        let entity = match self.storages.find_by_id(storage_id).await {
            Ok(Some(entity)) => entity,
            Ok(None) => {
                info.mark_failed(format!("Storage {storage_id} no longer exists"));
                return StepOutcome::Failed;
            }
            Err(e) => {
                tracing::warn!(package_id = package.id, storage_id, error = %e, "Storage lookup failed");
                info.record_failure(format!("Storage lookup failed: {e}"));
                return StepOutcome::RecoverableError;
            }
        };

        if let Err(problems) = entity.settings.validate() {
            let message = format!("Storage settings are invalid: {}", problems.join(", "));
            tracing::error!(package_id = package.id, storage_id, error = %message, "Transfer not attempted");
            info.mark_failed(message);
            return StepOutcome::Failed;
        }

        let mut handle = match StorageHandle::open(&self.registry, entity, &self.context).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(package_id = package.id, storage_id, error = %e, "Storage client unavailable");
                info.record_failure(format!("Storage client unavailable: {e}"));
                return StepOutcome::RecoverableError;
            }
        };

        let outcome = handle.copy_from_default(package, info, step).await;
        self.persist_refreshed_token(handle.entity().clone(), handle.refreshed_token())
            .await;
        handle.close().await;
        outcome
    }

    /// Persist a token the client refreshed during this invocation.
    async fn persist_refreshed_token(&self, mut entity: StorageEntity, token: Option<OAuthToken>) {
        let Some(token) = token else {
            return;
        };
        if !entity.settings.set_oauth_token(token) {
            return;
        }
        match self.storages.update(&entity).await {
            Ok(()) => tracing::info!(storage_id = entity.id, "Persisted refreshed access token"),
            Err(e) => tracing::warn!(storage_id = entity.id, error = %e, "Refreshed access token not saved"),
        }
    }

    /// Restart a transfer from zero, removing the remote partial first.
    ///
    /// Refused while a worker holds the transfer's lease.
    pub async fn requeue(&self, package_id: i64, storage_id: i64) -> AppResult<Package> {
        let holder = format!("requeue-{}", std::process::id());
        let ttl = self.context.transfer.lease_ttl();
        if !self
            .leases
            .try_acquire(package_id, storage_id, &holder, ttl)
            .await?
        {
            return Err(AppError::conflict(format!(
                "Transfer of package {package_id} to storage {storage_id} is running, try again later"
            )));
        }
        let result = self.reset_transfer(package_id, storage_id).await;
        if let Err(e) = self.leases.release(package_id, storage_id, &holder).await {
            tracing::warn!(package_id, storage_id, error = %e, "Transfer lease not released");
        }
        result
    }

    async fn reset_transfer(&self, package_id: i64, storage_id: i64) -> AppResult<Package> {
        let mut package = self.packages.get(package_id).await?;
        let info = package.upload_info(storage_id).cloned().ok_or_else(|| {
            AppError::not_found(format!(
                "Package {package_id} is not queued for storage {storage_id}"
            ))
        })?;

        match self.open(storage_id).await {
            Ok(mut handle) => {
                if let Err(e) = handle.remove_package_files(&package, &info).await {
                    tracing::warn!(package_id, storage_id, error = %e, "Remote partial not removed");
                }
                handle.close().await;
            }
            Err(e) => tracing::warn!(package_id, storage_id, error = %e, "Storage unavailable for cleanup"),
        }

        if let Some(info) = package.upload_info_mut(storage_id) {
            info.reset();
            self.packages.update_upload_info(package_id, info).await?;
        }
        tracing::info!(package_id, storage_id, "Transfer requeued");
        Ok(package)
    }

    /// Run retention on a storage now.
    pub async fn purge(&self, storage_id: i64) -> AppResult<Vec<String>> {
        let mut handle = self.open(storage_id).await?;
        let result = handle.purge_old_packages().await;
        self.persist_refreshed_token(handle.entity().clone(), handle.refreshed_token())
            .await;
        handle.close().await;
        Ok(result?)
    }

    /// Run the operator round-trip test on a storage.
    pub async fn test(&self, storage_id: i64) -> AppResult<TestLog> {
        let mut handle = self.open(storage_id).await?;
        let log = handle.test().await;
        self.persist_refreshed_token(handle.entity().clone(), handle.refreshed_token())
            .await;
        Ok(log)
    }

    /// Abort stale multipart uploads on every S3-family storage.
    pub async fn sweep_stale_multipart(&self) -> AppResult<usize> {
        let max_age = Duration::from_secs(self.context.transfer.stale_multipart_hours * 3600);
        let mut aborted = 0;
        for entity in self.storages.find_all().await? {
            if !entity.kind().is_s3_family() {
                continue;
            }
            let storage_id = entity.id;
            let mut handle = match StorageHandle::open(&self.registry, entity, &self.context).await {
                Ok(handle) => handle,
                Err(e) => {
                    tracing::warn!(storage_id, error = %e, "Skipping storage in multipart sweep");
                    continue;
                }
            };
            match handle.sweep_stale_uploads(max_age).await {
                Ok(count) => aborted += count,
                Err(e) => tracing::warn!(storage_id, error = %e, "Multipart sweep failed"),
            }
            handle.close().await;
        }
        if aborted > 0 {
            tracing::info!(aborted, "Stale multipart uploads aborted");
        }
        Ok(aborted)
    }
}
