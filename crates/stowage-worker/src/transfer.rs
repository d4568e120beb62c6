//! One bounded worker invocation.
//!
//! An invocation advances the pending transfers of one package until the
//! time slice is spent. Every step's result is persisted before the next
//! step starts, so a killed process loses at most the step in flight.

use std::sync::Arc;

use tokio::time::Instant;

use stowage_core::config::TransferConfig;
use stowage_core::result::AppResult;
use stowage_entity::package::{Package, PackageStatus};
use stowage_storage::engine::{StepContext, StepOutcome};
use stowage_storage::manager::StorageManager;

use crate::locks::TransferLocks;

/// What one invocation did to a package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationReport {
    /// The package advanced.
    pub package_id: i64,
    /// Outcome of every step, with the storage it ran against.
    pub steps: Vec<(i64, StepOutcome)>,
    /// Storages skipped because another step held their lock.
    pub skipped: Vec<i64>,
    /// Package status after the invocation.
    pub status: PackageStatus,
}

impl InvocationReport {
    fn new(package: &Package) -> Self {
        Self {
            package_id: package.id,
            steps: Vec::new(),
            skipped: Vec::new(),
            status: package.status,
        }
    }
}

/// Drives package transfers one time slice at a time.
#[derive(Debug, Clone)]
pub struct TransferWorker {
    manager: Arc<StorageManager>,
    locks: TransferLocks,
    transfer: TransferConfig,
}

impl TransferWorker {
    /// Create a new transfer worker taking leases under `holder`.
    ///
    /// `holder` must be unique among the processes sharing the database.
    pub fn new(
        manager: Arc<StorageManager>,
        holder: impl Into<String>,
        transfer: TransferConfig,
    ) -> Self {
        let locks = TransferLocks::new(manager.leases().clone(), holder, transfer.lease_ttl());
        Self {
            manager,
            locks,
            transfer,
        }
    }

    /// The leases this worker takes.
    pub fn locks(&self) -> &TransferLocks {
        &self.locks
    }

    /// Run one invocation over every package awaiting storage.
    ///
    /// All packages share a single time slice, oldest first.
    pub async fn run_pending(&self) -> AppResult<Vec<InvocationReport>> {
        let deadline = Instant::now() + self.transfer.worker_time();
        let packages = self
            .manager
            .packages()
            .find_by_status(PackageStatus::StoragePending)
            .await?;

        let mut reports = Vec::with_capacity(packages.len());
        for package in packages {
            if Instant::now() >= deadline {
                break;
            }
            reports.push(self.advance(package, deadline).await?);
        }
        Ok(reports)
    }

    /// Run one invocation over a single package.
    pub async fn run_package(&self, package_id: i64) -> AppResult<InvocationReport> {
        let deadline = Instant::now() + self.transfer.worker_time();
        let package = self.manager.packages().get(package_id).await?;
        self.advance(package, deadline).await
    }

    async fn advance(&self, package: Package, deadline: Instant) -> AppResult<InvocationReport> {
        let mut report = InvocationReport::new(&package);
        let package_id = package.id;
        if !package.status.is_transferring() {
            tracing::debug!(package_id, status = %package.status, "Package is not awaiting storage");
            return Ok(report);
        }

        for storage_id in package.pending_storage_ids() {
            if Instant::now() >= deadline {
                break;
            }
            let Some(lease) = self.locks.try_acquire(package_id, storage_id).await? else {
                tracing::debug!(package_id, storage_id, "Transfer busy, skipping");
                report.skipped.push(storage_id);
                continue;
            };
            let driven = self.drive(package_id, storage_id, deadline, &mut report).await;
            lease.release().await;
            driven?;
        }

        let package = self.manager.packages().get(package_id).await?;
        report.status = package.status;
        if package.status.is_transferring()
            && let Some(status) = package.completion_status()
            && self.manager.packages().finish(package_id, status).await?
        {
            report.status = status;
            tracing::info!(package_id, status = %status, "Package transfers finished");
        }
        Ok(report)
    }

    /// Step one transfer until it stops making progress or the slice ends.
    async fn drive(
        &self,
        package_id: i64,
        storage_id: i64,
        deadline: Instant,
        report: &mut InvocationReport,
    ) -> AppResult<()> {
        // Re-read under the lease: another worker may have moved this
        // transfer on, or the storage may be gone, since the list was read.
        let mut package = self.manager.packages().get(package_id).await?;
        let pending = package
            .upload_info(storage_id)
            .is_some_and(|info| !info.is_finished());
        if !package.status.is_transferring() || !pending {
            tracing::debug!(package_id, storage_id, "Transfer finished elsewhere");
            return Ok(());
        }

        while Instant::now() < deadline {
            let outcome = self.step(&mut package, storage_id, deadline).await?;
            report.steps.push((storage_id, outcome));
            if !outcome.should_continue() {
                break;
            }
        }
        Ok(())
    }

    /// One step against one storage, persisted before returning.
    async fn step(
        &self,
        package: &mut Package,
        storage_id: i64,
        deadline: Instant,
    ) -> AppResult<StepOutcome> {
        let package_id = package.id;
        // Cancellation is observed at chunk boundaries only.
        package.cancel_pending = self.manager.packages().is_cancel_pending(package_id).await?;
        let step = StepContext {
            deadline,
            throttle: self.transfer.throttle(),
            cancel_requested: package.cancel_pending,
        };

        let mut outcome = self.manager.process_package(package, storage_id, &step).await;

        let Some(info) = package.upload_info_mut(storage_id) else {
            return Ok(StepOutcome::NoOp);
        };
        if outcome == StepOutcome::RecoverableError {
            let ceiling = self.transfer.max_storage_retries;
            if info.failure_count > ceiling {
                tracing::error!(
                    package_id,
                    storage_id,
                    failure_count = info.failure_count,
                    "Retry ceiling reached, giving up"
                );
                let count = info.failure_count;
                let last = std::mem::take(&mut info.status_message);
                info.mark_failed(format!("Gave up after {count} failures: {last}"));
                outcome = StepOutcome::Failed;
            }
        }

        if !self.manager.packages().update_upload_info(package_id, info).await? {
            tracing::warn!(package_id, storage_id, "Transfer removed while it ran, result dropped");
            return Ok(StepOutcome::NoOp);
        }
        Ok(outcome)
    }
}
