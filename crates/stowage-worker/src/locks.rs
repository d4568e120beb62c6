//! Per-(package, storage) transfer locks.
//!
//! Locks are leases in the database, so they hold across every process
//! sharing it: the daemon, a manual `transfer step`, a requeue.

use std::time::Duration;

use stowage_core::result::AppResult;
use stowage_database::repositories::LeaseRepository;

/// Hands out transfer leases on behalf of one worker.
#[derive(Debug, Clone)]
pub struct TransferLocks {
    leases: LeaseRepository,
    holder: String,
    ttl: Duration,
}

impl TransferLocks {
    /// Create a lock table for `holder`. A lease this worker never gives
    /// back lapses after `ttl`.
    pub fn new(leases: LeaseRepository, holder: impl Into<String>, ttl: Duration) -> Self {
        Self {
            leases,
            holder: holder.into(),
            ttl,
        }
    }

    /// The name leases are taken under.
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Take the lock for a transfer without waiting. `None` if any worker,
    /// this one included, holds it.
    pub async fn try_acquire(
        &self,
        package_id: i64,
        storage_id: i64,
    ) -> AppResult<Option<TransferLease>> {
        let taken = self
            .leases
            .try_acquire(package_id, storage_id, &self.holder, self.ttl)
            .await?;
        Ok(taken.then(|| TransferLease {
            leases: self.leases.clone(),
            holder: self.holder.clone(),
            package_id,
            storage_id,
        }))
    }
}

/// A held transfer lease. Give it back with [`TransferLease::release`];
/// one that is dropped instead lapses when its time runs out.
#[derive(Debug)]
#[must_use = "a lease that is not released blocks the transfer until it expires"]
pub struct TransferLease {
    leases: LeaseRepository,
    holder: String,
    package_id: i64,
    storage_id: i64,
}

impl TransferLease {
    /// Give the lease back.
    pub async fn release(self) {
        match self
            .leases
            .release(self.package_id, self.storage_id, &self.holder)
            .await
        {
            Ok(true) => {}
            Ok(false) => tracing::warn!(
                package_id = self.package_id,
                storage_id = self.storage_id,
                holder = %self.holder,
                "Transfer lease had already lapsed"
            ),
            Err(e) => tracing::warn!(
                package_id = self.package_id,
                storage_id = self.storage_id,
                error = %e,
                "Transfer lease not released"
            ),
        }
    }
}
