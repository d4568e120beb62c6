//! Transfer lease repository implementation.
//!
//! A lease is the database-wide claim one worker holds on a single
//! (package, storage) transfer. Every process that advances transfers goes
//! through this table, so a daemon and an operator's manual step never
//! drive the same transfer at once.

use std::time::Duration;

use chrono::Utc;
use sqlx::SqlitePool;

use stowage_core::error::{AppError, ErrorKind};
use stowage_core::result::AppResult;

/// Repository for transfer leases.
#[derive(Debug, Clone)]
pub struct LeaseRepository {
    pool: SqlitePool,
}

impl LeaseRepository {
    /// Create a new lease repository.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Claim a transfer for `holder` until `ttl` from now.
    ///
    /// Succeeds when no lease exists or the existing one has expired.
    /// A live lease is never taken over, not even by the same holder.
    pub async fn try_acquire(
        &self,
        package_id: i64,
        storage_id: i64,
        holder: &str,
        ttl: Duration,
    ) -> AppResult<bool> {
        let now = Utc::now().timestamp_millis();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let expires_at = now.saturating_add(ttl_ms);

        let result = sqlx::query(
            "INSERT INTO transfer_leases (package_id, storage_id, holder, expires_at) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT (package_id, storage_id) DO UPDATE \
             SET holder = excluded.holder, expires_at = excluded.expires_at \
             WHERE transfer_leases.expires_at <= ?",
        )
        .bind(package_id)
        .bind(storage_id)
        .bind(holder)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to take transfer lease", e))?;

        Ok(result.rows_affected() > 0)
    }

    /// Give a lease back. Only the holder can release it.
    pub async fn release(&self, package_id: i64, storage_id: i64, holder: &str) -> AppResult<bool> {
        let result = sqlx::query(
            "DELETE FROM transfer_leases WHERE package_id = ? AND storage_id = ? AND holder = ?",
        )
        .bind(package_id)
        .bind(storage_id)
        .bind(holder)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to release transfer lease", e)
        })?;
        Ok(result.rows_affected() > 0)
    }

    /// Current holder of a live lease.
    pub async fn holder(&self, package_id: i64, storage_id: i64) -> AppResult<Option<String>> {
        sqlx::query_scalar(
            "SELECT holder FROM transfer_leases \
             WHERE package_id = ? AND storage_id = ? AND expires_at > ?",
        )
        .bind(package_id)
        .bind(storage_id)
        .bind(Utc::now().timestamp_millis())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to read transfer lease", e))
    }
}
