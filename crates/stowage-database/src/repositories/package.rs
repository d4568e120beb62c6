//! Package repository implementation.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};

use stowage_core::error::{AppError, ErrorKind};
use stowage_core::result::AppResult;
use stowage_entity::package::{NewPackage, Package, PackageStatus, UploadInfo};

/// Raw `packages` row.
#[derive(Debug, FromRow)]
struct PackageRow {
    id: i64,
    name: String,
    hash: String,
    local_dir: String,
    archive_name: String,
    installer_name: String,
    status: String,
    cancel_pending: bool,
    upload_infos: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PackageRow> for Package {
    type Error = AppError;

    fn try_from(row: PackageRow) -> Result<Self, Self::Error> {
        let upload_infos: Vec<UploadInfo> =
            serde_json::from_str(&row.upload_infos).map_err(|e| {
                AppError::with_source(
                    ErrorKind::Serialization,
                    format!("Corrupt upload info list on package {}", row.id),
                    e,
                )
            })?;
        Ok(Package {
            id: row.id,
            name: row.name,
            hash: row.hash,
            local_dir: PathBuf::from(row.local_dir),
            archive_name: row.archive_name,
            installer_name: row.installer_name,
            status: row.status.parse()?,
            cancel_pending: row.cancel_pending,
            upload_infos,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Repository for packages and their embedded transfer state.
#[derive(Debug, Clone)]
pub struct PackageRepository {
    pool: SqlitePool,
}

impl PackageRepository {
    /// Create a new package repository.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Register a built package, queued for its storages.
    pub async fn create(&self, data: &NewPackage) -> AppResult<Package> {
        let (archive_name, installer_name) = Package::default_file_names(&data.name, &data.hash);
        let infos = serde_json::to_string(&data.upload_infos())?;
        let local_dir = data.local_dir.to_string_lossy().into_owned();
        let now = Utc::now();

        let row = sqlx::query_as::<_, PackageRow>(
            "INSERT INTO packages (name, hash, local_dir, archive_name, installer_name, status, \
             cancel_pending, upload_infos, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?, ?) RETURNING *",
        )
        .bind(&data.name)
        .bind(&data.hash)
        .bind(&local_dir)
        .bind(&archive_name)
        .bind(&installer_name)
        .bind(PackageStatus::StoragePending.as_str())
        .bind(&infos)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to create package", e))?;

        row.try_into()
    }

    /// Find a package by ID.
    pub async fn find_by_id(&self, id: i64) -> AppResult<Option<Package>> {
        sqlx::query_as::<_, PackageRow>("SELECT * FROM packages WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to find package", e))?
            .map(Package::try_from)
            .transpose()
    }

    /// Find a package by ID or fail with not-found.
    pub async fn get(&self, id: i64) -> AppResult<Package> {
        self.find_by_id(id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("Package {id} not found")))
    }

    /// List packages in a given status, oldest first.
    pub async fn find_by_status(&self, status: PackageStatus) -> AppResult<Vec<Package>> {
        let rows = sqlx::query_as::<_, PackageRow>(
            "SELECT * FROM packages WHERE status = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to list packages", e))?;

        rows.into_iter().map(Package::try_from).collect()
    }

    /// List every package, newest first.
    pub async fn find_all(&self) -> AppResult<Vec<Package>> {
        let rows = sqlx::query_as::<_, PackageRow>(
            "SELECT * FROM packages ORDER BY created_at DESC, id DESC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to list packages", e))?;

        rows.into_iter().map(Package::try_from).collect()
    }

    /// Persist status and transfer state. Called after every transfer step.
    ///
    /// `cancel_pending` is deliberately not written: it belongs to the
    /// operator and a worker must never clear it by saving a stale copy.
    pub async fn update(&self, package: &Package) -> AppResult<()> {
        let infos = serde_json::to_string(&package.upload_infos)?;
        let result = sqlx::query(
            "UPDATE packages SET status = ?, upload_infos = ?, updated_at = ? WHERE id = ?",
        )
        .bind(package.status.as_str())
        .bind(&infos)
        .bind(Utc::now())
        .bind(package.id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to update package", e))?;

        if result.rows_affected() == 0 {
            return Err(AppError::not_found(format!(
                "Package {} not found",
                package.id
            )));
        }
        Ok(())
    }

    /// Persist the transfer state towards one storage, leaving every other
    /// entry of the list as it is in the database.
    ///
    /// Returns `false` when the package no longer carries a transfer to
    /// that storage, for instance because the storage was deleted.
    pub async fn update_upload_info(&self, package_id: i64, info: &UploadInfo) -> AppResult<bool> {
        let json = serde_json::to_string(info)?;
        let result = sqlx::query(
            "UPDATE packages SET upload_infos = ( \
                 SELECT json_group_array( \
                     CASE WHEN json_extract(e.value, '$.storage_id') = ?1 \
                          THEN json(?2) ELSE json(e.value) END) \
                 FROM json_each(packages.upload_infos) AS e \
             ), updated_at = ?3 \
             WHERE id = ?4 AND EXISTS ( \
                 SELECT 1 FROM json_each(packages.upload_infos) \
                 WHERE json_extract(value, '$.storage_id') = ?1)",
        )
        .bind(info.storage_id)
        .bind(&json)
        .bind(Utc::now())
        .bind(package_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to update transfer state", e)
        })?;
        Ok(result.rows_affected() > 0)
    }

    /// Move a package that is still awaiting storage to `status`.
    ///
    /// Returns `false` if another worker already moved it.
    pub async fn finish(&self, id: i64, status: PackageStatus) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE packages SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
        )
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(id)
        .bind(PackageStatus::StoragePending.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to update package status", e)
        })?;
        Ok(result.rows_affected() > 0)
    }

    /// Set a package's status unconditionally.
    pub async fn set_status(&self, id: i64, status: PackageStatus) -> AppResult<bool> {
        let result = sqlx::query("UPDATE packages SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                AppError::with_source(ErrorKind::Database, "Failed to update package status", e)
            })?;
        Ok(result.rows_affected() > 0)
    }

    /// Flag a package for cancellation.
    pub async fn set_cancel_pending(&self, id: i64, cancel: bool) -> AppResult<bool> {
        let result =
            sqlx::query("UPDATE packages SET cancel_pending = ?, updated_at = ? WHERE id = ?")
                .bind(cancel)
                .bind(Utc::now())
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    AppError::with_source(ErrorKind::Database, "Failed to flag package", e)
                })?;
        Ok(result.rows_affected() > 0)
    }

    /// Re-read the cancellation flag.
    pub async fn is_cancel_pending(&self, id: i64) -> AppResult<bool> {
        let flag: Option<bool> =
            sqlx::query_scalar("SELECT cancel_pending FROM packages WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| {
                    AppError::with_source(ErrorKind::Database, "Failed to read cancel flag", e)
                })?;
        Ok(flag.unwrap_or(false))
    }

    /// Delete a package and, with it, its transfer state.
    pub async fn delete(&self, id: i64) -> AppResult<bool> {
        let result = sqlx::query("DELETE FROM packages WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                AppError::with_source(ErrorKind::Database, "Failed to delete package", e)
            })?;
        Ok(result.rows_affected() > 0)
    }
}
