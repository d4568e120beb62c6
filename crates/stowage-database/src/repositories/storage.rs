//! Storage repository implementation.
//!
//! The `config` column is the only place storage settings are persisted.
//! When a [`ConfigCipher`] is configured it is sealed on every save and
//! opened on every load. Legacy flat records are migrated on load and
//! immediately written back in the tagged layout.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use tracing::{info, warn};

use stowage_core::config::StorageConfig;
use stowage_core::crypt::ConfigCipher;
use stowage_core::error::{AppError, ErrorKind};
use stowage_core::result::AppResult;
use stowage_entity::package::UploadInfo;
use stowage_entity::schedule::Schedule;
use stowage_entity::storage::{
    DefaultLocalSettings, NewStorage, StorageEntity, StorageKind, StorageSettings, legacy,
};

use super::schedule::ScheduleRow;

/// Raw `storages` row.
#[derive(Debug, FromRow)]
struct StorageRow {
    id: i64,
    name: String,
    notes: String,
    storage_type: i64,
    config: String,
    encrypted: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// Repository for configured storages.
#[derive(Debug, Clone)]
pub struct StorageRepository {
    pool: SqlitePool,
    cipher: Option<ConfigCipher>,
}

impl StorageRepository {
    /// Create a new storage repository. With a cipher, configs are sealed at rest.
    pub fn new(pool: SqlitePool, cipher: Option<ConfigCipher>) -> Self {
        Self { pool, cipher }
    }

    /// Find a storage by ID.
    pub async fn find_by_id(&self, id: i64) -> AppResult<Option<StorageEntity>> {
        let row = sqlx::query_as::<_, StorageRow>("SELECT * FROM storages WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to find storage", e))?;

        match row {
            Some(row) => self.load(row).await.map(Some),
            None => Ok(None),
        }
    }

    /// Find a storage by ID or fail with not-found.
    pub async fn get(&self, id: i64) -> AppResult<StorageEntity> {
        self.find_by_id(id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("Storage {id} not found")))
    }

    /// Find the default-local storage.
    pub async fn find_default(&self) -> AppResult<Option<StorageEntity>> {
        let row = sqlx::query_as::<_, StorageRow>(
            "SELECT * FROM storages WHERE storage_type = ? LIMIT 1",
        )
        .bind(StorageKind::DefaultLocal.code())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to find default storage", e)
        })?;

        match row {
            Some(row) => self.load(row).await.map(Some),
            None => Ok(None),
        }
    }

    /// List all storages, default first.
    pub async fn find_all(&self) -> AppResult<Vec<StorageEntity>> {
        let rows = sqlx::query_as::<_, StorageRow>(
            "SELECT * FROM storages ORDER BY (storage_type = -2) DESC, name ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to list storages", e))?;

        let mut storages = Vec::with_capacity(rows.len());
        for row in rows {
            storages.push(self.load(row).await?);
        }
        Ok(storages)
    }

    /// Return the default-local storage, creating it when absent.
    pub async fn ensure_default_local(&self, config: &StorageConfig) -> AppResult<StorageEntity> {
        if let Some(existing) = self.find_default().await? {
            return Ok(existing);
        }

        let settings = StorageSettings::DefaultLocal(DefaultLocalSettings {
            max_packages: config.default_max_packages,
        });
        let (encoded, encrypted) = self.encode(&settings)?;
        let now = Utc::now();

        // The partial unique index turns a concurrent creation into a no-op.
        sqlx::query(
            "INSERT OR IGNORE INTO storages (name, notes, storage_type, config, encrypted, created_at, updated_at) \
             VALUES (?, '', ?, ?, ?, ?, ?)",
        )
        .bind(&config.default_storage_name)
        .bind(StorageKind::DefaultLocal.code())
        .bind(&encoded)
        .bind(encrypted)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to create default storage", e)
        })?;

        info!(name = %config.default_storage_name, "Created default local storage");

        self.find_default()
            .await?
            .ok_or_else(|| AppError::internal("Default storage missing right after creation"))
    }

    /// Create a new storage. The default-local storage is never created here.
    pub async fn create(&self, data: &NewStorage) -> AppResult<StorageEntity> {
        if data.settings.kind() == StorageKind::DefaultLocal {
            return Err(AppError::conflict(
                "The default storage is created automatically",
            ));
        }

        let (encoded, encrypted) = self.encode(&data.settings)?;
        let now = Utc::now();

        let row = sqlx::query_as::<_, StorageRow>(
            "INSERT INTO storages (name, notes, storage_type, config, encrypted, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING *",
        )
        .bind(&data.name)
        .bind(&data.notes)
        .bind(data.settings.kind().code())
        .bind(&encoded)
        .bind(encrypted)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to create storage", e))?;

        self.load(row).await
    }

    /// Persist name, notes and settings.
    ///
    /// A storage never changes between default and non-default.
    pub async fn update(&self, storage: &StorageEntity) -> AppResult<()> {
        let current: Option<i64> =
            sqlx::query_scalar("SELECT storage_type FROM storages WHERE id = ?")
                .bind(storage.id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| {
                    AppError::with_source(ErrorKind::Database, "Failed to read storage type", e)
                })?;

        let current =
            current.ok_or_else(|| AppError::not_found(format!("Storage {} not found", storage.id)))?;
        let was_default = current == i64::from(StorageKind::DefaultLocal.code());
        if was_default != storage.is_default() {
            return Err(AppError::conflict(
                "A storage cannot be converted to or from the default storage",
            ));
        }

        self.write(storage).await
    }

    /// Deep-copy a storage's configuration.
    ///
    /// With no target a new storage named `"<source> - Copy"` is created.
    /// With a target, its notes and settings are overwritten; the target
    /// keeps its id and name and must be of the same kind.
    pub async fn copy(&self, source_id: i64, target_id: Option<i64>) -> AppResult<StorageEntity> {
        let source = self.get(source_id).await?;
        if source.is_default() {
            return Err(AppError::conflict("The default storage cannot be copied"));
        }

        match target_id {
            None => {
                self.create(&NewStorage {
                    name: format!("{} - Copy", source.name),
                    notes: source.notes,
                    settings: source.settings,
                })
                .await
            }
            Some(target_id) => {
                let mut target = self.get(target_id).await?;
                if target.kind() != source.kind() {
                    return Err(AppError::conflict(format!(
                        "Cannot copy a {} storage onto a {} storage",
                        source.kind(),
                        target.kind()
                    )));
                }
                target.notes = source.notes;
                target.settings = source.settings;
                self.write(&target).await?;
                self.get(target_id).await
            }
        }
    }

    /// Delete a storage and detach it from every package and schedule.
    ///
    /// Schedules left without any storage are deactivated. The default
    /// storage cannot be deleted.
    pub async fn delete(&self, id: i64) -> AppResult<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to begin delete", e))?;

        let storage_type: Option<i64> =
            sqlx::query_scalar("SELECT storage_type FROM storages WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| {
                    AppError::with_source(ErrorKind::Database, "Failed to find storage", e)
                })?;

        match storage_type {
            None => return Ok(false),
            Some(t) if t == i64::from(StorageKind::DefaultLocal.code()) => {
                return Err(AppError::conflict("The default storage cannot be deleted"));
            }
            Some(_) => {}
        }

        let packages: Vec<(i64, String)> =
            sqlx::query_as("SELECT id, upload_infos FROM packages")
                .fetch_all(&mut *tx)
                .await
                .map_err(|e| {
                    AppError::with_source(ErrorKind::Database, "Failed to list packages", e)
                })?;

        let mut detached_packages = 0usize;
        for (package_id, raw) in packages {
            let mut infos: Vec<UploadInfo> = serde_json::from_str(&raw)?;
            let before = infos.len();
            infos.retain(|i| i.storage_id != id);
            if infos.len() == before {
                continue;
            }
            sqlx::query("UPDATE packages SET upload_infos = ?, updated_at = ? WHERE id = ?")
                .bind(serde_json::to_string(&infos)?)
                .bind(Utc::now())
                .bind(package_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    AppError::with_source(ErrorKind::Database, "Failed to detach package", e)
                })?;
            detached_packages += 1;
        }

        let schedules = sqlx::query_as::<_, ScheduleRow>("SELECT * FROM schedules")
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| {
                AppError::with_source(ErrorKind::Database, "Failed to list schedules", e)
            })?;

        let mut detached_schedules = 0usize;
        for row in schedules {
            let mut schedule = Schedule::try_from(row)?;
            if !schedule.detach_storage(id) {
                continue;
            }
            if !schedule.active {
                warn!(schedule_id = schedule.id, "Schedule lost its last storage, deactivating");
            }
            sqlx::query("UPDATE schedules SET active = ?, storage_ids = ? WHERE id = ?")
                .bind(schedule.active)
                .bind(serde_json::to_string(&schedule.storage_ids)?)
                .bind(schedule.id)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    AppError::with_source(ErrorKind::Database, "Failed to detach schedule", e)
                })?;
            detached_schedules += 1;
        }

        sqlx::query("DELETE FROM storages WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                AppError::with_source(ErrorKind::Database, "Failed to delete storage", e)
            })?;

        tx.commit()
            .await
            .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to commit delete", e))?;

        info!(
            storage_id = id,
            detached_packages, detached_schedules, "Deleted storage"
        );
        Ok(true)
    }

    async fn write(&self, storage: &StorageEntity) -> AppResult<()> {
        let (encoded, encrypted) = self.encode(&storage.settings)?;
        sqlx::query(
            "UPDATE storages SET name = ?, notes = ?, storage_type = ?, config = ?, encrypted = ?, \
             updated_at = ? WHERE id = ?",
        )
        .bind(&storage.name)
        .bind(&storage.notes)
        .bind(storage.storage_type())
        .bind(&encoded)
        .bind(encrypted)
        .bind(Utc::now())
        .bind(storage.id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to update storage", e))?;
        Ok(())
    }

    /// Decode a row, re-saving it when it was migrated or needs sealing.
    async fn load(&self, row: StorageRow) -> AppResult<StorageEntity> {
        let (storage, rewrite) = self.decode(row)?;
        if rewrite {
            info!(
                storage_id = storage.id,
                storage_type = %storage.kind(),
                "Rewriting storage record in the current layout"
            );
            self.write(&storage).await?;
        }
        Ok(storage)
    }

    fn decode(&self, row: StorageRow) -> AppResult<(StorageEntity, bool)> {
        let plaintext = if row.encrypted {
            let cipher = self.cipher.as_ref().ok_or_else(|| {
                AppError::configuration(format!(
                    "Storage {} is sealed but security.crypt is disabled",
                    row.id
                ))
            })?;
            String::from_utf8(cipher.open(&row.config)?).map_err(|e| {
                AppError::with_source(ErrorKind::Crypto, "Opened config is not UTF-8", e)
            })?
        } else {
            row.config
        };

        let value: serde_json::Value = serde_json::from_str(&plaintext)?;
        let storage_type = i32::try_from(row.storage_type).map_err(|_| {
            AppError::validation(format!("Invalid storage type {}", row.storage_type))
        })?;

        let (settings, migrated) = if legacy::is_legacy(&value) {
            (legacy::migrate(storage_type, &value)?, true)
        } else {
            let settings: StorageSettings = serde_json::from_value(value)?;
            if settings.kind().code() != storage_type {
                return Err(AppError::validation(format!(
                    "Storage {} has type {} but {} settings",
                    row.id,
                    storage_type,
                    settings.kind()
                )));
            }
            (settings, false)
        };

        // Plaintext rows get sealed on their next save.
        let reseal = !row.encrypted && self.cipher.is_some();

        Ok((
            StorageEntity {
                id: row.id,
                name: row.name,
                notes: row.notes,
                settings,
                created_at: row.created_at,
                updated_at: row.updated_at,
            },
            migrated || reseal,
        ))
    }

    fn encode(&self, settings: &StorageSettings) -> AppResult<(String, bool)> {
        let json = serde_json::to_string(settings)?;
        match &self.cipher {
            Some(cipher) => Ok((cipher.seal(json.as_bytes())?, true)),
            None => Ok((json, false)),
        }
    }
}
