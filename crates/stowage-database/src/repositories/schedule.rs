//! Schedule repository implementation.

use sqlx::{FromRow, SqlitePool};

use stowage_core::error::{AppError, ErrorKind};
use stowage_core::result::AppResult;
use stowage_entity::schedule::Schedule;

#[derive(Debug, FromRow)]
pub(crate) struct ScheduleRow {
    pub(crate) id: i64,
    pub(crate) name: String,
    pub(crate) active: bool,
    pub(crate) storage_ids: String,
}

impl TryFrom<ScheduleRow> for Schedule {
    type Error = AppError;

    fn try_from(row: ScheduleRow) -> Result<Self, Self::Error> {
        let storage_ids = serde_json::from_str(&row.storage_ids).map_err(|e| {
            AppError::with_source(
                ErrorKind::Serialization,
                format!("Corrupt storage list on schedule {}", row.id),
                e,
            )
        })?;
        Ok(Schedule {
            id: row.id,
            name: row.name,
            active: row.active,
            storage_ids,
        })
    }
}

/// Repository for backup schedules.
#[derive(Debug, Clone)]
pub struct ScheduleRepository {
    pool: SqlitePool,
}

impl ScheduleRepository {
    /// Create a new schedule repository.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create an active schedule.
    pub async fn create(&self, name: &str, storage_ids: &[i64]) -> AppResult<Schedule> {
        let ids = serde_json::to_string(storage_ids)?;
        let row = sqlx::query_as::<_, ScheduleRow>(
            "INSERT INTO schedules (name, active, storage_ids) VALUES (?, 1, ?) RETURNING *",
        )
        .bind(name)
        .bind(&ids)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to create schedule", e))?;
        row.try_into()
    }

    /// Find a schedule by ID.
    pub async fn find_by_id(&self, id: i64) -> AppResult<Option<Schedule>> {
        sqlx::query_as::<_, ScheduleRow>("SELECT * FROM schedules WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to find schedule", e))?
            .map(Schedule::try_from)
            .transpose()
    }

    /// List all schedules.
    pub async fn find_all(&self) -> AppResult<Vec<Schedule>> {
        let rows = sqlx::query_as::<_, ScheduleRow>("SELECT * FROM schedules ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                AppError::with_source(ErrorKind::Database, "Failed to list schedules", e)
            })?;
        rows.into_iter().map(Schedule::try_from).collect()
    }

    /// Persist a schedule.
    pub async fn update(&self, schedule: &Schedule) -> AppResult<()> {
        let ids = serde_json::to_string(&schedule.storage_ids)?;
        sqlx::query("UPDATE schedules SET name = ?, active = ?, storage_ids = ? WHERE id = ?")
            .bind(&schedule.name)
            .bind(schedule.active)
            .bind(&ids)
            .bind(schedule.id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                AppError::with_source(ErrorKind::Database, "Failed to update schedule", e)
            })?;
        Ok(())
    }

    /// Delete a schedule.
    pub async fn delete(&self, id: i64) -> AppResult<bool> {
        let result = sqlx::query("DELETE FROM schedules WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                AppError::with_source(ErrorKind::Database, "Failed to delete schedule", e)
            })?;
        Ok(result.rows_affected() > 0)
    }
}
