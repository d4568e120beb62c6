//! Database migration runner.

use sqlx::SqlitePool;
use tracing::info;

use stowage_core::error::{AppError, ErrorKind};

/// Run all pending database migrations.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), AppError> {
    info!("Running database migrations...");

    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .map_err(|e| {
            AppError::with_source(
                ErrorKind::Database,
                format!("Failed to run migrations: {e}"),
                e,
            )
        })?;

    info!("Database migrations completed successfully");
    Ok(())
}

/// Number of migrations recorded as applied. Zero on a fresh database.
pub async fn applied_count(pool: &SqlitePool) -> Result<i64, AppError> {
    let table: Option<String> = sqlx::query_scalar(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name = '_sqlx_migrations'",
    )
    .fetch_optional(pool)
    .await
    .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to inspect schema", e))?;
    if table.is_none() {
        return Ok(0);
    }

    sqlx::query_scalar("SELECT COUNT(*) FROM _sqlx_migrations WHERE success = 1")
        .fetch_one(pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to read migration history", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    #[tokio::test]
    async fn test_applied_count_before_and_after() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        assert_eq!(applied_count(&pool).await.unwrap(), 0);
        run_migrations(&pool).await.unwrap();
        assert!(applied_count(&pool).await.unwrap() >= 1);
    }
}
