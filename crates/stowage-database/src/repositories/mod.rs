//! Repository implementations for all Stowage entities.

pub mod lease;
pub mod package;
pub mod schedule;
pub mod storage;

pub use lease::LeaseRepository;
pub use package::PackageRepository;
pub use schedule::ScheduleRepository;
pub use storage::StorageRepository;

#[cfg(test)]
pub(crate) mod test_support {
    use sqlx::SqlitePool;
    use sqlx::sqlite::SqlitePoolOptions;

    /// A migrated in-memory database. One connection so every query sees
    /// the same memory database.
    pub async fn memory_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migration::run_migrations(&pool).await.unwrap();
        pool
    }
}
