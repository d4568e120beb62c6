//! # stowage-database
//!
//! SQLite connection management, embedded migrations and the repositories
//! for storages, packages and schedules. Storage configuration is sealed
//! and opened here, at the persistence boundary, and nowhere else.

pub mod connection;
pub mod migration;
pub mod repositories;

pub use connection::DatabasePool;
