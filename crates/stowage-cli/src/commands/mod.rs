//! CLI command definitions and dispatch.

pub mod migrate;
pub mod package;
pub mod storage;
pub mod sweep;
pub mod transfer;

use clap::{Parser, Subcommand};

use stowage_core::config::AppConfig;
use stowage_core::error::AppError;
use stowage_database::DatabasePool;
use stowage_storage::StorageManager;

use crate::output::OutputFormat;

/// Stowage: resumable package transfers to remote storages
#[derive(Debug, Parser)]
#[command(name = "stowage", version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/default.toml")]
    pub config: String,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    pub format: OutputFormat,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level commands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Storage management
    Storage(storage::StorageArgs),
    /// Package registration and transfer status
    Package(package::PackageArgs),
    /// Run transfer steps by hand
    Transfer(transfer::TransferArgs),
    /// Abort stale S3 multipart uploads
    Sweep,
    /// Database migration management
    Migrate(migrate::MigrateArgs),
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(&self) -> Result<(), AppError> {
        match &self.command {
            Commands::Storage(args) => storage::execute(args, &self.config, self.format).await,
            Commands::Package(args) => package::execute(args, &self.config, self.format).await,
            Commands::Transfer(args) => transfer::execute(args, &self.config, self.format).await,
            Commands::Sweep => sweep::execute(&self.config).await,
            Commands::Migrate(args) => migrate::execute(args, &self.config).await,
        }
    }
}

/// Helper: load configuration from file
pub fn load_config(config_path: &str) -> Result<AppConfig, AppError> {
    AppConfig::load_file(config_path)
        .map_err(|e| AppError::configuration(format!("Failed to load config: {e}")))
}

/// Helper: open the database, bring the schema up to date and wire a
/// storage manager.
pub async fn open_manager(config_path: &str) -> Result<(AppConfig, StorageManager), AppError> {
    let config = load_config(config_path)?;
    let db = DatabasePool::connect(&config.database).await?;
    stowage_database::migration::run_migrations(db.pool()).await?;
    let manager = StorageManager::from_config(&db, &config)?;
    manager.ensure_default().await?;
    Ok((config, manager))
}

/// Helper: ask for confirmation unless `force` is set
pub fn confirm(prompt: &str, force: bool) -> Result<bool, AppError> {
    if force {
        return Ok(true);
    }
    dialoguer::Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()
        .map_err(|e| AppError::internal(format!("Input error: {e}")))
}
