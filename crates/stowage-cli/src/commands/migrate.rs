//! Database migration commands.

use clap::{Args, Subcommand};

use stowage_core::error::AppError;
use stowage_database::DatabasePool;

use crate::output;

/// Arguments for the migrate command
#[derive(Debug, Args)]
pub struct MigrateArgs {
    /// Migration subcommand
    #[command(subcommand)]
    pub command: MigrateCommand,
}

/// Migration subcommands
#[derive(Debug, Subcommand)]
pub enum MigrateCommand {
    /// Run all pending migrations
    Run,
    /// Check that the database is reachable and migrated
    Status,
}

/// Execute migration commands
pub async fn execute(args: &MigrateArgs, config_path: &str) -> Result<(), AppError> {
    let config = super::load_config(config_path)?;
    let db = DatabasePool::connect(&config.database).await?;

    match &args.command {
        MigrateCommand::Run => {
            println!("Running database migrations...");
            stowage_database::migration::run_migrations(db.pool()).await?;
            output::print_success("All migrations applied successfully.");
        }
        MigrateCommand::Status => {
            db.health_check().await?;
            let applied = stowage_database::migration::applied_count(db.pool()).await?;
            output::print_kv("Database", &config.database.url);
            output::print_kv("Applied migrations", &applied.to_string());
        }
    }

    db.close().await;
    Ok(())
}
