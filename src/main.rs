//! Stowage worker daemon.
//!
//! Wires configuration, logging, the database and the storage manager
//! together, then advances pending package transfers until shut down.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, fmt};

use stowage_core::config::AppConfig;
use stowage_core::error::AppError;
use stowage_database::DatabasePool;
use stowage_storage::StorageManager;
use stowage_worker::executor::JobExecutor;
use stowage_worker::jobs::MultipartSweepJob;
use stowage_worker::{TransferWorker, WorkerRunner};

#[tokio::main]
async fn main() {
    let env = std::env::var("STOWAGE_ENV").unwrap_or_else(|_| "development".to_string());
    let config = match AppConfig::load(&env) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    init_logging(&config);

    if let Err(e) = run(config, &env).await {
        tracing::error!(error = %e, "Worker error");
        std::process::exit(1);
    }
}

/// Initialize tracing/logging
fn init_logging(config: &AppConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format.as_str() {
        "json" => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_target(true)
                .with_thread_ids(true)
                .init();
        }
        _ => {
            fmt()
                .pretty()
                .with_env_filter(filter)
                .with_target(true)
                .init();
        }
    }
}

async fn run(config: AppConfig, env: &str) -> Result<(), AppError> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), env, "Starting Stowage worker");

    tokio::fs::create_dir_all(&config.storage.backup_dir).await?;

    let db = DatabasePool::connect(&config.database).await?;
    stowage_database::migration::run_migrations(db.pool()).await?;

    let manager = Arc::new(StorageManager::from_config(&db, &config)?);
    let default = manager.ensure_default().await?;
    tracing::info!(
        storage_id = default.id,
        backup_dir = %config.storage.backup_dir,
        kinds = ?manager.registry().kinds(),
        "Storages ready"
    );

    let worker_id = format!("stowage-{}", std::process::id());
    let transfer = TransferWorker::new(
        Arc::clone(&manager),
        worker_id.clone(),
        config.transfer.clone(),
    );

    let mut executor = JobExecutor::new();
    executor.register(Arc::new(MultipartSweepJob::new(
        Arc::clone(&manager),
        Duration::from_secs(config.worker.sweep_interval_seconds),
    )));

    let runner = WorkerRunner::new(transfer, executor, config.worker.clone(), worker_id);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(runner.run(shutdown_rx));

    shutdown_signal().await;
    tracing::info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);

    if let Err(e) = handle.await {
        tracing::error!(error = %e, "Worker task panicked");
    }
    db.close().await;
    tracing::info!("Stowage worker stopped");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
