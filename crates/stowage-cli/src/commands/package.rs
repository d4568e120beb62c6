//! Package registration and transfer status commands.

use std::path::PathBuf;

use chrono::Utc;
use clap::{Args, Subcommand};
use serde::Serialize;
use tabled::Tabled;

use stowage_core::error::AppError;
use stowage_entity::package::{NewPackage, Package, PackageFileType, PackageStatus, UploadInfo};

use crate::output::{self, OutputFormat};

/// Arguments for package commands
#[derive(Debug, Args)]
pub struct PackageArgs {
    /// Package subcommand
    #[command(subcommand)]
    pub command: PackageCommand,
}

/// Package subcommands
#[derive(Debug, Subcommand)]
pub enum PackageCommand {
    /// List all packages
    List,
    /// Register a built package and queue it for storages
    Register {
        /// Package name
        #[arg(short, long)]
        name: String,
        /// Hash part of the file names; generated when omitted
        #[arg(long)]
        hash: Option<String>,
        /// Directory holding the built files; defaults to the backup directory
        #[arg(short, long)]
        dir: Option<PathBuf>,
        /// Storage to queue the package for (repeatable)
        #[arg(short, long = "storage")]
        storages: Vec<i64>,
    },
    /// Show per-storage transfer state
    Status {
        /// Package ID
        id: i64,
    },
    /// Queue a package for another storage
    Queue {
        /// Package ID
        id: i64,
        /// Storage ID
        storage: i64,
    },
    /// Restart a transfer from zero
    Requeue {
        /// Package ID
        id: i64,
        /// Storage ID
        storage: i64,
    },
    /// Flag a package for cancellation; the worker stops at the next step
    Cancel {
        /// Package ID
        id: i64,
        /// Skip confirmation prompt
        #[arg(long)]
        force: bool,
    },
}

/// Package display row
#[derive(Debug, Serialize, Tabled)]
struct PackageRow {
    /// Package ID
    id: i64,
    /// Name
    name: String,
    /// Archive file
    archive: String,
    /// Lifecycle status
    status: String,
    /// Finished transfers out of queued
    transfers: String,
    /// Build time
    created: String,
}

impl From<&Package> for PackageRow {
    fn from(p: &Package) -> Self {
        let finished = p.upload_infos.iter().filter(|i| i.is_finished()).count();
        Self {
            id: p.id,
            name: p.name.clone(),
            archive: p.archive_name.clone(),
            status: if p.cancel_pending && p.status.is_transferring() {
                "cancelling".to_string()
            } else {
                p.status.to_string()
            },
            transfers: format!("{finished}/{}", p.upload_infos.len()),
            created: p.created_at.format("%Y-%m-%d %H:%M").to_string(),
        }
    }
}

/// One storage's transfer state
#[derive(Debug, Serialize, Tabled)]
struct TransferRow {
    /// Storage ID
    storage: i64,
    /// Derived state
    state: String,
    /// Percent done
    progress: String,
    /// Archive bytes acknowledged
    sent: String,
    /// Consecutive failures
    failures: u32,
    /// Last message
    message: String,
}

impl From<&UploadInfo> for TransferRow {
    fn from(i: &UploadInfo) -> Self {
        Self {
            storage: i.storage_id,
            state: i.state().to_string(),
            progress: format!("{}%", i.progress),
            sent: output::format_bytes(i.archive_offset),
            failures: i.failure_count,
            message: i.status_message.clone(),
        }
    }
}

/// Execute package commands
pub async fn execute(
    args: &PackageArgs,
    config_path: &str,
    format: OutputFormat,
) -> Result<(), AppError> {
    let (config, manager) = super::open_manager(config_path).await?;
    let packages = manager.packages();

    match &args.command {
        PackageCommand::List => {
            let rows: Vec<PackageRow> = packages.find_all().await?.iter().map(Into::into).collect();
            output::print_list(&rows, format);
        }
        PackageCommand::Register {
            name,
            hash,
            dir,
            storages,
        } => {
            for storage_id in storages {
                manager.storages().get(*storage_id).await?;
            }
            let data = NewPackage {
                name: name.clone(),
                hash: hash.clone().unwrap_or_else(generate_hash),
                local_dir: dir
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(&config.storage.backup_dir)),
                storage_ids: storages.clone(),
            };
            let package = packages.create(&data).await?;
            for file_type in [PackageFileType::Installer, PackageFileType::Archive] {
                let path = package.local_file_path(file_type);
                if !path.exists() {
                    output::print_warning(&format!("{file_type} not found at {}", path.display()));
                }
            }
            output::print_success(&format!(
                "Package '{}' registered (id: {}, {} storages)",
                package.name,
                package.id,
                package.upload_infos.len()
            ));
        }
        PackageCommand::Status { id } => {
            let package = packages.get(*id).await?;
            if format == OutputFormat::Table {
                let row = PackageRow::from(&package);
                output::print_kv("Package", &format!("{} ({})", row.name, row.id));
                output::print_kv("Status", &row.status);
                output::print_kv("Archive", &row.archive);
                output::print_kv("Installer", &package.installer_name);
                output::print_kv("Directory", &package.local_dir.display().to_string());
            }
            let rows: Vec<TransferRow> = package.upload_infos.iter().map(Into::into).collect();
            output::print_list(&rows, format);
        }
        PackageCommand::Queue { id, storage } => {
            manager.storages().get(*storage).await?;
            let mut package = packages.get(*id).await?;
            queue(&mut package, *storage)?;
            packages.update(&package).await?;
            output::print_success(&format!("Package {id} queued for storage {storage}"));
        }
        PackageCommand::Requeue { id, storage } => {
            let package = manager.requeue(*id, *storage).await?;
            if package.status == PackageStatus::Cancelled {
                packages.set_cancel_pending(*id, false).await?;
            }
            if !package.status.is_transferring() {
                packages.set_status(*id, PackageStatus::StoragePending).await?;
            }
            output::print_success(&format!("Transfer of package {id} to storage {storage} restarted"));
        }
        PackageCommand::Cancel { id, force } => {
            let package = packages.get(*id).await?;
            if !package.status.is_transferring() {
                return Err(AppError::conflict(format!(
                    "Package {id} is {}, nothing to cancel",
                    package.status
                )));
            }
            if !super::confirm(&format!("Cancel every transfer of '{}'?", package.name), *force)? {
                println!("Cancelled.");
                return Ok(());
            }
            packages.set_cancel_pending(*id, true).await?;
            output::print_success(&format!("Package {id} flagged for cancellation"));
        }
    }

    Ok(())
}

/// Add a storage to a package, reopening a finished package.
fn queue(package: &mut Package, storage_id: i64) -> Result<(), AppError> {
    if package.status == PackageStatus::Cancelled || package.cancel_pending {
        return Err(AppError::conflict(format!(
            "Package {} was cancelled",
            package.id
        )));
    }
    if !package.add_storage(storage_id) {
        return Err(AppError::conflict(format!(
            "Package {} is already queued for storage {storage_id}",
            package.id
        )));
    }
    package.status = PackageStatus::StoragePending;
    Ok(())
}

fn generate_hash() -> String {
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", Utc::now().format("%Y%m%d%H%M%S"), &random[..12])
}
