//! Storage management CLI commands.

use std::path::PathBuf;

use clap::{Args, Subcommand};
use serde::Serialize;
use serde_json::Value;
use tabled::Tabled;

use stowage_core::error::AppError;
use stowage_entity::storage::{NewStorage, StorageEntity, legacy};

use crate::output::{self, OutputFormat};

/// Arguments for storage commands
#[derive(Debug, Args)]
pub struct StorageArgs {
    /// Storage subcommand
    #[command(subcommand)]
    pub command: StorageCommand,
}

/// Storage subcommands
#[derive(Debug, Subcommand)]
pub enum StorageCommand {
    /// List all storages
    List,
    /// Show one storage
    Show {
        /// Storage ID
        id: i64,
    },
    /// Create a storage from a JSON file
    ///
    /// Accepts `{"name", "notes", "settings": {"kind", ...}}` or a flat
    /// record exported by older versions: `{"name", "storage_type", "config"}`.
    Import {
        /// JSON file to read
        file: PathBuf,
        /// Override the storage name
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Round-trip a probe file through a storage
    Test {
        /// Storage ID
        id: i64,
    },
    /// Apply the retention cap now
    Purge {
        /// Storage ID
        id: i64,
    },
    /// Copy a storage's settings into a new storage or onto another one
    Copy {
        /// Source storage ID
        id: i64,
        /// Existing storage to overwrite
        #[arg(long)]
        into: Option<i64>,
    },
    /// Delete a storage and detach it from packages and schedules
    Delete {
        /// Storage ID
        id: i64,
        /// Skip confirmation prompt
        #[arg(long)]
        force: bool,
    },
}

/// Storage display row
#[derive(Debug, Serialize, Tabled)]
struct StorageRow {
    /// Storage ID
    id: i64,
    /// Name
    name: String,
    /// Storage type
    #[tabled(rename = "type")]
    #[serde(rename = "type")]
    kind: String,
    /// Destination folder
    folder: String,
    /// Retention cap
    max_packages: i32,
    /// Settings complete
    valid: String,
}

impl From<&StorageEntity> for StorageRow {
    fn from(s: &StorageEntity) -> Self {
        Self {
            id: s.id,
            name: s.name.clone(),
            kind: s.kind().label().to_string(),
            folder: s.settings.storage_folder().unwrap_or("(backup directory)").to_string(),
            max_packages: s.settings.max_packages(),
            valid: if s.settings.validate().is_ok() { "✓" } else { "✗" }.to_string(),
        }
    }
}

/// Execute storage commands
pub async fn execute(
    args: &StorageArgs,
    config_path: &str,
    format: OutputFormat,
) -> Result<(), AppError> {
    let (_, manager) = super::open_manager(config_path).await?;
    let storages = manager.storages();

    match &args.command {
        StorageCommand::List => {
            let rows: Vec<StorageRow> = storages.find_all().await?.iter().map(Into::into).collect();
            output::print_list(&rows, format);
        }
        StorageCommand::Show { id } => {
            let storage = storages.get(*id).await?;
            let problems = storage.settings.validate().err().unwrap_or_default();
            match format {
                OutputFormat::Json => output::print_json(&serde_json::json!({
                    "storage": StorageRow::from(&storage),
                    "notes": storage.notes,
                    "problems": problems,
                    "created_at": storage.created_at,
                    "updated_at": storage.updated_at,
                })),
                OutputFormat::Table => {
                    let row = StorageRow::from(&storage);
                    output::print_kv("ID", &row.id.to_string());
                    output::print_kv("Name", &row.name);
                    output::print_kv("Type", &format!("{} ({})", row.kind, storage.storage_type()));
                    output::print_kv("Folder", &row.folder);
                    output::print_kv("Max packages", &row.max_packages.to_string());
                    output::print_kv("Notes", &storage.notes);
                    output::print_kv("Created", &storage.created_at.to_rfc3339());
                    output::print_kv("Updated", &storage.updated_at.to_rfc3339());
                    for problem in &problems {
                        output::print_warning(problem);
                    }
                }
            }
        }
        StorageCommand::Import { file, name } => {
            let raw = tokio::fs::read_to_string(file).await?;
            let value: Value = serde_json::from_str(&raw)?;
            let data = parse_import(value, name.as_deref())?;
            if let Err(problems) = data.settings.validate() {
                for problem in &problems {
                    output::print_warning(problem);
                }
            }
            let storage = storages.create(&data).await?;
            output::print_success(&format!(
                "Storage '{}' imported (id: {}, type: {})",
                storage.name,
                storage.id,
                storage.kind().label()
            ));
        }
        StorageCommand::Test { id } => {
            let log = manager.test(*id).await?;
            match format {
                OutputFormat::Json => output::print_json(&log),
                OutputFormat::Table => {
                    for line in log.lines() {
                        println!("  {line}");
                    }
                }
            }
            if !log.success {
                return Err(AppError::external(format!("Storage {id} failed the test")));
            }
            output::print_success("Storage test passed");
        }
        StorageCommand::Purge { id } => {
            let deleted = manager.purge(*id).await?;
            if deleted.is_empty() {
                println!("Nothing to purge.");
            }
            for name in &deleted {
                println!("  deleted {name}");
            }
        }
        StorageCommand::Copy { id, into } => {
            let storage = storages.copy(*id, *into).await?;
            output::print_success(&format!(
                "Settings copied to '{}' (id: {})",
                storage.name, storage.id
            ));
        }
        StorageCommand::Delete { id, force } => {
            let storage = storages.get(*id).await?;
            let prompt = format!("Delete storage '{}' and detach it from every package?", storage.name);
            if !super::confirm(&prompt, *force)? {
                println!("Cancelled.");
                return Ok(());
            }
            if storages.delete(*id).await? {
                output::print_success(&format!("Storage '{}' deleted", storage.name));
            }
        }
    }

    Ok(())
}

/// Turn an import document into storage data, migrating flat records.
fn parse_import(value: Value, name: Option<&str>) -> Result<NewStorage, AppError> {
    let mut data = if value.get("settings").is_some() {
        serde_json::from_value::<NewStorage>(value)?
    } else if let Some(storage_type) = value.get("storage_type").and_then(Value::as_i64) {
        let storage_type = i32::try_from(storage_type)
            .map_err(|_| AppError::validation(format!("Invalid storage type {storage_type}")))?;
        let config = value.get("config").cloned().unwrap_or(Value::Null);
        NewStorage {
            name: value
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            notes: value
                .get("notes")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            settings: legacy::migrate(storage_type, &config)?,
        }
    } else {
        return Err(AppError::validation(
            "Import file needs either a `settings` object or a `storage_type` and `config`",
        ));
    };

    if let Some(name) = name {
        data.name = name.to_string();
    }
    if data.name.trim().is_empty() {
        return Err(AppError::validation("Storage name is required"));
    }
    Ok(data)
}
