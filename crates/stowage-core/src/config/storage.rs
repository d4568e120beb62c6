//! Package storage configuration.

use serde::{Deserialize, Serialize};

/// Storage-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory packages are built into. The default-local storage always
    /// points here and cannot be redirected.
    #[serde(default = "default_backup_dir")]
    pub backup_dir: String,
    /// Name given to the auto-created default-local storage.
    #[serde(default = "default_storage_name")]
    pub default_storage_name: String,
    /// Retention cap applied to newly created storages.
    #[serde(default = "default_max_packages")]
    pub default_max_packages: i32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backup_dir: default_backup_dir(),
            default_storage_name: default_storage_name(),
            default_max_packages: default_max_packages(),
        }
    }
}

fn default_backup_dir() -> String {
    "./data/backups".to_string()
}

fn default_storage_name() -> String {
    "Default".to_string()
}

fn default_max_packages() -> i32 {
    10
}
