//! Storage entity model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::kind::StorageKind;
use super::settings::StorageSettings;

/// A configured storage destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageEntity {
    /// Unique storage identifier.
    pub id: i64,
    /// Human-readable name.
    pub name: String,
    /// Free-form operator notes.
    pub notes: String,
    /// Backend settings; the variant determines the storage type.
    pub settings: StorageSettings,
    /// When the storage was created.
    pub created_at: DateTime<Utc>,
    /// When the storage was last updated.
    pub updated_at: DateTime<Utc>,
}

impl StorageEntity {
    /// The storage kind.
    pub fn kind(&self) -> StorageKind {
        self.settings.kind()
    }

    /// The persisted integer discriminant.
    pub fn storage_type(&self) -> i32 {
        self.kind().code()
    }

    /// Check if this is the default-local storage.
    pub fn is_default(&self) -> bool {
        self.kind() == StorageKind::DefaultLocal
    }
}

/// Data required to create a new storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewStorage {
    /// Human-readable name.
    pub name: String,
    /// Free-form operator notes.
    #[serde(default)]
    pub notes: String,
    /// Backend settings.
    pub settings: StorageSettings,
}
