//! Storage type discriminant.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use stowage_core::AppError;

/// Integer code of the pre-Graph OneDrive storage, migrated on load.
pub const LEGACY_ONEDRIVE_CODE: i32 = 6;

/// The type of a configured storage.
///
/// The integer codes are the persisted `storage_type` column and never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    /// The always-present storage pointing at the backup directory.
    DefaultLocal,
    /// Another directory on the same filesystem.
    Local,
    /// Dropbox (HTTP API v2 upload sessions).
    Dropbox,
    /// FTP or FTPS.
    Ftp,
    /// Google Drive v3 resumable uploads.
    GDrive,
    /// Amazon S3.
    S3,
    /// SFTP over SSH.
    Sftp,
    /// OneDrive through Microsoft Graph.
    OneDrive,
    /// Any S3-compatible endpoint.
    S3Compatible,
    /// Backblaze B2 through its S3 endpoint.
    Backblaze,
}

impl StorageKind {
    /// Every kind, in registration order.
    pub const ALL: [StorageKind; 10] = [
        Self::DefaultLocal,
        Self::Local,
        Self::Dropbox,
        Self::Ftp,
        Self::GDrive,
        Self::S3,
        Self::Sftp,
        Self::OneDrive,
        Self::S3Compatible,
        Self::Backblaze,
    ];

    /// The persisted integer discriminant.
    pub fn code(&self) -> i32 {
        match self {
            Self::DefaultLocal => -2,
            Self::Local => 0,
            Self::Dropbox => 1,
            Self::Ftp => 2,
            Self::GDrive => 3,
            Self::S3 => 4,
            Self::Sftp => 5,
            Self::OneDrive => 7,
            Self::S3Compatible => 8,
            Self::Backblaze => 9,
        }
    }

    /// Look up a kind by its current integer discriminant. Legacy codes are
    /// not accepted here; see [`crate::storage::legacy`].
    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.code() == code)
    }

    /// Return the kind as a lowercase string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DefaultLocal => "default_local",
            Self::Local => "local",
            Self::Dropbox => "dropbox",
            Self::Ftp => "ftp",
            Self::GDrive => "gdrive",
            Self::S3 => "s3",
            Self::Sftp => "sftp",
            Self::OneDrive => "onedrive",
            Self::S3Compatible => "s3_compatible",
            Self::Backblaze => "backblaze",
        }
    }

    /// Human-readable label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::DefaultLocal => "Default",
            Self::Local => "Local",
            Self::Dropbox => "Dropbox",
            Self::Ftp => "FTP",
            Self::GDrive => "Google Drive",
            Self::S3 => "Amazon S3",
            Self::Sftp => "SFTP",
            Self::OneDrive => "OneDrive",
            Self::S3Compatible => "S3-Compatible",
            Self::Backblaze => "Backblaze B2",
        }
    }

    /// Whether this kind copies on the local filesystem instead of over a
    /// network protocol.
    pub fn is_local(&self) -> bool {
        matches!(self, Self::DefaultLocal | Self::Local)
    }

    /// Whether this kind speaks the S3 multipart protocol.
    pub fn is_s3_family(&self) -> bool {
        matches!(self, Self::S3 | Self::S3Compatible | Self::Backblaze)
    }

    /// Whether retention pairs installer and archive by name before deleting.
    /// The other kinds prune the two lists independently.
    pub fn purges_in_pairs(&self) -> bool {
        matches!(self, Self::OneDrive | Self::Ftp | Self::Sftp)
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StorageKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.to_lowercase();
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == lowered)
            .ok_or_else(|| {
                AppError::validation(format!(
                    "Invalid storage type: '{s}'. Expected one of: {}",
                    Self::ALL.map(|k| k.as_str()).join(", ")
                ))
            })
    }
}
