//! Package entity model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use stowage_core::AppError;

use super::naming::{self, PackageFileType};
use super::upload_info::{TransferState, UploadInfo};

/// Lifecycle status of a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageStatus {
    /// Archive and installer are still being produced.
    Building,
    /// Built; transfers to one or more storages are outstanding.
    StoragePending,
    /// Every transfer finished successfully.
    Completed,
    /// Every transfer finished, at least one failed.
    CompletedWithErrors,
    /// Cancelled by an operator.
    Cancelled,
}

impl PackageStatus {
    /// Check if the worker should still advance this package.
    pub fn is_transferring(&self) -> bool {
        matches!(self, Self::StoragePending)
    }

    /// Return the status as a lowercase string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Building => "building",
            Self::StoragePending => "storage_pending",
            Self::Completed => "completed",
            Self::CompletedWithErrors => "completed_with_errors",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for PackageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PackageStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "building" => Ok(Self::Building),
            "storage_pending" => Ok(Self::StoragePending),
            "completed" => Ok(Self::Completed),
            "completed_with_errors" => Ok(Self::CompletedWithErrors),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(AppError::validation(format!(
                "Invalid package status: '{other}'"
            ))),
        }
    }
}

/// A built backup package and its per-storage transfer state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Package {
    /// Unique package identifier.
    pub id: i64,
    /// Package name as chosen at build time.
    pub name: String,
    /// Random hash making the file names unguessable.
    pub hash: String,
    /// Directory the built files live in.
    pub local_dir: PathBuf,
    /// Archive file name.
    pub archive_name: String,
    /// Installer file name.
    pub installer_name: String,
    /// Lifecycle status.
    pub status: PackageStatus,
    /// Set by an operator; observed at the start of every transfer step.
    pub cancel_pending: bool,
    /// One entry per storage the package is queued for.
    pub upload_infos: Vec<UploadInfo>,
    /// When the package was built.
    pub created_at: DateTime<Utc>,
    /// When the package record was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Package {
    /// The shared file-name prefix, `{name}_{hash}`.
    pub fn file_prefix(name: &str, hash: &str) -> String {
        format!("{name}_{hash}")
    }

    /// File name of one of the package files.
    pub fn file_name(&self, file_type: PackageFileType) -> &str {
        match file_type {
            PackageFileType::Installer => &self.installer_name,
            PackageFileType::Archive => &self.archive_name,
        }
    }

    /// Absolute path of one of the package files on the local disk.
    pub fn local_file_path(&self, file_type: PackageFileType) -> PathBuf {
        self.local_dir.join(self.file_name(file_type))
    }

    /// Default file names for a fresh package.
    pub fn default_file_names(name: &str, hash: &str) -> (String, String) {
        let prefix = Self::file_prefix(name, hash);
        (naming::archive_name(&prefix), naming::installer_name(&prefix))
    }

    /// Transfer state towards `storage_id`.
    pub fn upload_info(&self, storage_id: i64) -> Option<&UploadInfo> {
        self.upload_infos.iter().find(|i| i.storage_id == storage_id)
    }

    /// Mutable transfer state towards `storage_id`.
    pub fn upload_info_mut(&mut self, storage_id: i64) -> Option<&mut UploadInfo> {
        self.upload_infos
            .iter_mut()
            .find(|i| i.storage_id == storage_id)
    }

    /// Queue the package for a storage. Returns `false` if already queued.
    pub fn add_storage(&mut self, storage_id: i64) -> bool {
        if self.upload_info(storage_id).is_some() {
            return false;
        }
        self.upload_infos.push(UploadInfo::new(storage_id));
        true
    }

    /// Drop a storage from the pending list. Returns `true` when removed.
    pub fn remove_storage(&mut self, storage_id: i64) -> bool {
        let before = self.upload_infos.len();
        self.upload_infos.retain(|i| i.storage_id != storage_id);
        self.upload_infos.len() != before
    }

    /// Storage ids whose transfers can still make progress.
    pub fn pending_storage_ids(&self) -> Vec<i64> {
        self.upload_infos
            .iter()
            .filter(|i| !i.is_finished())
            .map(|i| i.storage_id)
            .collect()
    }

    /// The status the package should move to once no transfer is pending,
    /// or `None` while something is still in flight.
    pub fn completion_status(&self) -> Option<PackageStatus> {
        if self.upload_infos.iter().any(|i| !i.is_finished()) {
            return None;
        }
        if self.cancel_pending {
            return Some(PackageStatus::Cancelled);
        }
        let any_failed = self
            .upload_infos
            .iter()
            .any(|i| i.state() == TransferState::Failed);
        Some(if any_failed {
            PackageStatus::CompletedWithErrors
        } else {
            PackageStatus::Completed
        })
    }
}

/// Data required to register a built package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPackage {
    /// Package name.
    pub name: String,
    /// Random hash.
    pub hash: String,
    /// Directory the built files live in.
    pub local_dir: PathBuf,
    /// Storages to queue the package for.
    #[serde(default)]
    pub storage_ids: Vec<i64>,
}

impl NewPackage {
    /// Initial transfer state, one entry per distinct storage.
    pub fn upload_infos(&self) -> Vec<UploadInfo> {
        let mut infos: Vec<UploadInfo> = Vec::with_capacity(self.storage_ids.len());
        for id in &self.storage_ids {
            if !infos.iter().any(|i| i.storage_id == *id) {
                infos.push(UploadInfo::new(*id));
            }
        }
        infos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn package() -> Package {
        let (archive_name, installer_name) = Package::default_file_names("site", "abc");
        Package {
            id: 1,
            name: "site".into(),
            hash: "abc".into(),
            local_dir: PathBuf::from("/backups"),
            archive_name,
            installer_name,
            status: PackageStatus::StoragePending,
            cancel_pending: false,
            upload_infos: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn local_paths() {
        let p = package();
        assert_eq!(
            p.local_file_path(PackageFileType::Archive),
            PathBuf::from("/backups/site_abc_archive.zip")
        );
        assert_eq!(
            p.local_file_path(PackageFileType::Installer),
            PathBuf::from("/backups/site_abc_installer.php")
        );
    }

    #[test]
    fn completion_waits_for_every_transfer() {
        let mut p = package();
        assert!(p.add_storage(1));
        assert!(!p.add_storage(1));
        assert!(p.add_storage(2));
        assert_eq!(p.completion_status(), None);

        p.upload_info_mut(1).unwrap().mark_installer_copied();
        p.upload_info_mut(1).unwrap().mark_archive_copied(10);
        assert_eq!(p.completion_status(), None);
        assert_eq!(p.pending_storage_ids(), vec![2]);

        p.upload_info_mut(2).unwrap().mark_failed("bucket missing");
        assert_eq!(
            p.completion_status(),
            Some(PackageStatus::CompletedWithErrors)
        );

        assert!(p.remove_storage(2));
        assert_eq!(p.completion_status(), Some(PackageStatus::Completed));
    }

    #[test]
    fn status_parse() {
        assert_eq!(
            "storage_pending".parse::<PackageStatus>().unwrap(),
            PackageStatus::StoragePending
        );
        assert!("nope".parse::<PackageStatus>().is_err());
    }
}
