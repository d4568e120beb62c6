//! Retention: delete the oldest stored packages beyond a cap.
//!
//! Planning is a pure function over a listing so every backend prunes the
//! same way. Only the pairing rule differs per kind.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use stowage_entity::package::naming::{self, PackageFileType};
use stowage_entity::storage::StorageKind;

use crate::client::{ChunkedTransferClient, RemoteObject, TransferResult};

/// How installer and archive files are matched before deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeMode {
    /// Installers and archives are pruned as two separate lists.
    Independent,
    /// Only prefixes with both files present are removed, both at once.
    Paired,
}

impl PurgeMode {
    /// The mode a storage kind prunes with.
    pub fn for_kind(kind: StorageKind) -> Self {
        if kind.purges_in_pairs() {
            Self::Paired
        } else {
            Self::Independent
        }
    }
}

/// Names to delete so that at most `max_packages` packages remain.
///
/// Files that are neither an installer nor an archive are never returned.
/// A cap of zero or less means unlimited.
pub fn plan_purge(objects: &[RemoteObject], max_packages: i32, mode: PurgeMode) -> Vec<String> {
    if max_packages <= 0 {
        return Vec::new();
    }
    let keep = max_packages as usize;

    match mode {
        PurgeMode::Independent => {
            let mut installers = Vec::new();
            let mut archives = Vec::new();
            for object in objects {
                match naming::classify(&object.name) {
                    Some((PackageFileType::Installer, _)) => installers.push(object),
                    Some((PackageFileType::Archive, _)) => archives.push(object),
                    None => {}
                }
            }
            let mut doomed = oldest_beyond(installers, keep);
            doomed.extend(oldest_beyond(archives, keep));
            doomed
        }
        PurgeMode::Paired => {
            let mut pairs: HashMap<&str, (Option<&RemoteObject>, Option<&RemoteObject>)> =
                HashMap::new();
            for object in objects {
                match naming::classify(&object.name) {
                    Some((PackageFileType::Installer, prefix)) => {
                        pairs.entry(prefix).or_default().0 = Some(object);
                    }
                    Some((PackageFileType::Archive, prefix)) => {
                        pairs.entry(prefix).or_default().1 = Some(object);
                    }
                    None => {}
                }
            }

            let mut complete: Vec<(&RemoteObject, &RemoteObject)> = pairs
                .into_values()
                .filter_map(|pair| match pair {
                    (Some(installer), Some(archive)) => Some((installer, archive)),
                    _ => None,
                })
                .collect();
            if complete.len() <= keep {
                return Vec::new();
            }
            complete.sort_by(|a, b| sort_key(a.1).cmp(&sort_key(b.1)));
            let excess = complete.len() - keep;
            complete
                .into_iter()
                .take(excess)
                .flat_map(|(installer, archive)| [installer.name.clone(), archive.name.clone()])
                .collect()
        }
    }
}

fn oldest_beyond(mut list: Vec<&RemoteObject>, keep: usize) -> Vec<String> {
    if list.len() <= keep {
        return Vec::new();
    }
    list.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
    let excess = list.len() - keep;
    list.into_iter()
        .take(excess)
        .map(|o| o.name.clone())
        .collect()
}

/// Undated objects sort first, ties break on name.
fn sort_key(object: &RemoteObject) -> (Option<DateTime<Utc>>, &str) {
    (object.modified, object.name.as_str())
}

/// List the storage and delete what [`plan_purge`] selects.
///
/// A failed delete is logged and skipped. Returns the names removed.
pub async fn purge_old_packages(
    client: &mut dyn ChunkedTransferClient,
    max_packages: i32,
) -> TransferResult<Vec<String>> {
    if max_packages <= 0 {
        return Ok(Vec::new());
    }
    let kind = client.kind();
    let objects = client.list_objects().await?;
    let planned = plan_purge(&objects, max_packages, PurgeMode::for_kind(kind));

    let mut deleted = Vec::with_capacity(planned.len());
    for name in planned {
        match client.delete(&name).await {
            Ok(_) => deleted.push(name),
            Err(e) => {
                tracing::warn!(storage_type = %kind, file = %name, error = %e, "Purge delete failed");
            }
        }
    }

    if !deleted.is_empty() {
        tracing::info!(
            storage_type = %kind,
            count = deleted.len(),
            max_packages,
            "Purged old packages"
        );
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn obj(name: &str, day: u32) -> RemoteObject {
        RemoteObject {
            name: name.to_string(),
            size: 1,
            modified: Some(Utc.with_ymd_and_hms(2026, 1, day, 0, 0, 0).unwrap()),
        }
    }

    fn five_pairs() -> Vec<RemoteObject> {
        let mut objects = Vec::new();
        for day in 1..=5 {
            objects.push(obj(&format!("p{day}_installer.php"), day));
            objects.push(obj(&format!("p{day}_archive.zip"), day));
        }
        objects.push(obj("notes.txt", 1));
        objects
    }

    #[test]
    fn test_cap_removes_oldest_in_both_modes() {
        for mode in [PurgeMode::Independent, PurgeMode::Paired] {
            let mut doomed = plan_purge(&five_pairs(), 3, mode);
            doomed.sort();
            assert_eq!(
                doomed,
                vec![
                    "p1_archive.zip",
                    "p1_installer.php",
                    "p2_archive.zip",
                    "p2_installer.php"
                ],
                "{mode:?}"
            );
        }
    }

    #[test]
    fn test_zero_cap_is_unlimited() {
        assert!(plan_purge(&five_pairs(), 0, PurgeMode::Independent).is_empty());
        assert!(plan_purge(&five_pairs(), -1, PurgeMode::Paired).is_empty());
    }

    #[test]
    fn test_independent_prunes_orphans_paired_does_not() {
        let objects = vec![
            obj("a_installer.php", 1),
            obj("b_installer.php", 2),
            obj("b_archive.zip", 2),
            obj("c_installer.php", 3),
            obj("c_archive.daf", 3),
        ];

        let mut independent = plan_purge(&objects, 1, PurgeMode::Independent);
        independent.sort();
        assert_eq!(
            independent,
            vec!["a_installer.php", "b_archive.zip", "b_installer.php"]
        );

        let paired = plan_purge(&objects, 1, PurgeMode::Paired);
        assert_eq!(paired, vec!["b_installer.php", "b_archive.zip"]);
    }

    #[test]
    fn test_mode_per_kind() {
        assert_eq!(PurgeMode::for_kind(StorageKind::Ftp), PurgeMode::Paired);
        assert_eq!(PurgeMode::for_kind(StorageKind::OneDrive), PurgeMode::Paired);
        assert_eq!(PurgeMode::for_kind(StorageKind::Sftp), PurgeMode::Paired);
        assert_eq!(PurgeMode::for_kind(StorageKind::S3), PurgeMode::Independent);
        assert_eq!(PurgeMode::for_kind(StorageKind::GDrive), PurgeMode::Independent);
        assert_eq!(PurgeMode::for_kind(StorageKind::Local), PurgeMode::Independent);
    }
}
