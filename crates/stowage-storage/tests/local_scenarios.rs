//! Local-folder transfers and retention end to end.

mod helpers;

use std::time::Duration;

use helpers::{MIB, file_names, write_aged, write_package};
use stowage_entity::package::UploadInfo;
use stowage_entity::storage::StorageKind;
use stowage_storage::engine::{StepContext, StepOutcome, copy_local};
use stowage_storage::providers::local::LocalClient;
use stowage_storage::retention::purge_old_packages;

const STORAGE_ID: i64 = 3;
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[tokio::test]
async fn test_ten_mib_archive_in_five_invocations() {
    let source = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let package = write_package(source.path(), 10 * MIB, STORAGE_ID).await;
    let mut client = LocalClient::new(StorageKind::Local, dest.path(), 2 * MIB);
    let mut persisted = serde_json::to_string(package.upload_info(STORAGE_ID).unwrap()).unwrap();

    let mut outcomes = Vec::new();
    for _ in 0..5 {
        // Every invocation starts from the persisted record only.
        let mut info: UploadInfo = serde_json::from_str(&persisted).unwrap();
        let step = StepContext::with_budget(Duration::from_secs(60));
        outcomes.push(
            copy_local(&mut client, &package, &mut info, dest.path(), 2 * MIB, 0, &step).await,
        );
        persisted = serde_json::to_string(&info).unwrap();
    }

    let info: UploadInfo = serde_json::from_str(&persisted).unwrap();
    assert_eq!(&outcomes[..4], &[StepOutcome::Progressed; 4]);
    assert_eq!(outcomes[4], StepOutcome::Completed);
    assert!(info.copied_installer);
    assert!(info.copied_archive);
    assert_eq!(info.archive_offset, 10 * MIB);
    assert_eq!(info.progress, 100);

    let copied = tokio::fs::read(dest.path().join(&package.archive_name)).await.unwrap();
    let original = tokio::fs::read(source.path().join(&package.archive_name)).await.unwrap();
    assert_eq!(copied, original);
    assert!(dest.path().join(&package.installer_name).exists());
}

#[tokio::test]
async fn test_progress_tracks_each_chunk() {
    let source = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let package = write_package(source.path(), 10 * MIB, STORAGE_ID).await;
    let mut client = LocalClient::new(StorageKind::Local, dest.path(), 2 * MIB);
    let mut info = package.upload_info(STORAGE_ID).cloned().unwrap();

    let mut progress = Vec::new();
    for _ in 0..5 {
        let step = StepContext::with_budget(Duration::from_secs(60));
        copy_local(&mut client, &package, &mut info, dest.path(), 2 * MIB, 0, &step).await;
        progress.push(info.progress);
    }
    assert_eq!(progress, vec![20, 40, 60, 80, 100]);
}

#[tokio::test]
async fn test_default_storage_completes_in_place() {
    let source = tempfile::tempdir().unwrap();
    let package = write_package(source.path(), MIB, STORAGE_ID).await;
    let mut client = LocalClient::new(StorageKind::DefaultLocal, source.path(), 2 * MIB);
    let mut info = package.upload_info(STORAGE_ID).cloned().unwrap();
    let step = StepContext::with_budget(Duration::from_secs(60));

    let outcome =
        copy_local(&mut client, &package, &mut info, source.path(), 2 * MIB, 0, &step).await;
    assert_eq!(outcome, StepOutcome::Completed);
    assert!(info.copied_installer && info.copied_archive);
    assert_eq!(file_names(source.path()).len(), 2);
}

#[tokio::test]
async fn test_cancel_removes_partial_copy() {
    let source = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let package = write_package(source.path(), 6 * MIB, STORAGE_ID).await;
    let mut client = LocalClient::new(StorageKind::Local, dest.path(), 2 * MIB);
    let mut info = package.upload_info(STORAGE_ID).cloned().unwrap();

    let step = StepContext::with_budget(Duration::from_secs(60));
    copy_local(&mut client, &package, &mut info, dest.path(), 2 * MIB, 0, &step).await;
    assert!(dest.path().join(&package.archive_name).exists());

    let cancel = StepContext {
        cancel_requested: true,
        ..StepContext::with_budget(Duration::from_secs(60))
    };
    let outcome = copy_local(&mut client, &package, &mut info, dest.path(), 2 * MIB, 0, &cancel).await;
    assert_eq!(outcome, StepOutcome::Cancelled);
    assert!(info.cancelled);
    assert!(!dest.path().join(&package.archive_name).exists());
}

#[tokio::test]
async fn test_purge_keeps_three_newest_of_five() {
    let dir = tempfile::tempdir().unwrap();
    for (i, age) in [5u32, 4, 3, 2, 1].into_iter().enumerate() {
        let prefix = format!("site_2026101{i}_hash{i}");
        write_aged(&dir.path().join(format!("{prefix}_archive.zip")), DAY * age);
        write_aged(&dir.path().join(format!("{prefix}_installer.php")), DAY * age);
    }
    write_aged(&dir.path().join("notes.txt"), DAY * 30);
    let mut client = LocalClient::new(StorageKind::Local, dir.path(), MIB);

    let mut deleted = purge_old_packages(&mut client, 3).await.unwrap();
    deleted.sort();
    assert_eq!(
        deleted,
        vec![
            "site_20261010_hash0_archive.zip",
            "site_20261010_hash0_installer.php",
            "site_20261011_hash1_archive.zip",
            "site_20261011_hash1_installer.php",
        ]
    );

    let left = file_names(dir.path());
    assert_eq!(left.len(), 7);
    for i in 2..5 {
        assert!(left.contains(&format!("site_2026101{i}_hash{i}_archive.zip")));
        assert!(left.contains(&format!("site_2026101{i}_hash{i}_installer.php")));
    }
    assert!(left.contains(&"notes.txt".to_string()));
}

#[tokio::test]
async fn test_purge_with_zero_cap_removes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    for i in 0..4u32 {
        write_aged(&dir.path().join(format!("p{i}_archive.zip")), DAY * (i + 1));
    }
    let mut client = LocalClient::new(StorageKind::Local, dir.path(), MIB);

    assert!(purge_old_packages(&mut client, 0).await.unwrap().is_empty());
    assert_eq!(file_names(dir.path()).len(), 4);
}
