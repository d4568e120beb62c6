//! A configured storage paired with its live transfer client.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use stowage_core::config::TransferConfig;
use stowage_core::result::AppResult;
use stowage_entity::package::{Package, UploadInfo};
use stowage_entity::storage::{OAuthToken, StorageEntity, StorageSettings};

use crate::client::{ChunkedTransferClient, TransferError, TransferResult};
use crate::engine::{self, StepContext, StepOutcome};
use crate::registry::{ClientContext, StorageRegistry};
use crate::retention;

/// One line of a storage test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestLogEntry {
    /// When the step finished.
    pub at: DateTime<Utc>,
    /// What happened.
    pub message: String,
}

/// Ordered log of a storage round-trip test.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TestLog {
    /// Steps in the order they ran.
    pub entries: Vec<TestLogEntry>,
    /// Whether every step passed.
    pub success: bool,
}

impl TestLog {
    fn push(&mut self, message: impl Into<String>) {
        self.entries.push(TestLogEntry {
            at: Utc::now(),
            message: message.into(),
        });
    }

    fn fail(mut self, message: impl Into<String>) -> Self {
        self.push(message);
        self.success = false;
        self
    }

    /// Render as `timestamp message` lines.
    pub fn lines(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|e| format!("{} {}", e.at.format("%Y-%m-%d %H:%M:%S"), e.message))
            .collect()
    }
}

/// A storage ready to transfer. Owns the client for one invocation.
#[derive(Debug)]
pub struct StorageHandle {
    entity: StorageEntity,
    client: Box<dyn ChunkedTransferClient>,
    local_root: Option<PathBuf>,
    transfer: TransferConfig,
}

impl StorageHandle {
    /// Build the client for `entity`.
    pub async fn open(
        registry: &StorageRegistry,
        entity: StorageEntity,
        context: &ClientContext,
    ) -> AppResult<Self> {
        let client = registry.build(&entity, context).await?;
        let mut handle = Self::with_client(entity, client, context.transfer.clone());
        if handle.entity.is_default() {
            handle.local_root = Some(context.backup_dir.clone());
        }
        Ok(handle)
    }

    /// Wrap an already-built client. Local directories go through the
    /// chunked copy engine; everything else through the remote state
    /// machine.
    pub fn with_client(
        entity: StorageEntity,
        client: Box<dyn ChunkedTransferClient>,
        transfer: TransferConfig,
    ) -> Self {
        let local_root = match &entity.settings {
            StorageSettings::Local(settings) => Some(PathBuf::from(&settings.folder)),
            _ => None,
        };
        Self {
            entity,
            client,
            local_root,
            transfer,
        }
    }

    /// The storage record.
    pub fn entity(&self) -> &StorageEntity {
        &self.entity
    }

    /// Structural pre-flight check. Never touches the network.
    pub fn is_valid(&self) -> Result<(), Vec<String>> {
        self.entity.settings.validate()
    }

    /// Advance the transfer of `package` to this storage by one step.
    pub async fn copy_from_default(
        &mut self,
        package: &Package,
        info: &mut UploadInfo,
        step: &StepContext,
    ) -> StepOutcome {
        let max_packages = self.entity.settings.max_packages();
        match &self.local_root {
            Some(root) => {
                engine::copy_local(
                    self.client.as_mut(),
                    package,
                    info,
                    root,
                    self.transfer.local_chunk_size_bytes,
                    max_packages,
                    step,
                )
                .await
            }
            None => {
                engine::copy_from_default(self.client.as_mut(), package, info, max_packages, step)
                    .await
            }
        }
    }

    /// Delete the oldest packages beyond the retention cap.
    pub async fn purge_old_packages(&mut self) -> TransferResult<Vec<String>> {
        let max_packages = self.entity.settings.max_packages();
        retention::purge_old_packages(self.client.as_mut(), max_packages).await
    }

    /// Remove whatever a transfer left on the storage: the session and
    /// the partial archive.
    pub async fn remove_package_files(
        &mut self,
        package: &Package,
        info: &UploadInfo,
    ) -> TransferResult<()> {
        if let Ok(token) = info.resume_token(self.entity.kind()) {
            self.client.abort(&package.archive_name, &token).await?;
        }
        self.client.delete(&package.archive_name).await?;
        Ok(())
    }

    /// Abort multipart uploads older than `max_age`.
    pub async fn sweep_stale_uploads(&mut self, max_age: Duration) -> TransferResult<usize> {
        self.client.sweep_stale_uploads(max_age).await
    }

    /// Round-trip a probe file and report every step.
    pub async fn test(&mut self) -> TestLog {
        let mut log = TestLog {
            success: true,
            ..TestLog::default()
        };
        log.push(format!(
            "Testing {} storage \"{}\"",
            self.entity.kind().label(),
            self.entity.name
        ));

        if let Err(errors) = self.is_valid() {
            for error in errors {
                log.push(format!("Invalid setting: {error}"));
            }
            return log.fail("Settings are incomplete, nothing was sent");
        }
        log.push("Settings are complete");

        match self.client.list_objects().await {
            Ok(objects) => log.push(format!("Connected, {} files in the folder", objects.len())),
            Err(e) => return log.fail(format!("Cannot list the folder: {}", e.message())),
        }

        let name = format!("stowage_test_{}.txt", uuid::Uuid::new_v4().simple());
        let probe = std::env::temp_dir().join(&name);
        if let Err(e) = tokio::fs::write(&probe, b"stowage storage test\n").await {
            return log.fail(format!("Cannot create the probe file: {e}"));
        }
        let log = self.round_trip(log, &probe, &name).await;
        if let Err(e) = tokio::fs::remove_file(&probe).await {
            tracing::debug!(file = %probe.display(), error = %e, "Probe file not removed");
        }
        self.client.close().await;
        log
    }

    async fn round_trip(&mut self, mut log: TestLog, probe: &std::path::Path, name: &str) -> TestLog {
        if let Err(e) = self.client.upload_whole(probe, name).await {
            return log.fail(format!("Upload of {name} failed: {}", e.message()));
        }
        log.push(format!("Uploaded {name}"));

        match self.listed(name).await {
            Ok(true) => log.push(format!("{name} is listed")),
            Ok(false) => return log.fail(format!("{name} was uploaded but is not listed")),
            Err(e) => return log.fail(format!("Listing failed: {}", e.message())),
        }

        match self.client.delete(name).await {
            Ok(true) => log.push(format!("Deleted {name}")),
            Ok(false) => return log.fail(format!("{name} disappeared before delete")),
            Err(e) => return log.fail(format!("Delete of {name} failed: {}", e.message())),
        }

        match self.listed(name).await {
            Ok(false) => log.push(format!("{name} is gone")),
            Ok(true) => return log.fail(format!("{name} is still listed after delete")),
            Err(e) => return log.fail(format!("Listing failed: {}", e.message())),
        }
        log.push("Storage test passed");
        log
    }

    async fn listed(&mut self, name: &str) -> Result<bool, TransferError> {
        Ok(self
            .client
            .list_objects()
            .await?
            .iter()
            .any(|o| o.name == name))
    }

    /// A token refreshed during this invocation that should be persisted.
    pub fn refreshed_token(&self) -> Option<OAuthToken> {
        self.client.refreshed_token()
    }

    /// Release the client's connection.
    pub async fn close(&mut self) {
        self.client.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::local::LocalClient;
    use stowage_entity::storage::{LocalSettings, StorageKind};

    fn local_entity(folder: &str) -> StorageEntity {
        StorageEntity {
            id: 3,
            name: "nas".into(),
            notes: String::new(),
            settings: StorageSettings::Local(LocalSettings {
                folder: folder.into(),
                max_packages: 2,
            }),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_round_trip_on_local_folder() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().to_string_lossy().into_owned();
        let client = LocalClient::new(StorageKind::Local, dir.path(), 1024);
        let mut handle = StorageHandle::with_client(
            local_entity(&folder),
            Box::new(client),
            TransferConfig::default(),
        );

        let log = handle.test().await;
        assert!(log.success, "{:?}", log.lines());
        assert!(log.entries.len() >= 6);
        let mut left = tokio::fs::read_dir(dir.path()).await.unwrap();
        assert!(left.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_settings_stop_before_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let client = LocalClient::new(StorageKind::Local, dir.path(), 1024);
        let mut handle =
            StorageHandle::with_client(local_entity(""), Box::new(client), TransferConfig::default());

        assert!(handle.is_valid().is_err());
        let log = handle.test().await;
        assert!(!log.success);
        assert!(log.lines().iter().any(|l| l.contains("Invalid setting")));
    }
}
