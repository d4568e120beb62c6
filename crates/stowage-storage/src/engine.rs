//! The per-(package, storage) transfer state machine.
//!
//! One call performs one bounded unit of work: the installer in full, or
//! one chunk of the archive. Backend errors never escape; they are folded
//! into the [`UploadInfo`] the caller persists afterwards.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use tokio::time::Instant;

use stowage_entity::package::{
    ChunkPosition, Package, PackageFileType, ResumeToken, UploadInfo,
};

use crate::chunked::{ChunkOutcome, CopyJob, copy_chunks};
use crate::client::{ChunkProgress, ChunkRequest, ChunkedTransferClient, TransferError};
use crate::retention;

/// What one step did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The transfer was already finished.
    NoOp,
    /// Bytes were acknowledged, more remain.
    Progressed,
    /// Both files are on the storage.
    Completed,
    /// The slice ran out. Not counted as a failure.
    TimedOut,
    /// A recoverable error was counted.
    RecoverableError,
    /// The transfer is abandoned.
    Failed,
    /// The package was cancelled and partial remote state discarded.
    Cancelled,
}

impl StepOutcome {
    /// Check if the caller may run another step in the same slice.
    pub fn should_continue(&self) -> bool {
        matches!(self, Self::Progressed)
    }

    /// Return the outcome as a lowercase string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoOp => "noop",
            Self::Progressed => "progressed",
            Self::Completed => "completed",
            Self::TimedOut => "timed_out",
            Self::RecoverableError => "recoverable_error",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-step inputs supplied by the worker.
#[derive(Debug, Clone, Copy)]
pub struct StepContext {
    /// The step must return before this instant.
    pub deadline: Instant,
    /// Sleep inserted between chunks.
    pub throttle: Duration,
    /// The package was flagged for cancellation.
    pub cancel_requested: bool,
}

impl StepContext {
    /// A context with `budget` left and no throttling.
    pub fn with_budget(budget: Duration) -> Self {
        Self {
            deadline: Instant::now() + budget,
            throttle: Duration::ZERO,
            cancel_requested: false,
        }
    }
}

/// Advance a transfer to a remote backend by one step.
pub async fn copy_from_default(
    client: &mut dyn ChunkedTransferClient,
    package: &Package,
    info: &mut UploadInfo,
    max_packages: i32,
    step: &StepContext,
) -> StepOutcome {
    if info.is_finished() {
        return StepOutcome::NoOp;
    }
    info.mark_started();
    let kind = client.kind();

    if step.cancel_requested {
        let token = info.resume_token(kind).unwrap_or(ResumeToken::None);
        if let Err(e) = client.abort(&package.archive_name, &token).await {
            tracing::warn!(
                package_id = package.id,
                storage_id = info.storage_id,
                error = %e,
                "Cleanup of cancelled transfer failed"
            );
        }
        info.mark_cancelled();
        tracing::info!(package_id = package.id, storage_id = info.storage_id, "Transfer cancelled");
        return StepOutcome::Cancelled;
    }

    if !info.copied_installer {
        let source = package.local_file_path(PackageFileType::Installer);
        return match client.upload_whole(&source, &package.installer_name).await {
            Ok(()) => {
                info.mark_installer_copied();
                tracing::info!(
                    package_id = package.id,
                    storage_id = info.storage_id,
                    storage_type = %kind,
                    "Installer copied"
                );
                StepOutcome::Progressed
            }
            Err(TransferError::Timeout(_)) => StepOutcome::TimedOut,
            Err(e) => {
                tracing::error!(
                    package_id = package.id,
                    storage_id = info.storage_id,
                    storage_type = %kind,
                    error = %e,
                    "Installer upload failed"
                );
                info.mark_failed(format!("Installer upload failed: {}", e.message()));
                StepOutcome::Failed
            }
        };
    }

    let source = package.local_file_path(PackageFileType::Archive);
    let file_size = match tokio::fs::metadata(&source).await {
        Ok(meta) => meta.len(),
        Err(e) => {
            info.mark_failed(format!("Archive {} unreadable: {e}", source.display()));
            return StepOutcome::Failed;
        }
    };

    let token = match info.resume_token(kind) {
        Ok(token) => token,
        Err(e) => {
            tracing::warn!(
                package_id = package.id,
                storage_id = info.storage_id,
                error = %e,
                "Discarding unreadable resume token, restarting archive"
            );
            info.clear_resume_token();
            info.reconcile_offset(0, file_size);
            ResumeToken::None
        }
    };

    let request = ChunkRequest {
        source: &source,
        dest: &package.archive_name,
        file_size,
        offset: info.archive_offset,
        token: token.clone(),
        deadline: step.deadline,
        throttle: step.throttle,
    };

    match client.upload_chunk(request).await {
        Ok(progress) => apply_progress(client, package, info, progress, file_size, max_packages).await,
        Err(TransferError::Timeout(message)) => {
            tracing::debug!(
                package_id = package.id,
                storage_id = info.storage_id,
                offset = info.archive_offset,
                error = %message,
                "Archive chunk stopped at the end of the slice"
            );
            StepOutcome::TimedOut
        }
        Err(TransferError::Fatal(message)) => {
            tracing::error!(
                package_id = package.id,
                storage_id = info.storage_id,
                storage_type = %kind,
                error = %message,
                "Archive transfer failed"
            );
            info.mark_failed(message);
            StepOutcome::Failed
        }
        Err(TransferError::Recoverable(message)) => {
            tracing::warn!(
                package_id = package.id,
                storage_id = info.storage_id,
                storage_type = %kind,
                offset = info.archive_offset,
                failure_count = info.failure_count + 1,
                error = %message,
                "Archive chunk failed"
            );
            info.record_failure(message);
            reconcile(client, package, info, &token, file_size, max_packages).await
        }
    }
}

async fn apply_progress(
    client: &mut dyn ChunkedTransferClient,
    package: &Package,
    info: &mut UploadInfo,
    progress: ChunkProgress,
    file_size: u64,
    max_packages: i32,
) -> StepOutcome {
    if progress.complete {
        finish(client, package, info, file_size, max_packages).await;
        return StepOutcome::Completed;
    }
    if let Err(e) = info.set_resume_token(&progress.token) {
        info.mark_failed(format!("Cannot persist resume token: {e}"));
        return StepOutcome::Failed;
    }
    info.record_chunk(progress.next_offset, file_size);
    tracing::debug!(
        package_id = package.id,
        storage_id = info.storage_id,
        offset = info.archive_offset,
        progress = info.progress,
        "Archive chunk acknowledged"
    );
    StepOutcome::Progressed
}

/// Ask the backend where it really is after a recoverable error.
async fn reconcile(
    client: &mut dyn ChunkedTransferClient,
    package: &Package,
    info: &mut UploadInfo,
    token: &ResumeToken,
    file_size: u64,
    max_packages: i32,
) -> StepOutcome {
    match client.recover_offset(&package.archive_name, file_size, token).await {
        Ok(progress) if progress.complete => {
            finish(client, package, info, file_size, max_packages).await;
            StepOutcome::Completed
        }
        Ok(progress) => {
            info.reconcile_offset(progress.next_offset, file_size);
            if let Err(e) = info.set_resume_token(&progress.token) {
                tracing::warn!(storage_id = info.storage_id, error = %e, "Resume token not updated");
            }
            StepOutcome::RecoverableError
        }
        Err(TransferError::Fatal(message)) => {
            info.mark_failed(message);
            StepOutcome::Failed
        }
        Err(e) => {
            tracing::debug!(storage_id = info.storage_id, error = %e, "Offset probe failed, keeping cursor");
            StepOutcome::RecoverableError
        }
    }
}

async fn finish(
    client: &mut dyn ChunkedTransferClient,
    package: &Package,
    info: &mut UploadInfo,
    file_size: u64,
    max_packages: i32,
) {
    info.mark_archive_copied(file_size);
    tracing::info!(
        package_id = package.id,
        storage_id = info.storage_id,
        storage_type = %client.kind(),
        bytes = file_size,
        "Archive copied"
    );
    run_purge(client, info.storage_id, max_packages).await;
}

async fn run_purge(client: &mut dyn ChunkedTransferClient, storage_id: i64, max_packages: i32) {
    if let Err(e) = retention::purge_old_packages(client, max_packages).await {
        tracing::warn!(storage_id, error = %e, "Purge of old packages failed");
    }
}

/// Advance a same-filesystem copy by one step.
///
/// Both files go through the chunked copy engine. When the destination is
/// the directory the package was built in there is nothing to copy.
pub async fn copy_local(
    client: &mut dyn ChunkedTransferClient,
    package: &Package,
    info: &mut UploadInfo,
    dest_dir: &Path,
    chunk_size: u64,
    max_packages: i32,
    step: &StepContext,
) -> StepOutcome {
    if info.is_finished() {
        return StepOutcome::NoOp;
    }
    info.mark_started();

    let archive = package.local_file_path(PackageFileType::Archive);
    let installer = package.local_file_path(PackageFileType::Installer);

    if step.cancel_requested {
        if !same_dir(&package.local_dir, dest_dir) && !info.copied_archive {
            let partial = dest_dir.join(&package.archive_name);
            if let Err(e) = tokio::fs::remove_file(&partial).await
                && e.kind() != std::io::ErrorKind::NotFound
            {
                tracing::warn!(file = %partial.display(), error = %e, "Partial copy not removed");
            }
        }
        info.mark_cancelled();
        return StepOutcome::Cancelled;
    }

    let archive_size = match tokio::fs::metadata(&archive).await {
        Ok(meta) => meta.len(),
        Err(e) => {
            info.mark_failed(format!("Archive {} unreadable: {e}", archive.display()));
            return StepOutcome::Failed;
        }
    };

    if same_dir(&package.local_dir, dest_dir) {
        if !installer.exists() {
            info.mark_failed(format!("Installer {} missing", installer.display()));
            return StepOutcome::Failed;
        }
        info.mark_installer_copied();
        finish(client, package, info, archive_size, max_packages).await;
        return StepOutcome::Completed;
    }

    let jobs = [
        CopyJob {
            source: installer,
            dest: dest_dir.join(&package.installer_name),
        },
        CopyJob {
            source: archive,
            dest: dest_dir.join(&package.archive_name),
        },
    ];

    let mut position = info.chunk_position.unwrap_or(ChunkPosition {
        file_index: usize::from(info.copied_installer),
        offset: if info.copied_installer { info.archive_offset } else { 0 },
    });

    let outcome = copy_chunks(&jobs, &mut position, chunk_size, step.deadline, step.throttle).await;

    if position.file_index >= 1 && !info.copied_installer {
        info.mark_installer_copied();
    }
    if position.file_index == 1 {
        info.record_chunk(position.offset, archive_size);
    }
    info.chunk_position = Some(position);

    match outcome {
        ChunkOutcome::Complete => {
            info.chunk_position = None;
            finish(client, package, info, archive_size, max_packages).await;
            StepOutcome::Completed
        }
        ChunkOutcome::Stop => StepOutcome::Progressed,
        ChunkOutcome::Error(message) => {
            tracing::error!(
                package_id = package.id,
                storage_id = info.storage_id,
                error = %message,
                "Local copy failed"
            );
            info.mark_failed(message);
            StepOutcome::Failed
        }
    }
}

fn same_dir(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_progress_continues() {
        assert!(StepOutcome::Progressed.should_continue());
        assert!(!StepOutcome::TimedOut.should_continue());
        assert!(!StepOutcome::Completed.should_continue());
    }
}
