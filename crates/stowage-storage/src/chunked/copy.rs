//! Same-filesystem chunked copy.
//!
//! Local storages have no wire protocol, so both package files are copied
//! byte-wise in bounded slices. The cursor is a [`ChunkPosition`] persisted
//! on the upload info between invocations.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::time::Instant;

use stowage_entity::package::ChunkPosition;

/// Result of one invocation of the copy engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Every file is fully copied.
    Complete,
    /// The slice is used up, resume later. Not a failure.
    Stop,
    /// An I/O failure.
    Error(String),
}

/// One file to copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyJob {
    /// Source file.
    pub source: PathBuf,
    /// Destination file.
    pub dest: PathBuf,
}

/// Copy up to `max` bytes of `source`, starting at `offset`, into `dest` at
/// the same offset.
///
/// Anything in `dest` past `offset` is discarded first, so a write that
/// landed after the cursor was last persisted is never kept.
pub async fn copy_range(source: &Path, dest: &Path, offset: u64, max: u64) -> std::io::Result<u64> {
    let mut reader = fs::File::open(source).await?;
    reader.seek(SeekFrom::Start(offset)).await?;

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut writer = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(dest)
        .await?;
    writer.set_len(offset).await?;
    writer.seek(SeekFrom::Start(offset)).await?;

    let mut limited = reader.take(max);
    let copied = tokio::io::copy(&mut limited, &mut writer).await?;
    writer.flush().await?;
    Ok(copied)
}

/// Read `len` bytes of `path` starting at `offset`. Short at end of file.
pub async fn read_range(path: &Path, offset: u64, len: u64) -> std::io::Result<Vec<u8>> {
    let mut file = fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = Vec::with_capacity(usize::try_from(len).unwrap_or(0));
    file.take(len).read_to_end(&mut buf).await?;
    Ok(buf)
}

/// Advance the copy of `jobs` by one chunk.
///
/// A chunk that finishes a file rolls straight into the next file while
/// the deadline allows; a chunk that leaves a file unfinished ends the
/// invocation.
pub async fn copy_chunks(
    jobs: &[CopyJob],
    position: &mut ChunkPosition,
    chunk_size: u64,
    deadline: Instant,
    throttle: Duration,
) -> ChunkOutcome {
    let chunk_size = chunk_size.max(1);

    loop {
        let Some(job) = jobs.get(position.file_index) else {
            return ChunkOutcome::Complete;
        };

        let size = match fs::metadata(&job.source).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                return ChunkOutcome::Error(format!(
                    "Cannot read {}: {e}",
                    job.source.display()
                ));
            }
        };

        let offset = position.offset.min(size);
        let copied = match copy_range(&job.source, &job.dest, offset, chunk_size).await {
            Ok(n) => n,
            Err(e) => {
                return ChunkOutcome::Error(format!(
                    "Copy of {} to {} failed: {e}",
                    job.source.display(),
                    job.dest.display()
                ));
            }
        };
        position.offset = offset + copied;

        tracing::debug!(
            file = %job.source.display(),
            offset = position.offset,
            size,
            "Copied local chunk"
        );

        if position.offset < size {
            if copied == 0 {
                return ChunkOutcome::Error(format!(
                    "{} shrank while being copied",
                    job.source.display()
                ));
            }
            if !throttle.is_zero() {
                tokio::time::sleep(throttle).await;
            }
            return ChunkOutcome::Stop;
        }

        position.file_index += 1;
        position.offset = 0;
        if position.file_index >= jobs.len() {
            return ChunkOutcome::Complete;
        }
        if Instant::now() >= deadline {
            return ChunkOutcome::Stop;
        }
    }
}
