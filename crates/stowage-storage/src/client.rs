//! The uniform contract every storage backend implements.
//!
//! A client drives one provider protocol. The transfer engine calls it one
//! bounded step at a time and persists whatever it returns, so a client
//! must never keep resumption state anywhere but in the returned
//! [`ChunkProgress`].

use std::fmt;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;

use stowage_core::error::{AppError, ErrorKind};
use stowage_entity::package::ResumeToken;
use stowage_entity::storage::{OAuthToken, StorageKind};

/// How a backend call failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    /// Network blip, rate limit, partial write. Counted, retried later.
    #[error("recoverable transfer error: {0}")]
    Recoverable(String),
    /// Credentials revoked, bucket gone, checksum mismatch. Stops the transfer.
    #[error("fatal transfer error: {0}")]
    Fatal(String),
    /// The time slice ran out. Not a failure.
    #[error("transfer timed out: {0}")]
    Timeout(String),
}

impl TransferError {
    /// Create a recoverable error.
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self::Recoverable(message.into())
    }

    /// Create a fatal error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    /// Create a timeout.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout(message.into())
    }

    /// Check if this error ends the transfer.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    /// Return the bare message.
    pub fn message(&self) -> &str {
        match self {
            Self::Recoverable(m) | Self::Fatal(m) | Self::Timeout(m) => m,
        }
    }
}

impl From<std::io::Error> for TransferError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => Self::Timeout(err.to_string()),
            std::io::ErrorKind::PermissionDenied => Self::Fatal(err.to_string()),
            _ => Self::Recoverable(err.to_string()),
        }
    }
}

impl From<TransferError> for AppError {
    fn from(err: TransferError) -> Self {
        let kind = match &err {
            TransferError::Recoverable(_) => ErrorKind::ExternalService,
            TransferError::Fatal(_) => ErrorKind::Storage,
            TransferError::Timeout(_) => ErrorKind::Timeout,
        };
        AppError::with_source(kind, err.message().to_string(), err)
    }
}

/// Result alias for backend calls.
pub type TransferResult<T> = Result<T, TransferError>;

/// One archive chunk to send.
#[derive(Debug, Clone)]
pub struct ChunkRequest<'a> {
    /// Local file being transferred.
    pub source: &'a Path,
    /// Remote file name, relative to the storage folder.
    pub dest: &'a str,
    /// Size of the source file.
    pub file_size: u64,
    /// First byte to send.
    pub offset: u64,
    /// Server-side session, if one was opened by an earlier step.
    pub token: ResumeToken,
    /// The step must return before this instant.
    pub deadline: Instant,
    /// Sleep inserted after a chunk is acknowledged.
    pub throttle: Duration,
}

impl ChunkRequest<'_> {
    /// Time left in the slice.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// What a step achieved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkProgress {
    /// Bytes the storage has acknowledged.
    pub next_offset: u64,
    /// Session to hand back on the next step.
    pub token: ResumeToken,
    /// Every byte is acknowledged and the remote file is finalized.
    pub complete: bool,
}

impl ChunkProgress {
    /// Progress that is not yet complete.
    pub fn partial(next_offset: u64, token: ResumeToken) -> Self {
        Self {
            next_offset,
            token,
            complete: false,
        }
    }

    /// A finished upload.
    pub fn finished(file_size: u64) -> Self {
        Self {
            next_offset: file_size,
            token: ResumeToken::None,
            complete: true,
        }
    }
}

/// A file stored on a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    /// File name, without the storage folder.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// Modification or creation time, when the provider reports one.
    pub modified: Option<DateTime<Utc>>,
}

/// Chunked, resumable transfer over one provider protocol.
///
/// Every method takes `&mut self` because a client owns a transient
/// connection for the duration of one worker invocation.
#[async_trait]
pub trait ChunkedTransferClient: Send + fmt::Debug {
    /// Return the storage kind this client speaks to.
    fn kind(&self) -> StorageKind;

    /// Upload a small file in one shot, replacing any existing copy.
    async fn upload_whole(&mut self, source: &Path, dest: &str) -> TransferResult<()>;

    /// Send at most one protocol chunk of the archive.
    async fn upload_chunk(&mut self, request: ChunkRequest<'_>) -> TransferResult<ChunkProgress>;

    /// Ask the storage how many bytes it actually holds after an ambiguous
    /// failure. Never invents an offset.
    async fn recover_offset(
        &mut self,
        dest: &str,
        file_size: u64,
        token: &ResumeToken,
    ) -> TransferResult<ChunkProgress>;

    /// Discard a partial upload. Best effort.
    async fn abort(&mut self, dest: &str, token: &ResumeToken) -> TransferResult<()>;

    /// Delete a stored file. Returns `false` if it did not exist.
    async fn delete(&mut self, name: &str) -> TransferResult<bool>;

    /// List the files in the storage folder.
    async fn list_objects(&mut self) -> TransferResult<Vec<RemoteObject>>;

    /// Abort server-side sessions older than `max_age`. Returns how many
    /// were aborted.
    async fn sweep_stale_uploads(&mut self, _max_age: Duration) -> TransferResult<usize> {
        Ok(0)
    }

    /// Return OAuth credentials minted during this invocation, if any.
    fn refreshed_token(&self) -> Option<OAuthToken> {
        None
    }

    /// Release the connection.
    async fn close(&mut self) {}
}

/// Join a storage folder and a file name with a single `/`.
pub fn join_remote(folder: &str, name: &str) -> String {
    let folder = folder.trim_end_matches('/');
    let name = name.trim_start_matches('/');
    if folder.is_empty() {
        name.to_string()
    } else {
        format!("{folder}/{name}")
    }
}
