//! Per-(package, storage) transfer state.
//!
//! An [`UploadInfo`] is the only state that survives between worker
//! invocations. Every field needed to resume a transfer lives here, and
//! the owning package is persisted after every step.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use stowage_core::{AppError, AppResult};

use crate::storage::StorageKind;

/// Progress reported once the installer is copied.
pub const INSTALLER_PROGRESS: u8 = 5;

/// Derived lifecycle state of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    /// Queued, nothing sent yet.
    Pending,
    /// The installer has not been copied yet.
    UploadingInstaller,
    /// The installer is copied, archive chunks are in flight.
    UploadingArchive,
    /// Both files are on the storage.
    Done,
    /// Abandoned after a fatal error or the retry ceiling.
    Failed,
    /// Abandoned because the package was cancelled.
    Cancelled,
}

impl TransferState {
    /// Check if the state is absorbing.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }

    /// Return the state as a lowercase string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::UploadingInstaller => "uploading_installer",
            Self::UploadingArchive => "uploading_archive",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Cursor of the local chunk-copy engine: which file and where inside it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPosition {
    /// Index into the copy list (installer first, then archive).
    pub file_index: usize,
    /// Bytes of that file already copied.
    pub offset: u64,
}

/// One acknowledged S3 multipart part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedPart {
    /// 1-based part number.
    pub part_number: i32,
    /// ETag the service returned for the part.
    pub etag: String,
}

/// Typed view of the opaque continuation fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeToken {
    /// No server-side session (local, FTP, SFTP, or not started).
    None,
    /// S3 multipart upload.
    Multipart {
        /// Upload id from CreateMultipartUpload.
        upload_id: String,
        /// Parts acknowledged so far, in order.
        parts: Vec<UploadedPart>,
    },
    /// Dropbox upload session.
    Session {
        /// Session id from upload_session/start.
        session_id: String,
    },
    /// Google Drive or OneDrive resumable session.
    ResumableUri {
        /// Session URI chunks are PUT to.
        uri: String,
        /// When the service forgets the session.
        expires_at: Option<DateTime<Utc>>,
    },
}

impl ResumeToken {
    /// Check if there is no session to resume.
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

/// Transfer state of one package towards one storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadInfo {
    /// Target storage.
    pub storage_id: i64,
    /// The installer is on the storage. Never cleared except by [`UploadInfo::reset`].
    #[serde(default)]
    pub copied_installer: bool,
    /// The archive is on the storage. Never cleared except by [`UploadInfo::reset`].
    #[serde(default)]
    pub copied_archive: bool,
    /// Archive bytes the storage has acknowledged.
    #[serde(default)]
    pub archive_offset: u64,
    /// Continuation token, primary field.
    #[serde(default)]
    pub upload_id: String,
    /// Continuation token, secondary field.
    #[serde(default)]
    pub data: String,
    /// Continuation token, tertiary field.
    #[serde(default)]
    pub data2: String,
    /// Consecutive failures since the last successful chunk.
    #[serde(default)]
    pub failure_count: u32,
    /// Terminal failure.
    #[serde(default)]
    pub failed: bool,
    /// 0..=100.
    #[serde(default)]
    pub progress: u8,
    /// Terminal cancellation.
    #[serde(default)]
    pub cancelled: bool,
    /// At least one step ran.
    #[serde(default)]
    pub has_started: bool,
    /// First step.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// Reached a terminal state.
    #[serde(default)]
    pub stopped_at: Option<DateTime<Utc>>,
    /// Last operator-facing message (error text or completion note).
    #[serde(default)]
    pub status_message: String,
    /// Local chunk-copy cursor.
    #[serde(default)]
    pub chunk_position: Option<ChunkPosition>,
}

impl UploadInfo {
    /// A fresh transfer towards `storage_id`.
    pub fn new(storage_id: i64) -> Self {
        Self {
            storage_id,
            copied_installer: false,
            copied_archive: false,
            archive_offset: 0,
            upload_id: String::new(),
            data: String::new(),
            data2: String::new(),
            failure_count: 0,
            failed: false,
            progress: 0,
            cancelled: false,
            has_started: false,
            started_at: None,
            stopped_at: None,
            status_message: String::new(),
            chunk_position: None,
        }
    }

    /// Derived lifecycle state.
    pub fn state(&self) -> TransferState {
        if self.failed {
            TransferState::Failed
        } else if self.cancelled {
            TransferState::Cancelled
        } else if self.copied_installer && self.copied_archive {
            TransferState::Done
        } else if !self.has_started {
            TransferState::Pending
        } else if !self.copied_installer {
            TransferState::UploadingInstaller
        } else {
            TransferState::UploadingArchive
        }
    }

    /// Check if no further step will change this transfer.
    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    /// Record that a step began.
    pub fn mark_started(&mut self) {
        if !self.has_started {
            self.has_started = true;
            self.started_at = Some(Utc::now());
        }
    }

    /// Record a successful installer copy.
    pub fn mark_installer_copied(&mut self) {
        self.copied_installer = true;
        self.progress = self.progress.max(INSTALLER_PROGRESS);
        self.failure_count = 0;
    }

    /// Record a successful archive chunk ending at `offset`.
    pub fn record_chunk(&mut self, offset: u64, file_size: u64) {
        self.archive_offset = offset.min(file_size);
        self.failure_count = 0;
        self.progress = progress_for(self.archive_offset, file_size);
    }

    /// Record that every archive byte is acknowledged.
    pub fn mark_archive_copied(&mut self, file_size: u64) {
        self.copied_archive = true;
        self.archive_offset = file_size;
        self.progress = 100;
        self.failure_count = 0;
        self.clear_resume_token();
        self.stopped_at = Some(Utc::now());
        self.status_message.clear();
    }

    /// Count a recoverable failure.
    pub fn record_failure(&mut self, message: impl Into<String>) {
        self.failure_count = self.failure_count.saturating_add(1);
        self.status_message = message.into();
    }

    /// Adopt the offset the storage reports. May move the cursor backwards
    /// but never past the end of the file.
    pub fn reconcile_offset(&mut self, remote_offset: u64, file_size: u64) {
        self.archive_offset = remote_offset.min(file_size);
        if self.copied_installer {
            self.progress = progress_for(self.archive_offset, file_size);
        }
    }

    /// Abandon the transfer.
    pub fn mark_failed(&mut self, message: impl Into<String>) {
        self.failed = true;
        self.status_message = message.into();
        self.stopped_at = Some(Utc::now());
    }

    /// Abandon the transfer because its package was cancelled.
    pub fn mark_cancelled(&mut self) {
        self.cancelled = true;
        self.status_message = "Cancelled".to_string();
        self.clear_resume_token();
        self.stopped_at = Some(Utc::now());
    }

    /// Start over from byte zero.
    pub fn reset(&mut self) {
        *self = Self::new(self.storage_id);
    }

    /// Decode the continuation fields for a storage of `kind`.
    pub fn resume_token(&self, kind: StorageKind) -> AppResult<ResumeToken> {
        if kind.is_s3_family() {
            if self.upload_id.is_empty() {
                return Ok(ResumeToken::None);
            }
            let parts = if self.data.is_empty() {
                Vec::new()
            } else {
                serde_json::from_str(&self.data).map_err(|e| {
                    AppError::with_source(
                        stowage_core::error::ErrorKind::Serialization,
                        "Corrupt multipart part list",
                        e,
                    )
                })?
            };
            return Ok(ResumeToken::Multipart {
                upload_id: self.upload_id.clone(),
                parts,
            });
        }

        match kind {
            StorageKind::Dropbox if !self.upload_id.is_empty() => Ok(ResumeToken::Session {
                session_id: self.upload_id.clone(),
            }),
            StorageKind::GDrive | StorageKind::OneDrive if !self.data.is_empty() => {
                let expires_at = if self.data2.is_empty() {
                    None
                } else {
                    Some(
                        DateTime::parse_from_rfc3339(&self.data2)
                            .map_err(|e| {
                                AppError::validation(format!("Corrupt session expiry: {e}"))
                            })?
                            .with_timezone(&Utc),
                    )
                };
                Ok(ResumeToken::ResumableUri {
                    uri: self.data.clone(),
                    expires_at,
                })
            }
            _ => Ok(ResumeToken::None),
        }
    }

    /// Encode a continuation token into the persisted fields.
    pub fn set_resume_token(&mut self, token: &ResumeToken) -> AppResult<()> {
        self.clear_resume_token();
        match token {
            ResumeToken::None => {}
            ResumeToken::Multipart { upload_id, parts } => {
                self.upload_id = upload_id.clone();
                self.data = serde_json::to_string(parts)?;
            }
            ResumeToken::Session { session_id } => {
                self.upload_id = session_id.clone();
            }
            ResumeToken::ResumableUri { uri, expires_at } => {
                self.data = uri.clone();
                self.data2 = expires_at.map(|t| t.to_rfc3339()).unwrap_or_default();
            }
        }
        Ok(())
    }

    /// Forget any server-side session.
    pub fn clear_resume_token(&mut self) {
        self.upload_id.clear();
        self.data.clear();
        self.data2.clear();
    }
}

/// `max(5, floor(100 * offset / size))`, clamped to 100.
pub fn progress_for(offset: u64, file_size: u64) -> u8 {
    if file_size == 0 {
        return 100;
    }
    let pct = (u128::from(offset) * 100 / u128::from(file_size)).min(100) as u8;
    pct.max(INSTALLER_PROGRESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions() {
        let mut info = UploadInfo::new(7);
        assert_eq!(info.state(), TransferState::Pending);
        info.mark_started();
        assert_eq!(info.state(), TransferState::UploadingInstaller);
        info.mark_installer_copied();
        assert_eq!(info.progress, 5);
        assert_eq!(info.state(), TransferState::UploadingArchive);
        info.mark_archive_copied(100);
        assert_eq!(info.state(), TransferState::Done);
        assert!(info.is_finished());
    }

    #[test]
    fn progress_floor_and_clamp() {
        assert_eq!(progress_for(0, 1000), 5);
        assert_eq!(progress_for(49, 1000), 5);
        assert_eq!(progress_for(499, 1000), 49);
        assert_eq!(progress_for(1000, 1000), 100);
        assert_eq!(progress_for(5000, 1000), 100);
        assert_eq!(progress_for(0, 0), 100);
    }

    #[test]
    fn successful_chunk_resets_failures_and_clamps_offset() {
        let mut info = UploadInfo::new(1);
        info.mark_installer_copied();
        info.record_failure("boom");
        info.record_failure("boom");
        assert_eq!(info.failure_count, 2);
        info.record_chunk(2_000, 1_000);
        assert_eq!(info.failure_count, 0);
        assert_eq!(info.archive_offset, 1_000);
    }

    #[test]
    fn failed_wins_over_done() {
        let mut info = UploadInfo::new(1);
        info.mark_installer_copied();
        info.mark_failed("installer rejected");
        assert_eq!(info.state(), TransferState::Failed);
    }

    #[test]
    fn multipart_token_round_trip() {
        let mut info = UploadInfo::new(1);
        let token = ResumeToken::Multipart {
            upload_id: "abc".into(),
            parts: vec![UploadedPart {
                part_number: 1,
                etag: "\"e1\"".into(),
            }],
        };
        info.set_resume_token(&token).unwrap();
        assert_eq!(info.upload_id, "abc");
        assert_eq!(info.resume_token(StorageKind::S3Compatible).unwrap(), token);
        // Other kinds do not read the multipart fields.
        assert!(info.resume_token(StorageKind::Ftp).unwrap().is_none());
    }

    #[test]
    fn resumable_uri_uses_data_fields() {
        let mut info = UploadInfo::new(1);
        let expires = DateTime::parse_from_rfc3339("2026-10-20T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let token = ResumeToken::ResumableUri {
            uri: "https://upload.example/session/1".into(),
            expires_at: Some(expires),
        };
        info.set_resume_token(&token).unwrap();
        assert!(info.upload_id.is_empty());
        assert_eq!(info.data, "https://upload.example/session/1");
        assert_eq!(info.resume_token(StorageKind::OneDrive).unwrap(), token);
    }

    #[test]
    fn corrupt_parts_are_an_error() {
        let mut info = UploadInfo::new(1);
        info.upload_id = "abc".into();
        info.data = "not json".into();
        assert!(info.resume_token(StorageKind::S3).is_err());
    }

    #[test]
    fn older_records_load_with_defaults() {
        let json = r#"{"storage_id":3,"copied_installer":true,"copied_archive":false,
            "archive_offset":1024,"upload_id":"","data":"","data2":"",
            "failure_count":0,"failed":false,"progress":5}"#;
        let info: UploadInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.archive_offset, 1024);
        assert!(!info.cancelled);
        assert!(info.chunk_position.is_none());
    }

    #[test]
    fn reset_keeps_storage() {
        let mut info = UploadInfo::new(9);
        info.mark_installer_copied();
        info.record_chunk(10, 20);
        info.reset();
        assert_eq!(info, UploadInfo::new(9));
    }
}
