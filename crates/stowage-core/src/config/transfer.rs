//! Transfer engine tuning knobs.
//!
//! These values are read once per worker invocation and handed to the
//! transfer engine and the protocol clients explicitly. Nothing reads them
//! from a process-wide singleton.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Minimum part size S3 accepts for every part but the last.
pub const S3_MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Google Drive resumable chunks must be multiples of 256 KiB.
pub const GDRIVE_CHUNK_QUANTUM: u64 = 256 * 1024;

/// OneDrive upload-session fragments must be multiples of 320 KiB.
pub const ONEDRIVE_CHUNK_QUANTUM: u64 = 320 * 1024;

/// Transfer tuning configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Time slice a single worker invocation may spend transferring.
    #[serde(default = "default_max_worker_time")]
    pub max_worker_time_seconds: u64,
    /// Sleep inserted between chunks, in microseconds. Zero disables throttling.
    #[serde(default)]
    pub throttle_delay_us: u64,
    /// Consecutive failures tolerated before the worker marks a transfer failed.
    #[serde(default = "default_max_retries")]
    pub max_storage_retries: u32,
    /// Chunk size for same-filesystem copies.
    #[serde(default = "default_two_mib")]
    pub local_chunk_size_bytes: u64,
    /// S3 multipart part size.
    #[serde(default = "default_s3_part_size")]
    pub s3_part_size_bytes: u64,
    /// Dropbox upload-session append size.
    #[serde(default = "default_two_mib")]
    pub dropbox_chunk_size_bytes: u64,
    /// Google Drive resumable chunk size.
    #[serde(default = "default_gdrive_chunk")]
    pub gdrive_chunk_size_bytes: u64,
    /// OneDrive upload-session fragment size.
    #[serde(default = "default_onedrive_chunk")]
    pub onedrive_chunk_size_bytes: u64,
    /// FTP append size.
    #[serde(default = "default_two_mib")]
    pub ftp_chunk_size_bytes: u64,
    /// SFTP write size.
    #[serde(default = "default_two_mib")]
    pub sftp_chunk_size_bytes: u64,
    /// Per-request timeout for HTTP based providers.
    #[serde(default = "default_http_timeout")]
    pub http_timeout_seconds: u64,
    /// Age after which an unfinished S3 multipart upload is aborted by the sweep.
    #[serde(default = "default_stale_hours")]
    pub stale_multipart_hours: u64,
    /// Verify TLS certificates of remote providers.
    #[serde(default = "default_true")]
    pub verify_tls: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_worker_time_seconds: default_max_worker_time(),
            throttle_delay_us: 0,
            max_storage_retries: default_max_retries(),
            local_chunk_size_bytes: default_two_mib(),
            s3_part_size_bytes: default_s3_part_size(),
            dropbox_chunk_size_bytes: default_two_mib(),
            gdrive_chunk_size_bytes: default_gdrive_chunk(),
            onedrive_chunk_size_bytes: default_onedrive_chunk(),
            ftp_chunk_size_bytes: default_two_mib(),
            sftp_chunk_size_bytes: default_two_mib(),
            http_timeout_seconds: default_http_timeout(),
            stale_multipart_hours: default_stale_hours(),
            verify_tls: true,
        }
    }
}

impl TransferConfig {
    /// The per-invocation time slice.
    pub fn worker_time(&self) -> Duration {
        Duration::from_secs(self.max_worker_time_seconds)
    }

    /// The inter-chunk throttle sleep.
    pub fn throttle(&self) -> Duration {
        Duration::from_micros(self.throttle_delay_us)
    }

    /// The HTTP request timeout.
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_seconds)
    }

    /// How long a transfer lease lives: one slice plus one request that
    /// started just before the slice ran out.
    pub fn lease_ttl(&self) -> Duration {
        self.worker_time() + self.http_timeout()
    }

    /// S3 part size, raised to the protocol minimum.
    pub fn s3_part_size(&self) -> u64 {
        self.s3_part_size_bytes.max(S3_MIN_PART_SIZE)
    }

    /// Google Drive chunk size, rounded down to the 256 KiB quantum.
    pub fn gdrive_chunk_size(&self) -> u64 {
        round_to_quantum(self.gdrive_chunk_size_bytes, GDRIVE_CHUNK_QUANTUM)
    }

    /// OneDrive fragment size, rounded down to the 320 KiB quantum.
    pub fn onedrive_chunk_size(&self) -> u64 {
        round_to_quantum(self.onedrive_chunk_size_bytes, ONEDRIVE_CHUNK_QUANTUM)
    }
}

fn round_to_quantum(size: u64, quantum: u64) -> u64 {
    ((size / quantum).max(1)) * quantum
}

fn default_max_worker_time() -> u64 {
    18
}

fn default_max_retries() -> u32 {
    10
}

fn default_two_mib() -> u64 {
    2 * 1024 * 1024
}

fn default_s3_part_size() -> u64 {
    6 * 1024 * 1024
}

fn default_gdrive_chunk() -> u64 {
    2 * 1024 * 1024
}

fn default_onedrive_chunk() -> u64 {
    10 * ONEDRIVE_CHUNK_QUANTUM
}

fn default_http_timeout() -> u64 {
    60
}

fn default_stale_hours() -> u64 {
    48
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_sizes_respect_protocol_quanta() {
        let config = TransferConfig {
            s3_part_size_bytes: 1024,
            gdrive_chunk_size_bytes: 300 * 1024,
            onedrive_chunk_size_bytes: 100,
            ..TransferConfig::default()
        };
        assert_eq!(config.s3_part_size(), S3_MIN_PART_SIZE);
        assert_eq!(config.gdrive_chunk_size(), GDRIVE_CHUNK_QUANTUM);
        assert_eq!(config.onedrive_chunk_size(), ONEDRIVE_CHUNK_QUANTUM);
    }
}
