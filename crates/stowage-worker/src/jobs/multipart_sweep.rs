//! Abort S3 multipart uploads that were never completed.
//!
//! A transfer that is requeued, cancelled or abandoned can leave parts on
//! the bucket that are billed until the upload is aborted.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use stowage_core::error::ErrorKind;
use stowage_storage::manager::StorageManager;

use crate::executor::{JobExecutionError, JobHandler};

/// Periodic stale multipart sweep over every S3-family storage.
#[derive(Debug)]
pub struct MultipartSweepJob {
    manager: Arc<StorageManager>,
    interval: Duration,
}

impl MultipartSweepJob {
    /// Create a new sweep job.
    pub fn new(manager: Arc<StorageManager>, interval: Duration) -> Self {
        Self { manager, interval }
    }
}

#[async_trait]
impl JobHandler for MultipartSweepJob {
    fn name(&self) -> &str {
        "multipart_sweep"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute(&self) -> Result<Value, JobExecutionError> {
        let aborted = self.manager.sweep_stale_multipart().await.map_err(|e| {
            if e.kind == ErrorKind::Database {
                JobExecutionError::Transient(format!("Storage list failed: {e}"))
            } else {
                JobExecutionError::Internal(e)
            }
        })?;
        Ok(json!({
            "task": "multipart_sweep",
            "aborted": aborted,
        }))
    }
}
