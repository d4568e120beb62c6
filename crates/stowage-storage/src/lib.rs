//! # stowage-storage
//!
//! Chunked transfer clients for every supported backend (local folders,
//! the S3 family, Dropbox, Google Drive, OneDrive, FTP/FTPS and SFTP), the
//! per-(package, storage) transfer state machine, the chunked local-copy
//! engine, retention, and the storage type registry.

pub mod chunked;
pub mod client;
pub mod engine;
pub mod handle;
pub mod manager;
pub mod providers;
pub mod registry;
pub mod retention;

pub use client::{ChunkedTransferClient, TransferError, TransferResult};
pub use engine::{StepContext, StepOutcome};
pub use handle::{StorageHandle, TestLog};
pub use manager::StorageManager;
pub use registry::{ApiEndpoints, ClientContext, StorageRegistry};
