//! Transfer worker for Stowage.
//!
//! This crate provides:
//! - One bounded worker invocation over a package's pending transfers
//! - Database leases so no two workers touch the same transfer at once
//! - Periodic maintenance jobs such as the stale multipart sweep
//! - A runner that polls pending packages and schedules the jobs

pub mod executor;
pub mod jobs;
pub mod locks;
pub mod runner;
pub mod transfer;

pub use locks::{TransferLease, TransferLocks};
pub use runner::WorkerRunner;
pub use transfer::{InvocationReport, TransferWorker};
