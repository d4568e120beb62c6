//! Built-in periodic jobs.

pub mod multipart_sweep;

pub use multipart_sweep::MultipartSweepJob;
