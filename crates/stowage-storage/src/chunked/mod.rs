//! Chunked local-copy engine.

pub mod copy;

pub use copy::{ChunkOutcome, CopyJob, copy_chunks, copy_range, read_range};
