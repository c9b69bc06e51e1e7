//! Reproducibility metadata stored alongside the results.

pub mod checksums;
pub mod recorder;

pub use checksums::{sha256_bytes, sha256_file, source_checksums, EXECUTABLE_KEY};
pub use recorder::{ProvenanceRecorder, DEFAULT_NAMESPACE};
