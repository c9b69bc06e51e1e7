// Core infrastructure shared by every stage of a sweep

pub mod config;
pub mod errors;

// Re-export commonly used types
pub use config::{ArtifactPolicy, LockPolicy, RunConfig, RunConfigBuilder};
pub use errors::{GridError, Result};
