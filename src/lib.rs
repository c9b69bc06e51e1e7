// Core infrastructure modules
pub mod core;

// Pipeline stages
pub mod sweep;       // Task model, generation and the per-task kernel
pub mod storage;     // Locked, persistent result artifact
pub mod pool;        // Worker pool with crash recovery
pub mod provenance;  // Reproducibility metadata
pub mod runner;      // End-to-end sweep

// Re-exports for convenience
pub use core::config::{ArtifactPolicy, LockPolicy, RunConfig, RunConfigBuilder};
pub use core::errors::{GridError, Result};
pub use pool::{FailedTask, Orchestrator, RunReport};
pub use provenance::ProvenanceRecorder;
pub use runner::{run_sweep, SweepRequest};
pub use storage::{ResultStore, StoreHandle, StoreSnapshot};
pub use sweep::{
    generate_tasks, Coordinate, GridShape, MandelbrotKernel, PlanePoint, SweepRange, Task,
    TaskKernel, TaskParameters,
};
