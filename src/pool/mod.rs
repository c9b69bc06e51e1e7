//! Worker pool: dispatch, crash recovery and completion accounting.

pub mod orchestrator;
pub mod state;

pub use orchestrator::{FailedTask, Orchestrator, RunReport};
pub use state::{CompletionLedger, PoolPhase, SlotState, WorkerPoolState};
