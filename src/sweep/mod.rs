//! Task model, task generation and the per-task kernel.

pub mod generator;
pub mod kernel;
pub mod model;

pub use generator::{generate_tasks, linspace};
pub use kernel::{KernelError, MandelbrotKernel, TaskKernel, STABILITY_CUTOFF};
pub use model::{Coordinate, GridShape, PlanePoint, SweepRange, Task, TaskParameters, TaskResult};
