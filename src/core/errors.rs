use std::path::PathBuf;
use thiserror::Error;

use crate::sweep::model::{Coordinate, GridShape};

/// Unified error type for the whole sweep pipeline
#[derive(Debug, Error)]
pub enum GridError {
    /// A range parameter has `max <= min` or a non-finite bound
    #[error("Invalid range for {axis} axis: min={min}, max={max} (max must be greater than min)")]
    InvalidRange { axis: String, min: f64, max: f64 },

    /// Grid size below one point per axis, or too large to enumerate
    #[error("Invalid grid size: num_points={num_points} (must be at least 1 and num_points^2 must fit in memory)")]
    InvalidSize { num_points: usize },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    #[error("Result store already exists at {}", .path.display())]
    StoreAlreadyExists { path: PathBuf },

    #[error("Result store not found at {}", .path.display())]
    StoreNotFound { path: PathBuf },

    #[error("Timed out acquiring write lock on {} after {attempts} attempts ({waited_ms}ms)", .path.display())]
    StoreLockTimeout {
        path: PathBuf,
        attempts: u32,
        waited_ms: u64,
    },

    #[error("Coordinate {coordinate} is outside grid of shape {shape}")]
    OutOfBounds {
        coordinate: Coordinate,
        shape: GridShape,
    },

    /// Fatal: the artifact on disk cannot be trusted
    #[error("Result store at {} is corrupted: {message}", .path.display())]
    StoreCorrupted { path: PathBuf, message: String },

    /// Database/persistence errors
    #[error("Database operation failed: {operation}")]
    Database {
        operation: String,
        #[source]
        source: sled::Error,
    },

    /// IO errors
    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Serialization errors
    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A task's computation failed and the run escalates it.
    ///
    /// `unwritten` starts as the failed coordinate; an aborting run replaces
    /// it with every coordinate it left uncommitted.
    #[error("Task at coordinate {coordinate} failed: {message}")]
    TaskComputation {
        coordinate: Coordinate,
        message: String,
        unwritten: Vec<Coordinate>,
    },

    #[error("Worker pool broke {restarts} times (max_pool_restarts={max_restarts}); {} coordinate(s) unwritten", .unwritten.len())]
    PoolExhausted {
        restarts: u32,
        max_restarts: u32,
        unwritten: Vec<Coordinate>,
    },

    #[error("Run drained with {} unwritten coordinate(s): {}", .unwritten.len(), format_coordinates(.unwritten))]
    PartialCompletion { unwritten: Vec<Coordinate> },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl GridError {
    pub fn invalid_range<S: Into<String>>(axis: S, min: f64, max: f64) -> Self {
        Self::InvalidRange {
            axis: axis.into(),
            min,
            max,
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    /// Create a configuration error naming the offending field
    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn corrupted<P: Into<PathBuf>, S: Into<String>>(path: P, message: S) -> Self {
        Self::StoreCorrupted {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a database error
    pub fn database<S: Into<String>>(operation: S, source: sled::Error) -> Self {
        Self::Database {
            operation: operation.into(),
            source,
        }
    }

    /// Create an IO error
    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Create a serialization error
    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    pub fn task<M: Into<String>>(coordinate: Coordinate, message: M) -> Self {
        Self::TaskComputation {
            coordinate,
            message: message.into(),
            unwritten: vec![coordinate],
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::InvalidRange { .. } | Self::InvalidSize { .. } => "validation",
            Self::Configuration { .. } => "configuration",
            Self::StoreAlreadyExists { .. }
            | Self::StoreNotFound { .. }
            | Self::StoreLockTimeout { .. }
            | Self::OutOfBounds { .. }
            | Self::StoreCorrupted { .. }
            | Self::Database { .. } => "storage",
            Self::Io { .. } => "io",
            Self::Serialization { .. } => "serialization",
            Self::TaskComputation { .. } => "task",
            Self::PoolExhausted { .. } => "pool",
            Self::PartialCompletion { .. } => "partial",
            Self::Internal { .. } => "internal",
        }
    }

    /// Process exit code reported by the CLI
    pub fn exit_code(&self) -> i32 {
        match self.category() {
            "validation" | "configuration" => 2,
            "storage" | "io" | "serialization" => 3,
            "task" => 4,
            "pool" => 5,
            "partial" => 6,
            _ => 1,
        }
    }

    /// Coordinates a rerun would need to cover, if the error carries them
    pub fn unwritten(&self) -> &[Coordinate] {
        match self {
            Self::PoolExhausted { unwritten, .. }
            | Self::PartialCompletion { unwritten }
            | Self::TaskComputation { unwritten, .. } => unwritten,
            _ => &[],
        }
    }

    /// Replace the unwritten list of a task error with what the run left behind
    pub fn with_unwritten(mut self, remaining: Vec<Coordinate>) -> Self {
        if let Self::TaskComputation { unwritten, .. } = &mut self {
            *unwritten = remaining;
        }
        self
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, GridError>;

impl From<std::io::Error> for GridError {
    fn from(err: std::io::Error) -> Self {
        Self::io("io_operation", err)
    }
}

impl From<serde_json::Error> for GridError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<bincode::Error> for GridError {
    fn from(err: bincode::Error) -> Self {
        Self::serialization("bincode", err)
    }
}

impl From<sled::Error> for GridError {
    fn from(err: sled::Error) -> Self {
        Self::database("sled_operation", err)
    }
}

/// Render at most a handful of coordinates for one-line messages.
pub fn format_coordinates(coordinates: &[Coordinate]) -> String {
    const SHOWN: usize = 8;
    let mut out: Vec<String> = coordinates
        .iter()
        .take(SHOWN)
        .map(|c| c.to_string())
        .collect();
    if coordinates.len() > SHOWN {
        out.push(format!("... (+{} more)", coordinates.len() - SHOWN));
    }
    out.join(", ")
}
