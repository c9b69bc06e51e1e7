//! Storage layer for gridrun
//!
//! A result artifact is a sled database holding a dense grid of `f64`
//! results, a written mask and namespaced provenance annotations. Access is
//! serialized across threads and processes by an advisory lock sentinel.

pub mod lock;
pub mod result_store;

pub use lock::{LockSentinel, WriteLock};
pub use result_store::{
    ResultStore, StoreHandle, StoreSnapshot, ANNOTATIONS_NAMESPACE, ARRAY_NAME, FILL_VALUE,
};

/// Lifecycle status of a run, as recorded in the artifact's annotations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    /// Finished, but some tasks failed and were not retried
    Partial,
    Aborted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Partial => "partial",
            RunStatus::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_strings() {
        let rendered: Vec<String> = [
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Partial,
            RunStatus::Aborted,
        ]
        .iter()
        .map(|status| status.to_string())
        .collect();
        assert_eq!(rendered, ["running", "completed", "partial", "aborted"]);
    }
}
