use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};
use tracing::{debug, info};
use uuid::Uuid;

use crate::core::config::RunConfig;
use crate::core::errors::{GridError, Result};
use crate::pool::RunReport;
use crate::provenance::checksums::source_checksums;
use crate::storage::{ResultStore, RunStatus, ANNOTATIONS_NAMESPACE};
use crate::sweep::model::{SweepRange, TaskParameters};

/// Namespace for the script-level annotations
pub const DEFAULT_NAMESPACE: &str = "custom_annotations";

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Writes reproducibility metadata into a result artifact.
///
/// All methods block on the store lock.
#[derive(Debug, Clone)]
pub struct ProvenanceRecorder {
    store: ResultStore,
    namespace: String,
    run_id: Uuid,
}

impl ProvenanceRecorder {
    pub fn new(store: ResultStore, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            run_id: Uuid::new_v4(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Record inputs, checksums and the start time. Must run before any task
    /// is dispatched.
    ///
    /// End-of-run entries left by an earlier run on the same artifact are
    /// cleared, so they only ever describe the current run.
    pub fn record_start(
        &self,
        range: &SweepRange,
        parameters: &TaskParameters,
        config: &RunConfig,
    ) -> Result<()> {
        let checksums = source_checksums();
        let mut handle = self.store.open_for_write()?;

        let mut cleared = 0;
        cleared += handle.remove_provenance("end_time", &self.namespace)? as usize;
        for key in ["run_summary", "abort_reason"] {
            cleared += handle.remove_provenance(key, ANNOTATIONS_NAMESPACE)? as usize;
        }
        if cleared > 0 {
            debug!(cleared, "Cleared end-of-run provenance from a previous run");
        }

        handle.write_provenance("script_input_parameters", range, &self.namespace)?;
        handle.write_provenance("script_checksums", &checksums, &self.namespace)?;

        handle.write_provenance("start_time", &now_rfc3339(), ANNOTATIONS_NAMESPACE)?;
        handle.write_provenance("run_id", &self.run_id.to_string(), ANNOTATIONS_NAMESPACE)?;
        handle.write_provenance("platform", &platform(), ANNOTATIONS_NAMESPACE)?;
        handle.write_provenance("run_config", config, ANNOTATIONS_NAMESPACE)?;
        handle.write_provenance("task_parameters", parameters, ANNOTATIONS_NAMESPACE)?;
        handle.write_provenance("run_status", RunStatus::Running.as_str(), ANNOTATIONS_NAMESPACE)?;
        handle.commit()?;

        info!(
            run_id = %self.run_id,
            namespace = %self.namespace,
            sources = checksums.len(),
            "Recorded run provenance"
        );
        Ok(())
    }

    /// Record the end time and a summary of a completed run.
    pub fn record_end(&self, report: &RunReport) -> Result<()> {
        let mut handle = self.store.open_for_write()?;
        handle.write_provenance("end_time", &now_rfc3339(), &self.namespace)?;
        handle.write_provenance("run_summary", &run_summary(report), ANNOTATIONS_NAMESPACE)?;
        handle.write_provenance("run_status", report.status().as_str(), ANNOTATIONS_NAMESPACE)?;
        handle.commit()?;
        debug!(run_id = %self.run_id, status = %report.status(), "Recorded run end");
        Ok(())
    }

    /// Mark the run aborted. No end time is written.
    pub fn record_abort(&self, error: &GridError) -> Result<()> {
        let mut handle = self.store.open_for_write()?;
        handle.write_provenance("run_status", RunStatus::Aborted.as_str(), ANNOTATIONS_NAMESPACE)?;
        handle.write_provenance(
            "abort_reason",
            &json!({
                "category": error.category(),
                "message": error.to_string(),
                "unwritten": error.unwritten().len(),
            }),
            ANNOTATIONS_NAMESPACE,
        )?;
        handle.commit()
    }
}

fn platform() -> Value {
    json!({
        "os": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "family": std::env::consts::FAMILY,
        "crate": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    })
}

fn run_summary(report: &RunReport) -> Value {
    let failed: Vec<Value> = report
        .failed
        .iter()
        .map(|f| {
            json!({
                "coordinate": [f.coordinate.row, f.coordinate.col],
                "message": f.message,
            })
        })
        .collect();
    json!({
        "status": report.status().as_str(),
        "total_tasks": report.total_tasks,
        "completed": report.completed,
        "failed": failed,
        "restarts": report.restarts,
        "elapsed_ms": report.elapsed.as_millis() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{ArtifactPolicy, LockPolicy};
    use crate::pool::FailedTask;
    use crate::sweep::model::{Coordinate, GridShape};
    use std::time::Duration;

    fn range() -> SweepRange {
        SweepRange {
            re_min: -2.0,
            re_max: 1.0,
            im_min: -1.0,
            im_max: 1.0,
            num_points: 2,
        }
    }

    fn store(dir: &tempfile::TempDir) -> ResultStore {
        ResultStore::create(
            dir.path().join("grid.db"),
            GridShape::square(2),
            ArtifactPolicy::Fail,
            LockPolicy::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_start_then_end() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let recorder = ProvenanceRecorder::new(store.clone(), DEFAULT_NAMESPACE);

        recorder
            .record_start(&range(), &TaskParameters::default(), &RunConfig::development())
            .unwrap();
        let snapshot = store.snapshot().unwrap();
        assert_eq!(
            snapshot.provenance(DEFAULT_NAMESPACE, "script_input_parameters"),
            Some(&json!({
                "re_min": -2.0, "re_max": 1.0, "im_min": -1.0, "im_max": 1.0, "num_points": 2
            }))
        );
        assert!(snapshot.provenance(DEFAULT_NAMESPACE, "end_time").is_none());
        assert_eq!(
            snapshot.provenance(ANNOTATIONS_NAMESPACE, "run_id"),
            Some(&json!(recorder.run_id().to_string()))
        );
        assert_eq!(
            snapshot.provenance(ANNOTATIONS_NAMESPACE, "run_status"),
            Some(&json!("running"))
        );

        let report = RunReport {
            total_tasks: 4,
            completed: 3,
            failed: vec![FailedTask {
                coordinate: Coordinate::new(1, 0),
                message: "diverged".into(),
            }],
            restarts: 1,
            elapsed: Duration::from_millis(12),
        };
        recorder.record_end(&report).unwrap();

        let snapshot = store.snapshot().unwrap();
        let end = snapshot
            .provenance(DEFAULT_NAMESPACE, "end_time")
            .and_then(Value::as_str)
            .unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(end).is_ok());
        let summary = snapshot.provenance(ANNOTATIONS_NAMESPACE, "run_summary").unwrap();
        assert_eq!(summary["status"], "partial");
        assert_eq!(summary["failed"][0]["coordinate"], json!([1, 0]));
        assert_eq!(summary["restarts"], 1);
    }

    #[test]
    fn test_abort_leaves_no_end_time() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let recorder = ProvenanceRecorder::new(store.clone(), "custom");

        let err = GridError::PoolExhausted {
            restarts: 2,
            max_restarts: 2,
            unwritten: vec![Coordinate::new(0, 0)],
        };
        recorder.record_abort(&err).unwrap();

        let snapshot = store.snapshot().unwrap();
        assert!(snapshot.provenance("custom", "end_time").is_none());
        assert_eq!(
            snapshot.provenance(ANNOTATIONS_NAMESPACE, "run_status"),
            Some(&json!("aborted"))
        );
        assert_eq!(
            snapshot.provenance(ANNOTATIONS_NAMESPACE, "abort_reason").unwrap()["category"],
            "pool"
        );
    }

    #[test]
    fn test_restart_clears_previous_run_end() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let first = ProvenanceRecorder::new(store.clone(), DEFAULT_NAMESPACE);
        first
            .record_start(&range(), &TaskParameters::default(), &RunConfig::development())
            .unwrap();
        first
            .record_end(&RunReport {
                total_tasks: 4,
                completed: 4,
                failed: Vec::new(),
                restarts: 0,
                elapsed: Duration::from_millis(3),
            })
            .unwrap();
        first
            .record_abort(&GridError::internal("left over"))
            .unwrap();

        let second = ProvenanceRecorder::new(store.clone(), DEFAULT_NAMESPACE);
        second
            .record_start(&range(), &TaskParameters::default(), &RunConfig::development())
            .unwrap();

        let snapshot = store.snapshot().unwrap();
        assert!(snapshot.provenance(DEFAULT_NAMESPACE, "end_time").is_none());
        assert!(snapshot.provenance(ANNOTATIONS_NAMESPACE, "run_summary").is_none());
        assert!(snapshot.provenance(ANNOTATIONS_NAMESPACE, "abort_reason").is_none());
        assert_eq!(
            snapshot.provenance(ANNOTATIONS_NAMESPACE, "run_id"),
            Some(&json!(second.run_id().to_string()))
        );
    }
}
