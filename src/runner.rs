//! End-to-end sweep: generate, create the artifact, record provenance,
//! dispatch, record the end.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::core::config::{ArtifactPolicy, RunConfig};
use crate::core::errors::{GridError, Result};
use crate::pool::{Orchestrator, RunReport};
use crate::provenance::{ProvenanceRecorder, DEFAULT_NAMESPACE};
use crate::storage::ResultStore;
use crate::sweep::generator::generate_tasks;
use crate::sweep::kernel::TaskKernel;
use crate::sweep::model::{SweepRange, TaskParameters};

/// Everything that identifies one sweep
#[derive(Debug, Clone)]
pub struct SweepRequest {
    pub range: SweepRange,
    pub parameters: TaskParameters,
    pub output: PathBuf,
    /// Provenance namespace for inputs, checksums and the end time
    pub namespace: String,
}

impl SweepRequest {
    pub fn new(range: SweepRange, output: impl Into<PathBuf>) -> Self {
        Self {
            range,
            parameters: TaskParameters::default(),
            output: output.into(),
            namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }

    pub fn with_parameters(mut self, parameters: TaskParameters) -> Self {
        self.parameters = parameters;
        self
    }
}

/// Run a blocking store operation off the async runtime
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| GridError::internal(format!("blocking store task failed: {e}")))?
}

/// Run a full sweep and return its report.
///
/// The end time is only recorded once the pool reaches `Completed`; an
/// aborted run leaves the artifact marked aborted, with the results written
/// so far.
pub async fn run_sweep(
    request: SweepRequest,
    config: RunConfig,
    kernel: Arc<dyn TaskKernel>,
) -> Result<RunReport> {
    config.validate()?;
    let mut tasks = generate_tasks(&request.range, request.parameters)?;
    let shape = request.range.shape();

    let store = {
        let output = request.output.clone();
        let policy = config.artifact_policy;
        let lock = config.lock.clone();
        blocking(move || ResultStore::create(output, shape, policy, lock)).await?
    };

    if config.artifact_policy == ArtifactPolicy::Resume {
        let reader = store.clone();
        let unwritten: HashSet<_> = blocking(move || reader.open_for_write()?.unwritten_coordinates())
            .await?
            .into_iter()
            .collect();
        let before = tasks.len();
        tasks.retain(|task| unwritten.contains(&task.coordinate));
        info!(
            already_written = before - tasks.len(),
            remaining = tasks.len(),
            "Resuming sweep"
        );
    }

    let recorder = ProvenanceRecorder::new(store.clone(), request.namespace.clone());
    {
        let recorder = recorder.clone();
        let range = request.range;
        let parameters = request.parameters;
        let config = config.clone();
        blocking(move || recorder.record_start(&range, &parameters, &config)).await?;
    }

    info!(
        output = %request.output.display(),
        shape = %shape,
        run_id = %recorder.run_id(),
        tasks = tasks.len(),
        "Starting sweep"
    );
    let orchestrator = Orchestrator::new(config, store, kernel);

    match orchestrator.run(tasks).await {
        Ok(report) => {
            let end = recorder.clone();
            let summary = report.clone();
            blocking(move || end.record_end(&summary)).await?;
            Ok(report)
        }
        Err(err) => {
            let aborted = recorder.clone();
            let (err, marked) = tokio::task::spawn_blocking(move || {
                let marked = aborted.record_abort(&err);
                (err, marked)
            })
            .await
            .map_err(|e| GridError::internal(format!("blocking store task failed: {e}")))?;
            if let Err(e) = marked {
                warn!(error = %e, "Could not mark the artifact aborted");
            }
            warn!(
                category = err.category(),
                "Sweep did not complete; no end time recorded"
            );
            Err(err)
        }
    }
}
