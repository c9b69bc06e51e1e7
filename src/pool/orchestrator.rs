//! Fixed-size worker pool that runs every task once, writes its result into
//! the store, and recovers from worker crashes by restarting the pool.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::core::config::RunConfig;
use crate::core::errors::{GridError, Result};
use crate::pool::state::{CompletionLedger, PoolPhase, SlotState, WorkerPoolState};
use crate::storage::{ResultStore, RunStatus};
use crate::sweep::kernel::{KernelError, TaskKernel};
use crate::sweep::model::{Coordinate, Task, TaskResult};

/// A task whose error was logged instead of aborting the run
#[derive(Debug, Clone, PartialEq)]
pub struct FailedTask {
    pub coordinate: Coordinate,
    pub message: String,
}

/// Outcome of a run that reached `Completed`
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub total_tasks: usize,
    pub completed: usize,
    pub failed: Vec<FailedTask>,
    pub restarts: u32,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.completed == self.total_tasks
    }

    pub fn status(&self) -> RunStatus {
        if self.is_complete() {
            RunStatus::Completed
        } else {
            RunStatus::Partial
        }
    }

    pub fn failed_coordinates(&self) -> Vec<Coordinate> {
        self.failed.iter().map(|f| f.coordinate).collect()
    }
}

/// What a worker slot reports back to the supervisor
#[derive(Debug)]
enum WorkerOutcome {
    Committed(TaskResult),
    TaskFailed {
        coordinate: Coordinate,
        error: KernelError,
    },
    StoreFailed {
        coordinate: Coordinate,
        error: GridError,
    },
    Crashed {
        coordinate: Coordinate,
        message: String,
    },
}

/// How one pool generation ended
enum GenerationEnd {
    /// Queue empty and every slot reported
    Drained,
    /// At least one worker crashed
    Broken,
    Aborted(GridError),
}

pub struct Orchestrator {
    config: RunConfig,
    store: ResultStore,
    kernel: Arc<dyn TaskKernel>,
}

impl Orchestrator {
    pub fn new(config: RunConfig, store: ResultStore, kernel: Arc<dyn TaskKernel>) -> Self {
        Self {
            config,
            store,
            kernel,
        }
    }

    /// Run every task to a durable result.
    ///
    /// Returns a report once all tasks are committed (or failed with errors
    /// suppressed). Aborts with `PoolExhausted` when crashes outlast
    /// `max_pool_restarts`, with `TaskComputation` on an escalated task
    /// error, and with the store's error if a write fails.
    pub async fn run(&self, tasks: Vec<Task>) -> Result<RunReport> {
        self.config.validate()?;
        let started = Instant::now();
        let mut ledger = CompletionLedger::new(self.store.shape(), tasks)?;
        let mut state = WorkerPoolState::new(self.config.workers);
        let mut progress = Progress::new(ledger.total());
        let mut failed = Vec::new();

        info!(
            tasks = ledger.total(),
            workers = self.config.workers,
            kernel = self.kernel.name(),
            "Dispatching tasks"
        );
        state.transition(PoolPhase::Dispatching)?;

        loop {
            state.outstanding_tasks = ledger.outstanding();
            let end = self
                .run_generation(&mut ledger, &mut state, &mut progress, &mut failed)
                .await;

            match end {
                GenerationEnd::Aborted(err) => {
                    state.transition(PoolPhase::Aborted)?;
                    let err = err.with_unwritten(ledger.uncommitted_coordinates());
                    error!(
                        category = err.category(),
                        error = %err,
                        unwritten = err.unwritten().len(),
                        "Run aborted"
                    );
                    return Err(err);
                }
                GenerationEnd::Broken => {
                    let reclaimed = ledger.reclaim_in_flight();
                    if state.restart_count >= self.config.max_pool_restarts {
                        state.transition(PoolPhase::Aborted)?;
                        let unwritten = ledger.uncommitted_coordinates();
                        error!(
                            restart_count = state.restart_count,
                            unwritten = unwritten.len(),
                            "Worker pool restarts exhausted"
                        );
                        return Err(GridError::PoolExhausted {
                            restarts: state.restart_count,
                            max_restarts: self.config.max_pool_restarts,
                            unwritten,
                        });
                    }
                    state.restart()?;
                    warn!(
                        generation = state.generation,
                        restart_count = state.restart_count,
                        reclaimed,
                        resubmitted = ledger.count(SlotState::Pending),
                        "Restarting worker pool"
                    );
                }
                GenerationEnd::Drained => {
                    state.transition(PoolPhase::Draining)?;
                    let missing = match self.verify_durable(&ledger).await {
                        Ok(missing) => missing,
                        Err(err) => {
                            state.transition(PoolPhase::Aborted)?;
                            return Err(err);
                        }
                    };
                    if missing.is_empty() {
                        state.transition(PoolPhase::Completed)?;
                        break;
                    }

                    warn!(
                        missing = missing.len(),
                        "Committed results are not durable in the store"
                    );
                    if state.restart_count >= self.config.max_pool_restarts {
                        state.transition(PoolPhase::Aborted)?;
                        return Err(GridError::PartialCompletion { unwritten: missing });
                    }
                    for coordinate in &missing {
                        ledger.reopen(*coordinate)?;
                    }
                    progress.retract(missing.len());
                    state.restart()?;
                }
            }
        }

        let report = RunReport {
            total_tasks: ledger.total(),
            completed: ledger.count(SlotState::Committed),
            failed,
            restarts: state.restart_count,
            elapsed: started.elapsed(),
        };
        info!(
            completed = report.completed,
            failed = report.failed.len(),
            restarts = report.restarts,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Run completed"
        );
        Ok(report)
    }

    /// Dispatch pending tasks until the queue drains, a worker crashes, or
    /// the run must abort. In-flight slots always report before returning.
    async fn run_generation(
        &self,
        ledger: &mut CompletionLedger,
        state: &mut WorkerPoolState,
        progress: &mut Progress,
        failed: &mut Vec<FailedTask>,
    ) -> GenerationEnd {
        let mut queue: VecDeque<Task> = ledger.pending_tasks().into();
        let mut in_flight = JoinSet::new();
        let mut broken = false;
        let mut abort: Option<GridError> = None;

        debug!(
            generation = state.generation,
            queued = queue.len(),
            "Starting pool generation"
        );

        loop {
            while !broken && abort.is_none() && in_flight.len() < self.config.workers {
                let Some(task) = queue.pop_front() else {
                    break;
                };
                if let Err(err) = ledger.mark_in_flight(task.coordinate) {
                    abort = Some(err);
                    break;
                }
                let kernel = Arc::clone(&self.kernel);
                let store = self.store.clone();
                in_flight.spawn_blocking(move || execute_task(task, kernel.as_ref(), &store));
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };

            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(join_err) => {
                    // The slot's coordinate stays in flight and is reclaimed
                    // when the generation ends.
                    warn!(generation = state.generation, error = %join_err, "Worker slot lost");
                    if !broken {
                        broken = true;
                        if let Err(err) = state.transition(PoolPhase::PoolBroken) {
                            abort.get_or_insert(err);
                        }
                    }
                    continue;
                }
            };

            let recorded = match outcome {
                WorkerOutcome::Committed(result) => {
                    progress.advance();
                    ledger.mark_committed(result.coordinate)
                }
                WorkerOutcome::TaskFailed { coordinate, error } => {
                    if self.config.re_raise_exceptions {
                        abort.get_or_insert(GridError::task(coordinate, error.to_string()));
                        ledger.mark_failed(coordinate)
                    } else {
                        warn!(coordinate = %coordinate, error = %error, "Task failed; continuing");
                        failed.push(FailedTask {
                            coordinate,
                            message: error.to_string(),
                        });
                        progress.advance();
                        ledger.mark_failed(coordinate)
                    }
                }
                WorkerOutcome::StoreFailed { coordinate, error } => {
                    error!(coordinate = %coordinate, error = %error, "Failed to store result");
                    abort.get_or_insert(error);
                    ledger.reopen(coordinate)
                }
                WorkerOutcome::Crashed {
                    coordinate,
                    message,
                } => {
                    warn!(
                        coordinate = %coordinate,
                        generation = state.generation,
                        panic = %message,
                        "Worker crashed"
                    );
                    if !broken {
                        broken = true;
                        if let Err(err) = state.transition(PoolPhase::PoolBroken) {
                            abort.get_or_insert(err);
                        }
                    }
                    ledger.reopen(coordinate)
                }
            };
            if let Err(err) = recorded {
                abort.get_or_insert(err);
            }
            state.outstanding_tasks = ledger.outstanding();
        }

        match (abort, broken) {
            (Some(err), _) => GenerationEnd::Aborted(err),
            (None, true) => GenerationEnd::Broken,
            (None, false) => GenerationEnd::Drained,
        }
    }

    /// Coordinates credited as committed that the store does not show written
    async fn verify_durable(&self, ledger: &CompletionLedger) -> Result<Vec<Coordinate>> {
        let committed = ledger.committed_coordinates();
        if committed.is_empty() {
            return Ok(Vec::new());
        }
        let store = self.store.clone();
        let mask = tokio::task::spawn_blocking(move || store.open_for_write()?.written_mask())
            .await
            .map_err(|e| GridError::internal(format!("verification task failed: {e}")))??;

        let shape = self.store.shape();
        Ok(committed
            .into_iter()
            .filter(|c| !shape.slot(*c).is_some_and(|slot| mask[slot]))
            .collect())
    }
}

/// Body of one worker slot: compute, write, commit.
fn execute_task(task: Task, kernel: &dyn TaskKernel, store: &ResultStore) -> WorkerOutcome {
    let coordinate = task.coordinate;
    let computed = panic::catch_unwind(AssertUnwindSafe(|| kernel.compute(&task)));
    let value = match computed {
        Ok(Ok(value)) => value,
        Ok(Err(error)) => return WorkerOutcome::TaskFailed { coordinate, error },
        Err(payload) => {
            return WorkerOutcome::Crashed {
                coordinate,
                message: panic_message(payload.as_ref()),
            }
        }
    };

    let persisted = panic::catch_unwind(AssertUnwindSafe(|| -> Result<()> {
        let mut handle = store.open_for_write()?;
        handle.write_cell(coordinate, value)?;
        handle.commit()
    }));
    match persisted {
        Ok(Ok(())) => WorkerOutcome::Committed(TaskResult { coordinate, value }),
        Ok(Err(error)) => WorkerOutcome::StoreFailed { coordinate, error },
        Err(payload) => WorkerOutcome::Crashed {
            coordinate,
            message: panic_message(payload.as_ref()),
        },
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

/// Logs progress at every 10% of finished tasks
struct Progress {
    total: usize,
    done: usize,
    last_decile: usize,
}

impl Progress {
    fn new(total: usize) -> Self {
        Self {
            total,
            done: 0,
            last_decile: 0,
        }
    }

    fn advance(&mut self) {
        self.done += 1;
        if self.total == 0 {
            return;
        }
        let decile = self.done * 10 / self.total;
        if decile > self.last_decile {
            self.last_decile = decile;
            info!(
                done = self.done,
                total = self.total,
                "Progress: {}%",
                decile * 10
            );
        }
    }

    fn retract(&mut self, count: usize) {
        self.done = self.done.saturating_sub(count);
    }
}
