use std::fmt;

use crate::core::errors::{GridError, Result};
use crate::sweep::model::{Coordinate, GridShape, Task};

/// Lifecycle phase of the worker pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolPhase {
    Idle,
    Dispatching,
    /// Queue empty and no slot in flight; results are being verified
    Draining,
    /// A worker crashed; in-flight slots are finishing before a restart
    PoolBroken,
    Completed,
    Aborted,
}

impl PoolPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolPhase::Idle => "idle",
            PoolPhase::Dispatching => "dispatching",
            PoolPhase::Draining => "draining",
            PoolPhase::PoolBroken => "pool_broken",
            PoolPhase::Completed => "completed",
            PoolPhase::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PoolPhase::Completed | PoolPhase::Aborted)
    }

    pub fn can_transition_to(&self, next: PoolPhase) -> bool {
        use PoolPhase::*;
        matches!(
            (self, next),
            (Idle, Dispatching)
                | (Dispatching, Draining)
                | (Dispatching, PoolBroken)
                | (Draining, Completed)
                | (Draining, Dispatching)
                | (PoolBroken, Dispatching)
                | (Idle | Dispatching | Draining | PoolBroken, Aborted)
        )
    }
}

impl fmt::Display for PoolPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// In-memory state of the pool for the duration of one run
#[derive(Debug, Clone)]
pub struct WorkerPoolState {
    pub configured_workers: usize,
    pub outstanding_tasks: usize,
    pub restart_count: u32,
    /// Pool generation, bumped on every restart
    pub generation: u32,
    phase: PoolPhase,
}

impl WorkerPoolState {
    pub fn new(configured_workers: usize) -> Self {
        Self {
            configured_workers,
            outstanding_tasks: 0,
            restart_count: 0,
            generation: 0,
            phase: PoolPhase::Idle,
        }
    }

    pub fn phase(&self) -> PoolPhase {
        self.phase
    }

    pub fn transition(&mut self, next: PoolPhase) -> Result<()> {
        if self.phase.is_terminal() {
            return Err(GridError::internal(format!(
                "pool already {}; cannot move to {}",
                self.phase, next
            )));
        }
        if !self.phase.can_transition_to(next) {
            return Err(GridError::internal(format!(
                "illegal pool transition {} -> {}",
                self.phase, next
            )));
        }
        self.phase = next;
        Ok(())
    }

    /// Start a fresh pool generation after a crash or failed verification
    pub fn restart(&mut self) -> Result<()> {
        if !matches!(self.phase, PoolPhase::PoolBroken | PoolPhase::Draining) {
            return Err(GridError::internal(format!(
                "restart requested while pool is {}",
                self.phase
            )));
        }
        self.transition(PoolPhase::Dispatching)?;
        self.restart_count += 1;
        self.generation += 1;
        Ok(())
    }
}

/// Where a task stands in the run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Pending,
    InFlight,
    Committed,
    Failed,
}

#[derive(Debug, Clone)]
struct LedgerEntry {
    task: Task,
    state: SlotState,
}

/// Per-coordinate accounting of the tasks handed to one run.
///
/// Indexed by row-major slot. Slots outside the run (already written before
/// a resume) stay empty.
#[derive(Debug)]
pub struct CompletionLedger {
    shape: GridShape,
    slots: Vec<Option<LedgerEntry>>,
    total: usize,
}

impl CompletionLedger {
    pub fn new(shape: GridShape, tasks: Vec<Task>) -> Result<Self> {
        let mut slots = vec![None; shape.len()];
        let total = tasks.len();
        for task in tasks {
            let slot = shape.slot(task.coordinate).ok_or(GridError::OutOfBounds {
                coordinate: task.coordinate,
                shape,
            })?;
            if slots[slot].is_some() {
                return Err(GridError::internal(format!(
                    "duplicate task for coordinate {}",
                    task.coordinate
                )));
            }
            slots[slot] = Some(LedgerEntry {
                task,
                state: SlotState::Pending,
            });
        }
        Ok(Self {
            shape,
            slots,
            total,
        })
    }

    pub fn total(&self) -> usize {
        self.total
    }

    fn set(&mut self, coordinate: Coordinate, state: SlotState) -> Result<()> {
        let entry = self
            .shape
            .slot(coordinate)
            .and_then(|slot| self.slots[slot].as_mut())
            .ok_or_else(|| {
                GridError::internal(format!("no task tracked for coordinate {coordinate}"))
            })?;
        entry.state = state;
        Ok(())
    }

    pub fn mark_in_flight(&mut self, coordinate: Coordinate) -> Result<()> {
        self.set(coordinate, SlotState::InFlight)
    }

    pub fn mark_committed(&mut self, coordinate: Coordinate) -> Result<()> {
        self.set(coordinate, SlotState::Committed)
    }

    pub fn mark_failed(&mut self, coordinate: Coordinate) -> Result<()> {
        self.set(coordinate, SlotState::Failed)
    }

    /// Put a task back in line for the next generation
    pub fn reopen(&mut self, coordinate: Coordinate) -> Result<()> {
        self.set(coordinate, SlotState::Pending)
    }

    /// Return every in-flight task to pending; used once a generation has
    /// drained and nothing can still report for them.
    pub fn reclaim_in_flight(&mut self) -> usize {
        let mut reclaimed = 0;
        for entry in self.slots.iter_mut().flatten() {
            if entry.state == SlotState::InFlight {
                entry.state = SlotState::Pending;
                reclaimed += 1;
            }
        }
        reclaimed
    }

    fn with_state(&self, state: SlotState) -> impl Iterator<Item = &Task> + '_ {
        self.slots
            .iter()
            .flatten()
            .filter(move |entry| entry.state == state)
            .map(|entry| &entry.task)
    }

    /// Tasks still to run, in row-major order
    pub fn pending_tasks(&self) -> Vec<Task> {
        self.with_state(SlotState::Pending).cloned().collect()
    }

    pub fn committed_coordinates(&self) -> Vec<Coordinate> {
        self.with_state(SlotState::Committed)
            .map(|task| task.coordinate)
            .collect()
    }

    pub fn count(&self, state: SlotState) -> usize {
        self.with_state(state).count()
    }

    /// Tasks that are neither committed nor failed
    pub fn outstanding(&self) -> usize {
        self.total - self.count(SlotState::Committed) - self.count(SlotState::Failed)
    }

    /// Coordinates of this run with no committed result
    pub fn uncommitted_coordinates(&self) -> Vec<Coordinate> {
        self.slots
            .iter()
            .flatten()
            .filter(|entry| entry.state != SlotState::Committed)
            .map(|entry| entry.task.coordinate)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sweep::generator::generate_tasks;
    use crate::sweep::model::{SweepRange, TaskParameters};

    fn tasks(n: usize) -> Vec<Task> {
        let range = SweepRange {
            re_min: -2.0,
            re_max: 1.0,
            im_min: -1.0,
            im_max: 1.0,
            num_points: n,
        };
        generate_tasks(&range, TaskParameters::default()).unwrap()
    }

    #[test]
    fn test_phase_machine() {
        let mut state = WorkerPoolState::new(4);
        assert_eq!(state.phase(), PoolPhase::Idle);
        assert!(state.transition(PoolPhase::Completed).is_err());

        state.transition(PoolPhase::Dispatching).unwrap();
        state.transition(PoolPhase::PoolBroken).unwrap();
        state.restart().unwrap();
        assert_eq!(state.restart_count, 1);
        assert_eq!(state.generation, 1);

        state.transition(PoolPhase::Draining).unwrap();
        state.restart().unwrap();
        state.transition(PoolPhase::Draining).unwrap();
        state.transition(PoolPhase::Completed).unwrap();
        assert!(state.phase().is_terminal());
        assert!(state.transition(PoolPhase::Aborted).is_err());
        assert!(state.transition(PoolPhase::Dispatching).is_err());
    }

    #[test]
    fn test_restart_only_from_broken_or_draining() {
        let mut state = WorkerPoolState::new(1);
        assert!(state.restart().is_err());
        assert_eq!(state.restart_count, 0);

        state.transition(PoolPhase::Dispatching).unwrap();
        assert!(state.restart().is_err());
        assert_eq!(state.phase(), PoolPhase::Dispatching);
        assert_eq!(state.generation, 0);

        state.transition(PoolPhase::Aborted).unwrap();
        assert!(state.restart().is_err());
        assert_eq!(state.restart_count, 0);
    }

    #[test]
    fn test_ledger_accounting() {
        let mut ledger = CompletionLedger::new(GridShape::square(3), tasks(3)).unwrap();
        assert_eq!(ledger.total(), 9);
        assert_eq!(ledger.outstanding(), 9);

        ledger.mark_in_flight(Coordinate::new(0, 0)).unwrap();
        ledger.mark_in_flight(Coordinate::new(0, 1)).unwrap();
        ledger.mark_committed(Coordinate::new(0, 0)).unwrap();
        ledger.mark_failed(Coordinate::new(2, 2)).unwrap();
        assert_eq!(ledger.outstanding(), 7);

        assert_eq!(ledger.reclaim_in_flight(), 1);
        assert_eq!(ledger.count(SlotState::InFlight), 0);

        let pending = ledger.pending_tasks();
        assert_eq!(pending.len(), 7);
        assert_eq!(pending[0].coordinate, Coordinate::new(0, 1));
        assert_eq!(ledger.committed_coordinates(), vec![Coordinate::new(0, 0)]);
        assert_eq!(ledger.uncommitted_coordinates().len(), 8);
    }

    #[test]
    fn test_ledger_rejects_bad_tasks() {
        let mut all = tasks(2);
        all.push(all[0].clone());
        assert!(CompletionLedger::new(GridShape::square(2), all).is_err());

        assert!(matches!(
            CompletionLedger::new(GridShape::square(1), tasks(2)),
            Err(GridError::OutOfBounds { .. })
        ));

        let mut ledger = CompletionLedger::new(GridShape::square(3), Vec::new()).unwrap();
        assert!(ledger.mark_committed(Coordinate::new(0, 0)).is_err());
    }
}
