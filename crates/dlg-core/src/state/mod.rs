use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use dlg_model::{Task, TaskId};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validating,
    Executing,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Validating => "validating",
            Stage::Executing => "executing",
        })
    }
}

/// Outcome of [`InFlight::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Inserted; the ticket identifies this particular admission.
    Admitted(u64),
    /// The id is already tracked in the given stage.
    Duplicate(Stage),
    /// The admission gate refused the task.
    Closed,
}

#[derive(Debug, Clone)]
pub struct InFlightRecord {
    pub task: Arc<Task>,
    pub cancel: CancellationToken,
    pub ticket: u64,
    pub since: Instant,
    reporting: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InFlightCounts {
    pub validating: usize,
    pub executing: usize,
}

/// Tasks currently being validated or executed by this delegate.
///
/// Both maps live behind one lock so that membership checks across them are atomic.
#[derive(Clone, Default)]
pub struct InFlight {
    inner: Arc<RwLock<InFlightInner>>,
    tickets: Arc<AtomicU64>,
}

#[derive(Default)]
struct InFlightInner {
    validating: HashMap<TaskId, InFlightRecord>,
    executing: HashMap<TaskId, InFlightRecord>,
}

impl InFlightInner {
    fn stage_of(&self, id: &TaskId) -> Option<Stage> {
        if self.executing.contains_key(id) {
            Some(Stage::Executing)
        } else if self.validating.contains_key(id) {
            Some(Stage::Validating)
        } else {
            None
        }
    }

    fn map(&mut self, stage: Stage) -> &mut HashMap<TaskId, InFlightRecord> {
        match stage {
            Stage::Validating => &mut self.validating,
            Stage::Executing => &mut self.executing,
        }
    }
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, InFlightInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, InFlightInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a task into `stage` unless the id is already in flight anywhere.
    ///
    /// `gate` is evaluated under the table lock, so a gate that observes a
    /// lifecycle flag cannot race with a drain that waits for the table to empty.
    /// A validated task has to leave the validating stage before it can execute.
    pub fn admit<G>(
        &self,
        stage: Stage,
        task: Arc<Task>,
        cancel: CancellationToken,
        gate: G,
    ) -> Admission
    where
        G: FnOnce() -> bool,
    {
        let mut inner = self.write();

        if let Some(current) = inner.stage_of(&task.id) {
            return Admission::Duplicate(current);
        }
        if !gate() {
            return Admission::Closed;
        }

        let ticket = self.tickets.fetch_add(1, Ordering::Relaxed) + 1;
        let id = task.id.clone();
        inner.map(stage).insert(
            id,
            InFlightRecord {
                task,
                cancel,
                ticket,
                since: Instant::now(),
                reporting: false,
            },
        );
        Admission::Admitted(ticket)
    }

    pub fn stage_of(&self, id: &TaskId) -> Option<Stage> {
        self.read().stage_of(id)
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.stage_of(id).is_some()
    }

    /// Leave the validating stage. `None` if the record was aborted meanwhile.
    pub fn finish_validation(&self, id: &TaskId, ticket: u64) -> Option<InFlightRecord> {
        let mut inner = self.write();
        match inner.validating.get(id) {
            Some(rec) if rec.ticket == ticket => inner.validating.remove(id),
            _ => None,
        }
    }

    /// Claim the right to report an executing task's outcome.
    ///
    /// Fails once the task was aborted; an abort after a successful claim
    /// no longer suppresses the report.
    pub fn begin_report(&self, id: &TaskId, ticket: u64) -> bool {
        let mut inner = self.write();
        match inner.executing.get_mut(id) {
            Some(rec) if rec.ticket == ticket => {
                rec.reporting = true;
                true
            }
            _ => false,
        }
    }

    /// Drop an executing record after its outcome was reported.
    pub fn release(&self, id: &TaskId, ticket: u64) -> bool {
        let mut inner = self.write();
        match inner.executing.get(id) {
            Some(rec) if rec.ticket == ticket => inner.executing.remove(id).is_some(),
            _ => false,
        }
    }

    /// Remove the id from both stages and cancel whatever work it had.
    ///
    /// Returns the stages the id was removed from; an executing record that is
    /// already reporting is left alone.
    pub fn abort(&self, id: &TaskId) -> Vec<Stage> {
        let mut removed = Vec::with_capacity(2);
        let mut inner = self.write();

        if let Some(rec) = inner.validating.remove(id) {
            rec.cancel.cancel();
            removed.push(Stage::Validating);
        }
        if inner.executing.get(id).is_some_and(|rec| !rec.reporting)
            && let Some(rec) = inner.executing.remove(id)
        {
            rec.cancel.cancel();
            removed.push(Stage::Executing);
        }
        removed
    }

    /// Executing task ids, sorted.
    pub fn executing_ids(&self) -> Vec<TaskId> {
        let inner = self.read();
        let mut ids: Vec<TaskId> = inner.executing.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn validating_ids(&self) -> Vec<TaskId> {
        let inner = self.read();
        let mut ids: Vec<TaskId> = inner.validating.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn counts(&self) -> InFlightCounts {
        let inner = self.read();
        InFlightCounts {
            validating: inner.validating.len(),
            executing: inner.executing.len(),
        }
    }

    #[inline]
    pub fn executing_len(&self) -> usize {
        self.read().executing.len()
    }

    #[inline]
    pub fn load(&self) -> usize {
        let c = self.counts();
        c.validating + c.executing
    }
}
