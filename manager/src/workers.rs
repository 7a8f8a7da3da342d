use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, trace};

/// Worker identifiers are dense, start at 1 and are stable for the life of
/// the worker process.
pub type WorkerId = u32;

/// The two kinds of work the manager hands out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Sim,
    Gen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveTask {
    Sim,
    Gen,
    /// a generator parked inside the worker for many rounds; only entry and
    /// exit are visible here, the intermediate rounds are not
    PersistentGen,
}

#[derive(Debug, Error)]
pub enum WorkerStateError {
    #[error("worker {0} is not registered")]
    UnknownWorker(WorkerId),
    #[error("worker {0} is already active")]
    AlreadyActive(WorkerId),
    #[error("worker {0} is not active")]
    NotActive(WorkerId),
    #[error("worker {0} is parked in a persistent generator and must be released by its exit tag")]
    PersistentStillParked(WorkerId),
    #[error("worker {0} is not running a persistent generator")]
    NotPersistent(WorkerId),
}

#[derive(Debug)]
struct WorkerRecord {
    active: Option<ActiveTask>,
    owned: Vec<usize>,
}

/// Manager owned view of every worker: which task kind each is running and
/// which ledger rows it currently holds.
#[derive(Debug)]
pub struct WorkerSet {
    records: BTreeMap<WorkerId, WorkerRecord>,
}

impl WorkerSet {
    pub fn new(workers: u32) -> Self {
        let records = (1..=workers)
            .map(|id| {
                (
                    id,
                    WorkerRecord {
                        active: None,
                        owned: Vec::new(),
                    },
                )
            })
            .collect();

        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn record(&self, id: WorkerId) -> Result<&WorkerRecord, WorkerStateError> {
        self.records.get(&id).ok_or(WorkerStateError::UnknownWorker(id))
    }

    fn record_mut(&mut self, id: WorkerId) -> Result<&mut WorkerRecord, WorkerStateError> {
        self.records
            .get_mut(&id)
            .ok_or(WorkerStateError::UnknownWorker(id))
    }

    /// Idle workers in ascending id order. The ordering is what makes
    /// allocation decisions reproducible between runs.
    pub fn idle_workers(&self) -> Vec<WorkerId> {
        self.records
            .iter()
            .filter(|(_, record)| record.active.is_none())
            .map(|(&id, _)| id)
            .collect()
    }

    /// Active workers of a task kind. Parked persistent generators count as
    /// generators for capping purposes.
    pub fn count_active(&self, kind: TaskKind) -> usize {
        self.records
            .values()
            .filter(|record| match kind {
                TaskKind::Sim => record.active == Some(ActiveTask::Sim),
                TaskKind::Gen => matches!(
                    record.active,
                    Some(ActiveTask::Gen) | Some(ActiveTask::PersistentGen)
                ),
            })
            .count()
    }

    pub fn active_persistent(&self) -> Vec<WorkerId> {
        self.records
            .iter()
            .filter(|(_, record)| record.active == Some(ActiveTask::PersistentGen))
            .map(|(&id, _)| id)
            .collect()
    }

    pub fn is_idle(&self, id: WorkerId) -> bool {
        self.records
            .get(&id)
            .map_or(false, |record| record.active.is_none())
    }

    pub fn all_idle(&self) -> bool {
        self.records.values().all(|record| record.active.is_none())
    }

    pub fn is_persistent(&self, id: WorkerId) -> bool {
        self.records
            .get(&id)
            .map_or(false, |record| record.active == Some(ActiveTask::PersistentGen))
    }

    pub fn owned_rows(&self, id: WorkerId) -> Result<&[usize], WorkerStateError> {
        Ok(&self.record(id)?.owned)
    }

    /// A worker is active under exactly one task kind at a time; handing a
    /// second item to an active worker is a scheduling bug.
    pub fn mark_active(
        &mut self,
        id: WorkerId,
        kind: TaskKind,
        persistent: bool,
        owned: Vec<usize>,
    ) -> Result<(), WorkerStateError> {
        let record = self.record_mut(id)?;
        if record.active.is_some() {
            return Err(WorkerStateError::AlreadyActive(id));
        }
        record.active = Some(match (kind, persistent) {
            (TaskKind::Sim, _) => ActiveTask::Sim,
            (TaskKind::Gen, false) => ActiveTask::Gen,
            (TaskKind::Gen, true) => ActiveTask::PersistentGen,
        });
        // a parked generator owns no rows, its in flight proposals are
        // tracked by the manager
        record.owned = if persistent { Vec::new() } else { owned };

        trace!(worker = id, kind = ?record.active, "worker marked active");

        Ok(())
    }

    /// Release a worker after a one shot task. Returns the rows it held.
    pub fn mark_idle(&mut self, id: WorkerId) -> Result<Vec<usize>, WorkerStateError> {
        let record = self.record_mut(id)?;
        match record.active {
            None => Err(WorkerStateError::NotActive(id)),
            Some(ActiveTask::PersistentGen) => Err(WorkerStateError::PersistentStillParked(id)),
            Some(_) => {
                record.active = None;
                Ok(std::mem::take(&mut record.owned))
            }
        }
    }

    /// Release a worker whose persistent generator reported its exit tag.
    pub fn release_persistent(&mut self, id: WorkerId) -> Result<(), WorkerStateError> {
        let record = self.record_mut(id)?;
        if record.active != Some(ActiveTask::PersistentGen) {
            return Err(WorkerStateError::NotPersistent(id));
        }
        record.active = None;
        record.owned.clear();

        debug!(worker = id, "persistent generator released");

        Ok(())
    }
}
