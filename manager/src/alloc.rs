use crate::history::History;
use crate::specs::{GenSpec, SimSpec};
use crate::workers::{TaskKind, WorkerId, WorkerSet};
use itertools::Itertools;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Error)]
pub enum AllocError {
    /// missing cursors mean the run was never initialized, which is a setup
    /// bug and not something to paper over with defaults
    #[error("allocation invoked without initialized policy cursors")]
    PolicyStateMissing,
}

/// Per worker random stream handed through work items. Opaque to the
/// allocation engine, which only moves it around.
#[derive(Clone)]
pub struct RunStream {
    pub worker: WorkerId,
    pub rng: SmallRng,
}

impl fmt::Debug for RunStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunStream").field("worker", &self.worker).finish()
    }
}

/// Scheduling cursors advanced by every allocation call.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedCursors {
    /// next ledger row nobody has been given yet
    pub next_to_give: usize,
    /// generator invocations issued so far
    pub total_gen_calls: usize,
}

/// Mutable per run policy state: the scheduling cursors plus the per worker
/// stream map. Threaded through `give_sim_work_first` explicitly, never held
/// in process globals.
#[derive(Debug)]
pub struct PolicyState {
    pub sched: Option<SchedCursors>,
    pub streams: BTreeMap<WorkerId, RunStream>,
}

impl PolicyState {
    /// Cursors zeroed and one deterministic random stream per worker.
    pub fn seeded(workers: u32, seed: u64) -> Self {
        let streams = (1..=workers)
            .map(|worker| {
                (
                    worker,
                    RunStream {
                        worker,
                        rng: SmallRng::seed_from_u64(seed.wrapping_add(u64::from(worker))),
                    },
                )
            })
            .collect();

        Self {
            sched: Some(SchedCursors::default()),
            streams,
        }
    }

    /// State with no cursors, as seen by an allocation call that ran before
    /// campaign setup.
    pub fn uninitialized() -> Self {
        Self {
            sched: None,
            streams: BTreeMap::new(),
        }
    }
}

/// One manager to worker assignment. Consumed once by the transport layer.
#[derive(Debug)]
pub struct WorkItem {
    pub worker: WorkerId,
    pub kind: TaskKind,
    /// ledger fields to transmit
    pub fields: Vec<String>,
    /// ledger rows to transmit, empty for a fresh generation request
    pub rows: Vec<usize>,
    /// opaque per worker state, present on generator items
    pub stream: Option<RunStream>,
    /// workers this item holds hostage for resource exclusivity
    pub blocking: Vec<WorkerId>,
}

/// The strict fast order allocator. Walks idle workers in ascending id
/// order handing each the next unrequested ledger row; once the ledger is
/// exhausted, idle workers are routed to generator work as long as the
/// active generator cap permits. Deterministic for identical inputs.
pub fn give_sim_work_first(
    workers: &WorkerSet,
    history: &History,
    sim_spec: &SimSpec,
    gen_spec: &GenSpec,
    state: &mut PolicyState,
) -> Result<Vec<WorkItem>, AllocError> {
    let sched = state.sched.as_mut().ok_or(AllocError::PolicyStateMissing)?;

    let mut items = Vec::new();
    let mut gen_count = workers.count_active(TaskKind::Gen);

    for worker in workers.idle_workers() {
        // skip over anything the manager has asked to cancel
        while sched.next_to_give < history.len() && history.cancel_requested(sched.next_to_give) {
            sched.next_to_give += 1;
        }

        if sched.next_to_give < history.len() {
            items.push(WorkItem {
                worker,
                kind: TaskKind::Sim,
                fields: sim_spec.inputs.clone(),
                rows: vec![sched.next_to_give],
                stream: None,
                blocking: Vec::new(),
            });
            sched.next_to_give += 1;
        } else if gen_count < gen_spec.num_active_gens.unwrap_or(gen_count + 1) {
            // a generator that declares input fields observes the whole
            // ledger so far, one that declares none receives nothing
            let rows = if gen_spec.inputs.is_empty() {
                Vec::new()
            } else {
                (0..history.len()).collect_vec()
            };

            sched.total_gen_calls += 1;
            gen_count += 1;
            items.push(WorkItem {
                worker,
                kind: TaskKind::Gen,
                fields: gen_spec.inputs.clone(),
                rows,
                stream: state.streams.get(&worker).cloned(),
                blocking: Vec::new(),
            });
        }
        // otherwise the worker sits this round out
    }

    trace!(
        items = items.len(),
        next_to_give = sched.next_to_give,
        total_gen_calls = sched.total_gen_calls,
        "allocation pass complete"
    );

    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{FieldKind, FieldSpec, Frame, Schema, X};
    use crate::specs::{CalcError, Generator, SimSpec, Simulator};
    use std::sync::Arc;

    struct NullSim;

    impl Simulator for NullSim {
        fn simulate(&self, _input: &Frame, _rows: &[usize]) -> Result<Frame, CalcError> {
            Ok(Frame::new(0))
        }
    }

    struct NullGen;

    impl Generator for NullGen {}

    fn sim_spec() -> SimSpec {
        SimSpec {
            sim: Arc::new(NullSim),
            inputs: vec![X.to_owned()],
            out: vec![FieldSpec::output("f", FieldKind::Float)],
        }
    }

    fn gen_spec(inputs: Vec<String>, cap: Option<usize>) -> GenSpec {
        GenSpec {
            gen: Arc::new(NullGen),
            inputs,
            out: vec![FieldSpec::input(X, FieldKind::FloatVec(1))],
            num_active_gens: cap,
            persistent: false,
        }
    }

    fn history_with(rows: usize) -> History {
        let mut history = History::new(
            Schema::build([
                FieldSpec::input(X, FieldKind::FloatVec(1)),
                FieldSpec::output("f", FieldKind::Float),
            ])
            .unwrap(),
        );
        history.append_rows(rows);
        history
    }

    #[test]
    fn hands_rows_to_idle_workers_in_order() {
        let workers = WorkerSet::new(3);
        let history = history_with(10);
        let mut state = PolicyState::seeded(3, 0);

        let items =
            give_sim_work_first(&workers, &history, &sim_spec(), &gen_spec(vec![], None), &mut state)
                .unwrap();

        let assigned: Vec<(WorkerId, usize)> =
            items.iter().map(|item| (item.worker, item.rows[0])).collect();
        assert_eq!(assigned, vec![(1, 0), (2, 1), (3, 2)]);
        assert!(items.iter().all(|item| item.kind == TaskKind::Sim));
        assert_eq!(state.sched.unwrap().next_to_give, 3);
    }

    #[test]
    fn cursor_survives_ledger_growth() {
        let mut workers = WorkerSet::new(3);
        let mut history = history_with(3);
        let mut state = PolicyState::seeded(3, 0);

        give_sim_work_first(&workers, &history, &sim_spec(), &gen_spec(vec![], None), &mut state)
            .unwrap();
        history.mark_returned(&[0, 1, 2]).unwrap();
        history.append_rows(5);
        workers.mark_active(2, TaskKind::Sim, false, vec![1]).unwrap();
        workers.mark_active(3, TaskKind::Sim, false, vec![2]).unwrap();

        let items =
            give_sim_work_first(&workers, &history, &sim_spec(), &gen_spec(vec![], None), &mut state)
                .unwrap();
        assert_eq!(items[0].worker, 1);
        assert_eq!(items[0].rows, vec![3]);
    }

    #[test]
    fn never_hands_out_the_same_row_twice_in_one_call() {
        let workers = WorkerSet::new(8);
        let history = history_with(5);
        let mut state = PolicyState::seeded(8, 0);

        let items =
            give_sim_work_first(&workers, &history, &sim_spec(), &gen_spec(vec![], None), &mut state)
                .unwrap();

        let sim_rows = items
            .iter()
            .filter(|item| item.kind == TaskKind::Sim)
            .flat_map(|item| item.rows.iter().copied())
            .collect_vec();
        assert_eq!(sim_rows.iter().unique().count(), sim_rows.len());
        assert_eq!(sim_rows.len(), 5);
    }

    #[test]
    fn cancelled_rows_fall_through_to_generator_work() {
        let workers = WorkerSet::new(1);
        let mut history = history_with(3);
        history.request_cancel(&[0, 1, 2]).unwrap();
        let mut state = PolicyState::seeded(1, 0);

        let items =
            give_sim_work_first(&workers, &history, &sim_spec(), &gen_spec(vec![], None), &mut state)
                .unwrap();

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].kind, TaskKind::Gen);
        assert!(items[0].rows.is_empty());
        assert_eq!(state.sched.unwrap().next_to_give, 3);
    }

    #[test]
    fn generator_cap_limits_new_generators() {
        let mut workers = WorkerSet::new(4);
        workers.mark_active(4, TaskKind::Gen, false, vec![]).unwrap();
        let history = history_with(0);
        let mut state = PolicyState::seeded(4, 0);

        let items = give_sim_work_first(
            &workers,
            &history,
            &sim_spec(),
            &gen_spec(vec![], Some(2)),
            &mut state,
        )
        .unwrap();

        // one generator already active, cap of two leaves room for one more
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].kind, TaskKind::Gen);
        assert_eq!(state.sched.unwrap().total_gen_calls, 1);
    }

    #[test]
    fn missing_cap_always_allows_one_more() {
        let workers = WorkerSet::new(3);
        let history = history_with(0);
        let mut state = PolicyState::seeded(3, 0);

        let items =
            give_sim_work_first(&workers, &history, &sim_spec(), &gen_spec(vec![], None), &mut state)
                .unwrap();

        assert_eq!(items.len(), 3);
        assert!(items.iter().all(|item| item.kind == TaskKind::Gen));
        assert_eq!(state.sched.unwrap().total_gen_calls, 3);
    }

    #[test]
    fn generators_with_declared_inputs_observe_the_whole_ledger() {
        let workers = WorkerSet::new(1);
        let history = history_with(4);
        let mut state = PolicyState::seeded(1, 0);
        state.sched.as_mut().unwrap().next_to_give = 4;

        let items = give_sim_work_first(
            &workers,
            &history,
            &sim_spec(),
            &gen_spec(vec![X.to_owned()], None),
            &mut state,
        )
        .unwrap();
        assert_eq!(items[0].rows, vec![0, 1, 2, 3]);
        assert!(items[0].stream.is_some());
    }

    #[test]
    fn uninitialized_cursors_are_fatal() {
        let workers = WorkerSet::new(1);
        let history = history_with(1);
        let mut state = PolicyState::uninitialized();

        assert!(matches!(
            give_sim_work_first(&workers, &history, &sim_spec(), &gen_spec(vec![], None), &mut state),
            Err(AllocError::PolicyStateMissing)
        ));
    }
}
