use crate::alloc::{give_sim_work_first, AllocError, PolicyState};
use crate::comms::{build_transport, CommError, ManagerMsg, ManagerTransport, ResultPacket, WorkPacket, WorkerMsg};
use crate::config::{CampaignConfig, ExitCriteria};
use crate::history::{Frame, History, HistoryError, Schema, X_ON_CUBE};
use crate::specs::{GenSpec, SimSpec};
use crate::worker::worker_main;
use crate::workers::{TaskKind, WorkerId, WorkerSet, WorkerStateError};
use itertools::Itertools;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Alloc(#[from] AllocError),
    #[error(transparent)]
    Comm(#[from] CommError),
    #[error(transparent)]
    History(#[from] HistoryError),
    #[error(transparent)]
    Workers(#[from] WorkerStateError),
    #[error("campaign io failure")]
    Io(#[from] std::io::Error),
    #[error("a persistent generator parks one worker, at least one more is needed for its proposals")]
    InsufficientWorkers,
    #[error("worker thread panicked")]
    WorkerPanic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    SimMaxReached,
    GenMaxReached,
    /// nothing left to schedule and no generator allowed to make more
    WorkExhausted,
}

/// What a finished campaign hands back: the full ledger, the final policy
/// state and why the run ended.
#[derive(Debug)]
pub struct RunSummary {
    pub history: History,
    pub policy: PolicyState,
    pub reason: ExitReason,
}

/// Run a campaign to completion: spawn the worker pool, loop
/// allocate/dispatch/receive/apply until the exit criteria hold, then shut
/// the pool down gracefully.
pub fn run_campaign(
    config: &CampaignConfig,
    sim_spec: SimSpec,
    gen_spec: GenSpec,
) -> Result<RunSummary, RunError> {
    let schema = Schema::build(
        gen_spec
            .out
            .iter()
            .cloned()
            .chain(sim_spec.out.iter().cloned()),
    )?;
    let track_nearest = schema.contains(&config.objective) && schema.contains(X_ON_CUBE);

    if gen_spec.persistent && config.workers < 2 {
        return Err(RunError::InsufficientWorkers);
    }

    if let Some(dir) = &config.ensemble_dir {
        std::fs::create_dir_all(dir)?;
    }

    let (transport, channels) = build_transport(config.workers);
    let sim_spec = Arc::new(sim_spec);
    let gen_spec = Arc::new(gen_spec);
    let staging = config.staging_policy();

    let mut handles = Vec::with_capacity(channels.len());
    for chan in channels {
        let worker = chan.worker;
        let sim = Arc::clone(&sim_spec);
        let gen = Arc::clone(&gen_spec);
        let staging = staging.clone();
        let handle = std::thread::Builder::new()
            .name(format!("worker{worker}"))
            .spawn(move || {
                if let Err(comm_error) = worker_main(chan, sim, gen, staging) {
                    error!(worker, error = %comm_error, "worker terminated abnormally");
                }
            })?;
        handles.push(handle);
    }

    info!(workers = handles.len(), "campaign started");

    let mut manager = Manager {
        history: History::new(schema),
        workers: WorkerSet::new(config.workers),
        policy: PolicyState::seeded(config.workers, config.seed),
        sim_spec,
        gen_spec,
        exit: config.exit_criteria.clone(),
        objective: config.objective.clone(),
        track_nearest,
        transport,
        pending: BTreeMap::new(),
        blocking: BTreeMap::new(),
        stopping: false,
        reason: None,
    };

    let outcome = manager.run();

    // release every worker, also on the error path so joins cannot hang
    for worker in 1..=config.workers {
        let _ = manager.transport.send(worker, ManagerMsg::Stop);
    }
    let Manager { history, policy, transport, .. } = manager;
    drop(transport);
    for handle in handles {
        handle.join().map_err(|_| RunError::WorkerPanic)?;
    }

    let reason = outcome?;
    info!(?reason, rows = history.len(), returned = history.returned_count(), "campaign finished");

    Ok(RunSummary { history, policy, reason })
}

struct Manager {
    history: History,
    workers: WorkerSet,
    policy: PolicyState,
    sim_spec: Arc<SimSpec>,
    gen_spec: Arc<GenSpec>,
    exit: ExitCriteria,
    objective: String,
    track_nearest: bool,
    transport: ManagerTransport,
    /// proposal rows each parked generator is awaiting
    pending: BTreeMap<WorkerId, Vec<usize>>,
    /// workers held hostage by a blocking work item, keyed by its owner
    blocking: BTreeMap<WorkerId, Vec<WorkerId>>,
    stopping: bool,
    reason: Option<ExitReason>,
}

impl Manager {
    fn exit_reason(&self) -> Option<ExitReason> {
        if let Some(sim_max) = self.exit.sim_max {
            if self.history.returned_count() >= sim_max {
                return Some(ExitReason::SimMaxReached);
            }
        }
        if let Some(gen_max) = self.exit.gen_max {
            let calls = self.policy.sched.map_or(0, |sched| sched.total_gen_calls);
            if calls >= gen_max {
                return Some(ExitReason::GenMaxReached);
            }
        }
        None
    }

    fn run(&mut self) -> Result<ExitReason, RunError> {
        let reason = loop {
            if !self.stopping {
                if let Some(reason) = self.exit_reason() {
                    info!(?reason, "exit criteria met, winding down");
                    self.stopping = true;
                    self.reason = Some(reason);
                    for worker in self.workers.active_persistent() {
                        self.transport.send(worker, ManagerMsg::PersisStop)?;
                    }
                }
            }

            let dispatched = if self.stopping { 0 } else { self.dispatch()? };

            if self.workers.all_idle() {
                if self.stopping {
                    break self.reason.unwrap_or(ExitReason::WorkExhausted);
                }
                if dispatched == 0 {
                    warn!("nothing left to schedule and no generator permitted");
                    break ExitReason::WorkExhausted;
                }
            }

            let msg = self.transport.recv_any()?;
            self.apply(msg)?;
            self.flush_pending()?;
        };

        Ok(reason)
    }

    fn dispatch(&mut self) -> Result<usize, RunError> {
        let items = give_sim_work_first(
            &self.workers,
            &self.history,
            &self.sim_spec,
            &self.gen_spec,
            &mut self.policy,
        )?;
        let count = items.len();

        for item in items {
            let fields = item.fields.iter().map(String::as_str).collect_vec();
            let input = self.history.read(&item.rows, &fields)?;
            let persistent = item.kind == TaskKind::Gen && self.gen_spec.persistent;

            if item.kind == TaskKind::Sim {
                self.history.mark_given(&item.rows)?;
            }
            self.workers
                .mark_active(item.worker, item.kind, persistent, item.rows.clone())?;
            for &hostage in &item.blocking {
                self.workers.mark_active(hostage, item.kind, false, Vec::new())?;
            }
            if !item.blocking.is_empty() {
                self.blocking.insert(item.worker, item.blocking.clone());
            }

            debug!(worker = item.worker, kind = ?item.kind, rows = ?item.rows, "dispatching work item");

            let packet = WorkPacket {
                kind: item.kind,
                rows: item.rows,
                input,
                persistent,
                stream: item.stream,
                blocking: item.blocking,
            };
            let msg = match item.kind {
                TaskKind::Sim => ManagerMsg::Sim(packet),
                TaskKind::Gen => ManagerMsg::Gen(packet),
            };
            self.transport.send(item.worker, msg)?;
        }

        Ok(count)
    }

    /// Idle a worker again and free anything its item was blocking.
    fn release(&mut self, worker: WorkerId) -> Result<(), RunError> {
        self.workers.mark_idle(worker)?;
        self.release_hostages(worker)?;
        Ok(())
    }

    fn release_hostages(&mut self, worker: WorkerId) -> Result<(), RunError> {
        if let Some(hostages) = self.blocking.remove(&worker) {
            for hostage in hostages {
                self.workers.mark_idle(hostage)?;
            }
        }
        Ok(())
    }

    fn apply(&mut self, msg: WorkerMsg) -> Result<(), RunError> {
        match msg {
            WorkerMsg::Completed { worker, kind: TaskKind::Sim, rows, out, .. } => {
                // results for rows cancelled while in flight are stale and
                // dropped on the floor
                let live = (0..rows.len())
                    .filter(|&i| !self.history.cancel_requested(rows[i]))
                    .collect_vec();
                let live_rows = live.iter().map(|&i| rows[i]).collect_vec();
                if live.len() < rows.len() {
                    debug!(worker, "ignoring results for cancelled rows");
                }

                let out = if live.len() == rows.len() { out } else { out.select(&live) };
                self.history.write(&live_rows, &out)?;
                self.history.mark_returned(&live_rows)?;
                if self.track_nearest {
                    for &row in &live_rows {
                        self.history.update_nearest_better(row, &self.objective)?;
                    }
                }

                debug!(
                    worker,
                    rows = ?live_rows,
                    returned = self.history.returned_count(),
                    "simulation results applied"
                );
                self.release(worker)?;
            }
            WorkerMsg::Completed { worker, kind: TaskKind::Gen, out, stream, .. } => {
                if let Some(stream) = stream {
                    self.policy.streams.insert(worker, stream);
                }
                let rows = self.append_from(&out)?;
                debug!(worker, rows = ?rows, "generator batch appended");
                self.release(worker)?;
            }
            WorkerMsg::Proposal { worker, out } => {
                let rows = self.append_from(&out)?;
                debug!(worker, rows = ?rows, "persistent proposal appended");
                self.pending.insert(worker, rows);
            }
            WorkerMsg::FinishedPersistent { worker, stream, .. } => {
                if let Some(stream) = stream {
                    self.policy.streams.insert(worker, stream);
                }
                if let Some(rows) = self.pending.remove(&worker) {
                    let abandoned = rows
                        .into_iter()
                        .filter(|&row| !self.history.returned(row))
                        .collect_vec();
                    if !abandoned.is_empty() {
                        debug!(worker, rows = ?abandoned, "marking abandoned proposal rows cancellable");
                        self.history.request_cancel(&abandoned)?;
                    }
                }
                self.workers.release_persistent(worker)?;
                self.release_hostages(worker)?;
                info!(worker, "persistent generator finished");
            }
            WorkerMsg::Failed { worker, kind, rows } => {
                warn!(worker, kind = ?kind, rows = ?rows, "evaluation failed, cancelling its rows");
                self.history.request_cancel(&rows)?;
                self.release(worker)?;
            }
        }

        Ok(())
    }

    /// Append proposed points to the ledger and fill in their input fields.
    fn append_from(&mut self, out: &Frame) -> Result<Vec<usize>, RunError> {
        let rows = self.history.append_rows(out.len()).collect_vec();
        self.history.write(&rows, out)?;
        Ok(rows)
    }

    /// Answer every parked generator whose proposal is fully settled, where
    /// settled means each row either returned or will never run. Nothing is
    /// answered during wind down, the stop tag already went out.
    fn flush_pending(&mut self) -> Result<(), RunError> {
        if self.stopping {
            return Ok(());
        }

        let ready = self
            .pending
            .iter()
            .filter(|(_, rows)| {
                rows.iter()
                    .all(|&row| self.history.returned(row) || self.history.cancel_requested(row))
            })
            .map(|(&worker, _)| worker)
            .collect_vec();

        for worker in ready {
            let rows = self.pending.remove(&worker).unwrap();
            let fields = self.gen_spec.inputs.iter().map(String::as_str).collect_vec();
            let values = self.history.read(&rows, &fields)?;
            debug!(worker, rows = ?rows, "answering parked generator");
            self.transport
                .send(worker, ManagerMsg::Results(ResultPacket { rows, values }))?;
        }

        Ok(())
    }
}
