use crate::alloc::RunStream;
use crate::history::Frame;
use crate::workers::{TaskKind, WorkerId};
use crossbeam::channel::{unbounded, Receiver, RecvError, Sender};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::trace;

/// The protocol vocabulary. Every message on the wire answers to exactly one
/// of these, queryable through `tag()` after an any-tag receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    /// manager to worker, evaluate a simulation
    EvalSim,
    /// manager to worker, run a generation request or resume a parked one
    /// with evaluated results
    EvalGen,
    /// worker to manager, proposal from a running persistent generator
    PersisGen,
    /// manager to worker, terminate immediately, abandon anything in flight
    Stop,
    /// manager to worker, finish current round bookkeeping then exit
    PersisStop,
    /// worker to manager, persistent generator exited normally
    FinishedPersistentGen,
}

#[derive(Debug, Error)]
pub enum CommError {
    #[error("worker channel disconnected")]
    Disconnected,
    /// a protocol violation is a correctness bug, never retried
    #[error("protocol violation: received {got:?} while awaiting {expected}")]
    UnexpectedTag { expected: &'static str, got: Tag },
}

impl From<RecvError> for CommError {
    fn from(_: RecvError) -> Self {
        CommError::Disconnected
    }
}

/// Payload of a work request. `input` carries the transmitted ledger fields
/// for `rows`, already copied out of the ledger.
#[derive(Debug)]
pub struct WorkPacket {
    pub kind: TaskKind,
    pub rows: Vec<usize>,
    pub input: Frame,
    pub persistent: bool,
    pub stream: Option<RunStream>,
    pub blocking: Vec<WorkerId>,
}

/// Evaluated results for rows a persistent generator proposed earlier.
#[derive(Debug)]
pub struct ResultPacket {
    pub rows: Vec<usize>,
    pub values: Frame,
}

/// Everything the manager ever sends a worker.
#[derive(Debug)]
pub enum ManagerMsg {
    Sim(WorkPacket),
    Gen(WorkPacket),
    Results(ResultPacket),
    Stop,
    PersisStop,
}

impl ManagerMsg {
    pub fn tag(&self) -> Tag {
        match self {
            Self::Sim(_) => Tag::EvalSim,
            Self::Gen(_) | Self::Results(_) => Tag::EvalGen,
            Self::Stop => Tag::Stop,
            Self::PersisStop => Tag::PersisStop,
        }
    }
}

/// Everything a worker ever sends the manager. One-shot completions answer
/// with the tag of the request they complete.
#[derive(Debug)]
pub enum WorkerMsg {
    Completed {
        worker: WorkerId,
        kind: TaskKind,
        rows: Vec<usize>,
        out: Frame,
        stream: Option<RunStream>,
    },
    Proposal {
        worker: WorkerId,
        out: Frame,
    },
    FinishedPersistent {
        worker: WorkerId,
        out: Option<Frame>,
        stream: Option<RunStream>,
    },
    /// the user callable failed or panicked; the named rows should not be
    /// reissued
    Failed {
        worker: WorkerId,
        kind: TaskKind,
        rows: Vec<usize>,
    },
}

impl WorkerMsg {
    pub fn tag(&self) -> Tag {
        match self {
            Self::Completed { kind: TaskKind::Sim, .. } | Self::Failed { kind: TaskKind::Sim, .. } => {
                Tag::EvalSim
            }
            Self::Completed { kind: TaskKind::Gen, .. } | Self::Failed { kind: TaskKind::Gen, .. } => {
                Tag::EvalGen
            }
            Self::Proposal { .. } => Tag::PersisGen,
            Self::FinishedPersistent { .. } => Tag::FinishedPersistentGen,
        }
    }

    pub fn worker(&self) -> WorkerId {
        match self {
            Self::Completed { worker, .. }
            | Self::Proposal { worker, .. }
            | Self::FinishedPersistent { worker, .. }
            | Self::Failed { worker, .. } => *worker,
        }
    }
}

/// Manager side of the transport: one outgoing channel per worker, one
/// merged incoming channel. Per worker ordering is FIFO; nothing is promised
/// across workers.
#[derive(Debug)]
pub struct ManagerTransport {
    to_workers: BTreeMap<WorkerId, Sender<ManagerMsg>>,
    from_workers: Receiver<WorkerMsg>,
}

impl ManagerTransport {
    pub fn send(&self, worker: WorkerId, msg: ManagerMsg) -> Result<(), CommError> {
        trace!(worker, tag = ?msg.tag(), "manager send");
        self.to_workers
            .get(&worker)
            .ok_or(CommError::Disconnected)?
            .send(msg)
            .map_err(|_| CommError::Disconnected)
    }

    /// Blocking any-tag receive over all workers.
    pub fn recv_any(&self) -> Result<WorkerMsg, CommError> {
        let msg = self.from_workers.recv()?;
        trace!(worker = msg.worker(), tag = ?msg.tag(), "manager recv");
        Ok(msg)
    }
}

/// Worker side of the transport.
#[derive(Debug)]
pub struct WorkerChannel {
    pub worker: WorkerId,
    rx: Receiver<ManagerMsg>,
    tx: Sender<WorkerMsg>,
}

impl WorkerChannel {
    /// Blocking any-tag receive from the manager.
    pub fn recv(&self) -> Result<ManagerMsg, CommError> {
        let msg = self.rx.recv()?;
        trace!(worker = self.worker, tag = ?msg.tag(), "worker recv");
        Ok(msg)
    }

    pub fn send(&self, msg: WorkerMsg) -> Result<(), CommError> {
        trace!(worker = self.worker, tag = ?msg.tag(), "worker send");
        self.tx.send(msg).map_err(|_| CommError::Disconnected)
    }

    pub fn gen_comm(&self) -> GenComm<'_> {
        GenComm { chan: self }
    }
}

/// What a parked generator hears back after a proposal.
#[derive(Debug)]
pub enum Reply {
    Results(ResultPacket),
    /// which stop tag arrived, `Tag::Stop` or `Tag::PersisStop`
    Stop(Tag),
}

/// Protocol handle lent to a persistent generator for the duration of its
/// loop. The generator may only propose and await, never see raw work
/// packets.
#[derive(Debug)]
pub struct GenComm<'a> {
    chan: &'a WorkerChannel,
}

impl GenComm<'_> {
    pub fn worker(&self) -> WorkerId {
        self.chan.worker
    }

    pub fn send_proposal(&self, out: Frame) -> Result<(), CommError> {
        self.chan.send(WorkerMsg::Proposal {
            worker: self.chan.worker,
            out,
        })
    }

    /// Block until evaluated results or a stop tag arrive. A work packet
    /// here means the manager lost track of this worker, which is fatal.
    pub fn recv(&self) -> Result<Reply, CommError> {
        match self.chan.recv()? {
            ManagerMsg::Results(results) => Ok(Reply::Results(results)),
            ManagerMsg::Stop => Ok(Reply::Stop(Tag::Stop)),
            ManagerMsg::PersisStop => Ok(Reply::Stop(Tag::PersisStop)),
            msg => Err(CommError::UnexpectedTag {
                expected: "results or a stop tag",
                got: msg.tag(),
            }),
        }
    }

    /// One full proposal round: send, then block for the paired response.
    pub fn sendrecv(&self, out: Frame) -> Result<Reply, CommError> {
        self.send_proposal(out)?;
        self.recv()
    }
}

/// Build the channel mesh for `workers` workers with ids `1..=workers`.
pub fn build_transport(workers: u32) -> (ManagerTransport, Vec<WorkerChannel>) {
    let (merged_tx, merged_rx) = unbounded();

    let mut to_workers = BTreeMap::new();
    let mut channels = Vec::with_capacity(workers as usize);
    for worker in 1..=workers {
        let (tx, rx) = unbounded();
        to_workers.insert(worker, tx);
        channels.push(WorkerChannel {
            worker,
            rx,
            tx: merged_tx.clone(),
        });
    }

    (
        ManagerTransport {
            to_workers,
            from_workers: merged_rx,
        },
        channels,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_worker_delivery_is_fifo() {
        let (transport, mut channels) = build_transport(1);
        let chan = channels.remove(0);

        transport.send(1, ManagerMsg::PersisStop).unwrap();
        transport.send(1, ManagerMsg::Stop).unwrap();

        assert_eq!(chan.recv().unwrap().tag(), Tag::PersisStop);
        assert_eq!(chan.recv().unwrap().tag(), Tag::Stop);
    }

    #[test]
    fn any_tag_receive_reports_the_delivered_tag() {
        let (transport, channels) = build_transport(2);

        channels[1]
            .send(WorkerMsg::Proposal {
                worker: 2,
                out: Frame::new(0),
            })
            .unwrap();
        channels[0]
            .send(WorkerMsg::FinishedPersistent {
                worker: 1,
                out: None,
                stream: None,
            })
            .unwrap();

        let first = transport.recv_any().unwrap();
        assert_eq!((first.worker(), first.tag()), (2, Tag::PersisGen));
        let second = transport.recv_any().unwrap();
        assert_eq!((second.worker(), second.tag()), (1, Tag::FinishedPersistentGen));
    }

    #[test]
    fn generators_reject_raw_work_packets() {
        let (transport, channels) = build_transport(1);

        transport
            .send(
                1,
                ManagerMsg::Sim(WorkPacket {
                    kind: TaskKind::Sim,
                    rows: vec![0],
                    input: Frame::new(1),
                    persistent: false,
                    stream: None,
                    blocking: Vec::new(),
                }),
            )
            .unwrap();

        let comm = channels[0].gen_comm();
        assert!(matches!(
            comm.recv(),
            Err(CommError::UnexpectedTag { got: Tag::EvalSim, .. })
        ));
    }

    #[test]
    fn sendrecv_pairs_a_proposal_with_its_reply() {
        let (transport, channels) = build_transport(1);

        transport
            .send(
                1,
                ManagerMsg::Results(ResultPacket {
                    rows: vec![3, 4],
                    values: Frame::new(2),
                }),
            )
            .unwrap();

        let comm = channels[0].gen_comm();
        match comm.sendrecv(Frame::new(0)).unwrap() {
            Reply::Results(results) => assert_eq!(results.rows, vec![3, 4]),
            Reply::Stop(tag) => panic!("unexpected stop tag {tag:?}"),
        }

        match transport.recv_any().unwrap() {
            WorkerMsg::Proposal { worker, .. } => assert_eq!(worker, 1),
            msg => panic!("unexpected message {:?}", msg.tag()),
        }
    }

    #[test]
    fn dropped_peers_surface_as_disconnects() {
        let (transport, channels) = build_transport(1);
        drop(channels);
        assert!(matches!(transport.recv_any(), Err(CommError::Disconnected)));
    }
}
