use crate::comms::{CommError, ManagerMsg, WorkPacket, WorkerChannel, WorkerMsg};
use crate::specs::{CalcError, GenSpec, SimSpec};
use crate::staging::{self, DEFAULT_STAGE_MARKER};
use crate::workers::TaskKind;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Working directory behavior for one worker. With no ensemble dir the
/// worker runs everything in place and stages nothing.
#[derive(Debug, Clone)]
pub struct StagingPolicy {
    /// parent of the per task working directories
    pub ensemble_dir: Option<PathBuf>,
    /// contents staged into every task directory before the run
    pub input_dir: Option<PathBuf>,
    /// parent of the per task copy back directories
    pub copy_back_dir: Option<PathBuf>,
    pub marker: String,
}

impl Default for StagingPolicy {
    fn default() -> Self {
        Self {
            ensemble_dir: None,
            input_dir: None,
            copy_back_dir: None,
            marker: DEFAULT_STAGE_MARKER.to_owned(),
        }
    }
}

/// The per worker dispatch loop. Blocks for work, runs it, reports back,
/// and exits on a stop tag. User callable failures never leave this
/// function as errors; they are logged with their row context and reported
/// to the manager as failed evaluations. Transport problems do leave it,
/// they are fatal.
pub fn worker_main(
    chan: WorkerChannel,
    sim_spec: Arc<SimSpec>,
    gen_spec: Arc<GenSpec>,
    staging: StagingPolicy,
) -> Result<(), CommError> {
    debug!(worker = chan.worker, "worker online");

    loop {
        match chan.recv()? {
            ManagerMsg::Sim(packet) => run_sim(&chan, &sim_spec, packet, &staging)?,
            ManagerMsg::Gen(packet) => {
                if packet.persistent {
                    run_persistent_gen(&chan, &gen_spec, packet)?
                } else {
                    run_gen(&chan, &gen_spec, packet)?
                }
            }
            ManagerMsg::Stop | ManagerMsg::PersisStop => {
                debug!(worker = chan.worker, "worker released");
                break;
            }
            msg @ ManagerMsg::Results(_) => {
                return Err(CommError::UnexpectedTag {
                    expected: "a work request or a stop tag",
                    got: msg.tag(),
                });
            }
        }
    }

    Ok(())
}

fn run_sim(
    chan: &WorkerChannel,
    spec: &SimSpec,
    packet: WorkPacket,
    staging: &StagingPolicy,
) -> Result<(), CommError> {
    let WorkPacket { rows, input, .. } = packet;

    let workdir = staging
        .ensemble_dir
        .as_ref()
        .map(|base| base.join(staging::task_dir_name("sim", chan.worker, &rows)));
    if let Some(dir) = &workdir {
        if let Err(staging_error) = prepare_workdir(dir, staging) {
            error!(
                worker = chan.worker,
                rows = ?rows,
                error = ?staging_error,
                "failed to prepare working directory"
            );
            return chan.send(WorkerMsg::Failed {
                worker: chan.worker,
                kind: TaskKind::Sim,
                rows,
            });
        }
    }

    let result = panic::catch_unwind(AssertUnwindSafe(|| spec.sim.simulate(&input, &rows)));

    if let Some(dir) = &workdir {
        let copy_back = staging
            .copy_back_dir
            .as_ref()
            .map(|base| base.join(staging::task_dir_name("sim", chan.worker, &rows)));
        if let Err(staging_error) =
            staging::unstage_output(dir, copy_back.as_deref(), &staging.marker)
        {
            error!(worker = chan.worker, error = ?staging_error, "failed to unstage working directory");
        }
    }

    match result {
        Ok(Ok(out)) => chan.send(WorkerMsg::Completed {
            worker: chan.worker,
            kind: TaskKind::Sim,
            rows,
            out,
            stream: None,
        }),
        Ok(Err(calc_error)) => {
            error!(worker = chan.worker, rows = ?rows, error = %calc_error, "simulation failed");
            chan.send(WorkerMsg::Failed {
                worker: chan.worker,
                kind: TaskKind::Sim,
                rows,
            })
        }
        Err(_) => {
            error!(worker = chan.worker, rows = ?rows, "simulation panicked");
            chan.send(WorkerMsg::Failed {
                worker: chan.worker,
                kind: TaskKind::Sim,
                rows,
            })
        }
    }
}

fn prepare_workdir(dir: &PathBuf, staging: &StagingPolicy) -> Result<(), staging::StagingError> {
    std::fs::create_dir_all(dir)?;
    if let Some(input_dir) = &staging.input_dir {
        staging::stage_input(input_dir, dir, &staging.marker)?;
    }
    Ok(())
}

fn run_gen(chan: &WorkerChannel, spec: &GenSpec, packet: WorkPacket) -> Result<(), CommError> {
    let WorkPacket { rows, input, stream, .. } = packet;

    let mut stream = match stream {
        Some(stream) => stream,
        None => {
            error!(worker = chan.worker, "generation request arrived without a run stream");
            return chan.send(WorkerMsg::Failed {
                worker: chan.worker,
                kind: TaskKind::Gen,
                rows,
            });
        }
    };

    let result = panic::catch_unwind(AssertUnwindSafe(|| spec.gen.generate(&input, &mut stream)));

    match result {
        Ok(Ok(out)) => chan.send(WorkerMsg::Completed {
            worker: chan.worker,
            kind: TaskKind::Gen,
            rows,
            out,
            stream: Some(stream),
        }),
        Ok(Err(calc_error)) => {
            error!(worker = chan.worker, error = %calc_error, "generation failed");
            chan.send(WorkerMsg::Failed {
                worker: chan.worker,
                kind: TaskKind::Gen,
                rows,
            })
        }
        Err(_) => {
            error!(worker = chan.worker, "generation panicked");
            chan.send(WorkerMsg::Failed {
                worker: chan.worker,
                kind: TaskKind::Gen,
                rows,
            })
        }
    }
}

fn run_persistent_gen(
    chan: &WorkerChannel,
    spec: &GenSpec,
    packet: WorkPacket,
) -> Result<(), CommError> {
    let WorkPacket { input, stream, .. } = packet;

    let mut stream = match stream {
        Some(stream) => stream,
        None => {
            error!(worker = chan.worker, "persistent request arrived without a run stream");
            return chan.send(WorkerMsg::FinishedPersistent {
                worker: chan.worker,
                out: None,
                stream: None,
            });
        }
    };

    let comm = chan.gen_comm();
    let result =
        panic::catch_unwind(AssertUnwindSafe(|| spec.gen.run_persistent(&input, &mut stream, &comm)));

    match result {
        Ok(Ok(out)) => {
            info!(worker = chan.worker, "persistent generator exited");
            chan.send(WorkerMsg::FinishedPersistent {
                worker: chan.worker,
                out,
                stream: Some(stream),
            })
        }
        // a transport error inside the loop means the protocol itself broke
        Ok(Err(CalcError::Comm(comm_error))) => Err(comm_error),
        Ok(Err(calc_error)) => {
            error!(worker = chan.worker, error = %calc_error, "persistent generator failed");
            chan.send(WorkerMsg::FinishedPersistent {
                worker: chan.worker,
                out: None,
                stream: Some(stream),
            })
        }
        Err(_) => {
            error!(worker = chan.worker, "persistent generator panicked");
            chan.send(WorkerMsg::FinishedPersistent {
                worker: chan.worker,
                out: None,
                stream: Some(stream),
            })
        }
    }
}
