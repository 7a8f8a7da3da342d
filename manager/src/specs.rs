use crate::alloc::RunStream;
use crate::comms::{CommError, GenComm};
use crate::history::{FieldSpec, Frame};
use std::sync::Arc;
use thiserror::Error;

/// Failure of a user supplied callable. Transport errors bubbling out of a
/// persistent generator are kept apart because they are fatal to the run
/// rather than a failed evaluation.
#[derive(Debug, Error)]
pub enum CalcError {
    #[error("calculation failed: {0}")]
    Failed(String),
    #[error(transparent)]
    Comm(#[from] CommError),
}

/// A simulation callable. Receives the transmitted input fields for its rows
/// and answers with a frame shaped per the declared output fields, one row
/// per input row.
pub trait Simulator: Send + Sync {
    fn simulate(&self, input: &Frame, rows: &[usize]) -> Result<Frame, CalcError>;
}

/// A generator callable. One-shot generators implement `generate`;
/// persistent ones implement `run_persistent` and live inside a worker until
/// a stop tag arrives.
pub trait Generator: Send + Sync {
    /// Produce a batch of candidate points shaped like a proposal frame.
    fn generate(&self, input: &Frame, stream: &mut RunStream) -> Result<Frame, CalcError> {
        let _ = (input, stream);
        Err(CalcError::Failed(
            "generator does not support one-shot requests".to_owned(),
        ))
    }

    /// Run the long lived proposal loop. Returns the final output to report
    /// with the exit tag, if any.
    fn run_persistent(
        &self,
        input: &Frame,
        stream: &mut RunStream,
        comm: &GenComm<'_>,
    ) -> Result<Option<Frame>, CalcError> {
        let _ = (input, stream, comm);
        Err(CalcError::Failed(
            "generator does not support persistent requests".to_owned(),
        ))
    }
}

/// Simulation policy: the callable, the ledger fields it is sent and the
/// output fields it declares into the campaign schema.
#[derive(Clone)]
pub struct SimSpec {
    pub sim: Arc<dyn Simulator>,
    pub inputs: Vec<String>,
    pub out: Vec<FieldSpec>,
}

/// Generation policy. `inputs` doubles as the "wants to observe the ledger"
/// switch for allocation and as the field list a parked generator receives
/// back with evaluated results.
#[derive(Clone)]
pub struct GenSpec {
    pub gen: Arc<dyn Generator>,
    pub inputs: Vec<String>,
    pub out: Vec<FieldSpec>,
    /// cap on concurrently active generators, unbounded when absent
    pub num_active_gens: Option<usize>,
    /// promote generator assignments to the persistent protocol
    pub persistent: bool,
}
