use crate::alloc::RunStream;
use crate::comms::{GenComm, Reply};
use crate::gen::support::proposal_frame;
use crate::history::{Frame, RETURNED, X};
use crate::specs::{CalcError, Generator};
use itertools::Itertools;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Persistent compass search refinement around the best point seen so far.
///
/// Each candidate is proposed as a local point through one protocol round
/// trip, except when it exactly matches a point whose value is already
/// cached from the transmitted history or an earlier round; those are
/// answered from the cache without touching the manager. A stop tag ends
/// the search immediately with the best point held at that moment.
#[derive(Debug, Clone)]
pub struct LocalRefine {
    pub lb: Vec<f64>,
    pub ub: Vec<f64>,
    /// initial step as a fraction of the distance to the nearest bound
    pub step_multiple: f64,
    /// step size below which the search is converged
    pub xtol: f64,
    pub max_evals: usize,
    /// result field carrying the objective value
    pub objective: String,
}

enum Outcome {
    Value(f64),
    Stopped,
}

impl LocalRefine {
    fn eval_point(
        &self,
        point: &[f64],
        cache: &mut BTreeMap<Vec<u64>, f64>,
        comm: &GenComm<'_>,
    ) -> Result<Outcome, CalcError> {
        let key = point.iter().map(|v| v.to_bits()).collect_vec();
        if let Some(&value) = cache.get(&key) {
            debug!(worker = comm.worker(), "reused cached evaluation");
            return Ok(Outcome::Value(value));
        }

        match comm.sendrecv(proposal_frame(&[point.to_vec()], &self.lb, &self.ub, true))? {
            Reply::Stop(_) => Ok(Outcome::Stopped),
            Reply::Results(results) => {
                let value = results
                    .values
                    .column(&self.objective)
                    .map_err(|error| CalcError::Failed(error.to_string()))?
                    .float(0);
                cache.insert(key, value);
                Ok(Outcome::Value(value))
            }
        }
    }

    /// Seed the cache from the transmitted history and pick the starting
    /// point: the best returned evaluation, or the box center on a cold
    /// start.
    fn warm_start(&self, input: &Frame) -> (BTreeMap<Vec<u64>, f64>, Vec<f64>) {
        let mut cache = BTreeMap::new();
        let mut start: Option<(f64, Vec<f64>)> = None;

        if let (Some(x), Some(obj)) = (input.get(X), input.get(&self.objective)) {
            for row in 0..input.len() {
                if input.get(RETURNED).map_or(false, |flags| !flags.flag(row)) {
                    continue;
                }
                let point = x.vec(row).to_vec();
                let value = obj.float(row);
                cache.insert(point.iter().map(|v| v.to_bits()).collect_vec(), value);
                if start.as_ref().map_or(true, |(best, _)| value < *best) {
                    start = Some((value, point));
                }
            }
        }

        let x0 = start.map(|(_, point)| point).unwrap_or_else(|| {
            self.lb
                .iter()
                .zip(&self.ub)
                .map(|(&lo, &hi)| 0.5 * (lo + hi))
                .collect_vec()
        });

        (cache, x0)
    }
}

impl Generator for LocalRefine {
    fn run_persistent(
        &self,
        input: &Frame,
        _stream: &mut RunStream,
        comm: &GenComm<'_>,
    ) -> Result<Option<Frame>, CalcError> {
        let (mut cache, mut x) = self.warm_start(input);

        let dist_to_bound = x
            .iter()
            .zip(self.lb.iter().zip(&self.ub))
            .map(|(&v, (&lo, &hi))| (v - lo).min(hi - v))
            .fold(f64::INFINITY, f64::min);
        let mut step = (dist_to_bound * self.step_multiple).max(self.xtol);

        let mut fx = match self.eval_point(&x, &mut cache, comm)? {
            Outcome::Value(value) => value,
            Outcome::Stopped => return Ok(Some(proposal_frame(&[x], &self.lb, &self.ub, true))),
        };
        let mut evals = 1;

        'search: while step > self.xtol && evals < self.max_evals {
            let mut improved = false;

            for d in 0..x.len() {
                for sign in [1.0, -1.0] {
                    let mut candidate = x.clone();
                    candidate[d] = (candidate[d] + sign * step).clamp(self.lb[d], self.ub[d]);
                    if candidate[d] == x[d] {
                        continue;
                    }

                    match self.eval_point(&candidate, &mut cache, comm)? {
                        Outcome::Stopped => break 'search,
                        Outcome::Value(value) => {
                            evals += 1;
                            if value < fx {
                                x = candidate;
                                fx = value;
                                improved = true;
                            }
                        }
                    }
                    if evals >= self.max_evals {
                        break 'search;
                    }
                }
            }

            if !improved {
                step *= 0.5;
            }
        }

        info!(worker = comm.worker(), best = fx, evals, "local refinement finished");

        Ok(Some(proposal_frame(&[x], &self.lb, &self.ub, true)))
    }
}
