use crate::alloc::RunStream;
use crate::gen::support::proposal_frame;
use crate::history::Frame;
use crate::specs::{CalcError, Generator};
use itertools::Itertools;
use rand::Rng;
use tracing::debug;

/// One-shot batch sampler, uniform over the box `[lb, ub]`. Draws from the
/// worker's seeded stream so repeated runs propose identical batches.
#[derive(Debug, Clone)]
pub struct UniformSample {
    pub lb: Vec<f64>,
    pub ub: Vec<f64>,
    pub batch_size: usize,
}

impl Generator for UniformSample {
    fn generate(&self, _input: &Frame, stream: &mut RunStream) -> Result<Frame, CalcError> {
        let points = (0..self.batch_size)
            .map(|_| {
                self.lb
                    .iter()
                    .zip(&self.ub)
                    .map(|(&lo, &hi)| stream.rng.gen_range(lo..=hi))
                    .collect_vec()
            })
            .collect_vec();

        debug!(worker = stream.worker, batch = points.len(), "sampled uniform batch");

        Ok(proposal_frame(&points, &self.lb, &self.ub, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{X, X_ON_CUBE};
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn stream() -> RunStream {
        RunStream {
            worker: 1,
            rng: SmallRng::seed_from_u64(42),
        }
    }

    #[test]
    fn batches_stay_inside_the_bounds() {
        let gen = UniformSample {
            lb: vec![-3.0, 0.0],
            ub: vec![3.0, 1.0],
            batch_size: 50,
        };

        let frame = gen.generate(&Frame::new(0), &mut stream()).unwrap();
        assert_eq!(frame.len(), 50);
        let x = frame.column(X).unwrap();
        let cube = frame.column(X_ON_CUBE).unwrap();
        for row in 0..frame.len() {
            let point = x.vec(row);
            assert!(point[0] >= -3.0 && point[0] <= 3.0);
            assert!(point[1] >= 0.0 && point[1] <= 1.0);
            assert!(cube.vec(row).iter().all(|&c| (0.0..=1.0).contains(&c)));
        }
    }

    #[test]
    fn equal_seeds_propose_equal_batches() {
        let gen = UniformSample {
            lb: vec![0.0],
            ub: vec![1.0],
            batch_size: 5,
        };

        let first = gen.generate(&Frame::new(0), &mut stream()).unwrap();
        let second = gen.generate(&Frame::new(0), &mut stream()).unwrap();
        assert_eq!(first.column(X).unwrap(), second.column(X).unwrap());
    }
}
