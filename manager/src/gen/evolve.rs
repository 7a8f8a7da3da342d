use crate::alloc::RunStream;
use crate::comms::{GenComm, Reply, Tag};
use crate::gen::support::proposal_frame;
use crate::history::Frame;
use crate::specs::{CalcError, Generator};
use itertools::Itertools;
use rand::rngs::SmallRng;
use rand::Rng;
use tracing::{debug, info};

/// Generation based evolutionary loop speaking the persistent protocol.
///
/// Generation zero evaluates the whole population through one round trip.
/// Every later generation applies bounded simulated binary crossover and
/// bounded polynomial mutation to tournament selected offspring, evaluates
/// only the individuals whose fitness the variation invalidated (a
/// generation without any is valid and skips the round trip entirely), then
/// keeps the best of parents and offspring. The loop ends exactly when a
/// stop tag arrives and reports the best fitness found so far.
#[derive(Debug, Clone)]
pub struct Evolutionary {
    pub lb: Vec<f64>,
    pub ub: Vec<f64>,
    pub pop_size: usize,
    /// probability an offspring pair is crossed
    pub cxpb: f64,
    /// crowding degree of the bounded variation operators
    pub eta: f64,
    /// per gene mutation probability
    pub indpb: f64,
    /// result field carrying the fitness value back from evaluations
    pub fitness_field: String,
}

#[derive(Debug, Clone)]
struct Individual {
    x: Vec<f64>,
    /// cleared whenever variation touches the genome
    fitness: Option<f64>,
}

impl Evolutionary {
    /// Round trip the selected individuals through the manager for
    /// evaluation. Returns the stop tag if one arrived instead of results.
    fn evaluate_pop(
        &self,
        pop: &mut [Individual],
        which: &[usize],
        comm: &GenComm<'_>,
    ) -> Result<Option<Tag>, CalcError> {
        let points = which.iter().map(|&i| pop[i].x.clone()).collect_vec();

        match comm.sendrecv(proposal_frame(&points, &self.lb, &self.ub, false))? {
            Reply::Stop(tag) => Ok(Some(tag)),
            Reply::Results(results) => {
                let values = results
                    .values
                    .column(&self.fitness_field)
                    .map_err(|error| CalcError::Failed(error.to_string()))?;
                for (k, &i) in which.iter().enumerate() {
                    pop[i].fitness = Some(values.float(k));
                }
                Ok(None)
            }
        }
    }

    /// Bounded simulated binary crossover. Returns whether anything changed.
    fn crossover(&self, a: &mut [f64], b: &mut [f64], rng: &mut SmallRng) -> bool {
        let mut changed = false;
        for i in 0..a.len() {
            if rng.gen::<f64>() > 0.5 {
                continue;
            }
            let (x1, x2) = if a[i] <= b[i] { (a[i], b[i]) } else { (b[i], a[i]) };
            if x2 - x1 < 1e-14 {
                continue;
            }
            let (xl, xu) = (self.lb[i], self.ub[i]);
            let u: f64 = rng.gen();
            let spread = |beta: f64| -> f64 {
                let alpha = 2.0 - beta.powf(-(self.eta + 1.0));
                if u <= 1.0 / alpha {
                    (u * alpha).powf(1.0 / (self.eta + 1.0))
                } else {
                    (1.0 / (2.0 - u * alpha)).powf(1.0 / (self.eta + 1.0))
                }
            };

            let beta_low = 1.0 + 2.0 * (x1 - xl) / (x2 - x1);
            let c1 = (0.5 * (x1 + x2 - spread(beta_low) * (x2 - x1))).clamp(xl, xu);
            let beta_high = 1.0 + 2.0 * (xu - x2) / (x2 - x1);
            let c2 = (0.5 * (x1 + x2 + spread(beta_high) * (x2 - x1))).clamp(xl, xu);

            if rng.gen::<f64>() <= 0.5 {
                a[i] = c2;
                b[i] = c1;
            } else {
                a[i] = c1;
                b[i] = c2;
            }
            changed = true;
        }
        changed
    }

    /// Bounded polynomial mutation. Returns whether anything changed.
    fn mutate(&self, x: &mut [f64], rng: &mut SmallRng) -> bool {
        let mut changed = false;
        for i in 0..x.len() {
            if rng.gen::<f64>() > self.indpb {
                continue;
            }
            let (xl, xu) = (self.lb[i], self.ub[i]);
            if xu - xl < 1e-14 {
                continue;
            }
            let delta1 = (x[i] - xl) / (xu - xl);
            let delta2 = (xu - x[i]) / (xu - xl);
            let u: f64 = rng.gen();
            let mut_pow = 1.0 / (self.eta + 1.0);
            let delta_q = if u < 0.5 {
                let xy = 1.0 - delta1;
                let val = 2.0 * u + (1.0 - 2.0 * u) * xy.powf(self.eta + 1.0);
                val.powf(mut_pow) - 1.0
            } else {
                let xy = 1.0 - delta2;
                let val = 2.0 * (1.0 - u) + (2.0 * u - 1.0) * xy.powf(self.eta + 1.0);
                1.0 - val.powf(mut_pow)
            };
            x[i] = (x[i] + delta_q * (xu - xl)).clamp(xl, xu);
            changed = true;
        }
        changed
    }

    /// Binary tournament over an evaluated population, lower fitness wins.
    fn tournament(&self, pop: &[Individual], rng: &mut SmallRng) -> Vec<Individual> {
        (0..pop.len())
            .map(|_| {
                let a = rng.gen_range(0..pop.len());
                let b = rng.gen_range(0..pop.len());
                let winner = if pop[a].fitness <= pop[b].fitness { a } else { b };
                pop[winner].clone()
            })
            .collect()
    }

    /// Environmental selection: the `mu` best evaluated individuals.
    fn select(&self, mut pool: Vec<Individual>, mu: usize) -> Vec<Individual> {
        pool.retain(|ind| ind.fitness.is_some());
        pool.sort_by(|p, q| {
            p.fitness
                .partial_cmp(&q.fitness)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        pool.truncate(mu);
        pool
    }

    fn best(pop: &[Individual]) -> Option<&Individual> {
        pop.iter()
            .filter(|ind| ind.fitness.is_some())
            .min_by(|p, q| {
                p.fitness
                    .partial_cmp(&q.fitness)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    }
}

impl Generator for Evolutionary {
    fn run_persistent(
        &self,
        _input: &Frame,
        stream: &mut RunStream,
        comm: &GenComm<'_>,
    ) -> Result<Option<Frame>, CalcError> {
        let mut pop: Vec<Individual> = (0..self.pop_size)
            .map(|_| Individual {
                x: self
                    .lb
                    .iter()
                    .zip(&self.ub)
                    .map(|(&lo, &hi)| stream.rng.gen_range(lo..=hi))
                    .collect(),
                fitness: None,
            })
            .collect();

        let everyone = (0..pop.len()).collect_vec();
        let mut stop_tag = self.evaluate_pop(&mut pop, &everyone, comm)?;
        let mut generation: u64 = 0;

        while stop_tag.is_none() {
            generation += 1;

            let mut offspring = self.tournament(&pop, &mut stream.rng);
            for k in (0..offspring.len()).step_by(2) {
                if k + 1 < offspring.len() && stream.rng.gen::<f64>() <= self.cxpb {
                    let (left, right) = offspring.split_at_mut(k + 1);
                    if self.crossover(&mut left[k].x, &mut right[0].x, &mut stream.rng) {
                        left[k].fitness = None;
                        right[0].fitness = None;
                    }
                }
            }
            for ind in offspring.iter_mut() {
                if self.mutate(&mut ind.x, &mut stream.rng) {
                    ind.fitness = None;
                }
            }

            let invalid = offspring
                .iter()
                .positions(|ind| ind.fitness.is_none())
                .collect_vec();
            if invalid.is_empty() {
                // variation left every fitness intact, keep evolving without
                // a round trip
                debug!(generation, "no individuals required evaluation");
                continue;
            }

            stop_tag = self.evaluate_pop(&mut offspring, &invalid, comm)?;
            if stop_tag.is_none() {
                pop.append(&mut offspring);
                pop = self.select(pop, self.pop_size);
            }

            if let Some(best) = Self::best(&pop) {
                debug!(generation, best = best.fitness.unwrap(), "generation complete");
            }
        }

        let best = Self::best(&pop);
        info!(
            tag = ?stop_tag.unwrap(),
            generation,
            best = best.and_then(|ind| ind.fitness),
            "evolution met its exit criteria"
        );

        Ok(best.map(|ind| proposal_frame(&[ind.x.clone()], &self.lb, &self.ub, false)))
    }
}
