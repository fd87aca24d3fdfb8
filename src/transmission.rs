//! Contact sampling, partner selection, and infection decisions.
//!
//! Two interchangeable partner-selection strategies are provided: the
//! default binned strategy (infected agents bucketed by 5-year age bin and
//! risk group, assortative draws over neighboring bins) and a linear-scan
//! baseline weighting the full infected pool by age difference.

use crate::agent::{Agent, Sex};
use crate::config::ModelParameters;
use anyhow::Result;
use rand::prelude::*;
use rand_chacha::ChaCha12Rng;
use rand_distr::{Poisson, weighted::WeightedIndex};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Youngest age taking part in sexual mixing.
const MIXING_MIN_AGE: f64 = 15.0;
/// Width of the assortative age bins, in years.
const AGE_BIN_YEARS: f64 = 5.0;
/// Neighbor kernel over age-bin offsets: same and adjacent bins dominate.
const BIN_OFFSETS: [i64; 5] = [-2, -1, 0, 1, 2];
const BIN_OFFSET_WEIGHTS: [f64; 5] = [0.1, 0.2, 0.4, 0.2, 0.1];
/// Probability of picking a partner from the same risk group.
const SAME_RISK_PREFERENCE: f64 = 0.7;

/// Partner-selection strategy.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MixingMethod {
    /// Bucketed assortative mixing; the default.
    #[default]
    Binned,
    /// Weighted draw over the full infected pool; baseline for benchmarks.
    Scan,
}

/// Poisson sampler for per-agent contact counts.
///
/// The accelerated path samples in parallel, giving every agent slot its own
/// generator seeded from `(base seed, step, slot)` so results do not depend
/// on thread scheduling. It touches no agent state.
pub struct ContactSampler {
    accelerated: bool,
    base_seed: u64,
    step: u64,
}

impl ContactSampler {
    pub fn new(accelerated: bool, base_seed: u64) -> Self {
        Self {
            accelerated,
            base_seed,
            step: 0,
        }
    }

    /// Draw one Poisson count per entry of `lambdas`.
    pub fn poisson_counts(
        &mut self,
        lambdas: &[f64],
        rng: &mut ChaCha12Rng,
    ) -> Result<Vec<u64>> {
        self.step += 1;
        if !self.accelerated {
            return lambdas
                .iter()
                .map(|&lambda| sample_poisson(lambda, rng))
                .collect();
        }

        let step_seed = self
            .base_seed
            .wrapping_add(self.step.wrapping_mul(0x9e37_79b9_7f4a_7c15));
        lambdas
            .par_iter()
            .enumerate()
            .map(|(slot, &lambda)| {
                let slot_seed =
                    step_seed ^ (slot as u64).wrapping_mul(0xd1b5_4a32_d192_ed03);
                let mut slot_rng = ChaCha12Rng::seed_from_u64(slot_seed);
                sample_poisson(lambda, &mut slot_rng)
            })
            .collect()
    }
}

fn sample_poisson(lambda: f64, rng: &mut ChaCha12Rng) -> Result<u64> {
    if lambda <= 0.0 {
        return Ok(0);
    }
    let count = Poisson::new(lambda)?.sample(rng);
    Ok(count as u64)
}

/// Run one transmission step and infect the selected susceptible agents.
///
/// Returns the number of new infections. A step with no infected or no
/// eligible susceptible agents is a no-op.
pub fn transmission_step(
    agents: &mut [Agent],
    year: f64,
    dt: f64,
    params: &ModelParameters,
    method: MixingMethod,
    sampler: &mut ContactSampler,
    rng: &mut ChaCha12Rng,
) -> Result<usize> {
    let infected: Vec<usize> = (0..agents.len())
        .filter(|&i| agents[i].alive && agents[i].is_infected())
        .collect();
    let susceptible: Vec<usize> = (0..agents.len())
        .filter(|&i| {
            agents[i].alive && !agents[i].is_infected() && agents[i].age >= MIXING_MIN_AGE
        })
        .collect();
    if infected.is_empty() || susceptible.is_empty() {
        return Ok(0);
    }

    let lambdas: Vec<f64> = susceptible
        .iter()
        .map(|&i| agents[i].contacts_per_year * dt)
        .collect();
    let counts = sampler.poisson_counts(&lambdas, rng)?;

    let bins = match method {
        MixingMethod::Binned => Some(InfectedBins::build(agents, &infected)),
        MixingMethod::Scan => None,
    };
    let offset_dist = WeightedIndex::new(BIN_OFFSET_WEIGHTS)?;

    let mut newly_infected = Vec::new();
    for (slot, &i_sus) in susceptible.iter().enumerate() {
        for _ in 0..counts[slot] {
            let i_partner = match &bins {
                Some(bins) => bins.sample_partner(&agents[i_sus], &offset_dist, rng),
                None => scan_partner(agents, &infected, &agents[i_sus], rng)?,
            };

            let prob = infection_probability(&agents[i_sus], &agents[i_partner], year, params, rng);
            if rng.random::<f64>() < prob {
                newly_infected.push(i_sus);
                // At most one infection event per agent per step.
                break;
            }
        }
    }

    for &i in &newly_infected {
        agents[i].infect(params, rng)?;
    }
    Ok(newly_infected.len())
}

/// Per-contact infection probability for `sus` exposed to `partner`.
fn infection_probability(
    sus: &Agent,
    partner: &Agent,
    year: f64,
    params: &ModelParameters,
    rng: &mut ChaCha12Rng,
) -> f64 {
    let mut prob = partner.infectivity(year, params, rng);
    if prob <= 0.0 {
        return 0.0;
    }

    prob *= params.risk_multiplier(sus.risk_group, year);

    if sus.sex == Sex::Male && rng.random::<f64>() < params.circumcision_prevalence {
        prob *= params.circumcision_protection;
    }

    let coverage = params.condom_coverage.value_at(year) * params.funding_factor(year);
    prob *= 1.0 - coverage.clamp(0.0, 1.0) * params.condom_efficacy;

    prob.clamp(0.0, 1.0)
}

fn age_bin(age: f64) -> i64 {
    (age / AGE_BIN_YEARS).floor() as i64
}

/// Infected agents bucketed by (5-year age bin, risk group), with fallback
/// pools for sparse buckets.
struct InfectedBins {
    by_bin_risk: HashMap<(i64, usize), Vec<usize>>,
    by_bin: HashMap<i64, Vec<usize>>,
    all: Vec<usize>,
}

impl InfectedBins {
    fn build(agents: &[Agent], infected: &[usize]) -> Self {
        let mut by_bin_risk: HashMap<(i64, usize), Vec<usize>> = HashMap::new();
        let mut by_bin: HashMap<i64, Vec<usize>> = HashMap::new();
        for &i in infected {
            let bin = age_bin(agents[i].age);
            let risk = agents[i].risk_group.index();
            by_bin_risk.entry((bin, risk)).or_default().push(i);
            by_bin.entry(bin).or_default().push(i);
        }
        Self {
            by_bin_risk,
            by_bin,
            all: infected.to_vec(),
        }
    }

    /// Draw a partner for `sus`: target bucket first, then same age bin with
    /// any risk group, then the full infected pool.
    fn sample_partner(
        &self,
        sus: &Agent,
        offset_dist: &WeightedIndex<f64>,
        rng: &mut ChaCha12Rng,
    ) -> usize {
        let target_bin = age_bin(sus.age) + BIN_OFFSETS[offset_dist.sample(rng)];

        let own_risk = sus.risk_group.index();
        let target_risk = if rng.random::<f64>() < SAME_RISK_PREFERENCE {
            own_risk
        } else {
            // One of the two other groups, uniformly.
            let others = [(own_risk + 1) % 3, (own_risk + 2) % 3];
            others[rng.random_range(0..2)]
        };

        let pool = self
            .by_bin_risk
            .get(&(target_bin, target_risk))
            .or_else(|| self.by_bin.get(&target_bin))
            .map(Vec::as_slice)
            .unwrap_or(&self.all);

        // Pools are never empty by construction.
        *pool.choose(rng).unwrap_or(&self.all[0])
    }
}

/// Baseline strategy: weighted draw over every infected agent, with weights
/// decaying from 1 within 5 years of age difference to a floor of 0.05 at
/// 20 years and beyond.
fn scan_partner(
    agents: &[Agent],
    infected: &[usize],
    sus: &Agent,
    rng: &mut ChaCha12Rng,
) -> Result<usize> {
    let weights: Vec<f64> = infected
        .iter()
        .map(|&i| {
            let diff = (agents[i].age - sus.age).abs();
            if diff <= 5.0 {
                1.0
            } else if diff >= 20.0 {
                0.05
            } else {
                1.0 - 0.95 * (diff - 5.0) / 15.0
            }
        })
        .collect();
    let dist = WeightedIndex::new(&weights)?;
    Ok(infected[dist.sample(rng)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{HivStatus, RiskGroup};
    use rand::SeedableRng;

    fn make_agents(n_susceptible: usize, n_infected: usize) -> Vec<Agent> {
        let params = ModelParameters::default();
        let mut rng = ChaCha12Rng::seed_from_u64(11);
        let mut agents = Vec::new();
        for i in 0..n_susceptible + n_infected {
            let mut agent = Agent::new(
                i as u64,
                30.0,
                if i % 2 == 0 { Sex::Female } else { Sex::Male },
                0,
                RiskGroup::High,
                &params,
                &mut rng,
            )
            .unwrap();
            if i >= n_susceptible {
                agent.infect(&params, &mut rng).unwrap();
            }
            agents.push(agent);
        }
        agents
    }

    #[test]
    fn no_infected_pool_is_a_noop() {
        let params = ModelParameters::default();
        let mut rng = ChaCha12Rng::seed_from_u64(12);
        let mut sampler = ContactSampler::new(false, 12);
        let mut agents = make_agents(50, 0);

        let n = transmission_step(
            &mut agents,
            2000.0,
            1.0,
            &params,
            MixingMethod::Binned,
            &mut sampler,
            &mut rng,
        )
        .unwrap();
        assert_eq!(n, 0);
        assert!(agents.iter().all(|a| !a.is_infected()));
    }

    #[test]
    fn no_susceptible_pool_is_a_noop() {
        let params = ModelParameters::default();
        let mut rng = ChaCha12Rng::seed_from_u64(13);
        let mut sampler = ContactSampler::new(false, 13);
        let mut agents = make_agents(0, 50);

        let n = transmission_step(
            &mut agents,
            2000.0,
            1.0,
            &params,
            MixingMethod::Binned,
            &mut sampler,
            &mut rng,
        )
        .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn minors_are_not_exposed() {
        let params = ModelParameters::default();
        let mut rng = ChaCha12Rng::seed_from_u64(14);
        let mut sampler = ContactSampler::new(false, 14);
        let mut agents = make_agents(20, 20);
        for agent in agents.iter_mut().take(20) {
            agent.age = 8.0;
        }

        for _ in 0..50 {
            transmission_step(
                &mut agents,
                2000.0,
                1.0,
                &params,
                MixingMethod::Binned,
                &mut sampler,
                &mut rng,
            )
            .unwrap();
        }
        assert!(agents.iter().take(20).all(|a| !a.is_infected()));
    }

    #[test]
    fn both_strategies_produce_infections() {
        for method in [MixingMethod::Binned, MixingMethod::Scan] {
            let params = ModelParameters::default();
            let mut rng = ChaCha12Rng::seed_from_u64(15);
            let mut sampler = ContactSampler::new(false, 15);
            let mut agents = make_agents(200, 50);

            let mut total = 0;
            for _ in 0..20 {
                total += transmission_step(
                    &mut agents,
                    1995.0,
                    1.0,
                    &params,
                    method,
                    &mut sampler,
                    &mut rng,
                )
                .unwrap();
            }
            assert!(total > 0, "no infections with {method:?}");
        }
    }

    #[test]
    fn accelerated_sampler_is_deterministic() {
        let lambdas: Vec<f64> = (0..100).map(|i| 0.5 + i as f64 * 0.1).collect();

        let mut rng_a = ChaCha12Rng::seed_from_u64(16);
        let mut sampler_a = ContactSampler::new(true, 99);
        let counts_a = sampler_a.poisson_counts(&lambdas, &mut rng_a).unwrap();

        let mut rng_b = ChaCha12Rng::seed_from_u64(16);
        let mut sampler_b = ContactSampler::new(true, 99);
        let counts_b = sampler_b.poisson_counts(&lambdas, &mut rng_b).unwrap();

        assert_eq!(counts_a, counts_b);
    }

    #[test]
    fn newly_infected_start_acute() {
        let params = ModelParameters::default();
        let mut rng = ChaCha12Rng::seed_from_u64(17);
        let mut sampler = ContactSampler::new(false, 17);
        let mut agents = make_agents(200, 50);

        for _ in 0..20 {
            transmission_step(
                &mut agents,
                1995.0,
                1.0,
                &params,
                MixingMethod::Binned,
                &mut sampler,
                &mut rng,
            )
            .unwrap();
        }
        // Infections seeded by the step itself are acute with time zero.
        let fresh: Vec<_> = agents
            .iter()
            .take(200)
            .filter(|a| a.is_infected())
            .collect();
        assert!(!fresh.is_empty());
        assert!(fresh.iter().all(|a| a.hiv_status == HivStatus::Acute));
        assert!(fresh.iter().all(|a| a.infection_time == 0.0));
    }
}
