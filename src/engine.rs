use crate::agent::{Agent, DeathCause, HivStatus, RiskGroup, Sex};
use crate::config::Config;
use crate::results::{SimulationResults, YearCounters, YearSnapshot, take_snapshot};
use crate::transmission::{ContactSampler, transmission_step};
use anyhow::{Context, Result, bail};
use rand::prelude::*;
use rand_chacha::ChaCha12Rng;
use rand_distr::{Poisson, weighted::WeightedIndex};
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

/// Width of the age bands weighted at population initialization.
const AGE_BAND_YEARS: f64 = 10.0;
/// Childbearing age range for the birth process.
const FERTILE_AGE_RANGE: (f64, f64) = (15.0, 45.0);
/// Era boundaries of the historical MTCT risk decline.
const MTCT_ERA_YEARS: [f64; 2] = [2004.0, 2014.0];
/// Sleep interval while paused.
const PAUSE_POLL: Duration = Duration::from_millis(20);

/// Cooperative run-control handle, checked once per internal step.
///
/// Cloneable and shareable across threads; `request_stop` ends the run early
/// (returning the snapshots recorded so far), `request_pause` makes the loop
/// sleep until `resume` or a stop.
#[derive(Debug, Clone, Default)]
pub struct SimControl {
    flags: Arc<ControlFlags>,
}

#[derive(Debug, Default)]
struct ControlFlags {
    stop: AtomicBool,
    pause: AtomicBool,
}

impl SimControl {
    pub fn request_stop(&self) {
        self.flags.stop.store(true, Ordering::Relaxed);
    }

    pub fn request_pause(&self) {
        self.flags.pause.store(true, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.flags.pause.store(false, Ordering::Relaxed);
    }

    pub fn stop_requested(&self) -> bool {
        self.flags.stop.load(Ordering::Relaxed)
    }

    pub fn paused(&self) -> bool {
        self.flags.pause.load(Ordering::Relaxed)
    }
}

/// Per-year streaming callback: receives each recorded snapshot plus the
/// run-progress fraction in `[0, 1]`. Errors are logged, never propagated.
pub type YearCallback = Box<dyn FnMut(&YearSnapshot, f64) -> Result<()> + Send>;

/// Simulation engine.
///
/// Owns the population, the calibrated parameters, and the run RNG, and
/// drives the yearly cycle of state updates, transmission, deaths, births,
/// and snapshot recording.
pub struct Engine {
    cfg: Config,
    agents: Vec<Agent>,
    next_id: u64,
    rng: ChaCha12Rng,
    seed: u64,
    sampler: ContactSampler,
    counters: YearCounters,
    control: SimControl,
    year_callback: Option<YearCallback>,
}

impl Engine {
    /// Create a new `Engine` with an initial population drawn from the
    /// configured age, sex, and risk-group distributions, seeded with the
    /// configured HIV prevalence.
    pub fn new(cfg: Config) -> Result<Self> {
        let seed = match cfg.run.seed {
            Some(seed) => seed,
            None => ChaCha12Rng::try_from_os_rng()?.random(),
        };
        let mut rng = ChaCha12Rng::seed_from_u64(seed);
        let sampler = ContactSampler::new(cfg.run.accelerated, seed);

        let agents = generate_population(&cfg, &mut rng)?;
        let next_id = agents.len() as u64;

        log::info!(
            "initialized {} agents (seed {seed}, mixing {:?}, accelerated {})",
            agents.len(),
            cfg.run.mixing_method,
            cfg.run.accelerated,
        );

        Ok(Self {
            cfg,
            agents,
            next_id,
            rng,
            seed,
            sampler,
            counters: YearCounters::default(),
            control: SimControl::default(),
            year_callback: None,
        })
    }

    /// The seed this run derives all randomness from.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Handle for cooperative pause/stop control.
    pub fn control(&self) -> SimControl {
        self.control.clone()
    }

    /// Install a per-year streaming callback.
    pub fn set_year_callback(&mut self, callback: YearCallback) {
        self.year_callback = Some(callback);
    }

    /// Infect `n` randomly chosen susceptible agents (external seeding).
    pub fn seed_infections(&mut self, n: usize) -> Result<()> {
        let mut candidates: Vec<usize> = (0..self.agents.len())
            .filter(|&i| self.agents[i].alive && !self.agents[i].is_infected())
            .collect();
        candidates.shuffle(&mut self.rng);
        for &i in candidates.iter().take(n) {
            self.agents[i].infect(&self.cfg.params, &mut self.rng)?;
        }
        Ok(())
    }

    /// Run the simulation for `years` with timestep `dt` and return the
    /// result table. Row 0 is the initial state before any stepping.
    pub fn run_simulation(&mut self, years: usize, dt: f64) -> Result<SimulationResults> {
        if years == 0 {
            bail!("number of years must be positive");
        }
        if !(dt > 0.0 && dt <= 1.0) {
            bail!("timestep must be in (0, 1] years, but is {dt}");
        }
        let steps_per_year = ((1.0 / dt).round() as usize).max(1);
        let start_year = self.cfg.run.start_year;

        let mut results = SimulationResults::default();
        self.counters.reset();
        self.record_year(&mut results, start_year, 0.0);

        'years: for elapsed in 0..years {
            for step in 0..steps_per_year {
                if self.wait_if_paused() {
                    break 'years;
                }
                let year = start_year + elapsed as f64 + step as f64 * dt;
                self.perform_step(dt, year)
                    .context("failed to perform step")?;
            }

            let recorded_year = start_year + (elapsed + 1) as f64;
            let progress = (elapsed + 1) as f64 / years as f64;
            self.record_year(&mut results, recorded_year, progress);
            log::debug!(
                "recorded year {recorded_year}: {} alive",
                results.last().map_or(0, |r| r.total_population)
            );
        }

        Ok(results)
    }

    /// Check the control flags; returns true when the run should stop.
    fn wait_if_paused(&self) -> bool {
        while self.control.paused() && !self.control.stop_requested() {
            thread::sleep(PAUSE_POLL);
        }
        self.control.stop_requested()
    }

    fn perform_step(&mut self, dt: f64, year: f64) -> Result<()> {
        // Per-agent state updates touch only each agent's own fields.
        for agent in self.agents.iter_mut().filter(|a| a.alive) {
            agent.step(dt, year, &self.cfg.params, &mut self.rng)?;
        }

        transmission_step(
            &mut self.agents,
            year,
            dt,
            &self.cfg.params,
            self.cfg.run.mixing_method,
            &mut self.sampler,
            &mut self.rng,
        )
        .context("failed to run transmission step")?;

        self.mortality_step(dt, year)
            .context("failed to run mortality step")?;

        self.birth_step(dt, year)
            .context("failed to run birth step")?;

        Ok(())
    }

    fn mortality_step(&mut self, dt: f64, year: f64) -> Result<()> {
        let params = &self.cfg.params;
        let base_rate = params.death_rate_at(year);

        // Iterate a stable index snapshot; deaths tombstone in place and the
        // population is compacted after the pass.
        for i in 0..self.agents.len() {
            let agent = &self.agents[i];
            if !agent.alive {
                continue;
            }

            let mut natural_hazard = base_rate;
            if agent.age > 50.0 {
                natural_hazard += params.old_age_mortality_excess * (agent.age - 50.0) / 10.0;
            }
            if agent.age < 5.0 {
                natural_hazard += params.child_mortality_excess;
            }

            let mut hazard = natural_hazard;
            if agent.is_infected() {
                let mut mult = match agent.hiv_status {
                    HivStatus::Susceptible => 1.0,
                    HivStatus::Acute => params.hiv_mortality_multipliers[0],
                    HivStatus::Chronic => params.hiv_mortality_multipliers[1],
                    HivStatus::Aids => params.hiv_mortality_multipliers[2],
                };
                if agent.on_art {
                    mult = 1.0 + (mult - 1.0) * params.art_mortality_reduction;
                }
                hazard *= mult;
            }

            if self.rng.random::<f64>() < (hazard * dt).min(1.0) {
                // Attribute the death in proportion to the HIV excess hazard.
                let hiv_share = (hazard - natural_hazard) / hazard;
                let cause = if self.agents[i].is_infected()
                    && self.rng.random::<f64>() < hiv_share
                {
                    self.counters.deaths_hiv += 1;
                    DeathCause::Hiv
                } else {
                    self.counters.deaths_natural += 1;
                    DeathCause::Natural
                };
                let agent = &mut self.agents[i];
                agent.alive = false;
                agent.death_cause = Some(cause);
            }
        }

        self.agents.retain(|a| a.alive);
        Ok(())
    }

    fn birth_step(&mut self, dt: f64, year: f64) -> Result<()> {
        let mothers: Vec<usize> = (0..self.agents.len())
            .filter(|&i| {
                let a = &self.agents[i];
                a.alive
                    && a.sex == Sex::Female
                    && a.age >= FERTILE_AGE_RANGE.0
                    && a.age < FERTILE_AGE_RANGE.1
            })
            .collect();
        if mothers.is_empty() {
            return Ok(());
        }

        let birth_rate = self.cfg.params.birth_rate.value_at(year);
        let lambda = mothers.len() as f64 * birth_rate * dt;
        if lambda <= 0.0 {
            return Ok(());
        }
        let n_births = Poisson::new(lambda)?.sample(&mut self.rng) as usize;

        let risk_dist = WeightedIndex::new(self.cfg.params.risk_distribution)?;
        for _ in 0..n_births {
            let &i_mother = mothers
                .choose(&mut self.rng)
                .context("failed to choose a mother")?;
            let mother_infected = self.agents[i_mother].is_infected();
            let mother_on_art = self.agents[i_mother].on_art;
            let region = self.agents[i_mother].region;

            let sex = if self.rng.random_bool(0.5) {
                Sex::Female
            } else {
                Sex::Male
            };
            let risk = RiskGroup::ALL[risk_dist.sample(&mut self.rng)];
            let id = self.next_id;
            self.next_id += 1;

            let mut newborn =
                Agent::new(id, 0.0, sex, region, risk, &self.cfg.params, &mut self.rng)?;

            if mother_infected {
                let era = MTCT_ERA_YEARS.iter().filter(|&&y| year >= y).count();
                let mut mtct_rate = self.cfg.params.mtct_rates[era];
                if mother_on_art {
                    mtct_rate *= self.cfg.params.mtct_art_multipliers[era];
                }
                if self.rng.random::<f64>() < mtct_rate {
                    newborn.infect_at_birth(&self.cfg.params, &mut self.rng)?;
                }
            }

            self.counters.births += 1;
            self.agents.push(newborn);
        }

        Ok(())
    }

    fn record_year(&mut self, results: &mut SimulationResults, year: f64, progress: f64) {
        let snapshot = take_snapshot(&self.agents, year, &self.counters);
        self.counters.reset();

        if let Some(callback) = &mut self.year_callback {
            // A failing callback must never abort the simulation.
            if let Err(error) = callback(&snapshot, progress) {
                log::warn!("year callback failed: {error:#}");
            }
        }

        results.push(snapshot);
    }
}

/// Draw the initial population: banded age pyramid, fair sex draw, risk
/// groups from the configured shares, and prevalent infections at the
/// configured initial prevalence.
fn generate_population(cfg: &Config, rng: &mut ChaCha12Rng) -> Result<Vec<Agent>> {
    let params = &cfg.params;
    let age_band_dist = WeightedIndex::new(&params.age_band_weights)?;
    let risk_dist = WeightedIndex::new(params.risk_distribution)?;

    let mut agents = Vec::with_capacity(cfg.run.n_agents);
    for id in 0..cfg.run.n_agents as u64 {
        let band = age_band_dist.sample(rng);
        let age = band as f64 * AGE_BAND_YEARS + rng.random_range(0.0..AGE_BAND_YEARS);
        let sex = if rng.random_bool(0.5) {
            Sex::Female
        } else {
            Sex::Male
        };
        let risk = RiskGroup::ALL[risk_dist.sample(rng)];
        let region = rng.random_range(0..params.n_regions);

        let mut agent = Agent::new(id, age, sex, region, risk, params, rng)?;
        if age >= 15.0 && rng.random::<f64>() < params.initial_hiv_prevalence {
            agent.seed_prevalent_infection(params, rng)?;
        }
        agents.push(agent);
    }

    Ok(agents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_before_run_returns_initial_row_only() {
        let mut cfg = Config::default();
        cfg.run.n_agents = 100;
        cfg.run.seed = Some(42);
        let mut engine = Engine::new(cfg).unwrap();
        engine.control().request_stop();

        let results = engine.run_simulation(10, 0.5).unwrap();
        assert_eq!(results.rows().len(), 1);
        assert_eq!(results.rows()[0].year, 1990.0);
    }

    #[test]
    fn invalid_timestep_is_rejected() {
        let mut cfg = Config::default();
        cfg.run.n_agents = 10;
        cfg.run.seed = Some(1);
        let mut engine = Engine::new(cfg).unwrap();
        assert!(engine.run_simulation(5, 0.0).is_err());
        assert!(engine.run_simulation(5, 1.5).is_err());
        assert!(engine.run_simulation(0, 0.5).is_err());
    }

    #[test]
    fn ids_are_never_reused() {
        let mut cfg = Config::default();
        cfg.run.n_agents = 300;
        cfg.run.seed = Some(7);
        let mut engine = Engine::new(cfg).unwrap();
        engine.run_simulation(20, 0.5).unwrap();

        let mut ids: Vec<u64> = engine.agents.iter().map(|a| a.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), engine.agents.len());
    }

    #[test]
    fn dead_agents_are_compacted_out() {
        let mut cfg = Config::default();
        cfg.run.n_agents = 500;
        cfg.run.seed = Some(9);
        let mut engine = Engine::new(cfg).unwrap();
        engine.run_simulation(30, 0.5).unwrap();
        assert!(engine.agents.iter().all(|a| a.alive));
    }
}
