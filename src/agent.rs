//! Per-agent disease, treatment, and behavioral state.

use crate::config::ModelParameters;
use anyhow::Result;
use rand::prelude::*;
use rand_chacha::ChaCha12Rng;
use rand_distr::{LogNormal, Normal};
use serde::{Deserialize, Serialize};

/// Era boundaries of the historical testing scale-up.
const TESTING_ERA_YEARS: [f64; 3] = [1995.0, 2004.0, 2015.0];
/// Era boundaries of the WHO treatment-eligibility guidelines.
const WHO_GUIDELINE_YEARS: [f64; 2] = [2010.0, 2013.0];
/// CD4 eligibility thresholds per guideline era (cells/µL).
const WHO_CD4_THRESHOLDS: [f64; 3] = [200.0, 350.0, 500.0];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sex {
    Male,
    Female,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskGroup {
    Low,
    Medium,
    High,
}

impl RiskGroup {
    pub const ALL: [RiskGroup; 3] = [RiskGroup::Low, RiskGroup::Medium, RiskGroup::High];

    /// Index into the `[low, medium, high]` parameter arrays.
    pub fn index(self) -> usize {
        match self {
            RiskGroup::Low => 0,
            RiskGroup::Medium => 1,
            RiskGroup::High => 2,
        }
    }
}

/// Disease stage. Forward-progressing except for the rare ART-induced
/// AIDS-to-chronic regression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HivStatus {
    Susceptible,
    Acute,
    Chronic,
    Aids,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeathCause {
    Hiv,
    Natural,
}

/// One simulated person.
///
/// All stochastic state updates draw from the RNG passed in by the engine;
/// an agent never mutates anything but its own fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: u64,
    pub age: f64,
    pub sex: Sex,
    pub region: usize,
    pub risk_group: RiskGroup,

    pub hiv_status: HivStatus,
    /// Years since infection; meaningless while susceptible.
    pub infection_time: f64,
    pub cd4_count: f64,
    pub viral_load: f64,

    pub tested: bool,
    pub diagnosed: bool,
    pub on_art: bool,
    pub art_start_year: Option<f64>,
    pub cd4_at_diagnosis: Option<f64>,

    /// Drawn once at creation from the risk-group contact distribution.
    pub contacts_per_year: f64,
    pub partnership_duration: f64,

    pub alive: bool,
    pub death_cause: Option<DeathCause>,
}

impl Agent {
    pub fn new(
        id: u64,
        age: f64,
        sex: Sex,
        region: usize,
        risk_group: RiskGroup,
        params: &ModelParameters,
        rng: &mut ChaCha12Rng,
    ) -> Result<Self> {
        let mean = params.contacts_mean[risk_group.index()];
        let sigma = params.contacts_sigma;
        // Mean-preserving log-normal draw.
        let contacts_dist = LogNormal::new(mean.ln() - 0.5 * sigma * sigma, sigma)?;
        let duration_dist = LogNormal::new(params.partnership_duration_years.ln(), 0.5)?;

        Ok(Self {
            id,
            age,
            sex,
            region,
            risk_group,
            hiv_status: HivStatus::Susceptible,
            infection_time: 0.0,
            cd4_count: 0.0,
            viral_load: 0.0,
            tested: false,
            diagnosed: false,
            on_art: false,
            art_start_year: None,
            cd4_at_diagnosis: None,
            contacts_per_year: contacts_dist.sample(rng),
            partnership_duration: duration_dist.sample(rng),
            alive: true,
            death_cause: None,
        })
    }

    pub fn is_infected(&self) -> bool {
        self.hiv_status != HivStatus::Susceptible
    }

    /// Transition to acute infection with a fresh CD4 draw.
    pub fn infect(&mut self, params: &ModelParameters, rng: &mut ChaCha12Rng) -> Result<()> {
        self.hiv_status = HivStatus::Acute;
        self.infection_time = 0.0;
        self.cd4_count = draw_initial_cd4(params, rng)?;
        self.viral_load = LogNormal::new(params.vl_acute_mu, params.vl_sigma)?.sample(rng);
        Ok(())
    }

    /// Perinatal infection: newborns skip the adult acute phase and start
    /// chronic with a depressed CD4 count.
    pub fn infect_at_birth(
        &mut self,
        params: &ModelParameters,
        rng: &mut ChaCha12Rng,
    ) -> Result<()> {
        self.hiv_status = HivStatus::Chronic;
        self.infection_time = 0.0;
        self.cd4_count = 0.6 * draw_initial_cd4(params, rng)?;
        self.viral_load = LogNormal::new(params.vl_chronic_mu, params.vl_sigma)?.sample(rng);
        Ok(())
    }

    /// Seed a pre-existing infection at population initialization, with an
    /// infection already one to six years old (so it counts as prevalent,
    /// never as a new infection of the first recorded year).
    pub fn seed_prevalent_infection(
        &mut self,
        params: &ModelParameters,
        rng: &mut ChaCha12Rng,
    ) -> Result<()> {
        self.infect(params, rng)?;
        self.infection_time = rng.random_range(1.0..6.0);
        if self.infection_time > params.acute_duration_years {
            self.hiv_status = HivStatus::Chronic;
            self.cd4_count =
                (self.cd4_count - self.infection_time * params.cd4_decline_rate).max(50.0);
        }
        Ok(())
    }

    /// Advance the agent's own state by `dt` years at absolute `year`.
    pub fn step(
        &mut self,
        dt: f64,
        year: f64,
        params: &ModelParameters,
        rng: &mut ChaCha12Rng,
    ) -> Result<()> {
        self.age += dt;
        if !self.is_infected() {
            return Ok(());
        }
        self.infection_time += dt;

        self.progress_disease(dt, params, rng);
        self.update_cd4(dt, params);
        self.update_viral_load(year, params, rng)?;
        self.update_testing(dt, year, params, rng);
        self.update_treatment(dt, year, params, rng);

        Ok(())
    }

    fn progress_disease(&mut self, dt: f64, params: &ModelParameters, rng: &mut ChaCha12Rng) {
        match self.hiv_status {
            HivStatus::Acute => {
                if self.infection_time > params.acute_duration_years {
                    self.hiv_status = HivStatus::Chronic;
                    self.cd4_count = (self.cd4_count - rng.random_range(50.0..150.0)).max(0.0);
                }
            }
            HivStatus::Chronic => {
                if !self.on_art
                    && rng.random::<f64>() < dt / params.chronic_duration_years
                {
                    self.hiv_status = HivStatus::Aids;
                    self.cd4_count = self.cd4_count.min(200.0);
                }
            }
            HivStatus::Aids => {
                // Rare regression once ART has restored immune function.
                if self.on_art
                    && self.cd4_count > params.aids_recovery_cd4
                    && rng.random::<f64>() < params.aids_recovery_prob * dt
                {
                    self.hiv_status = HivStatus::Chronic;
                }
            }
            HivStatus::Susceptible => {}
        }
    }

    fn update_cd4(&mut self, dt: f64, params: &ModelParameters) {
        if self.on_art {
            self.cd4_count =
                (self.cd4_count + params.cd4_recovery_rate * dt).min(params.cd4_recovery_max);
            return;
        }
        let decline = match self.hiv_status {
            HivStatus::Aids => params.cd4_aids_decline_rate,
            _ => params.cd4_decline_rate,
        };
        self.cd4_count = (self.cd4_count - decline * dt).max(0.0);
    }

    fn update_viral_load(
        &mut self,
        year: f64,
        params: &ModelParameters,
        rng: &mut ChaCha12Rng,
    ) -> Result<()> {
        let suppressed = self.on_art && rng.random::<f64>() < params.adherence_at(year);
        let (mu, sigma) = if suppressed {
            (params.vl_suppressed_mu, params.vl_suppressed_sigma)
        } else {
            let mu = match self.hiv_status {
                HivStatus::Acute => params.vl_acute_mu,
                HivStatus::Aids => params.vl_aids_mu,
                _ => params.vl_chronic_mu,
            };
            (mu, params.vl_sigma)
        };
        self.viral_load = LogNormal::new(mu, sigma)?.sample(rng);
        Ok(())
    }

    fn update_testing(
        &mut self,
        dt: f64,
        year: f64,
        params: &ModelParameters,
        rng: &mut ChaCha12Rng,
    ) {
        if self.tested {
            return;
        }
        let era_rate = testing_era_rate(params, year);
        let rate = era_rate
            * params.testing_risk_multipliers[self.risk_group.index()]
            * params.funding_factor(year);
        if rng.random::<f64>() < rate * dt {
            self.tested = true;
            if rng.random::<f64>() < params.test_accuracy {
                self.diagnosed = true;
                self.cd4_at_diagnosis = Some(self.cd4_count);
            }
        }
    }

    fn update_treatment(
        &mut self,
        dt: f64,
        year: f64,
        params: &ModelParameters,
        rng: &mut ChaCha12Rng,
    ) {
        if !self.diagnosed || self.on_art {
            return;
        }
        let eligible =
            year >= params.treat_all_year || self.cd4_count < cd4_eligibility_threshold(year);
        if !eligible {
            return;
        }
        let prob =
            params.art_initiation_rate * art_uptake(params, year) * params.funding_factor(year);
        if rng.random::<f64>() < prob * dt {
            self.on_art = true;
            self.art_start_year = Some(year);
        }
    }

    /// Per-contact probability of transmitting to a susceptible partner.
    ///
    /// Returns 0 for susceptible agents. Includes the stage multiplier, the
    /// viral-load scaling, and the ART adherence gate; partner-side factors
    /// (risk group, circumcision, condoms) are applied by the mixing engine.
    pub fn infectivity(
        &self,
        year: f64,
        params: &ModelParameters,
        rng: &mut ChaCha12Rng,
    ) -> f64 {
        let stage = match self.hiv_status {
            HivStatus::Susceptible => return 0.0,
            HivStatus::Acute => params.acute_infectivity_multiplier,
            HivStatus::Chronic => 1.0,
            HivStatus::Aids => params.aids_infectivity_multiplier,
        };

        let mut rate = params.base_transmission_rate * stage * viral_load_factor(self.viral_load);

        let past_art_start = self.on_art && self.art_start_year.is_some_and(|y| year >= y);
        if past_art_start && rng.random::<f64>() < params.adherence_at(year) {
            rate *= 1.0 - params.art_efficacy_transmission;
        }

        rate
    }
}

/// Viral-load scaling of infectivity: roughly log-linear in copies/mL,
/// anchored at 1 for a typical chronic set-point (~10^4.3).
fn viral_load_factor(viral_load: f64) -> f64 {
    (viral_load.max(1.0).log10() / 4.3).clamp(0.2, 2.5)
}

fn draw_initial_cd4(params: &ModelParameters, rng: &mut ChaCha12Rng) -> Result<f64> {
    let dist = Normal::new(params.cd4_initial_mean, params.cd4_initial_sd)?;
    Ok(dist.sample(rng).max(200.0))
}

fn testing_era_rate(params: &ModelParameters, year: f64) -> f64 {
    let era = TESTING_ERA_YEARS.iter().filter(|&&y| year >= y).count();
    params.testing_rate_eras[era]
}

fn cd4_eligibility_threshold(year: f64) -> f64 {
    let era = WHO_GUIDELINE_YEARS.iter().filter(|&&y| year >= y).count();
    WHO_CD4_THRESHOLDS[era]
}

fn art_uptake(params: &ModelParameters, year: f64) -> f64 {
    if year >= params.treat_all_year {
        return params.art_uptake_eras[3];
    }
    let era = WHO_GUIDELINE_YEARS.iter().filter(|&&y| year >= y).count();
    params.art_uptake_eras[era]
}
