use crate::agent::RiskGroup;
use crate::series::{Projection, RateSeries};
use crate::transmission::MixingMethod;
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::{fmt::Debug, fs, ops::RangeBounds, path::Path};

/// Full simulation configuration: model parameters plus run settings.
///
/// Loaded from a TOML file and validated before use.
/// See [`Config::from_file`] for loading.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub params: ModelParameters,
    pub run: RunSettings,
}

/// Settings for one simulation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    /// Initial number of agents.
    pub n_agents: usize,
    /// Number of simulated years.
    pub years: usize,
    /// Timestep in years.
    pub dt: f64,
    /// Explicit RNG seed; a random seed is drawn when absent.
    pub seed: Option<u64>,
    /// Partner-selection strategy.
    pub mixing_method: MixingMethod,
    /// Use the parallel Poisson contact sampler.
    pub accelerated: bool,
    /// Calendar year the simulation starts at.
    pub start_year: f64,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            n_agents: 1000,
            years: 40,
            dt: 0.25,
            seed: None,
            mixing_method: MixingMethod::Binned,
            accelerated: false,
            start_year: 1990.0,
        }
    }
}

/// A policy shock reducing testing, treatment, and prevention effectiveness
/// from `start_year` onward.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FundingCut {
    pub start_year: f64,
    /// Fraction of program effectiveness lost, in `[0, 1]`.
    pub magnitude: f64,
}

/// Calibrated model parameters, immutable for the duration of a run.
///
/// Scalar rates are per year unless stated otherwise. Per-risk-group arrays
/// are indexed `[low, medium, high]`; era arrays follow the historical bands
/// documented on each field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelParameters {
    // Transmission biology.
    /// Per-contact transmission probability for an untreated chronic case.
    pub base_transmission_rate: f64,
    pub acute_duration_years: f64,
    /// Mean years from chronic infection to AIDS without treatment.
    pub chronic_duration_years: f64,
    pub acute_infectivity_multiplier: f64,
    pub aids_infectivity_multiplier: f64,
    /// Reduction of onward transmission on effective ART.
    pub art_efficacy_transmission: f64,

    // CD4 dynamics (cells/µL).
    pub cd4_initial_mean: f64,
    pub cd4_initial_sd: f64,
    /// Decline per year off ART in chronic stage.
    pub cd4_decline_rate: f64,
    /// Decline per year off ART with AIDS.
    pub cd4_aids_decline_rate: f64,
    /// Recovery per year on ART.
    pub cd4_recovery_rate: f64,
    pub cd4_recovery_max: f64,
    /// CD4 above which an AIDS case on ART may regress to chronic.
    pub aids_recovery_cd4: f64,
    /// Yearly probability of that regression once the CD4 gate is met.
    pub aids_recovery_prob: f64,

    // Viral load, log-normal in natural-log space.
    pub vl_acute_mu: f64,
    pub vl_chronic_mu: f64,
    pub vl_aids_mu: f64,
    pub vl_sigma: f64,
    pub vl_suppressed_mu: f64,
    pub vl_suppressed_sigma: f64,

    // Testing and treatment cascade.
    pub test_accuracy: f64,
    /// Yearly testing rates for the eras <1995, 1995-2004, 2004-2015, >=2015.
    pub testing_rate_eras: [f64; 4],
    pub testing_risk_multipliers: [f64; 3],
    /// Yearly ART initiation rate for an eligible diagnosed agent.
    pub art_initiation_rate: f64,
    /// Rollout-speed factors for the eras <2010, 2010-2013, 2013-2016, treat-all.
    pub art_uptake_eras: [f64; 4],
    pub treat_all_year: f64,
    pub art_adherence: f64,
    /// Multiplier on excess HIV mortality while on ART.
    pub art_mortality_reduction: f64,

    // Behavior.
    /// Mean yearly sexual contacts per risk group.
    pub contacts_mean: [f64; 3],
    /// Log-normal sigma of the contacts draw.
    pub contacts_sigma: f64,
    pub partnership_duration_years: f64,
    /// Susceptibility multipliers per risk group.
    pub risk_multipliers: [f64; 3],
    pub circumcision_prevalence: f64,
    /// Transmission multiplier for circumcised men.
    pub circumcision_protection: f64,
    pub condom_efficacy: f64,
    pub condom_coverage: RateSeries,

    // Demography.
    pub birth_rate: RateSeries,
    pub natural_death_rate: RateSeries,
    pub life_expectancy: RateSeries,
    /// Extra yearly hazard per decade of age above 50.
    pub old_age_mortality_excess: f64,
    /// Extra yearly hazard below age 5.
    pub child_mortality_excess: f64,
    /// Hazard multipliers while infected, `[acute, chronic, aids]`.
    pub hiv_mortality_multipliers: [f64; 3],
    /// Mother-to-child transmission risk for the eras <2004, 2004-2014, >=2014.
    pub mtct_rates: [f64; 3],
    /// MTCT multipliers per era when the mother is on ART.
    pub mtct_art_multipliers: [f64; 3],

    // Initial population.
    pub initial_hiv_prevalence: f64,
    /// Population shares per risk group; must sum to 1.
    pub risk_distribution: [f64; 3],
    /// Weights of the decade age bands 0-10, ..., 70-80 at initialization.
    pub age_band_weights: Vec<f64>,
    pub n_regions: usize,

    // Scenario toggles.
    pub funding_cut: Option<FundingCut>,
}

impl Default for ModelParameters {
    fn default() -> Self {
        Self {
            base_transmission_rate: 0.012,
            acute_duration_years: 0.25,
            chronic_duration_years: 9.0,
            acute_infectivity_multiplier: 9.2,
            aids_infectivity_multiplier: 2.4,
            art_efficacy_transmission: 0.96,

            cd4_initial_mean: 850.0,
            cd4_initial_sd: 150.0,
            cd4_decline_rate: 60.0,
            cd4_aids_decline_rate: 110.0,
            cd4_recovery_rate: 80.0,
            cd4_recovery_max: 900.0,
            aids_recovery_cd4: 350.0,
            aids_recovery_prob: 0.25,

            vl_acute_mu: 13.0,
            vl_chronic_mu: 10.0,
            vl_aids_mu: 12.0,
            vl_sigma: 1.0,
            vl_suppressed_mu: 3.9,
            vl_suppressed_sigma: 0.5,

            test_accuracy: 0.95,
            testing_rate_eras: [0.01, 0.05, 0.15, 0.30],
            testing_risk_multipliers: [1.0, 1.3, 1.8],
            art_initiation_rate: 0.9,
            art_uptake_eras: [0.10, 0.30, 0.55, 0.80],
            treat_all_year: 2016.0,
            art_adherence: 0.90,
            art_mortality_reduction: 0.25,

            contacts_mean: [4.0, 12.0, 40.0],
            contacts_sigma: 0.5,
            partnership_duration_years: 2.0,
            risk_multipliers: [1.0, 1.5, 2.5],
            circumcision_prevalence: 0.30,
            circumcision_protection: 0.4,
            condom_efficacy: 0.85,
            condom_coverage: RateSeries::from_points(vec![
                (1990.0, 0.04),
                (2000.0, 0.20),
                (2010.0, 0.40),
                (2020.0, 0.55),
            ])
            .with_bounds(0.0, 1.0),

            birth_rate: RateSeries::from_points(vec![
                (1990.0, 0.042),
                (2000.0, 0.038),
                (2010.0, 0.033),
                (2020.0, 0.028),
            ])
            .with_bounds(0.005, 0.06)
            .with_projection(Projection::Trend),
            natural_death_rate: RateSeries::from_points(vec![
                (1990.0, 0.016),
                (2000.0, 0.015),
                (2010.0, 0.012),
                (2020.0, 0.010),
            ])
            .with_bounds(0.003, 0.05)
            .with_projection(Projection::Trend),
            life_expectancy: RateSeries::from_points(vec![
                (1990.0, 55.0),
                (2020.0, 66.0),
                (2050.0, 72.0),
            ])
            .with_bounds(30.0, 95.0),
            old_age_mortality_excess: 0.02,
            child_mortality_excess: 0.01,
            hiv_mortality_multipliers: [1.5, 2.5, 10.0],
            mtct_rates: [0.28, 0.15, 0.05],
            mtct_art_multipliers: [0.50, 0.40, 0.25],

            initial_hiv_prevalence: 0.02,
            risk_distribution: [0.70, 0.22, 0.08],
            age_band_weights: vec![1.6, 1.5, 1.4, 1.2, 0.9, 0.7, 0.4, 0.2],
            n_regions: 4,

            funding_cut: None,
        }
    }
}

impl ModelParameters {
    pub fn funding_cut_active(&self, year: f64) -> bool {
        self.funding_cut.is_some_and(|cut| year >= cut.start_year)
    }

    /// Program-effectiveness multiplier: 1 before a funding cut takes
    /// effect, reduced by its magnitude afterwards.
    pub fn funding_factor(&self, year: f64) -> f64 {
        match self.funding_cut {
            Some(cut) if year >= cut.start_year => (1.0 - cut.magnitude).max(0.0),
            _ => 1.0,
        }
    }

    /// ART adherence probability; partially degraded under a funding cut.
    pub fn adherence_at(&self, year: f64) -> f64 {
        match self.funding_cut {
            Some(cut) if year >= cut.start_year => {
                (self.art_adherence * (1.0 - 0.5 * cut.magnitude)).max(0.0)
            }
            _ => self.art_adherence,
        }
    }

    /// Susceptibility multiplier for a risk group; medium/high risk is
    /// boosted while a funding cut is active.
    pub fn risk_multiplier(&self, risk: RiskGroup, year: f64) -> f64 {
        let mut mult = self.risk_multipliers[risk.index()];
        if risk != RiskGroup::Low {
            if let Some(cut) = self.funding_cut {
                if year >= cut.start_year {
                    mult *= 1.0 + 0.5 * cut.magnitude;
                }
            }
        }
        mult
    }

    /// Natural death rate at `year`, tapered toward the life-expectancy
    /// target on long projections.
    pub fn death_rate_at(&self, year: f64) -> f64 {
        self.natural_death_rate
            .value_at_tapered(year, &self.life_expectancy)
    }

    fn validate(&self) -> Result<()> {
        check_num(self.base_transmission_rate, 0.0..=1.0)
            .context("invalid base transmission rate")?;
        check_num(self.acute_duration_years, 0.01..2.0).context("invalid acute duration")?;
        check_num(self.chronic_duration_years, 0.5..50.0).context("invalid chronic duration")?;
        check_num(self.acute_infectivity_multiplier, 1.0..100.0)
            .context("invalid acute infectivity multiplier")?;
        check_num(self.aids_infectivity_multiplier, 1.0..100.0)
            .context("invalid aids infectivity multiplier")?;
        check_num(self.art_efficacy_transmission, 0.0..=1.0)
            .context("invalid art transmission efficacy")?;

        check_num(self.cd4_initial_mean, 100.0..2000.0).context("invalid initial cd4 mean")?;
        check_num(self.cd4_initial_sd, 0.0..1000.0).context("invalid initial cd4 sd")?;
        check_num(self.aids_recovery_prob, 0.0..=1.0).context("invalid aids recovery prob")?;
        check_num(self.vl_sigma, 0.0..10.0).context("invalid viral load sigma")?;
        check_num(self.vl_suppressed_sigma, 0.0..10.0)
            .context("invalid suppressed viral load sigma")?;

        check_num(self.test_accuracy, 0.0..=1.0).context("invalid test accuracy")?;
        check_rates(&self.testing_rate_eras).context("invalid testing rate eras")?;
        check_num(self.art_initiation_rate, 0.0..=1.0).context("invalid art initiation rate")?;
        check_rates(&self.art_uptake_eras).context("invalid art uptake eras")?;
        check_num(self.art_adherence, 0.0..=1.0).context("invalid art adherence")?;
        check_num(self.art_mortality_reduction, 0.0..=1.0)
            .context("invalid art mortality reduction")?;

        check_num(self.contacts_sigma, 0.0..5.0).context("invalid contacts sigma")?;
        check_num(self.partnership_duration_years, 0.1..50.0)
            .context("invalid partnership duration")?;
        if self.contacts_mean.iter().any(|&m| m <= 0.0) {
            bail!("mean contact rates must be positive");
        }
        check_num(self.circumcision_prevalence, 0.0..=1.0)
            .context("invalid circumcision prevalence")?;
        check_num(self.circumcision_protection, 0.0..=1.0)
            .context("invalid circumcision protection")?;
        check_num(self.condom_efficacy, 0.0..=1.0).context("invalid condom efficacy")?;

        check_rates(&self.mtct_rates).context("invalid mtct rates")?;
        check_rates(&self.mtct_art_multipliers).context("invalid mtct art multipliers")?;
        if self.hiv_mortality_multipliers.iter().any(|&m| m < 1.0) {
            bail!("hiv mortality multipliers must be at least 1");
        }

        check_num(self.initial_hiv_prevalence, 0.0..=1.0).context("invalid initial prevalence")?;
        check_prob_vec(&self.risk_distribution).context("invalid risk distribution")?;
        if self.age_band_weights.is_empty() || self.age_band_weights.iter().any(|&w| w < 0.0) {
            bail!("age band weights must be non-empty and non-negative");
        }
        if self.age_band_weights.iter().sum::<f64>() <= 0.0 {
            bail!("age band weights must not all be zero");
        }
        check_num(self.n_regions, 1..100).context("invalid number of regions")?;

        if let Some(cut) = self.funding_cut {
            check_num(cut.magnitude, 0.0..=1.0).context("invalid funding cut magnitude")?;
        }

        Ok(())
    }
}

impl Config {
    /// Load a [`Config`] from a TOML file and validate it.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, deserialized,
    /// or if the configuration values are invalid.
    pub fn from_file<P: AsRef<Path>>(file: P) -> Result<Self> {
        let file = file.as_ref();
        let text = fs::read_to_string(file).with_context(|| format!("failed to read {file:?}"))?;

        let config: Config = toml::from_str(&text).context("failed to deserialize config")?;

        config.validate().context("failed to validate config")?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        check_num(self.run.n_agents, 2..10_000_000).context("invalid number of agents")?;
        check_num(self.run.years, 1..10_000).context("invalid number of years")?;
        check_num(self.run.dt, 0.001..=1.0).context("invalid timestep")?;
        check_num(self.run.start_year, 1900.0..2200.0).context("invalid start year")?;

        self.params.validate().context("invalid model parameters")?;

        Ok(())
    }
}

fn check_num<T, R>(num: T, range: R) -> Result<()>
where
    T: PartialOrd + Debug,
    R: RangeBounds<T> + Debug,
{
    if !range.contains(&num) {
        bail!("number must be in the range {range:?}, but is {num:?}");
    }
    Ok(())
}

fn check_rates(rates: &[f64]) -> Result<()> {
    if rates.iter().any(|&r| !(0.0..=1.0).contains(&r)) {
        bail!("rates must all be in [0, 1], but are {rates:?}");
    }
    Ok(())
}

fn check_prob_vec(vec: &[f64]) -> Result<()> {
    if vec.iter().any(|&ele| ele < 0.0) {
        bail!("vector must have only non-negative elements");
    }
    let sum: f64 = vec.iter().sum();
    let tol = 1e-8;
    if (sum - 1.0).abs() > tol {
        bail!("vector must sum to 1.0 (tolerance: {tol}), but sums to {sum}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn bad_risk_distribution_is_rejected() {
        let mut config = Config::default();
        config.params.risk_distribution = [0.5, 0.5, 0.5];
        assert!(config.validate().is_err());
    }

    #[test]
    fn funding_factor_switches_at_start_year() {
        let mut params = ModelParameters::default();
        params.funding_cut = Some(FundingCut {
            start_year: 2025.0,
            magnitude: 0.4,
        });
        assert_eq!(params.funding_factor(2024.0), 1.0);
        assert!((params.funding_factor(2025.0) - 0.6).abs() < 1e-12);
        assert!(params.risk_multiplier(RiskGroup::High, 2026.0) > params.risk_multipliers[2]);
        assert_eq!(
            params.risk_multiplier(RiskGroup::Low, 2026.0),
            params.risk_multipliers[0]
        );
    }
}
