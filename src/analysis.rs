//! Post-run summaries of one result table.

use crate::results::{SimulationResults, YearSnapshot};
use crate::stats::Accumulator;
use anyhow::{Context, Result};
use std::{fs::File, io::BufWriter, path::Path};

/// An observable summarized over the rows of a result table.
pub trait Obs {
    fn update(&mut self, row: &YearSnapshot) -> Result<()>;
    fn report(&self) -> serde_json::Value;
}

/// Mean and spread of prevalence across all recorded years.
pub struct PrevalenceStats {
    acc: Accumulator,
}

impl PrevalenceStats {
    pub fn new() -> Self {
        Self {
            acc: Accumulator::new(),
        }
    }
}

impl Obs for PrevalenceStats {
    fn update(&mut self, row: &YearSnapshot) -> Result<()> {
        self.acc.add(row.hiv_prevalence);
        Ok(())
    }

    fn report(&self) -> serde_json::Value {
        serde_json::json!({ "hiv_prevalence": self.acc.report() })
    }
}

/// The year with the most new infections, and their count.
pub struct PeakIncidence {
    peak_year: Option<f64>,
    peak_count: usize,
}

impl PeakIncidence {
    pub fn new() -> Self {
        Self {
            peak_year: None,
            peak_count: 0,
        }
    }
}

impl Obs for PeakIncidence {
    fn update(&mut self, row: &YearSnapshot) -> Result<()> {
        if self.peak_year.is_none() || row.new_infections > self.peak_count {
            self.peak_year = Some(row.year);
            self.peak_count = row.new_infections;
        }
        Ok(())
    }

    fn report(&self) -> serde_json::Value {
        serde_json::json!({
            "peak_incidence": { "year": self.peak_year, "new_infections": self.peak_count }
        })
    }
}

/// Headline figures of the last recorded year.
pub struct FinalYear {
    last: Option<YearSnapshot>,
}

impl FinalYear {
    pub fn new() -> Self {
        Self { last: None }
    }
}

impl Obs for FinalYear {
    fn update(&mut self, row: &YearSnapshot) -> Result<()> {
        self.last = Some(row.clone());
        Ok(())
    }

    fn report(&self) -> serde_json::Value {
        match &self.last {
            Some(row) => serde_json::json!({
                "final_year": {
                    "year": row.year,
                    "total_population": row.total_population,
                    "hiv_prevalence": row.hiv_prevalence,
                    "art_coverage": row.art_coverage,
                    "deaths_hiv": row.deaths_hiv,
                }
            }),
            None => serde_json::json!({ "final_year": null }),
        }
    }
}

/// Cumulative totals over the whole run.
pub struct RunTotals {
    new_infections: usize,
    deaths_hiv: usize,
    deaths_natural: usize,
    births: usize,
}

impl RunTotals {
    pub fn new() -> Self {
        Self {
            new_infections: 0,
            deaths_hiv: 0,
            deaths_natural: 0,
            births: 0,
        }
    }
}

impl Obs for RunTotals {
    fn update(&mut self, row: &YearSnapshot) -> Result<()> {
        self.new_infections += row.new_infections;
        self.deaths_hiv += row.deaths_hiv;
        self.deaths_natural += row.deaths_natural;
        self.births += row.births;
        Ok(())
    }

    fn report(&self) -> serde_json::Value {
        serde_json::json!({
            "totals": {
                "new_infections": self.new_infections,
                "deaths_hiv": self.deaths_hiv,
                "deaths_natural": self.deaths_natural,
                "births": self.births,
            }
        })
    }
}

/// Runs every observable over a result table and writes the reports.
pub struct Analyzer {
    obs_ptr_vec: Vec<Box<dyn Obs>>,
}

impl Analyzer {
    pub fn new() -> Self {
        let mut obs_ptr_vec: Vec<Box<dyn Obs>> = Vec::new();
        obs_ptr_vec.push(Box::new(PrevalenceStats::new()));
        obs_ptr_vec.push(Box::new(PeakIncidence::new()));
        obs_ptr_vec.push(Box::new(FinalYear::new()));
        obs_ptr_vec.push(Box::new(RunTotals::new()));
        Self { obs_ptr_vec }
    }

    pub fn add_file<P: AsRef<Path>>(&mut self, file: P) -> Result<()> {
        let results = SimulationResults::read_csv(file).context("failed to read results")?;
        for row in results.rows() {
            for obs in &mut self.obs_ptr_vec {
                obs.update(row).context("failed to update observable")?;
            }
        }
        Ok(())
    }

    pub fn save_results<P: AsRef<Path>>(&self, file: P) -> Result<()> {
        let file = file.as_ref();
        let file = File::create(file).with_context(|| format!("failed to create {file:?}"))?;
        let writer = BufWriter::new(file);

        let reports: Vec<_> = self.obs_ptr_vec.iter().map(|obs| obs.report()).collect();
        serde_json::to_writer_pretty(writer, &reports)?;
        Ok(())
    }
}

impl Default for Analyzer {
    fn default() -> Self {
        Self::new()
    }
}
