//! Per-year population snapshots and tabular output.

use crate::agent::{Agent, HivStatus};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Aggregated population statistics for one simulated year.
///
/// Immutable once recorded; one row per year, in chronological order, with
/// row 0 reflecting the initial state before any stepping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YearSnapshot {
    pub year: f64,
    pub total_population: usize,
    pub susceptible: usize,
    pub hiv_infections: usize,
    pub acute: usize,
    pub chronic: usize,
    pub aids: usize,
    pub new_infections: usize,
    pub deaths_hiv: usize,
    pub deaths_natural: usize,
    pub births: usize,
    pub on_art: usize,
    pub tested: usize,
    pub diagnosed: usize,
    pub hiv_prevalence: f64,
    pub art_coverage: f64,
}

/// Death and birth tallies accumulated within the current recorded year.
#[derive(Debug, Default, Clone, Copy)]
pub struct YearCounters {
    pub deaths_hiv: usize,
    pub deaths_natural: usize,
    pub births: usize,
}

impl YearCounters {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Scan the live population once and aggregate the year's row.
pub fn take_snapshot(agents: &[Agent], year: f64, counters: &YearCounters) -> YearSnapshot {
    let mut total = 0;
    let mut acute = 0;
    let mut chronic = 0;
    let mut aids = 0;
    let mut new_infections = 0;
    let mut on_art = 0;
    let mut tested = 0;
    let mut diagnosed = 0;

    for agent in agents.iter().filter(|a| a.alive) {
        total += 1;
        match agent.hiv_status {
            HivStatus::Susceptible => {}
            HivStatus::Acute => acute += 1,
            HivStatus::Chronic => chronic += 1,
            HivStatus::Aids => aids += 1,
        }
        if agent.is_infected() {
            if agent.infection_time < 1.0 {
                new_infections += 1;
            }
            if agent.on_art {
                on_art += 1;
            }
        }
        if agent.tested {
            tested += 1;
        }
        if agent.diagnosed {
            diagnosed += 1;
        }
    }

    let infections = acute + chronic + aids;
    // Derived rates resolve to 0 for empty denominators, never NaN.
    let hiv_prevalence = if total > 0 {
        infections as f64 / total as f64
    } else {
        0.0
    };
    let art_coverage = if infections > 0 {
        on_art as f64 / infections as f64
    } else {
        0.0
    };

    YearSnapshot {
        year,
        total_population: total,
        susceptible: total - infections,
        hiv_infections: infections,
        acute,
        chronic,
        aids,
        new_infections,
        deaths_hiv: counters.deaths_hiv,
        deaths_natural: counters.deaths_natural,
        births: counters.births,
        on_art,
        tested,
        diagnosed,
        hiv_prevalence,
        art_coverage,
    }
}

/// The full result table of one run, one row per simulated year.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SimulationResults {
    rows: Vec<YearSnapshot>,
}

impl SimulationResults {
    pub fn push(&mut self, row: YearSnapshot) {
        self.rows.push(row);
    }

    pub fn rows(&self) -> &[YearSnapshot] {
        &self.rows
    }

    pub fn last(&self) -> Option<&YearSnapshot> {
        self.rows.last()
    }

    /// Write the table as CSV with one header row.
    pub fn write_csv<P: AsRef<Path>>(&self, file: P) -> Result<()> {
        let file = file.as_ref();
        let mut writer =
            csv::Writer::from_path(file).with_context(|| format!("failed to create {file:?}"))?;
        for row in &self.rows {
            writer.serialize(row).context("failed to serialize row")?;
        }
        writer.flush().context("failed to flush csv writer")?;
        Ok(())
    }

    /// Read a table back from a CSV file written by [`Self::write_csv`].
    pub fn read_csv<P: AsRef<Path>>(file: P) -> Result<Self> {
        let file = file.as_ref();
        let mut reader =
            csv::Reader::from_path(file).with_context(|| format!("failed to open {file:?}"))?;
        let mut rows = Vec::new();
        for row in reader.deserialize() {
            rows.push(row.context("failed to deserialize row")?);
        }
        Ok(Self { rows })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_population_yields_zero_rates() {
        let snapshot = take_snapshot(&[], 2000.0, &YearCounters::default());
        assert_eq!(snapshot.total_population, 0);
        assert_eq!(snapshot.hiv_prevalence, 0.0);
        assert_eq!(snapshot.art_coverage, 0.0);
    }
}
