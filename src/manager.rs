use crate::analysis::Analyzer;
use crate::config::Config;
use crate::engine::Engine;
use anyhow::{Context, Result};
use glob::glob;
use std::{
    fs,
    path::{Path, PathBuf},
};

/// Manages the simulation directory: one `config.toml` plus a numbered
/// `run-NNNN/` directory per replication, each holding a `results.csv`.
pub struct Manager {
    sim_dir: PathBuf,
    cfg: Config,
}

impl Manager {
    pub fn new<P: AsRef<Path>>(sim_dir: P) -> Result<Self> {
        let sim_dir = sim_dir.as_ref().to_path_buf();

        let cfg =
            Config::from_file(sim_dir.join("config.toml")).context("failed to construct cfg")?;
        log::info!("{cfg:#?}");

        Ok(Self { sim_dir, cfg })
    }

    /// Simulate one new replication and write its result table.
    pub fn create_run(&self) -> Result<()> {
        let run_idx = self.count_run_dirs().context("failed to count run dirs")?;

        let run_dir = self.run_dir(run_idx);
        fs::create_dir_all(&run_dir).with_context(|| format!("failed to create {run_dir:?}"))?;
        log::info!("created {run_dir:?}");

        // Offset the configured seed per replication so runs are
        // reproducible yet distinct.
        let mut cfg = self.cfg.clone();
        cfg.run.seed = cfg.run.seed.map(|seed| seed.wrapping_add(run_idx as u64));

        let years = cfg.run.years;
        let dt = cfg.run.dt;
        let mut engine = Engine::new(cfg).context("failed to construct engine")?;

        engine.set_year_callback(Box::new(|row, progress| {
            log::info!(
                "year {:.0}: population {}, prevalence {:.4} ({:05.1}%)",
                row.year,
                row.total_population,
                row.hiv_prevalence,
                100.0 * progress,
            );
            Ok(())
        }));

        let results = engine
            .run_simulation(years, dt)
            .context("failed to run simulation")?;

        results
            .write_csv(self.results_file(run_idx))
            .context("failed to write results")?;

        Ok(())
    }

    /// Summarize every run into a per-run `analysis.json`.
    pub fn analyze_sim(&self) -> Result<()> {
        let n_runs = self.count_run_dirs().context("failed to count run dirs")?;
        for run_idx in 0..n_runs {
            let mut analyzer = Analyzer::new();

            analyzer
                .add_file(self.results_file(run_idx))
                .context("failed to add file")?;

            analyzer
                .save_results(self.run_dir(run_idx).join("analysis.json"))
                .context("failed to save analysis")?;
        }

        Ok(())
    }

    /// Remove all run directories.
    pub fn clean_sim(&self) -> Result<()> {
        let n_runs = self.count_run_dirs().context("failed to count run dirs")?;
        for run_idx in 0..n_runs {
            let run_dir = self.run_dir(run_idx);
            fs::remove_dir_all(&run_dir).with_context(|| format!("failed to remove {run_dir:?}"))?;
        }
        Ok(())
    }

    fn count_run_dirs(&self) -> Result<usize> {
        let pattern = self.sim_dir.join("run-*");
        let pattern = pattern.to_str().context("pattern is not valid UTF-8")?;
        let count = glob(pattern)
            .context("failed to glob run dirs")?
            .filter_map(Result::ok)
            .filter(|p| p.is_dir())
            .count();
        Ok(count)
    }

    fn run_dir(&self, run_idx: usize) -> PathBuf {
        self.sim_dir.join(format!("run-{run_idx:04}"))
    }

    fn results_file(&self, run_idx: usize) -> PathBuf {
        self.run_dir(run_idx).join("results.csv")
    }
}
