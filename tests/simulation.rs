use anyhow::bail;
use hivsim::{Config, Engine, MixingMethod};
use std::sync::{Arc, Mutex};
use std::{thread, time::Duration};

fn base_config(n_agents: usize, seed: u64) -> Config {
    let mut cfg = Config::default();
    cfg.run.n_agents = n_agents;
    cfg.run.seed = Some(seed);
    cfg
}

#[test]
fn accounting_identities_hold_every_year() {
    let mut cfg = base_config(800, 123);
    cfg.run.dt = 0.5;
    let mut engine = Engine::new(cfg).expect("failed to construct engine");
    let results = engine.run_simulation(25, 0.5).expect("failed to run");

    assert_eq!(results.rows().len(), 26);
    for row in results.rows() {
        assert_eq!(
            row.total_population,
            row.susceptible + row.hiv_infections,
            "population identity broken in year {}",
            row.year
        );
        assert_eq!(row.hiv_infections, row.acute + row.chronic + row.aids);
        assert!((0.0..=1.0).contains(&row.hiv_prevalence));
        assert!((0.0..=1.0).contains(&row.art_coverage));
        assert!(row.on_art <= row.hiv_infections);
    }
}

#[test]
fn rows_are_chronological_from_start_year() {
    let mut cfg = base_config(300, 5);
    cfg.run.start_year = 2000.0;
    let mut engine = Engine::new(cfg).expect("failed to construct engine");
    let results = engine.run_simulation(10, 1.0).expect("failed to run");

    for (i, row) in results.rows().iter().enumerate() {
        assert_eq!(row.year, 2000.0 + i as f64);
    }
}

#[test]
fn identical_seeds_produce_identical_tables() {
    for accelerated in [false, true] {
        let mut cfg = base_config(500, 77);
        cfg.run.accelerated = accelerated;

        let mut engine_a = Engine::new(cfg.clone()).expect("failed to construct engine");
        let rows_a = engine_a.run_simulation(15, 0.5).expect("failed to run");

        let mut engine_b = Engine::new(cfg).expect("failed to construct engine");
        let rows_b = engine_b.run_simulation(15, 0.5).expect("failed to run");

        assert_eq!(rows_a, rows_b, "accelerated = {accelerated}");
    }
}

#[test]
fn zero_prevalence_never_generates_infections() {
    let mut cfg = base_config(1000, 9);
    cfg.run.dt = 1.0;
    cfg.params.initial_hiv_prevalence = 0.0;
    let mut engine = Engine::new(cfg).expect("failed to construct engine");
    let results = engine.run_simulation(5, 1.0).expect("failed to run");

    for row in results.rows() {
        assert_eq!(row.hiv_infections, 0);
        assert_eq!(row.new_infections, 0);
        assert_eq!(row.acute + row.chronic + row.aids, 0);
        assert_eq!(row.deaths_hiv, 0);
        assert_eq!(row.on_art, 0);
        assert_eq!(row.tested, 0);
        assert_eq!(row.diagnosed, 0);
    }
}

#[test]
fn single_high_risk_seed_eventually_spreads() {
    let mut spreading_runs = 0;
    for seed in 0..10 {
        let mut cfg = base_config(1000, seed);
        cfg.params.initial_hiv_prevalence = 0.0;
        cfg.params.risk_distribution = [0.0, 0.0, 1.0];
        let mut engine = Engine::new(cfg).expect("failed to construct engine");
        engine.seed_infections(1).expect("failed to seed infection");

        let results = engine.run_simulation(50, 0.5).expect("failed to run");
        let total: usize = results.rows().iter().map(|r| r.new_infections).sum();
        if total > 0 {
            spreading_runs += 1;
        }
    }
    assert!(
        spreading_runs >= 8,
        "only {spreading_runs}/10 seeded runs spread"
    );
}

#[test]
fn counters_start_at_zero_and_stay_bounded() {
    let cfg = base_config(600, 31);
    let mut engine = Engine::new(cfg).expect("failed to construct engine");
    let results = engine.run_simulation(20, 0.25).expect("failed to run");

    let first = &results.rows()[0];
    assert_eq!(first.deaths_hiv, 0);
    assert_eq!(first.deaths_natural, 0);
    assert_eq!(first.births, 0);

    // Per-year tallies, not cumulative: no single year can plausibly exceed
    // the starting population.
    for row in results.rows() {
        assert!(row.deaths_hiv + row.deaths_natural <= 600);
        assert!(row.births <= 600);
    }
}

#[test]
fn callback_receives_all_rows_and_monotone_progress() {
    let cfg = base_config(200, 13);
    let mut engine = Engine::new(cfg).expect("failed to construct engine");

    let seen: Arc<Mutex<Vec<f64>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    engine.set_year_callback(Box::new(move |_row, progress| {
        sink.lock().unwrap().push(progress);
        Ok(())
    }));

    engine.run_simulation(8, 1.0).expect("failed to run");

    let progress = seen.lock().unwrap();
    assert_eq!(progress.len(), 9);
    assert_eq!(progress[0], 0.0);
    assert_eq!(*progress.last().unwrap(), 1.0);
    assert!(progress.windows(2).all(|pair| pair[0] <= pair[1]));
}

#[test]
fn callback_errors_do_not_abort_the_run() {
    let cfg = base_config(200, 14);
    let mut engine = Engine::new(cfg).expect("failed to construct engine");
    engine.set_year_callback(Box::new(|_row, _progress| bail!("consumer went away")));

    let results = engine.run_simulation(5, 1.0).expect("failed to run");
    assert_eq!(results.rows().len(), 6);
}

#[test]
fn scan_strategy_matches_table_shape() {
    let mut cfg = base_config(400, 21);
    cfg.run.mixing_method = MixingMethod::Scan;
    let mut engine = Engine::new(cfg).expect("failed to construct engine");
    let results = engine.run_simulation(10, 0.5).expect("failed to run");

    assert_eq!(results.rows().len(), 11);
    for row in results.rows() {
        assert_eq!(row.total_population, row.susceptible + row.hiv_infections);
    }
}

#[test]
fn paused_run_resumes_and_completes() {
    let cfg = base_config(150, 8);
    let mut engine = Engine::new(cfg).expect("failed to construct engine");

    let control = engine.control();
    control.request_pause();
    let resumer = control.clone();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        resumer.resume();
    });

    let results = engine.run_simulation(3, 1.0).expect("failed to run");
    handle.join().unwrap();
    assert_eq!(results.rows().len(), 4);
}

#[test]
fn funding_cut_reduces_art_coverage() {
    let years = 40;
    let final_coverage = |cut: Option<hivsim::FundingCut>| {
        let mut cfg = base_config(2000, 99);
        cfg.params.initial_hiv_prevalence = 0.10;
        cfg.params.funding_cut = cut;
        let mut engine = Engine::new(cfg).expect("failed to construct engine");
        let results = engine.run_simulation(years, 0.5).expect("failed to run");
        results.last().unwrap().art_coverage
    };

    let baseline = final_coverage(None);
    let shocked = final_coverage(Some(hivsim::FundingCut {
        start_year: 2000.0,
        magnitude: 0.8,
    }));
    assert!(
        shocked < baseline,
        "coverage {shocked} not below baseline {baseline}"
    );
}
