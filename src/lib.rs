//! Agent-based HIV epidemic simulation engine.
//!
//! Each agent carries disease, treatment, and behavioral state; the
//! population evolves year by year under transmission, disease progression,
//! treatment scale-up, mortality, and births, calibrated to time-varying
//! historical rate series. See [`engine::Engine`] for the entry point.

pub mod agent;
pub mod analysis;
pub mod config;
pub mod engine;
pub mod manager;
pub mod results;
pub mod series;
pub mod stats;
pub mod transmission;

pub use agent::{Agent, DeathCause, HivStatus, RiskGroup, Sex};
pub use config::{Config, FundingCut, ModelParameters, RunSettings};
pub use engine::{Engine, SimControl, YearCallback};
pub use results::{SimulationResults, YearSnapshot};
pub use series::{Projection, RateSeries};
pub use transmission::MixingMethod;
