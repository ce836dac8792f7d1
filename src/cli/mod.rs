//! Command-line parsing for the `dose` calibration tool.
//!
//! The goal of this module is to keep **argument parsing** and **command dispatch**
//! separate from the modeling/math code.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::domain::{InputFormat, WeightPolicy};

/// Top-level CLI.
#[derive(Debug, Parser)]
#[command(name = "dose", version, about = "4PL dose-response calibration with IRLS weighting")]
pub struct Cli {
    /// Log verbosity level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: tracing::Level,

    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fit a calibration curve from a CSV of standards and report the precision profile.
    Fit(FitArgs),
    /// Write a synthetic heteroscedastic 4PL data set to CSV.
    Simulate(SimulateArgs),
}

#[derive(Debug, Parser, Clone)]
pub struct FitArgs {
    /// Standards CSV (long: concentration,replicate,response; wide: concentration,rep1,rep2,...).
    #[arg(long, value_name = "CSV")]
    pub csv: PathBuf,

    #[arg(long, value_enum, default_value_t = InputFormat::Auto)]
    pub format: InputFormat,

    /// How theta turns fitted responses into weights.
    #[arg(long, value_enum, default_value_t = WeightPolicy::Half)]
    pub policy: WeightPolicy,

    /// Variance function for the inversion's measurement term (defaults to `--policy`).
    #[arg(long, value_enum)]
    pub inversion_policy: Option<WeightPolicy>,

    /// Relative change in weighted sum of squares at which IRLS stops.
    #[arg(long, default_value_t = 1e-5)]
    pub tolerance: f64,

    /// Maximum number of reweighted fits.
    #[arg(long, default_value_t = 100)]
    pub max_cycles: usize,

    /// Iteration cap for each Levenberg-Marquardt solve.
    #[arg(long, default_value_t = 200)]
    pub solver_iterations: usize,

    /// Start value for the response at zero concentration (all four start values go together).
    #[arg(long, allow_negative_numbers = true, requires_all = ["bottom", "ic50", "slope"])]
    pub top: Option<f64>,

    #[arg(long, allow_negative_numbers = true, requires_all = ["top", "ic50", "slope"])]
    pub bottom: Option<f64>,

    #[arg(long, requires_all = ["top", "bottom", "slope"])]
    pub ic50: Option<f64>,

    #[arg(long, allow_negative_numbers = true, requires_all = ["top", "bottom", "ic50"])]
    pub slope: Option<f64>,

    /// Replicates averaged per unknown sample.
    #[arg(short = 'm', long, default_value_t = 3)]
    pub replicates: usize,

    /// Number of concentrations in the inversion grid.
    #[arg(long, default_value_t = 700)]
    pub resolution: usize,

    /// Observed response of an unknown sample to back-calculate (repeatable).
    #[arg(long = "unknown", value_name = "Y", allow_negative_numbers = true)]
    pub unknowns: Vec<f64>,

    /// CV threshold (percent) for the working range.
    #[arg(long, default_value_t = 20.0)]
    pub max_cv: f64,

    /// Grid rows shown in the terminal report.
    #[arg(long, default_value_t = 15)]
    pub grid_rows: usize,

    /// Also print the per-standard back-fit table.
    #[arg(long)]
    pub standards: bool,

    /// Export the full inversion grid to CSV.
    #[arg(long, value_name = "CSV")]
    pub export_grid: Option<PathBuf>,

    /// Export the calibration (variance model, fits, grid, unknowns) to JSON.
    #[arg(long, value_name = "JSON")]
    pub export_json: Option<PathBuf>,
}

#[derive(Debug, Parser, Clone)]
pub struct SimulateArgs {
    /// Output CSV (long layout).
    #[arg(long, value_name = "CSV")]
    pub out: PathBuf,

    #[arg(long, allow_negative_numbers = true, default_value_t = 1.0)]
    pub top: f64,

    #[arg(long, allow_negative_numbers = true, default_value_t = 0.05)]
    pub bottom: f64,

    #[arg(long, default_value_t = 10.0)]
    pub ic50: f64,

    #[arg(long, allow_negative_numbers = true, default_value_t = -1.0)]
    pub slope: f64,

    /// Variance exponent of the generated noise.
    #[arg(long, allow_negative_numbers = true, default_value_t = 1.5)]
    pub theta: f64,

    /// Noise scale.
    #[arg(long, default_value_t = 0.03)]
    pub sigma: f64,

    #[arg(long, value_enum, default_value_t = WeightPolicy::Half)]
    pub policy: WeightPolicy,

    #[arg(long, default_value_t = 3)]
    pub replicates: usize,

    /// Number of log-spaced concentrations.
    #[arg(long, default_value_t = 8)]
    pub levels: usize,

    #[arg(long, default_value_t = 0.1)]
    pub conc_min: f64,

    #[arg(long, default_value_t = 1000.0)]
    pub conc_max: f64,

    /// Add a zero-concentration blank level.
    #[arg(long)]
    pub blank: bool,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,
}
