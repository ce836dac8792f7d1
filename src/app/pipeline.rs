//! Shared calibration pipeline.
//!
//! Keeping this in one place avoids duplicating the core workflow:
//! ingest -> summarize -> variance model -> IRLS -> inversion grid -> unknowns
//!
//! The CLI only handles presentation and exports.

use std::ops::RangeInclusive;

use crate::domain::{
    CalibrationConfig, CurveParameters, Estimate, InversionGrid, IrlsResult, Observation, SummaryStat, VarianceFit,
};
use crate::error::AppError;
use crate::fit::{
    InversionOptions, IrlsOptions, SolverOptions, estimate, fit_variance, initial_guess, predict_grid, run_irls,
    summarize,
};
use crate::io::ingest::{IngestedData, load_observations};

/// All computed outputs of a single `dose fit` run.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub ingest: IngestedData,
    pub summary: Vec<SummaryStat>,
    pub variance: VarianceFit,
    /// The start vector every IRLS cycle began from.
    pub start: CurveParameters,
    pub result: IrlsResult,
    pub grid: InversionGrid,
    pub estimates: Vec<Estimate>,
    pub working_range: Option<RangeInclusive<f64>>,
}

/// Load the configured CSV and run the calibration on it.
pub fn run_calibration(config: &CalibrationConfig) -> Result<RunOutput, AppError> {
    let ingest = load_observations(&config.csv_path, config.format)?;
    run_calibration_on(ingest, config)
}

/// Run the calibration on already-ingested observations.
pub fn run_calibration_on(ingest: IngestedData, config: &CalibrationConfig) -> Result<RunOutput, AppError> {
    let summary = summarize(&ingest.observations);

    // Blanks cannot sit on the log-concentration curve; keep them out of the
    // variance regression too so it sees the same standards the fit does.
    let on_curve: Vec<Observation> = ingest
        .observations
        .iter()
        .filter(|o| o.concentration > 0.0)
        .copied()
        .collect();
    let fitted_summary = summarize(&on_curve);
    let variance = fit_variance(&fitted_summary)?;

    let start = match config.start {
        Some(start) => start,
        None => initial_guess(&fitted_summary)?,
    };
    tracing::info!(?start, "start parameters");

    let irls = IrlsOptions {
        tolerance: config.tolerance,
        max_cycles: config.max_cycles,
        policy: config.policy,
        solver: SolverOptions {
            max_iterations: config.solver_max_iterations,
            ..SolverOptions::default()
        },
    };
    let result = run_irls(&on_curve, variance.theta, &start, &irls)?;

    let inversion = InversionOptions {
        replicates: config.replicates,
        resolution: config.resolution,
        policy: config.inversion_policy,
        ..InversionOptions::default()
    };
    let grid = predict_grid(&result, variance.theta, &inversion)?;
    let working_range = grid.working_range(config.max_cv);

    let estimates = config
        .unknowns
        .iter()
        .map(|&y| estimate(&result, variance.theta, y, &inversion))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(RunOutput {
        ingest,
        summary,
        variance,
        start,
        result,
        grid,
        estimates,
        working_range,
    })
}
