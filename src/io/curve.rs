//! Write calibration JSON files.
//!
//! The calibration JSON is the portable record of a run:
//! - variance model (θ, intercept, CI)
//! - initial and final 4PL parameters with standard errors and covariance
//! - IRLS bookkeeping (cycles, convergence, sigma, df)
//! - the inversion grid and any unknown-sample estimates

use std::fs::File;
use std::io::Write;
use std::path::Path;

use serde::Serialize;

use crate::domain::{CurveParameters, Estimate, FitResult, InversionGrid, IrlsResult, SummaryStat, VarianceFit, WeightPolicy};
use crate::error::AppError;

#[derive(Debug, Clone, Serialize)]
pub struct CalibrationFile<'a> {
    pub tool: &'static str,
    pub policy: WeightPolicy,
    pub inversion_policy: WeightPolicy,
    pub summary: &'a [SummaryStat],
    pub variance: &'a VarianceFit,
    pub initial: FitRecord,
    pub fit: FitRecord,
    pub cycles: usize,
    /// Observations left out of the fit (blanks).
    pub excluded: usize,
    pub grid: &'a InversionGrid,
    pub estimates: &'a [Estimate],
}

#[derive(Debug, Clone, Serialize)]
pub struct FitRecord {
    pub params: CurveParameters,
    pub std_errors: CurveParameters,
    /// Row-major, parameter order `top, bottom, ic50, slope`.
    pub cov_unscaled: [[f64; 4]; 4],
    pub wss: f64,
    pub sigma: f64,
    pub df: usize,
    pub converged: bool,
    pub iterations: usize,
}

impl From<&FitResult> for FitRecord {
    fn from(fit: &FitResult) -> Self {
        let mut cov = [[0.0; 4]; 4];
        for (i, row) in cov.iter_mut().enumerate() {
            for (j, v) in row.iter_mut().enumerate() {
                *v = fit.cov_unscaled[(i, j)];
            }
        }
        Self {
            params: fit.params,
            std_errors: fit.std_errors(),
            cov_unscaled: cov,
            wss: fit.wss,
            sigma: fit.sigma,
            df: fit.df,
            converged: fit.converged,
            iterations: fit.iterations,
        }
    }
}

impl<'a> CalibrationFile<'a> {
    pub fn new(
        policy: WeightPolicy,
        inversion_policy: WeightPolicy,
        summary: &'a [SummaryStat],
        variance: &'a VarianceFit,
        result: &IrlsResult,
        grid: &'a InversionGrid,
        estimates: &'a [Estimate],
    ) -> Self {
        Self {
            tool: "dose",
            policy,
            inversion_policy,
            summary,
            variance,
            initial: FitRecord::from(&result.initial),
            fit: FitRecord::from(&result.fit),
            cycles: result.cycles,
            excluded: result.excluded,
            grid,
            estimates,
        }
    }
}

/// Write a calibration JSON file.
pub fn write_calibration_json(path: &Path, calibration: &CalibrationFile<'_>) -> Result<(), AppError> {
    let file = File::create(path)
        .map_err(|e| AppError::io(format!("Failed to create calibration JSON '{}': {e}", path.display())))?;
    write_calibration(file, calibration)
}

pub fn write_calibration<W: Write>(writer: W, calibration: &CalibrationFile<'_>) -> Result<(), AppError> {
    serde_json::to_writer_pretty(writer, calibration)
        .map_err(|e| AppError::io(format!("Failed to write calibration JSON: {e}")))
}
