//! Shared domain types.
//!
//! Inputs (`Observation`), derived tables (`SummaryStat`), and the immutable
//! outputs of each pipeline stage (`VarianceFit`, `FitResult`, `IrlsResult`,
//! `InversionGrid`). Stages hand these to each other by reference and never
//! mutate an upstream result.

use std::path::PathBuf;

use clap::ValueEnum;
use nalgebra::Matrix4;
use serde::{Deserialize, Serialize};

/// One measured response at a known concentration (natural scale).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub concentration: f64,
    pub replicate: usize,
    pub response: f64,
}

impl Observation {
    pub fn new(concentration: f64, replicate: usize, response: f64) -> Self {
        Self {
            concentration,
            replicate,
            response,
        }
    }
}

/// Replicate statistics for one distinct concentration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SummaryStat {
    pub concentration: f64,
    pub n: usize,
    pub mean: f64,
    /// Sample variance (n - 1 denominator). NaN when `n < 2`.
    pub variance: f64,
}

impl SummaryStat {
    pub fn sd(&self) -> f64 {
        self.variance.sqrt()
    }

    /// Coefficient of variation of the replicates, in percent.
    pub fn cv_percent(&self) -> f64 {
        100.0 * self.sd() / self.mean.abs()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ConfidenceInterval {
    pub level: f64,
    pub lower: f64,
    pub upper: f64,
}

/// Power-law mean/variance relationship: `ln(var) = intercept + theta * ln(mean)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VarianceFit {
    pub theta: f64,
    /// Natural log of the power-law constant.
    pub intercept: f64,
    /// `None` when the regression has no residual degrees of freedom.
    pub theta_ci: Option<ConfidenceInterval>,
    /// Number of summary rows that survived the positivity filter.
    pub n_points: usize,
}

/// The four 4PL parameters.
///
/// Solver code works on vectors in the fixed order `(top, bottom, ic50, slope)`;
/// conversions live here so nothing else indexes by position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurveParameters {
    pub top: f64,
    pub bottom: f64,
    pub ic50: f64,
    pub slope: f64,
}

impl CurveParameters {
    pub const LEN: usize = 4;
    pub const NAMES: [&'static str; 4] = ["top", "bottom", "ic50", "slope"];

    pub fn new(top: f64, bottom: f64, ic50: f64, slope: f64) -> Self {
        Self {
            top,
            bottom,
            ic50,
            slope,
        }
    }

    pub fn to_array(self) -> [f64; 4] {
        [self.top, self.bottom, self.ic50, self.slope]
    }

    /// # Panics
    /// Panics if `values` has fewer than four entries.
    pub fn from_slice(values: &[f64]) -> Self {
        Self::new(values[0], values[1], values[2], values[3])
    }

    pub fn is_finite(&self) -> bool {
        self.to_array().iter().all(|v| v.is_finite())
    }
}

/// Outcome of a single weighted 4PL solve.
#[derive(Debug, Clone)]
pub struct FitResult {
    pub params: CurveParameters,
    /// Model predictions at each observation.
    pub fitted: Vec<f64>,
    /// `y - fitted`.
    pub residuals: Vec<f64>,
    /// `sqrt(w) * (y - fitted)`.
    pub weighted_residuals: Vec<f64>,
    pub weights: Vec<f64>,
    /// Weighted sum of squares, `Σ weighted_residuals²`.
    pub wss: f64,
    /// `(JᵀWJ)⁻¹` at the solution; multiply by `sigma²` for the covariance.
    pub cov_unscaled: Matrix4<f64>,
    /// Residual degrees of freedom, `n - 4`.
    pub df: usize,
    /// Residual standard error, `sqrt(wss / df)`.
    pub sigma: f64,
    pub converged: bool,
    pub iterations: usize,
}

impl FitResult {
    /// Parameter covariance, `sigma² · cov_unscaled`.
    pub fn covariance(&self) -> Matrix4<f64> {
        self.cov_unscaled * (self.sigma * self.sigma)
    }

    /// Standard errors in parameter order.
    pub fn std_errors(&self) -> CurveParameters {
        let cov = self.covariance();
        CurveParameters::new(
            cov[(0, 0)].sqrt(),
            cov[(1, 1)].sqrt(),
            cov[(2, 2)].sqrt(),
            cov[(3, 3)].sqrt(),
        )
    }
}

/// Output of the reweighting loop.
#[derive(Debug, Clone)]
pub struct IrlsResult {
    /// The unweighted first fit.
    pub initial: FitResult,
    /// The last reweighted fit.
    pub fit: FitResult,
    /// Number of reweighted fits performed (always ≥ 1).
    pub cycles: usize,
    /// Observations the fit was computed on: the input set with non-positive
    /// or non-finite concentrations (blanks) removed, in input order.
    pub observations: Vec<Observation>,
    /// How many input observations were removed before fitting.
    pub excluded: usize,
}

/// How the variance exponent turns fitted responses into weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum WeightPolicy {
    /// `theta` is a variance exponent: `w = (ŷ²)^(-θ/2)`, `var(y) ∝ (y²)^(θ/2)`.
    Half,
    /// `theta` is an SD exponent: `w = (ŷ²)^(-θ)`, `var(y) ∝ (y²)^θ`.
    Full,
}

impl WeightPolicy {
    /// Exponent applied to `ŷ²`.
    fn power(self, theta: f64) -> f64 {
        match self {
            WeightPolicy::Half => theta / 2.0,
            WeightPolicy::Full => theta,
        }
    }

    /// Relative response variance at `y` (up to `sigma²`).
    pub fn variance_factor(self, y: f64, theta: f64) -> f64 {
        (y * y).powf(self.power(theta))
    }

    /// Observation weight for a fitted response `y_hat`.
    pub fn weight(self, y_hat: f64, theta: f64) -> f64 {
        1.0 / self.variance_factor(y_hat, theta)
    }
}

/// One row of the calibration uncertainty grid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct InversionRow {
    pub response: f64,
    pub concentration: f64,
    pub sd: f64,
}

impl InversionRow {
    pub fn cv_percent(&self) -> f64 {
        100.0 * self.sd / self.concentration.abs()
    }
}

/// Response → concentration → SD triplets sorted by concentration.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InversionGrid {
    pub rows: Vec<InversionRow>,
}

/// Back-calculated concentration for one observed response.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Estimate {
    pub response: f64,
    pub concentration: f64,
    pub sd: f64,
    pub cv_percent: f64,
}

/// Input table layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum InputFormat {
    /// `long` if the header has a `response` column, else `wide`.
    Auto,
    /// `concentration,replicate,response`.
    Long,
    /// `concentration,rep1,rep2,...`.
    Wide,
}

/// A full `dose fit` run's configuration (derived from CLI flags).
#[derive(Debug, Clone)]
pub struct CalibrationConfig {
    pub csv_path: PathBuf,
    pub format: InputFormat,
    /// Explicit start vector; `None` uses the data-driven guess.
    pub start: Option<CurveParameters>,
    /// Weighting used by the IRLS loop.
    pub policy: WeightPolicy,
    /// Variance function used for the measurement term of the inversion.
    pub inversion_policy: WeightPolicy,
    pub tolerance: f64,
    pub max_cycles: usize,
    pub solver_max_iterations: usize,
    pub replicates: usize,
    pub resolution: usize,
    pub unknowns: Vec<f64>,
    /// CV threshold (percent) for the working-range report.
    pub max_cv: f64,
    pub grid_rows: usize,
    /// Print the per-standard back-fit table.
    pub show_standards: bool,
    pub export_grid: Option<PathBuf>,
    pub export_json: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameter_vector_order_is_stable() {
        let p = CurveParameters::new(1.0, 0.2, 10.0, -1.0);
        let v = p.to_array();
        assert_eq!(v, [1.0, 0.2, 10.0, -1.0]);
        assert_eq!(CurveParameters::from_slice(&v), p);
    }

    #[test]
    fn weight_policies_agree_for_positive_theta_one() {
        // Half(θ=2) and Full(θ=1) describe the same variance function.
        let a = WeightPolicy::Half.weight(0.5, 2.0);
        let b = WeightPolicy::Full.weight(0.5, 1.0);
        assert!((a - b).abs() < 1e-12);
        assert!((a - 4.0).abs() < 1e-12);
    }

    #[test]
    fn weights_are_sign_insensitive() {
        let w_pos = WeightPolicy::Half.weight(0.3, 1.4);
        let w_neg = WeightPolicy::Half.weight(-0.3, 1.4);
        assert!(w_pos.is_finite());
        assert!((w_pos - w_neg).abs() < 1e-12);
    }
}
