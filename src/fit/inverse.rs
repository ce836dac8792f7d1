//! Inverse prediction with delta-method uncertainty.
//!
//! For a response `y` the back-calculated concentration is `x̂ = f⁻¹(y; p)`.
//! Its variance combines measurement noise of an `m`-replicate mean and
//! parameter uncertainty of the fitted curve:
//!
//! ```text
//! Var(x̂) ≈ (∂x/∂y)² · σ² v(y) / m  +  gᵀ (σ² C) g
//! ```
//!
//! where `v(y)` is the weight policy's variance function, `C` the unscaled
//! covariance of the final IRLS fit and `g = ∂x/∂(top, bottom, ic50, slope)`.

use std::ops::RangeInclusive;

use nalgebra::Vector4;

use crate::domain::{Estimate, FitResult, InversionGrid, InversionRow, IrlsResult, WeightPolicy};
use crate::error::AppError;
use crate::math::log_space;
use crate::models::four_pl;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InversionOptions {
    /// Replicates averaged per unknown sample.
    pub replicates: usize,
    /// Total number of grid concentrations (split evenly below/above IC50).
    pub resolution: usize,
    /// Lower grid bound; the smallest positive observed concentration wins if lower.
    pub floor: f64,
    pub policy: WeightPolicy,
}

impl Default for InversionOptions {
    fn default() -> Self {
        Self {
            replicates: 3,
            resolution: 700,
            floor: 0.0005,
            policy: WeightPolicy::Half,
        }
    }
}

/// Build the response → concentration → SD grid for a converged fit.
pub fn predict_grid(result: &IrlsResult, theta: f64, opts: &InversionOptions) -> Result<InversionGrid, AppError> {
    validate(opts)?;
    let fit = &result.fit;
    let ic50 = fit.params.ic50;

    let positive = result
        .observations
        .iter()
        .map(|o| o.concentration)
        .filter(|&x| x.is_finite() && x > 0.0);
    let (min_obs, max_obs) = positive.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), x| (lo.min(x), hi.max(x)));
    if !min_obs.is_finite() {
        return Err(AppError::invalid_input("No positive concentrations to span the grid."));
    }
    let floor = opts.floor.min(min_obs);

    let grid = concentration_grid(floor, ic50, max_obs, opts.resolution)?;

    let mut rows = Vec::with_capacity(grid.len());
    for &x in &grid {
        let y = four_pl::evaluate(x, &fit.params);
        let conc = four_pl::inverse(y, &fit.params);
        let sd = concentration_sd(fit, theta, y, conc, opts.replicates, opts.policy);
        if conc.is_finite() && sd.is_finite() {
            rows.push(InversionRow {
                response: y,
                concentration: conc,
                sd,
            });
        }
    }

    let dropped = grid.len() - rows.len();
    if dropped > 0 {
        tracing::debug!(dropped, "non-finite inversion rows excluded");
    }
    rows.sort_by(|a, b| a.concentration.total_cmp(&b.concentration));

    Ok(InversionGrid { rows })
}

/// Back-calculate one observed response.
pub fn estimate(result: &IrlsResult, theta: f64, response: f64, opts: &InversionOptions) -> Result<Estimate, AppError> {
    validate(opts)?;
    let p = &result.fit.params;
    let (lo, hi) = (p.top.min(p.bottom), p.top.max(p.bottom));
    if !(response.is_finite() && response > lo && response < hi) {
        return Err(AppError::invalid_input(format!(
            "Response {response} is outside the curve's asymptotes ({lo:.4}, {hi:.4})."
        )));
    }

    let concentration = four_pl::inverse(response, p);
    let sd = concentration_sd(&result.fit, theta, response, concentration, opts.replicates, opts.policy);
    Ok(Estimate {
        response,
        concentration,
        sd,
        cv_percent: 100.0 * sd / concentration.abs(),
    })
}

/// Delta-method SD of the concentration back-calculated from response `y`.
///
/// Returns NaN/inf where the inverse is undefined (at or beyond an asymptote).
pub fn concentration_sd(fit: &FitResult, theta: f64, y: f64, x: f64, replicates: usize, policy: WeightPolicy) -> f64 {
    let g = four_pl::inverse_gradient(y, x, &fit.params);
    let sigma_sq = fit.sigma * fit.sigma;

    let measurement = g.d_response * g.d_response * sigma_sq * policy.variance_factor(y, theta) / replicates as f64;
    let gv = Vector4::from(g.d_params);
    let parameter = gv.dot(&(fit.covariance() * gv));

    (measurement + parameter).sqrt()
}

impl InversionGrid {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Widest contiguous concentration run (in log terms) whose CV stays at or
    /// below `max_cv_percent`.
    pub fn working_range(&self, max_cv_percent: f64) -> Option<RangeInclusive<f64>> {
        let mut best: Option<(usize, usize)> = None;
        let mut run_start: Option<usize> = None;

        let width = |(a, b): (usize, usize)| (self.rows[b].concentration / self.rows[a].concentration).ln();

        for (i, row) in self.rows.iter().enumerate() {
            if row.cv_percent() <= max_cv_percent {
                let s = *run_start.get_or_insert(i);
                if best.is_none_or(|b| width((s, i)) > width(b)) {
                    best = Some((s, i));
                }
            } else {
                run_start = None;
            }
        }

        best.map(|(a, b)| self.rows[a].concentration..=self.rows[b].concentration)
    }
}

fn validate(opts: &InversionOptions) -> Result<(), AppError> {
    if opts.replicates == 0 {
        return Err(AppError::invalid_input("Replicate count must be >= 1."));
    }
    if opts.resolution < 4 {
        return Err(AppError::invalid_input("Grid resolution must be >= 4."));
    }
    if !(opts.floor.is_finite() && opts.floor > 0.0) {
        return Err(AppError::invalid_input("Grid floor must be a positive concentration."));
    }
    Ok(())
}

/// Lower half `[floor, ic50]`, upper half `(ic50, max]`, both log-spaced.
///
/// A half whose range is empty (IC50 outside the observed span) is skipped.
fn concentration_grid(floor: f64, ic50: f64, max: f64, resolution: usize) -> Result<Vec<f64>, AppError> {
    if !(ic50.is_finite() && ic50 > 0.0) {
        return Err(AppError::invalid_input(format!("Fitted IC50 {ic50} cannot anchor a grid.")));
    }
    let n_lower = resolution / 2;
    let n_upper = resolution - n_lower;

    let mut grid = Vec::with_capacity(resolution);
    if floor < ic50 {
        grid.extend(log_space(floor, ic50, n_lower)?);
    }
    if max > ic50 {
        grid.extend(log_space(ic50, max, n_upper + 1)?.into_iter().skip(1));
    }
    if grid.is_empty() {
        // IC50 sits below the floor: cover the observed range instead.
        grid = log_space(floor, max, resolution)?;
    }
    Ok(grid)
}
