//! Single weighted 4PL fit.
//!
//! Given observations `(x_i, y_i)`, weights `w_i` and a start vector, run the
//! Levenberg–Marquardt solver on the 4PL model and package the outcome as a
//! [`FitResult`] (residuals, unscaled covariance, sigma, df, convergence flag).
//!
//! Also hosts the data-driven start-parameter guess used when the caller has
//! no prior curve.

use nalgebra::Matrix4;

use crate::domain::{CurveParameters, FitResult, Observation, SummaryStat};
use crate::error::AppError;
use crate::fit::solver::{CurveModel, LevenbergMarquardt};
use crate::models::four_pl;

/// Adapter exposing the 4PL functions to the generic solver.
#[derive(Debug, Clone, Copy, Default)]
pub struct FourPl;

impl CurveModel for FourPl {
    fn n_params(&self) -> usize {
        CurveParameters::LEN
    }

    fn value(&self, x: f64, params: &[f64]) -> f64 {
        four_pl::evaluate(x, &CurveParameters::from_slice(params))
    }

    fn gradient(&self, x: f64, params: &[f64], out: &mut [f64]) {
        out.copy_from_slice(&four_pl::gradient(x, &CurveParameters::from_slice(params)));
    }

    fn is_admissible(&self, params: &[f64]) -> bool {
        let p = CurveParameters::from_slice(params);
        p.ic50 > 0.0 && p.slope != 0.0
    }
}

/// Fit the 4PL curve once with fixed weights.
pub fn fit_four_pl(
    observations: &[Observation],
    weights: &[f64],
    start: &CurveParameters,
    solver: &LevenbergMarquardt,
) -> Result<FitResult, AppError> {
    let n = observations.len();
    if n <= CurveParameters::LEN {
        return Err(AppError::invalid_input(format!(
            "Need more than {} observations for a 4PL fit with residual degrees of freedom, got {n}.",
            CurveParameters::LEN
        )));
    }

    let x: Vec<f64> = observations.iter().map(|o| o.concentration).collect();
    let y: Vec<f64> = observations.iter().map(|o| o.response).collect();

    let out = solver.minimize(&FourPl, &x, &y, weights, &start.to_array())?;

    let residuals: Vec<f64> = y.iter().zip(out.fitted.iter()).map(|(&yi, &f)| yi - f).collect();
    let weighted_residuals: Vec<f64> = residuals
        .iter()
        .zip(weights.iter())
        .map(|(&r, &w)| w.sqrt() * r)
        .collect();

    let df = n - CurveParameters::LEN;
    let sigma = (out.wss / df as f64).sqrt();

    Ok(FitResult {
        params: CurveParameters::from_slice(&out.params),
        fitted: out.fitted,
        residuals,
        weighted_residuals,
        weights: weights.to_vec(),
        wss: out.wss,
        cov_unscaled: Matrix4::from_iterator(out.cov_unscaled.iter().copied()),
        df,
        sigma,
        converged: out.converged,
        iterations: out.iterations,
    })
}

/// Start parameters from replicate means.
///
/// `top` is placed at the lowest-concentration mean and `bottom` at the
/// highest (both padded outward by 5% of the range) with `slope = -1`, so
/// the same guess works for rising and falling curves. `ic50` is the
/// log-interpolated concentration where the means cross the midpoint.
pub fn initial_guess(stats: &[SummaryStat]) -> Result<CurveParameters, AppError> {
    let mut rows: Vec<&SummaryStat> = stats
        .iter()
        .filter(|s| s.concentration > 0.0 && s.concentration.is_finite() && s.mean.is_finite())
        .collect();
    if rows.len() < 2 {
        return Err(AppError::invalid_input(
            "Need at least two positive concentrations to guess start parameters.",
        ));
    }
    rows.sort_by(|a, b| a.concentration.total_cmp(&b.concentration));

    let first = rows[0];
    let last = rows[rows.len() - 1];
    let range = first.mean - last.mean;
    let top = first.mean + 0.05 * range;
    let bottom = last.mean - 0.05 * range;
    let mid = (first.mean + last.mean) / 2.0;

    // Geometric mean of the concentration range as a fallback.
    let mut ic50 = (first.concentration * last.concentration).sqrt();
    for pair in rows.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        let crosses = (a.mean - mid) * (b.mean - mid) <= 0.0 && a.mean != b.mean;
        if crosses {
            let t = (mid - a.mean) / (b.mean - a.mean);
            let ln_x = a.concentration.ln() + t * (b.concentration.ln() - a.concentration.ln());
            ic50 = ln_x.exp();
            break;
        }
    }

    let guess = CurveParameters::new(top, bottom, ic50, -1.0);
    if !guess.is_finite() {
        return Err(AppError::invalid_input(format!(
            "Could not derive finite start parameters from the data: {guess:?}."
        )));
    }
    Ok(guess)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fit::variance::summarize;

    fn noise_free(params: &CurveParameters) -> Vec<Observation> {
        let mut out = Vec::new();
        for i in 0..13 {
            let x = 0.1 * 10f64.powf(i as f64 * 0.333);
            for rep in 1..=2 {
                out.push(Observation::new(x, rep, four_pl::evaluate(x, params)));
            }
        }
        out
    }

    #[test]
    fn recovers_known_parameters_from_noise_free_data() {
        let truth = CurveParameters::new(1.0, 0.2, 10.0, -1.0);
        let obs = noise_free(&truth);
        let weights = vec![1.0; obs.len()];
        let start = CurveParameters::new(0.9, 0.3, 6.0, -0.7);

        let fit = fit_four_pl(&obs, &weights, &start, &LevenbergMarquardt::default()).unwrap();
        assert!(fit.converged);
        assert!((fit.params.top - truth.top).abs() < 1e-4);
        assert!((fit.params.bottom - truth.bottom).abs() < 1e-4);
        assert!((fit.params.ic50 - truth.ic50).abs() < 1e-4);
        assert!((fit.params.slope - truth.slope).abs() < 1e-4);
        assert_eq!(fit.df, obs.len() - 4);
    }

    #[test]
    fn fit_result_is_internally_consistent() {
        let truth = CurveParameters::new(2.0, 0.1, 5.0, 1.2);
        let mut obs = noise_free(&truth);
        // Deterministic perturbation so the residuals are non-trivial.
        for (i, o) in obs.iter_mut().enumerate() {
            o.response += if i % 2 == 0 { 0.01 } else { -0.01 } * (1 + i % 3) as f64;
        }
        let weights: Vec<f64> = (0..obs.len()).map(|i| 1.0 + (i % 4) as f64).collect();
        let start = initial_guess(&summarize(&obs)).unwrap();

        let fit = fit_four_pl(&obs, &weights, &start, &LevenbergMarquardt::default()).unwrap();
        let wss: f64 = fit.weighted_residuals.iter().map(|r| r * r).sum();
        assert!((wss - fit.wss).abs() < 1e-12 * (1.0 + fit.wss));
        assert!((fit.sigma - (fit.wss / fit.df as f64).sqrt()).abs() < 1e-15);
        for (o, (&f, &r)) in obs.iter().zip(fit.fitted.iter().zip(fit.residuals.iter())) {
            assert!((o.response - f - r).abs() < 1e-15);
        }
        // Covariance is symmetric with a positive diagonal.
        let c = fit.cov_unscaled;
        for i in 0..4 {
            assert!(c[(i, i)] > 0.0);
            for j in 0..4 {
                assert!((c[(i, j)] - c[(j, i)]).abs() <= 1e-8 * (c[(i, i)] * c[(j, j)]).sqrt());
            }
        }
    }

    #[test]
    fn initial_guess_brackets_the_curve() {
        let obs = noise_free(&CurveParameters::new(1.0, 0.2, 10.0, -1.0));
        let guess = initial_guess(&summarize(&obs)).unwrap();
        assert!(guess.top > 0.9 && guess.bottom < 0.3);
        assert!(guess.ic50 > 3.0 && guess.ic50 < 30.0);
        assert_eq!(guess.slope, -1.0);
    }

    #[test]
    fn too_few_observations_is_invalid_input() {
        let obs: Vec<Observation> = (1..=4).map(|i| Observation::new(i as f64, 1, 1.0 / i as f64)).collect();
        let start = CurveParameters::new(1.0, 0.0, 2.0, -1.0);
        let err = fit_four_pl(&obs, &[1.0; 4], &start, &LevenbergMarquardt::default()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidInput);
    }
}
