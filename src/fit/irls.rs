//! Iteratively reweighted 4PL fitting for heteroscedastic responses.
//!
//! The loop:
//!
//! 1. fit unweighted (`w = 1`); this is the reported initial model
//! 2. derive weights from the previous fit's predictions via the weight
//!    policy (`w = (ŷ²)^(-θ/2)` by default)
//! 3. refit from the *original* start vector with those weights
//! 4. stop when the relative change in weighted sum of squares is at most
//!    `tolerance`, otherwise go to 2
//!
//! Every refit restarts from the same start vector rather than the previous
//! estimate; this changes the final estimates and must stay that way.
//!
//! The loop is capped at `max_cycles` reweighted fits. Hitting the cap is an
//! error; a solver that fails to converge inside a cycle is not (its
//! estimate is used as-is and the flag travels with the result).

use crate::domain::{CurveParameters, FitResult, IrlsResult, Observation, WeightPolicy};
use crate::error::{AppError, ErrorKind};
use crate::fit::fitter::fit_four_pl;
use crate::fit::solver::{LevenbergMarquardt, SolverOptions};

/// Floor for `ŷ²` so a prediction of exactly zero cannot produce an infinite weight.
const MIN_FITTED_SQ: f64 = 1e-24;

/// Reweighting loop options.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IrlsOptions {
    /// Relative wss change at or below which the loop stops.
    pub tolerance: f64,
    /// Maximum number of reweighted fits.
    pub max_cycles: usize,
    pub policy: WeightPolicy,
    pub solver: SolverOptions,
}

impl Default for IrlsOptions {
    fn default() -> Self {
        Self {
            tolerance: 1e-5,
            max_cycles: 100,
            policy: WeightPolicy::Half,
            solver: SolverOptions::default(),
        }
    }
}

/// Run the reweighting loop from `start` with variance exponent `theta`.
///
/// Observations with non-positive or non-finite concentration are dropped
/// before fitting (a zero-concentration blank cannot sit on a log-scale curve).
pub fn run_irls(
    observations: &[Observation],
    theta: f64,
    start: &CurveParameters,
    opts: &IrlsOptions,
) -> Result<IrlsResult, AppError> {
    if !theta.is_finite() {
        return Err(AppError::invalid_input(format!("Variance exponent must be finite, got {theta}.")));
    }
    if opts.max_cycles == 0 {
        return Err(AppError::invalid_input("max_cycles must be >= 1."));
    }
    if !start.is_finite() || start.ic50 <= 0.0 {
        return Err(AppError::new(
            ErrorKind::Numeric,
            format!("Start parameters must be finite with ic50 > 0, got {start:?}."),
        ));
    }

    let usable: Vec<Observation> = observations
        .iter()
        .filter(|o| o.concentration.is_finite() && o.concentration > 0.0 && o.response.is_finite())
        .copied()
        .collect();
    let dropped = observations.len() - usable.len();
    if dropped > 0 {
        tracing::warn!(dropped, "observations with non-positive concentration excluded from the fit");
    }

    let solver = LevenbergMarquardt::new(opts.solver);

    let initial = fit_four_pl(&usable, &vec![1.0; usable.len()], start, &solver)?;
    warn_if_unconverged(&initial, 0);
    tracing::debug!(wss = initial.wss, "unweighted fit");

    let mut previous = initial.clone();
    let mut cycles = 0usize;

    loop {
        if cycles >= opts.max_cycles {
            return Err(AppError::new(
                ErrorKind::IrlsNonConvergence,
                format!(
                    "Reweighting did not stabilize within {} cycles (last relative change above {}).",
                    opts.max_cycles, opts.tolerance
                ),
            ));
        }

        let current = reweighted_fit(&usable, &previous, theta, start, opts.policy, &solver)?;
        cycles += 1;
        warn_if_unconverged(&current, cycles);

        let change = relative_change(previous.wss, current.wss);
        tracing::debug!(cycle = cycles, wss = current.wss, change, "reweighted fit");

        if change <= opts.tolerance {
            tracing::info!(cycles, wss = current.wss, converged = current.converged, "IRLS converged");
            return Ok(IrlsResult {
                initial,
                fit: current,
                cycles,
                observations: usable,
                excluded: dropped,
            });
        }
        previous = current;
    }
}

/// One more reweighted fit on top of a finished result, using the same start vector.
///
/// At convergence the weighted sum of squares should barely move.
pub fn reweight_once(
    result: &IrlsResult,
    theta: f64,
    start: &CurveParameters,
    opts: &IrlsOptions,
) -> Result<FitResult, AppError> {
    let solver = LevenbergMarquardt::new(opts.solver);
    reweighted_fit(&result.observations, &result.fit, theta, start, opts.policy, &solver)
}

/// Weights implied by a fit's predictions.
pub fn weights_from_fit(fit: &FitResult, theta: f64, policy: WeightPolicy) -> Vec<f64> {
    fit.fitted
        .iter()
        .map(|&y_hat| {
            let y_sq = (y_hat * y_hat).max(MIN_FITTED_SQ);
            policy.weight(y_sq.sqrt(), theta)
        })
        .collect()
}

/// `|prev - cur| / prev`, with an exact zero treated as converged only against another zero.
pub fn relative_change(previous: f64, current: f64) -> f64 {
    if previous == 0.0 {
        if current == 0.0 { 0.0 } else { f64::INFINITY }
    } else {
        (previous - current).abs() / previous
    }
}

fn reweighted_fit(
    observations: &[Observation],
    previous: &FitResult,
    theta: f64,
    start: &CurveParameters,
    policy: WeightPolicy,
    solver: &LevenbergMarquardt,
) -> Result<FitResult, AppError> {
    let weights = weights_from_fit(previous, theta, policy);
    fit_four_pl(observations, &weights, start, solver)
}

fn warn_if_unconverged(fit: &FitResult, cycle: usize) {
    if !fit.converged {
        tracing::warn!(cycle, iterations = fit.iterations, "solver hit its iteration cap; using last estimate");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fit::variance::{fit_variance, summarize};
    use crate::models::four_pl;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal};

    fn small_assay() -> Vec<Observation> {
        vec![
            Observation::new(1.0, 1, 0.95),
            Observation::new(1.0, 2, 0.93),
            Observation::new(10.0, 1, 0.55),
            Observation::new(10.0, 2, 0.52),
            Observation::new(100.0, 1, 0.12),
            Observation::new(100.0, 2, 0.10),
        ]
    }

    fn simulated_assay(seed: u64) -> Vec<Observation> {
        let truth = CurveParameters::new(1.8, 0.05, 12.0, -1.1);
        let mut rng = StdRng::seed_from_u64(seed);
        let mut obs = Vec::new();
        for i in 0..10 {
            let x = 0.2 * 2.5f64.powi(i);
            let mean = four_pl::evaluate(x, &truth);
            let noise = Normal::new(0.0, 0.03 * mean.powf(0.7)).unwrap();
            for rep in 1..=3 {
                obs.push(Observation::new(x, rep, mean + noise.sample(&mut rng)));
            }
        }
        obs
    }

    #[test]
    fn small_assay_converges_with_plausible_ic50() {
        let obs = small_assay();
        let theta = fit_variance(&summarize(&obs)).unwrap().theta;
        let start = CurveParameters::new(1.0, 0.1, 10.0, -1.0);

        let result = run_irls(&obs, theta, &start, &IrlsOptions::default()).unwrap();
        assert!(result.cycles >= 1 && result.cycles <= 20);
        assert!(result.fit.params.ic50 > 5.0 && result.fit.params.ic50 < 20.0);
        assert_eq!(result.observations.len(), 6);
        assert!(result.initial.weights.iter().all(|&w| w == 1.0));
    }

    #[test]
    fn converged_result_is_stable_under_one_more_reweight() {
        let obs = small_assay();
        let theta = fit_variance(&summarize(&obs)).unwrap().theta;
        let start = CurveParameters::new(1.0, 0.1, 10.0, -1.0);
        let opts = IrlsOptions::default();

        let result = run_irls(&obs, theta, &start, &opts).unwrap();
        let again = reweight_once(&result, theta, &start, &opts).unwrap();
        assert!(relative_change(result.fit.wss, again.wss) < opts.tolerance);
    }

    #[test]
    fn heteroscedastic_simulation_converges() {
        let obs = simulated_assay(11);
        let theta = fit_variance(&summarize(&obs)).unwrap().theta;
        let start = crate::fit::fitter::initial_guess(&summarize(&obs)).unwrap();

        let result = run_irls(&obs, theta, &start, &IrlsOptions::default()).unwrap();
        assert!(result.fit.converged);
        assert!(result.fit.params.ic50 > 6.0 && result.fit.params.ic50 < 24.0);

        // Weights follow the fitted curve: larger responses get smaller weights.
        let fit = &result.fit;
        let (hi, lo) = if fit.fitted[0] > fit.fitted[fit.fitted.len() - 1] {
            (0, fit.fitted.len() - 1)
        } else {
            (fit.fitted.len() - 1, 0)
        };
        assert!(fit.weights[hi] < fit.weights[lo]);
    }

    #[test]
    fn cycle_cap_is_a_reported_failure() {
        let obs = simulated_assay(3);
        let start = crate::fit::fitter::initial_guess(&summarize(&obs)).unwrap();
        let opts = IrlsOptions {
            tolerance: 0.0,
            max_cycles: 2,
            ..IrlsOptions::default()
        };

        let err = run_irls(&obs, 1.4, &start, &opts).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IrlsNonConvergence);
    }

    #[test]
    fn blank_rows_are_excluded() {
        let mut obs = small_assay();
        obs.push(Observation::new(0.0, 1, 1.0));
        obs.push(Observation::new(-1.0, 1, 1.0));
        let start = CurveParameters::new(1.0, 0.1, 10.0, -1.0);

        let result = run_irls(&obs, 1.0, &start, &IrlsOptions::default()).unwrap();
        assert_eq!(result.observations.len(), 6);
        assert_eq!(result.excluded, 2);
        assert!(result.observations.iter().all(|o| o.concentration > 0.0));
        assert!(result.fit.fitted.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn every_cycle_restarts_from_the_original_start() {
        let obs = simulated_assay(5);
        let theta = fit_variance(&summarize(&obs)).unwrap().theta;
        // Deliberately far from the truth so a warm start would land elsewhere.
        let start = CurveParameters::new(1.2, 0.3, 40.0, -0.6);
        let opts = IrlsOptions::default();

        let result = run_irls(&obs, theta, &start, &opts).unwrap();
        assert!(result.cycles >= 2);

        let solver = LevenbergMarquardt::new(opts.solver);
        let mut fit = fit_four_pl(&obs, &vec![1.0; obs.len()], &start, &solver).unwrap();
        assert_eq!(fit.params, result.initial.params);
        for _ in 0..result.cycles {
            let weights = weights_from_fit(&fit, theta, WeightPolicy::Half);
            fit = fit_four_pl(&obs, &weights, &start, &solver).unwrap();
        }
        assert_eq!(fit.params, result.fit.params);
        assert_eq!(fit.wss, result.fit.wss);
    }

    #[test]
    fn capped_solver_is_tolerated_and_flagged() {
        let obs = small_assay();
        let theta = fit_variance(&summarize(&obs)).unwrap().theta;
        let start = CurveParameters::new(2.0, 0.0, 300.0, -3.0);
        let opts = IrlsOptions {
            solver: SolverOptions {
                max_iterations: 1,
                ..SolverOptions::default()
            },
            ..IrlsOptions::default()
        };

        let result = run_irls(&obs, theta, &start, &opts).unwrap();
        assert!(result.cycles >= 1);
        assert!(!result.fit.converged);
        assert_eq!(result.fit.iterations, 1);
    }

    #[test]
    fn relative_change_handles_zero() {
        assert_eq!(relative_change(0.0, 0.0), 0.0);
        assert!(relative_change(0.0, 1.0).is_infinite());
        assert!((relative_change(2.0, 1.0) - 0.5).abs() < 1e-15);
    }
}
