//! Weighted Levenberg–Marquardt solver.
//!
//! Minimizes
//!
//! ```text
//! S(p) = Σ w_i (y_i - f(x_i; p))²
//! ```
//!
//! for a model supplied through [`CurveModel`]. Each iteration solves the
//! damped Gauss–Newton system in its row-augmented least-squares form
//!
//! ```text
//! [ √W J    ]       [ √W r ]
//! [ √(λ D)  ] δ  ≈  [ 0    ]
//! ```
//!
//! with `D = diag(JᵀWJ)` (Marquardt scaling), using the same SVD solve as the
//! variance regression. A step is accepted when it does not increase `S`;
//! otherwise `λ` grows and the step is retried.
//!
//! Termination:
//! - relative reduction of `S` below `ftol`
//! - relative step length below `xtol`
//! - gradient orthogonal to the residual (cosine below `gtol`)
//! - no admissible non-increasing step exists even at maximum damping
//!
//! Exhausting `max_iterations` is not an error: the outcome carries
//! `converged = false` and the caller decides what to do with it.

use nalgebra::{DMatrix, DVector};

use crate::error::{AppError, ErrorKind};
use crate::math::{solve_least_squares, spd_inverse};

/// A model `y = f(x; p)` with a fixed number of parameters.
pub trait CurveModel {
    fn n_params(&self) -> usize;

    fn value(&self, x: f64, params: &[f64]) -> f64;

    /// Fill `out` with `∂f/∂p_j` at `x`.
    ///
    /// The default uses central finite differences. Models with closed-form
    /// partials should override it.
    fn gradient(&self, x: f64, params: &[f64], out: &mut [f64]) {
        let mut shifted = params.to_vec();
        for j in 0..params.len() {
            let h = 1e-7 * (1.0 + params[j].abs());
            shifted[j] = params[j] + h;
            let up = self.value(x, &shifted);
            shifted[j] = params[j] - h;
            let dn = self.value(x, &shifted);
            shifted[j] = params[j];
            out[j] = (up - dn) / (2.0 * h);
        }
    }

    /// Whether `params` lies in the model's domain. Trial steps outside it are rejected.
    fn is_admissible(&self, _params: &[f64]) -> bool {
        true
    }
}

/// Solver hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolverOptions {
    pub max_iterations: usize,
    pub initial_lambda: f64,
    /// Multiplier applied to `λ` after a rejected step (> 1).
    pub lambda_up: f64,
    /// Multiplier applied to `λ` after an accepted step (< 1).
    pub lambda_down: f64,
    /// Damping ceiling; reaching it without an acceptable step ends the search.
    pub max_lambda: f64,
    pub ftol: f64,
    pub xtol: f64,
    pub gtol: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            initial_lambda: 1e-3,
            lambda_up: 10.0,
            lambda_down: 0.1,
            max_lambda: 1e16,
            ftol: 1e-10,
            xtol: 1e-10,
            gtol: 1e-10,
        }
    }
}

/// Raw solver output, in the model's parameter order.
#[derive(Debug, Clone)]
pub struct SolverOutcome {
    pub params: Vec<f64>,
    pub fitted: Vec<f64>,
    pub wss: f64,
    /// `(JᵀWJ)⁻¹` at `params` (pseudo-inverse if singular, NaN if that fails too).
    pub cov_unscaled: DMatrix<f64>,
    pub iterations: usize,
    pub converged: bool,
}

#[derive(Debug, Clone, Default)]
pub struct LevenbergMarquardt {
    pub options: SolverOptions,
}

impl LevenbergMarquardt {
    pub fn new(options: SolverOptions) -> Self {
        Self { options }
    }

    /// Minimize the weighted residual sum of squares from `start`.
    ///
    /// Errors only on malformed input (length mismatch, negative or
    /// non-finite weights, a start outside the model domain, or a
    /// non-finite objective at the start).
    pub fn minimize<M: CurveModel>(
        &self,
        model: &M,
        x: &[f64],
        y: &[f64],
        w: &[f64],
        start: &[f64],
    ) -> Result<SolverOutcome, AppError> {
        let opts = &self.options;
        let m = x.len();
        let p = model.n_params();

        if y.len() != m || w.len() != m {
            return Err(AppError::invalid_input(format!(
                "Solver input length mismatch: x={m}, y={}, w={}.",
                y.len(),
                w.len()
            )));
        }
        if start.len() != p {
            return Err(AppError::invalid_input(format!(
                "Start vector has {} entries, model expects {p}.",
                start.len()
            )));
        }
        if m < p {
            return Err(AppError::invalid_input(format!(
                "Need at least {p} observations to fit {p} parameters, got {m}."
            )));
        }
        if w.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(AppError::invalid_input("Weights must be finite and non-negative."));
        }
        if start.iter().any(|v| !v.is_finite()) || !model.is_admissible(start) {
            return Err(AppError::new(
                ErrorKind::Numeric,
                format!("Start parameters {start:?} are outside the model domain."),
            ));
        }

        let sw: Vec<f64> = w.iter().map(|v| v.sqrt()).collect();
        let mut params = DVector::from_row_slice(start);
        let (mut fitted, mut wss) = objective(model, x, y, w, params.as_slice());
        if !wss.is_finite() {
            return Err(AppError::new(
                ErrorKind::Numeric,
                "Non-finite weighted sum of squares at the start parameters.",
            ));
        }

        let mut jac = weighted_jacobian(model, x, &sw, params.as_slice());
        let mut lambda = opts.initial_lambda;
        let mut iterations = 0usize;
        let mut converged = false;

        loop {
            let r_w = weighted_residuals(y, &fitted, &sw);
            let jtj = jac.transpose() * &jac;
            let g = jac.transpose() * &r_w;

            if wss == 0.0 || gradient_is_orthogonal(&jtj, &g, wss, opts.gtol) {
                converged = true;
                break;
            }
            if iterations >= opts.max_iterations {
                break;
            }
            iterations += 1;

            // Marquardt scaling; zero columns get a unit scale so the damping
            // block stays full rank.
            let scale: Vec<f64> = (0..p)
                .map(|j| if jtj[(j, j)] > 0.0 { jtj[(j, j)] } else { 1.0 })
                .collect();

            let mut accepted = None;
            while lambda <= opts.max_lambda {
                if let Some(step) = damped_step(&jac, &r_w, &scale, lambda) {
                    let trial = &params + &step;
                    if trial.iter().all(|v| v.is_finite()) && model.is_admissible(trial.as_slice()) {
                        let (trial_fitted, trial_wss) = objective(model, x, y, w, trial.as_slice());
                        if trial_wss.is_finite() && trial_wss <= wss {
                            accepted = Some((step, trial, trial_fitted, trial_wss));
                            break;
                        }
                    }
                }
                lambda *= opts.lambda_up;
            }

            let Some((step, trial, trial_fitted, trial_wss)) = accepted else {
                // No descent direction left at any damping: stationary point.
                tracing::debug!(iterations, wss, "no improving step; stopping");
                converged = true;
                break;
            };

            let reduction = (wss - trial_wss) / wss;
            let small_step = step.norm() <= opts.xtol * (params.norm() + opts.xtol);

            params = trial;
            fitted = trial_fitted;
            wss = trial_wss;
            lambda = (lambda * opts.lambda_down).max(1e-12);
            jac = weighted_jacobian(model, x, &sw, params.as_slice());

            if reduction <= opts.ftol || small_step {
                converged = true;
                break;
            }
        }

        let jtj = jac.transpose() * &jac;
        let cov_unscaled = spd_inverse(&jtj).unwrap_or_else(|| DMatrix::from_element(p, p, f64::NAN));

        tracing::debug!(iterations, wss, converged, "levenberg-marquardt finished");

        Ok(SolverOutcome {
            params: params.iter().copied().collect(),
            fitted,
            wss,
            cov_unscaled,
            iterations,
            converged,
        })
    }
}

fn objective<M: CurveModel>(model: &M, x: &[f64], y: &[f64], w: &[f64], params: &[f64]) -> (Vec<f64>, f64) {
    let fitted: Vec<f64> = x.iter().map(|&xi| model.value(xi, params)).collect();
    let wss = fitted
        .iter()
        .zip(y.iter().zip(w.iter()))
        .map(|(&f, (&yi, &wi))| {
            let r = yi - f;
            wi * r * r
        })
        .sum();
    (fitted, wss)
}

fn weighted_residuals(y: &[f64], fitted: &[f64], sw: &[f64]) -> DVector<f64> {
    DVector::from_iterator(
        y.len(),
        y.iter().zip(fitted.iter()).zip(sw.iter()).map(|((&yi, &f), &s)| s * (yi - f)),
    )
}

/// Jacobian of `f` with rows scaled by `√w`.
fn weighted_jacobian<M: CurveModel>(model: &M, x: &[f64], sw: &[f64], params: &[f64]) -> DMatrix<f64> {
    let p = model.n_params();
    let mut jac = DMatrix::<f64>::zeros(x.len(), p);
    let mut row = vec![0.0; p];
    for (i, (&xi, &s)) in x.iter().zip(sw.iter()).enumerate() {
        model.gradient(xi, params, &mut row);
        for j in 0..p {
            jac[(i, j)] = row[j] * s;
        }
    }
    jac
}

fn damped_step(jac: &DMatrix<f64>, r_w: &DVector<f64>, scale: &[f64], lambda: f64) -> Option<DVector<f64>> {
    let m = jac.nrows();
    let p = jac.ncols();

    let mut a = DMatrix::<f64>::zeros(m + p, p);
    a.rows_mut(0, m).copy_from(jac);
    for j in 0..p {
        a[(m + j, j)] = (lambda * scale[j]).sqrt();
    }

    let mut b = DVector::<f64>::zeros(m + p);
    b.rows_mut(0, m).copy_from(r_w);

    solve_least_squares(&a, &b)
}

/// MINPACK-style gradient test: every column of `√W J` is nearly orthogonal to the residual.
fn gradient_is_orthogonal(jtj: &DMatrix<f64>, g: &DVector<f64>, wss: f64, gtol: f64) -> bool {
    let r_norm = wss.sqrt();
    g.iter().enumerate().all(|(j, &gj)| {
        let col_norm = jtj[(j, j)].sqrt();
        col_norm == 0.0 || (gj.abs() / (col_norm * r_norm)) <= gtol
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `y = a * exp(-b x)`, relying on the default finite-difference gradient.
    struct ExpDecay;

    impl CurveModel for ExpDecay {
        fn n_params(&self) -> usize {
            2
        }

        fn value(&self, x: f64, params: &[f64]) -> f64 {
            params[0] * (-params[1] * x).exp()
        }
    }

    /// Straight line through the origin with a positivity domain on the slope.
    struct PositiveSlope;

    impl CurveModel for PositiveSlope {
        fn n_params(&self) -> usize {
            1
        }

        fn value(&self, x: f64, params: &[f64]) -> f64 {
            params[0] * x
        }

        fn gradient(&self, x: f64, _params: &[f64], out: &mut [f64]) {
            out[0] = x;
        }

        fn is_admissible(&self, params: &[f64]) -> bool {
            params[0] > 0.0
        }
    }

    #[test]
    fn recovers_exponential_decay_with_numeric_jacobian() {
        let x: Vec<f64> = (0..15).map(|i| i as f64 * 0.3).collect();
        let y: Vec<f64> = x.iter().map(|&xi| 2.5 * (-0.7 * xi).exp()).collect();
        let w = vec![1.0; x.len()];

        let out = LevenbergMarquardt::default()
            .minimize(&ExpDecay, &x, &y, &w, &[1.0, 0.2])
            .unwrap();
        assert!(out.converged);
        assert!((out.params[0] - 2.5).abs() < 1e-6);
        assert!((out.params[1] - 0.7).abs() < 1e-6);
        assert!(out.wss < 1e-12);
    }

    #[test]
    fn weights_change_the_solution() {
        // Two inconsistent clusters; the heavier one should dominate.
        let x = [1.0, 1.0, 2.0, 2.0];
        let y = [1.0, 1.0, 6.0, 6.0];
        let solver = LevenbergMarquardt::default();

        let light = solver.minimize(&PositiveSlope, &x, &y, &[1.0, 1.0, 1.0, 1.0], &[1.0]).unwrap();
        let heavy = solver.minimize(&PositiveSlope, &x, &y, &[100.0, 100.0, 1.0, 1.0], &[1.0]).unwrap();

        // Unweighted optimum: Σxy/Σx² = (2 + 24)/(2 + 8) = 2.6
        assert!((light.params[0] - 2.6).abs() < 1e-8);
        // Weighted: (200 + 24)/(200 + 8)
        assert!((heavy.params[0] - 224.0 / 208.0).abs() < 1e-8);
    }

    #[test]
    fn iteration_cap_flags_non_convergence() {
        let x: Vec<f64> = (0..15).map(|i| i as f64 * 0.3).collect();
        let y: Vec<f64> = x.iter().map(|&xi| 2.5 * (-0.7 * xi).exp()).collect();
        let w = vec![1.0; x.len()];
        let solver = LevenbergMarquardt::new(SolverOptions {
            max_iterations: 1,
            ..SolverOptions::default()
        });

        let out = solver.minimize(&ExpDecay, &x, &y, &w, &[10.0, 3.0]).unwrap();
        assert!(!out.converged);
        assert_eq!(out.iterations, 1);
        assert!(out.wss.is_finite());
    }

    #[test]
    fn covariance_matches_linear_theory() {
        // For y = a x, (JᵀJ)⁻¹ = 1 / Σx².
        let x = [1.0, 2.0, 3.0];
        let y = [1.1, 1.9, 3.2];
        let out = LevenbergMarquardt::default()
            .minimize(&PositiveSlope, &x, &y, &[1.0, 1.0, 1.0], &[0.5])
            .unwrap();
        assert!((out.cov_unscaled[(0, 0)] - 1.0 / 14.0).abs() < 1e-10);
    }

    #[test]
    fn rejects_malformed_input() {
        let solver = LevenbergMarquardt::default();
        assert!(solver.minimize(&PositiveSlope, &[1.0], &[1.0, 2.0], &[1.0], &[1.0]).is_err());
        assert!(solver.minimize(&PositiveSlope, &[1.0], &[1.0], &[-1.0], &[1.0]).is_err());
        assert!(solver.minimize(&PositiveSlope, &[1.0], &[1.0], &[1.0], &[-1.0]).is_err());
    }
}
