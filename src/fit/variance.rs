//! Replicate summaries and the power-law variance model.
//!
//! Immunoassay responses are heteroscedastic: replicate variance grows with
//! the mean response roughly as a power law,
//!
//! ```text
//! var = c · mean^θ    ⇔    ln(var) = ln(c) + θ · ln(mean)
//! ```
//!
//! `θ` is estimated by ordinary least squares on the log-transformed
//! per-concentration summaries and later drives the IRLS weights.

use nalgebra::{DMatrix, DVector};
use statrs::distribution::{ContinuousCDF, StudentsT};

use crate::domain::{ConfidenceInterval, Observation, SummaryStat, VarianceFit};
use crate::error::AppError;
use crate::math::solve_least_squares;

/// Two-sided level for the θ confidence interval.
const THETA_CI_LEVEL: f64 = 0.95;

/// Per-concentration count, mean and sample variance, ascending by concentration.
///
/// Non-finite concentrations or responses are skipped.
pub fn summarize(observations: &[Observation]) -> Vec<SummaryStat> {
    let mut sorted: Vec<&Observation> = observations
        .iter()
        .filter(|o| o.concentration.is_finite() && o.response.is_finite())
        .collect();
    sorted.sort_by(|a, b| a.concentration.total_cmp(&b.concentration));

    let mut out = Vec::new();
    let mut start = 0;
    while start < sorted.len() {
        let conc = sorted[start].concentration;
        let mut end = start;
        while end < sorted.len() && sorted[end].concentration == conc {
            end += 1;
        }

        let group = &sorted[start..end];
        let n = group.len();
        let mean = group.iter().map(|o| o.response).sum::<f64>() / n as f64;
        let variance = if n > 1 {
            group.iter().map(|o| (o.response - mean).powi(2)).sum::<f64>() / (n as f64 - 1.0)
        } else {
            f64::NAN
        };

        out.push(SummaryStat {
            concentration: conc,
            n,
            mean,
            variance,
        });
        start = end;
    }
    out
}

/// Fit `ln(var) = intercept + θ ln(mean)` on rows with positive mean and variance.
pub fn fit_variance(stats: &[SummaryStat]) -> Result<VarianceFit, AppError> {
    let usable: Vec<(f64, f64)> = stats
        .iter()
        .filter(|s| s.mean.is_finite() && s.variance.is_finite() && s.mean > 0.0 && s.variance > 0.0)
        .map(|s| (s.mean.ln(), s.variance.ln()))
        .collect();

    let dropped = stats.len() - usable.len();
    if dropped > 0 {
        tracing::debug!(dropped, "summary rows excluded from variance regression");
    }

    let k = usable.len();
    if k < 2 {
        return Err(AppError::invalid_input(format!(
            "Variance model needs at least 2 concentrations with positive mean and variance, got {k}."
        )));
    }

    let ln_mean_bar = usable.iter().map(|(lm, _)| lm).sum::<f64>() / k as f64;
    let sxx: f64 = usable.iter().map(|(lm, _)| (lm - ln_mean_bar).powi(2)).sum();
    if sxx <= 0.0 {
        return Err(AppError::invalid_input(
            "Variance model needs at least two distinct mean responses.",
        ));
    }

    let mut design = DMatrix::<f64>::zeros(k, 2);
    let mut target = DVector::<f64>::zeros(k);
    for (i, &(lm, lv)) in usable.iter().enumerate() {
        design[(i, 0)] = 1.0;
        design[(i, 1)] = lm;
        target[i] = lv;
    }
    let beta = solve_least_squares(&design, &target)
        .ok_or_else(|| AppError::invalid_input("Variance regression is singular."))?;
    let (intercept, theta) = (beta[0], beta[1]);

    let df = k - 2;
    let theta_ci = if df > 0 {
        let ssr: f64 = usable
            .iter()
            .map(|&(lm, lv)| (lv - intercept - theta * lm).powi(2))
            .sum();
        let se = (ssr / df as f64 / sxx).sqrt();
        StudentsT::new(0.0, 1.0, df as f64).ok().map(|t| {
            let q = t.inverse_cdf(0.5 + THETA_CI_LEVEL / 2.0);
            ConfidenceInterval {
                level: THETA_CI_LEVEL,
                lower: theta - q * se,
                upper: theta + q * se,
            }
        })
    } else {
        None
    };

    tracing::info!(theta, intercept, n_points = k, "variance model fitted");

    Ok(VarianceFit {
        theta,
        intercept,
        theta_ci,
        n_points: k,
    })
}
