//! Reporting utilities: back-fit of the calibration standards and formatted
//! terminal output.

use crate::domain::IrlsResult;
use crate::models::four_pl;

pub mod format;

pub use format::*;

/// One calibration observation after the final fit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StandardRow {
    pub concentration: f64,
    pub replicate: usize,
    pub response: f64,
    pub fitted: f64,
    pub residual: f64,
    pub weight: f64,
    /// Concentration read back off the fitted curve; `None` beyond the asymptotes.
    pub back_calculated: Option<f64>,
}

impl StandardRow {
    /// Back-calculated concentration as a percentage of the nominal one.
    pub fn recovery_percent(&self) -> Option<f64> {
        self.back_calculated.map(|x| 100.0 * x / self.concentration)
    }
}

/// Pair each fitted observation with its residual, weight and back-calculated concentration.
pub fn standards_table(result: &IrlsResult) -> Vec<StandardRow> {
    let fit = &result.fit;
    result
        .observations
        .iter()
        .enumerate()
        .map(|(i, o)| {
            let x = four_pl::inverse(o.response, &fit.params);
            StandardRow {
                concentration: o.concentration,
                replicate: o.replicate,
                response: o.response,
                fitted: fit.fitted[i],
                residual: fit.residuals[i],
                weight: fit.weights[i],
                back_calculated: (x.is_finite() && x > 0.0).then_some(x),
            }
        })
        .collect()
}
