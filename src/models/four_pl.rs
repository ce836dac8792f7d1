//! Four-parameter logistic model.
//!
//! ```text
//! y(x) = top + (bottom - top) / (1 + (x / ic50)^slope)
//! ```
//!
//! Besides the forward curve, the inverse prediction needs the closed-form
//! inverse
//!
//! ```text
//! x(y) = ic50 * ((bottom - y) / (y - top))^(1 / slope)
//! ```
//!
//! and its partial derivatives. None of these functions panic: at `y == top`
//! or `y == bottom` they return non-finite values and callers filter them.
//!
//! Numerical notes:
//! - `(x/ic50)^slope` overflows for extreme concentrations; the forward
//!   partials are written in terms of `q = 1 / (1 + u)` so `u = inf` degrades
//!   to `q = 0` instead of `inf / inf`.

use crate::domain::CurveParameters;

/// `q = 1 / (1 + (x/ic50)^slope)`, the weight on `bottom`.
fn bottom_share(x: f64, p: &CurveParameters) -> f64 {
    let u = (x / p.ic50).powf(p.slope);
    if u.is_infinite() { 0.0 } else { 1.0 / (1.0 + u) }
}

/// Evaluate the 4PL response at concentration `x`.
pub fn evaluate(x: f64, p: &CurveParameters) -> f64 {
    let q = bottom_share(x, p);
    p.top + (p.bottom - p.top) * q
}

/// Partial derivatives of the response w.r.t. `(top, bottom, ic50, slope)`.
pub fn gradient(x: f64, p: &CurveParameters) -> [f64; 4] {
    let q = bottom_share(x, p);
    let spread = p.bottom - p.top;
    // u / (1+u)² = q (1 - q)
    let qq = q * (1.0 - q);
    let d_slope = if qq == 0.0 {
        0.0
    } else {
        -spread * qq * (x / p.ic50).ln()
    };
    [1.0 - q, q, spread * qq * p.slope / p.ic50, d_slope]
}

/// Derivative of the response w.r.t. concentration.
pub fn d_response_d_x(x: f64, p: &CurveParameters) -> f64 {
    let q = bottom_share(x, p);
    -(p.bottom - p.top) * q * (1.0 - q) * p.slope / x
}

/// Concentration that produces response `y`.
///
/// Finite only for `y` strictly between the asymptotes.
pub fn inverse(y: f64, p: &CurveParameters) -> f64 {
    p.ic50 * ((p.bottom - y) / (y - p.top)).powf(1.0 / p.slope)
}

/// Partial derivatives of the inverse `x(y)` used by the delta method.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InverseGradient {
    /// `∂x/∂y`
    pub d_response: f64,
    /// `∂x/∂(top, bottom, ic50, slope)`
    pub d_params: [f64; 4],
}

/// Closed-form partials of `x(y)` at response `y`, where `x = inverse(y, p)`.
pub fn inverse_gradient(y: f64, x: f64, p: &CurveParameters) -> InverseGradient {
    let s = p.slope;
    let above_top = y - p.top;
    let below_bottom = p.bottom - y;

    InverseGradient {
        d_response: x * (p.top - p.bottom) / (s * above_top * below_bottom),
        d_params: [
            x / (s * above_top),
            x / (s * below_bottom),
            x / p.ic50,
            (-x / (s * s)) * (below_bottom / above_top).ln(),
        ],
    }
}
