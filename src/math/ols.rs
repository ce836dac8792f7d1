//! Dense least-squares helpers.
//!
//! Two places need a small linear least-squares solve:
//!
//! ```text
//! minimize ‖A x - b‖²
//! ```
//!
//! - every Levenberg–Marquardt step solves a damped, row-augmented system
//! - the variance model regresses `ln(var)` on `ln(mean)`
//!
//! Both are tall and tiny (≤ 4 columns), so SVD is cheap and copes with the
//! rank-deficient Jacobians a saturated 4PL design produces.
//! (Nalgebra's `QR::solve` is intended for square systems and will panic for
//! non-square matrices.)

use nalgebra::{DMatrix, DVector};

/// Solve a least squares problem using SVD.
///
/// Returns `None` if no tolerance yields a finite solution.
pub fn solve_least_squares(a: &DMatrix<f64>, b: &DVector<f64>) -> Option<DVector<f64>> {
    let svd = a.clone().svd(true, true);

    for &tol in &[1e-12, 1e-10, 1e-8] {
        if let Ok(x) = svd.solve(b, tol) {
            if x.iter().all(|v| v.is_finite()) {
                return Some(x);
            }
        }
    }

    None
}

/// Inverse of a symmetric positive semi-definite matrix.
///
/// Tries Cholesky first and falls back to the SVD pseudo-inverse for singular
/// input. Returns `None` only when both fail.
pub fn spd_inverse(m: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    if let Some(chol) = m.clone().cholesky() {
        let inv = chol.inverse();
        if inv.iter().all(|v| v.is_finite()) {
            return Some(inv);
        }
    }

    let max_abs = m.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
    let eps = (max_abs * 1e-12).max(f64::MIN_POSITIVE);
    m.clone().pseudo_inverse(eps).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn least_squares_solves_simple_system() {
        // Fit y = 2 + 3x on x = [0,1,2]
        let a = DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 1.0, 1.0, 1.0, 2.0]);
        let b = DVector::from_row_slice(&[2.0, 5.0, 8.0]);

        let x = solve_least_squares(&a, &b).unwrap();
        assert!((x[0] - 2.0).abs() < 1e-10);
        assert!((x[1] - 3.0).abs() < 1e-10);
    }

    #[test]
    fn rank_deficient_system_still_solves() {
        // Duplicate column: minimum-norm solution splits the coefficient.
        let a = DMatrix::from_row_slice(3, 2, &[1.0, 1.0, 2.0, 2.0, 3.0, 3.0]);
        let b = DVector::from_row_slice(&[2.0, 4.0, 6.0]);

        let x = solve_least_squares(&a, &b).unwrap();
        assert!((x[0] - 1.0).abs() < 1e-8);
        assert!((x[1] - 1.0).abs() < 1e-8);
    }

    #[test]
    fn spd_inverse_of_diagonal() {
        let m = DMatrix::from_row_slice(2, 2, &[4.0, 0.0, 0.0, 0.5]);
        let inv = spd_inverse(&m).unwrap();
        assert!((inv[(0, 0)] - 0.25).abs() < 1e-12);
        assert!((inv[(1, 1)] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn spd_inverse_handles_singular_input() {
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0]);
        let inv = spd_inverse(&m).unwrap();
        assert!(inv.iter().all(|v| v.is_finite()));
        // Pseudo-inverse of [[1,1],[1,1]] is [[.25,.25],[.25,.25]].
        assert!((inv[(0, 1)] - 0.25).abs() < 1e-9);
    }
}
