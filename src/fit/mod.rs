//! Curve fitting orchestration.
//!
//! Responsibilities:
//!
//! - summarize replicates and fit the power-law variance model (`variance`)
//! - solve weighted 4PL least squares (`solver`, `fitter`)
//! - iterate weights until the weighted sum of squares stabilizes (`irls`)
//! - invert the fitted curve with propagated uncertainty (`inverse`)

pub mod fitter;
pub mod inverse;
pub mod irls;
pub mod solver;
pub mod variance;

pub use fitter::*;
pub use inverse::*;
pub use irls::*;
pub use solver::*;
pub use variance::*;
