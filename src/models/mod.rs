//! Dose-response model implementations.
//!
//! Models are implemented as small, pure functions so that fitting and
//! inversion code can stay generic.

pub mod four_pl;

pub use four_pl::*;
