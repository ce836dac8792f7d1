//! `dose-curves` library crate.
//!
//! The binary (`dose`) is a thin wrapper around this library so that:
//!
//! - core logic is testable without spawning processes
//! - the fitting pipeline can be driven from other tools
//!
//! Pipeline: CSV → `Observation`s → replicate summaries → power-law variance
//! model (θ) → IRLS-weighted 4PL fit → inversion grid with delta-method SDs.

pub mod app;
pub mod cli;
pub mod data;
pub mod domain;
pub mod error;
pub mod fit;
pub mod io;
pub mod math;
pub mod models;
pub mod report;
