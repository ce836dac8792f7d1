//! Input/output helpers.
//!
//! - CSV ingest + reshaping (`ingest`)
//! - inversion grid CSV export (`export`)
//! - calibration JSON export (`curve`)

pub mod curve;
pub mod export;
pub mod ingest;

pub use curve::*;
pub use export::*;
pub use ingest::*;
