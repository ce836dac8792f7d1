//! Domain types used throughout the pipeline.
//!
//! This module defines:
//!
//! - raw and summarized measurements (`Observation`, `SummaryStat`)
//! - curve parameters and fit outputs (`CurveParameters`, `FitResult`, `IrlsResult`)
//! - inversion outputs (`InversionGrid`, `Estimate`)
//! - run configuration (`CalibrationConfig`, `WeightPolicy`, `InputFormat`)

pub mod types;

pub use types::*;
