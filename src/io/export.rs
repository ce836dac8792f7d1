//! CSV exports: the inversion grid and raw observations.
//!
//! The exports are meant to be easy to consume in spreadsheets or plotting scripts.
//! Observations are written in the long layout that `ingest` reads back.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use serde::Serialize;

use crate::domain::{InversionGrid, Observation};
use crate::error::AppError;

#[derive(Serialize)]
struct GridRecord {
    response: f64,
    concentration: f64,
    sd: f64,
    cv_percent: f64,
}

/// Write `response,concentration,sd,cv_percent` rows to a CSV file.
pub fn write_grid_csv(path: &Path, grid: &InversionGrid) -> Result<(), AppError> {
    let file = File::create(path)
        .map_err(|e| AppError::io(format!("Failed to create grid CSV '{}': {e}", path.display())))?;
    write_grid(file, grid)
}

/// Write the grid CSV to any writer.
pub fn write_grid<W: Write>(writer: W, grid: &InversionGrid) -> Result<(), AppError> {
    let mut out = csv::Writer::from_writer(writer);
    for row in &grid.rows {
        out.serialize(GridRecord {
            response: row.response,
            concentration: row.concentration,
            sd: row.sd,
            cv_percent: row.cv_percent(),
        })
        .map_err(|e| AppError::io(format!("Failed to write grid CSV row: {e}")))?;
    }
    out.flush()
        .map_err(|e| AppError::io(format!("Failed to flush grid CSV: {e}")))?;
    Ok(())
}

/// Write `concentration,replicate,response` rows to a CSV file.
pub fn write_observations_csv(path: &Path, observations: &[Observation]) -> Result<(), AppError> {
    let file = File::create(path)
        .map_err(|e| AppError::io(format!("Failed to create observations CSV '{}': {e}", path.display())))?;
    write_observations(file, observations)
}

pub fn write_observations<W: Write>(writer: W, observations: &[Observation]) -> Result<(), AppError> {
    let mut out = csv::Writer::from_writer(writer);
    for o in observations {
        out.serialize(o)
            .map_err(|e| AppError::io(format!("Failed to write observation row: {e}")))?;
    }
    out.flush()
        .map_err(|e| AppError::io(format!("Failed to flush observations CSV: {e}")))?;
    Ok(())
}
