//! CSV ingest and normalization.
//!
//! Turns an assay export into a clean list of `Observation`s. Two layouts are
//! accepted:
//!
//! - **long**: one measurement per row, `concentration,replicate,response`
//!   (`replicate` optional; numbered per concentration when absent)
//! - **wide**: one concentration per row, `concentration,rep1,rep2,...`
//!
//! Design goals:
//! - **Row-level validation** (skip bad rows, but report what happened)
//! - **Missing cells are dropped**, never guessed
//! - **No fitting logic here**

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use csv::StringRecord;

use crate::domain::{InputFormat, Observation};
use crate::error::{AppError, ErrorKind};

const CONCENTRATION_NAMES: [&str; 4] = ["concentration", "conc", "dose", "x"];
const REPLICATE_NAMES: [&str; 3] = ["replicate", "rep", "well"];
const RESPONSE_NAMES: [&str; 5] = ["response", "signal", "od", "value", "y"];

/// A row-level problem encountered during ingest.
#[derive(Debug, Clone)]
pub struct RowError {
    pub line: usize,
    pub message: String,
}

/// Ingest output: observations + resolved layout + what was skipped.
#[derive(Debug, Clone)]
pub struct IngestedData {
    pub observations: Vec<Observation>,
    pub format: InputFormat,
    pub row_errors: Vec<RowError>,
    pub rows_read: usize,
    /// Observations at concentration zero (kept; the fitter excludes them).
    pub blanks: usize,
}

/// Load observations from a CSV file.
pub fn load_observations(path: &Path, format: InputFormat) -> Result<IngestedData, AppError> {
    let file = File::open(path)
        .map_err(|e| AppError::io(format!("Failed to open CSV '{}': {e}", path.display())))?;
    let data = read_observations(file, format)?;
    tracing::info!(
        path = %path.display(),
        observations = data.observations.len(),
        skipped = data.row_errors.len(),
        "loaded observations"
    );
    Ok(data)
}

/// Parse observations from any reader (used by `load_observations` and tests).
pub fn read_observations<R: Read>(reader: R, format: InputFormat) -> Result<IngestedData, AppError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers = reader
        .headers()
        .map_err(|e| AppError::invalid_input(format!("Failed to read CSV headers: {e}")))?
        .clone();
    let header_map = build_header_map(&headers);

    let format = resolve_format(format, &header_map);
    let layout = match format {
        InputFormat::Long | InputFormat::Auto => Layout::long(&header_map)?,
        InputFormat::Wide => Layout::wide(&headers)?,
    };

    let mut observations = Vec::new();
    let mut row_errors = Vec::new();
    let mut rows_read = 0usize;
    let mut replicate_counter: HashMap<u64, usize> = HashMap::new();

    for (idx, result) in reader.records().enumerate() {
        // +2: 1-based lines, header on line 1.
        let line = idx + 2;
        rows_read += 1;

        let record = match result {
            Ok(r) => r,
            Err(e) => {
                row_errors.push(RowError {
                    line,
                    message: format!("CSV parse error: {e}"),
                });
                continue;
            }
        };
        if record.iter().all(str::is_empty) {
            continue;
        }

        match layout.parse_row(&record, &mut replicate_counter) {
            Ok(rows) => observations.extend(rows),
            Err(message) => row_errors.push(RowError { line, message }),
        }
    }

    if observations.is_empty() {
        return Err(AppError::new(
            ErrorKind::InsufficientData,
            "No valid observations remain after parsing.",
        ));
    }

    for e in &row_errors {
        tracing::warn!(line = e.line, "{}", e.message);
    }

    let blanks = observations.iter().filter(|o| o.concentration == 0.0).count();
    Ok(IngestedData {
        observations,
        format,
        row_errors,
        rows_read,
        blanks,
    })
}

enum Layout {
    Long {
        concentration: usize,
        replicate: Option<usize>,
        response: usize,
    },
    Wide {
        replicate_columns: usize,
    },
}

impl Layout {
    fn long(header_map: &HashMap<String, usize>) -> Result<Self, AppError> {
        let find = |names: &[&str]| names.iter().find_map(|n| header_map.get(*n).copied());
        let concentration = find(&CONCENTRATION_NAMES)
            .ok_or_else(|| AppError::invalid_input("Missing required column 'concentration'."))?;
        let response = find(&RESPONSE_NAMES)
            .ok_or_else(|| AppError::invalid_input("Missing required column 'response'."))?;
        Ok(Layout::Long {
            concentration,
            replicate: find(&REPLICATE_NAMES),
            response,
        })
    }

    fn wide(headers: &StringRecord) -> Result<Self, AppError> {
        if headers.len() < 2 {
            return Err(AppError::invalid_input(
                "Wide layout needs a concentration column and at least one replicate column.",
            ));
        }
        Ok(Layout::Wide {
            replicate_columns: headers.len() - 1,
        })
    }

    fn parse_row(
        &self,
        record: &StringRecord,
        replicate_counter: &mut HashMap<u64, usize>,
    ) -> Result<Vec<Observation>, String> {
        match *self {
            Layout::Long {
                concentration,
                replicate,
                response,
            } => {
                let conc = parse_concentration(record.get(concentration))?;
                let Some(resp) = parse_optional(record.get(response), "response")? else {
                    // Missing response: nothing to record.
                    return Ok(Vec::new());
                };
                let rep = match replicate {
                    Some(col) => parse_replicate(record.get(col))?,
                    None => None,
                };
                let rep = rep.unwrap_or_else(|| {
                    let n = replicate_counter.entry(conc.to_bits()).or_insert(0);
                    *n += 1;
                    *n
                });
                Ok(vec![Observation::new(conc, rep, resp)])
            }
            Layout::Wide { replicate_columns } => {
                let conc = parse_concentration(record.get(0))?;
                let mut out = Vec::new();
                for rep in 1..=replicate_columns {
                    if let Some(resp) = parse_optional(record.get(rep), "response")? {
                        out.push(Observation::new(conc, rep, resp));
                    }
                }
                Ok(out)
            }
        }
    }
}

fn build_header_map(headers: &StringRecord) -> HashMap<String, usize> {
    headers
        .iter()
        .enumerate()
        .map(|(idx, name)| (normalize_header_name(name), idx))
        .collect()
}

fn normalize_header_name(name: &str) -> String {
    // Excel sometimes emits UTF-8 CSVs with a BOM on the first header.
    let name = name.trim().trim_start_matches('\u{feff}');
    name.to_ascii_lowercase()
}

fn resolve_format(format: InputFormat, header_map: &HashMap<String, usize>) -> InputFormat {
    match format {
        InputFormat::Auto => {
            if RESPONSE_NAMES.iter().any(|n| header_map.contains_key(*n)) {
                InputFormat::Long
            } else {
                InputFormat::Wide
            }
        }
        other => other,
    }
}

fn parse_concentration(cell: Option<&str>) -> Result<f64, String> {
    let value = parse_optional(cell, "concentration")?.ok_or_else(|| "Missing concentration.".to_string())?;
    if value < 0.0 {
        return Err(format!("Negative concentration {value}."));
    }
    Ok(value)
}

fn parse_replicate(cell: Option<&str>) -> Result<Option<usize>, String> {
    match cell.map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => s
            .parse::<usize>()
            .map(Some)
            .map_err(|_| format!("Invalid replicate index '{s}'.")),
    }
}

fn parse_optional(cell: Option<&str>, field: &str) -> Result<Option<f64>, String> {
    match cell.map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) if s.eq_ignore_ascii_case("na") || s.eq_ignore_ascii_case("nan") => Ok(None),
        Some(s) => {
            let v = s.parse::<f64>().map_err(|_| format!("Invalid {field} '{s}'."))?;
            if v.is_finite() {
                Ok(Some(v))
            } else {
                Err(format!("Non-finite {field} '{s}'."))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_format_with_replicates() {
        let csv = "Concentration,Replicate,Response\n1,1,0.95\n1,2,0.93\n10,1,0.55\n";
        let data = read_observations(csv.as_bytes(), InputFormat::Auto).unwrap();
        assert_eq!(data.format, InputFormat::Long);
        assert_eq!(data.observations.len(), 3);
        assert_eq!(data.observations[1], Observation::new(1.0, 2, 0.93));
    }

    #[test]
    fn long_format_numbers_replicates_when_absent() {
        let csv = "conc,response\n5,0.4\n5,0.41\n50,0.1\n";
        let data = read_observations(csv.as_bytes(), InputFormat::Long).unwrap();
        let reps: Vec<usize> = data.observations.iter().map(|o| o.replicate).collect();
        assert_eq!(reps, vec![1, 2, 1]);
    }

    #[test]
    fn wide_format_is_reshaped_and_gaps_dropped() {
        let csv = "\u{feff}dose,r1,r2,r3\n0,1.02,1.01,\n1,0.95,0.93,0.94\n100,0.12,NA,0.10\n";
        let data = read_observations(csv.as_bytes(), InputFormat::Auto).unwrap();
        assert_eq!(data.format, InputFormat::Wide);
        assert_eq!(data.observations.len(), 7);
        assert_eq!(data.blanks, 2);
        assert_eq!(data.observations[6], Observation::new(100.0, 3, 0.10));
    }

    #[test]
    fn bad_rows_are_reported_not_fatal() {
        let csv = "concentration,replicate,response\n1,1,0.9\n-2,1,0.5\nabc,1,0.4\n10,x,0.3\n10,1,0.2\n";
        let data = read_observations(csv.as_bytes(), InputFormat::Long).unwrap();
        assert_eq!(data.observations.len(), 2);
        assert_eq!(data.row_errors.len(), 3);
        assert_eq!(data.row_errors[0].line, 3);
        assert_eq!(data.rows_read, 5);
    }

    #[test]
    fn missing_columns_and_empty_input_fail() {
        let err = read_observations("concentration,replicate\n1,1\n".as_bytes(), InputFormat::Long).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);

        let err = read_observations("concentration,response\n".as_bytes(), InputFormat::Long).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InsufficientData);
    }
}
