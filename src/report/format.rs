//! Formatted terminal output for a calibration run.
//!
//! We keep formatting code in one place so:
//! - the math/fitting code stays clean and testable
//! - output changes are localized

use std::ops::RangeInclusive;

use crate::domain::{
    CalibrationConfig, CurveParameters, Estimate, FitResult, InversionGrid, IrlsResult, SummaryStat, VarianceFit,
};
use crate::io::ingest::IngestedData;
use crate::report::StandardRow;

/// Format the run header, variance model and both fits.
pub fn format_run_summary(
    ingest: &IngestedData,
    variance: &VarianceFit,
    result: &IrlsResult,
    config: &CalibrationConfig,
) -> String {
    let mut out = String::new();

    out.push_str("=== dose - 4PL calibration ===\n");
    out.push_str(&format!("Input: {} ({:?})\n", config.csv_path.display(), ingest.format));
    out.push_str(&format!(
        "Rows: read={} | observations={} | skipped={} | blanks={}\n",
        ingest.rows_read,
        ingest.observations.len(),
        ingest.row_errors.len(),
        ingest.blanks
    ));
    out.push_str(&format!(
        "Weighting: fit={:?} | inversion={:?}\n",
        config.policy, config.inversion_policy
    ));

    out.push_str("\nVariance model (ln var = ln c + theta ln mean):\n");
    out.push_str(&format!("- theta    : {:.4}", variance.theta));
    if let Some(ci) = &variance.theta_ci {
        out.push_str(&format!(
            "  ({:.0}% CI {:.4} .. {:.4})",
            100.0 * ci.level,
            ci.lower,
            ci.upper
        ));
    }
    out.push('\n');
    out.push_str(&format!("- ln c     : {:.4}\n", variance.intercept));
    out.push_str(&format!("- points   : {}\n", variance.n_points));

    out.push_str("\nParameters:\n");
    out.push_str(&format_parameter_table(&result.initial, &result.fit));

    let fit = &result.fit;
    if result.excluded > 0 {
        out.push_str(&format!("Excluded from fit (concentration <= 0): {}\n", result.excluded));
    }
    out.push_str(&format!(
        "\nIRLS: cycles={} | solver converged={} | iterations={} | wss={:.6e} | sigma={:.6} | df={}\n",
        result.cycles, fit.converged, fit.iterations, fit.wss, fit.sigma, fit.df
    ));

    out
}

/// Per-concentration replicate statistics.
pub fn format_summary_table(stats: &[SummaryStat]) -> String {
    let mut out = String::new();
    push_row(&mut out, format!("{:>12} {:>4} {:>12} {:>12} {:>8}", "conc", "n", "mean", "sd", "cv%"));
    push_row(&mut out, format!("{:-<12} {:-<4} {:-<12} {:-<12} {:-<8}", "", "", "", "", ""));
    for s in stats {
        push_row(
            &mut out,
            format!(
                "{:>12} {:>4} {:>12.5} {:>12} {:>8}",
                fmt_num(s.concentration),
                s.n,
                s.mean,
                fmt_opt(s.sd(), 5),
                fmt_opt(s.cv_percent(), 2)
            ),
        );
    }
    out
}

/// Fitted values, residuals and back-calculated recovery for each standard.
pub fn format_standards(rows: &[StandardRow]) -> String {
    let mut out = String::new();
    push_row(
        &mut out,
        format!(
            "{:>12} {:>4} {:>10} {:>10} {:>10} {:>10} {:>12} {:>9}",
            "conc", "rep", "response", "fitted", "residual", "weight", "back-calc", "recov%"
        ),
    );
    push_row(
        &mut out,
        format!("{:-<12} {:-<4} {:-<10} {:-<10} {:-<10} {:-<10} {:-<12} {:-<9}", "", "", "", "", "", "", "", ""),
    );
    for r in rows {
        push_row(
            &mut out,
            format!(
                "{:>12} {:>4} {:>10.5} {:>10.5} {:>10.5} {:>10.3e} {:>12} {:>9}",
                fmt_num(r.concentration),
                r.replicate,
                r.response,
                r.fitted,
                r.residual,
                r.weight,
                r.back_calculated.map(fmt_num).unwrap_or_else(|| "-".to_string()),
                r.recovery_percent().map(|v| format!("{v:.1}")).unwrap_or_else(|| "-".to_string()),
            ),
        );
    }
    out
}

/// `rows` evenly spaced entries of the inversion grid plus the working range.
pub fn format_grid_excerpt(grid: &InversionGrid, rows: usize, working_range: Option<&RangeInclusive<f64>>, max_cv: f64) -> String {
    let mut out = String::new();
    out.push_str(&format!("Inversion grid ({} rows):\n", grid.len()));
    push_row(&mut out, format!("{:>12} {:>12} {:>12} {:>8}", "response", "conc", "sd", "cv%"));
    push_row(&mut out, format!("{:-<12} {:-<12} {:-<12} {:-<8}", "", "", "", ""));
    for idx in excerpt_indices(grid.len(), rows) {
        let r = &grid.rows[idx];
        push_row(
            &mut out,
            format!(
                "{:>12.5} {:>12} {:>12} {:>8.2}",
                r.response,
                fmt_num(r.concentration),
                fmt_num(r.sd),
                r.cv_percent()
            ),
        );
    }

    match working_range {
        Some(range) => out.push_str(&format!(
            "\nWorking range (cv <= {max_cv}%): {} .. {}\n",
            fmt_num(*range.start()),
            fmt_num(*range.end())
        )),
        None => out.push_str(&format!("\nWorking range (cv <= {max_cv}%): none\n")),
    }
    out
}

/// Unknown-sample back-calculations.
pub fn format_estimates(estimates: &[Estimate]) -> String {
    let mut out = String::new();
    out.push_str("Unknowns:\n");
    push_row(&mut out, format!("{:>12} {:>12} {:>12} {:>8}", "response", "conc", "sd", "cv%"));
    push_row(&mut out, format!("{:-<12} {:-<12} {:-<12} {:-<8}", "", "", "", ""));
    for e in estimates {
        push_row(
            &mut out,
            format!(
                "{:>12.5} {:>12} {:>12} {:>8.2}",
                e.response,
                fmt_num(e.concentration),
                fmt_num(e.sd),
                e.cv_percent
            ),
        );
    }
    out
}

fn format_parameter_table(initial: &FitResult, fit: &FitResult) -> String {
    let mut out = String::new();
    push_row(&mut out, format!("{:<8} {:>14} {:>14} {:>14}", "", "unweighted", "final", "se"));
    let a = initial.params.to_array();
    let b = fit.params.to_array();
    let se = fit.std_errors().to_array();
    for (i, name) in CurveParameters::NAMES.iter().enumerate() {
        push_row(
            &mut out,
            format!("{name:<8} {:>14.6} {:>14.6} {:>14}", a[i], b[i], fmt_opt(se[i], 6)),
        );
    }
    out
}

/// Up to `n` indices spread over `0..len`, always including both ends.
fn excerpt_indices(len: usize, n: usize) -> Vec<usize> {
    match (len, n) {
        (0, _) | (_, 0) => Vec::new(),
        _ if n >= len => (0..len).collect(),
        (_, 1) => vec![0],
        _ => {
            let mut idx: Vec<usize> = (0..n).map(|k| k * (len - 1) / (n - 1)).collect();
            idx.dedup();
            idx
        }
    }
}

fn push_row(out: &mut String, row: String) {
    out.push_str(row.trim_end());
    out.push('\n');
}

/// Concentrations span decades; switch to exponent notation outside [1e-3, 1e5).
fn fmt_num(v: f64) -> String {
    let a = v.abs();
    if a != 0.0 && !(1e-3..1e5).contains(&a) {
        format!("{v:.4e}")
    } else {
        format!("{v:.5}")
    }
}

fn fmt_opt(v: f64, decimals: usize) -> String {
    if v.is_finite() {
        format!("{v:.decimals$}")
    } else {
        "-".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::InversionRow;

    #[test]
    fn excerpt_covers_both_ends() {
        assert_eq!(excerpt_indices(10, 3), vec![0, 4, 9]);
        assert_eq!(excerpt_indices(3, 10), vec![0, 1, 2]);
        assert!(excerpt_indices(0, 5).is_empty());
        assert!(excerpt_indices(5, 0).is_empty());
        assert_eq!(excerpt_indices(5, 1), vec![0]);
    }

    #[test]
    fn numbers_switch_to_exponent_form() {
        assert_eq!(fmt_num(12.5), "12.50000");
        assert_eq!(fmt_num(0.0), "0.00000");
        assert_eq!(fmt_num(0.0005), "5.0000e-4");
        assert_eq!(fmt_opt(f64::NAN, 2), "-");
    }

    #[test]
    fn summary_table_shows_missing_sd_as_dash() {
        let stats = [
            SummaryStat { concentration: 1.0, n: 2, mean: 0.94, variance: 0.0002 },
            SummaryStat { concentration: 100.0, n: 1, mean: 0.12, variance: f64::NAN },
        ];
        let text = format_summary_table(&stats);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].ends_with("cv%"));
        assert!(lines[3].ends_with('-'));
        assert!(lines[2].contains("0.94000"));
    }

    #[test]
    fn grid_excerpt_reports_working_range() {
        let grid = InversionGrid {
            rows: (1..=20)
                .map(|i| InversionRow { response: 1.0 / i as f64, concentration: i as f64, sd: 0.1 })
                .collect(),
        };
        let range = grid.working_range(20.0);
        let text = format_grid_excerpt(&grid, 5, range.as_ref(), 20.0);
        assert!(text.starts_with("Inversion grid (20 rows):"));
        // Header, rule, five rows.
        assert_eq!(text.lines().skip(1).take_while(|l| !l.is_empty()).count(), 7);
        assert!(text.contains("Working range (cv <= 20%): 1.00000 .. 20.00000"));

        let none = format_grid_excerpt(&grid, 5, None, 1.0);
        assert!(none.contains("none"));
    }
}
