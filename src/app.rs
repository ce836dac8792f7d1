//! Top-level application orchestration.
//!
//! `src/main.rs` stays tiny; this module is the "real main" that:
//! - parses CLI arguments and installs the log subscriber
//! - runs the calibration pipeline
//! - prints the report
//! - writes optional exports

use clap::Parser;

use crate::cli::{Cli, Command, FitArgs, SimulateArgs};
use crate::data::{SimulationConfig, simulate};
use crate::domain::{CalibrationConfig, CurveParameters};
use crate::error::AppError;
use crate::io::curve::{CalibrationFile, write_calibration_json};
use crate::io::export::{write_grid_csv, write_observations_csv};
use crate::report;

pub mod pipeline;

/// Entry point for the `dose` binary.
pub fn run() -> Result<(), AppError> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Fit(args) => handle_fit(&args),
        Command::Simulate(args) => handle_simulate(&args),
    }
}

fn handle_fit(args: &FitArgs) -> Result<(), AppError> {
    let config = config_from_args(args);
    let run = pipeline::run_calibration(&config)?;

    println!(
        "{}",
        report::format_run_summary(&run.ingest, &run.variance, &run.result, &config)
    );
    println!("{}", report::format_summary_table(&run.summary));
    if config.show_standards {
        println!("{}", report::format_standards(&report::standards_table(&run.result)));
    }
    println!(
        "{}",
        report::format_grid_excerpt(&run.grid, config.grid_rows, run.working_range.as_ref(), config.max_cv)
    );
    if !run.estimates.is_empty() {
        println!("{}", report::format_estimates(&run.estimates));
    }

    if let Some(path) = &config.export_grid {
        write_grid_csv(path, &run.grid)?;
        tracing::info!(path = %path.display(), rows = run.grid.len(), "wrote inversion grid");
    }
    if let Some(path) = &config.export_json {
        let calibration = CalibrationFile::new(
            config.policy,
            config.inversion_policy,
            &run.summary,
            &run.variance,
            &run.result,
            &run.grid,
            &run.estimates,
        );
        write_calibration_json(path, &calibration)?;
        tracing::info!(path = %path.display(), "wrote calibration JSON");
    }

    Ok(())
}

fn handle_simulate(args: &SimulateArgs) -> Result<(), AppError> {
    let config = simulation_from_args(args);
    let observations = simulate(&config)?;
    write_observations_csv(&args.out, &observations)?;
    println!("Wrote {} observations to {}", observations.len(), args.out.display());
    Ok(())
}

pub fn config_from_args(args: &FitArgs) -> CalibrationConfig {
    let start = match (args.top, args.bottom, args.ic50, args.slope) {
        (Some(top), Some(bottom), Some(ic50), Some(slope)) => Some(CurveParameters::new(top, bottom, ic50, slope)),
        _ => None,
    };

    CalibrationConfig {
        csv_path: args.csv.clone(),
        format: args.format,
        start,
        policy: args.policy,
        inversion_policy: args.inversion_policy.unwrap_or(args.policy),
        tolerance: args.tolerance,
        max_cycles: args.max_cycles,
        solver_max_iterations: args.solver_iterations,
        replicates: args.replicates,
        resolution: args.resolution,
        unknowns: args.unknowns.clone(),
        max_cv: args.max_cv,
        grid_rows: args.grid_rows,
        show_standards: args.standards,
        export_grid: args.export_grid.clone(),
        export_json: args.export_json.clone(),
    }
}

pub fn simulation_from_args(args: &SimulateArgs) -> SimulationConfig {
    SimulationConfig {
        params: CurveParameters::new(args.top, args.bottom, args.ic50, args.slope),
        theta: args.theta,
        sigma: args.sigma,
        policy: args.policy,
        replicates: args.replicates,
        levels: args.levels,
        conc_min: args.conc_min,
        conc_max: args.conc_max,
        blank: args.blank,
        seed: args.seed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{InputFormat, WeightPolicy};

    #[test]
    fn fit_flags_map_into_config() {
        let cli = Cli::parse_from([
            "dose", "--log-level", "debug", "fit", "--csv", "std.csv", "--policy", "full", "--top", "1.0",
            "--bottom", "0.1", "--ic50", "10", "--slope", "-1.2", "--unknown", "0.4", "--unknown", "0.6",
        ]);
        assert_eq!(cli.log_level, tracing::Level::DEBUG);
        let Command::Fit(args) = cli.command else {
            panic!("expected fit subcommand");
        };

        let config = config_from_args(&args);
        assert_eq!(config.format, InputFormat::Auto);
        assert_eq!(config.policy, WeightPolicy::Full);
        assert_eq!(config.inversion_policy, WeightPolicy::Full);
        assert_eq!(config.start, Some(CurveParameters::new(1.0, 0.1, 10.0, -1.2)));
        assert_eq!(config.unknowns, vec![0.4, 0.6]);
        assert_eq!(config.max_cycles, 100);
        assert_eq!(config.resolution, 700);
        assert_eq!(config.replicates, 3);
    }

    #[test]
    fn inversion_policy_can_differ_from_the_fit_policy() {
        let cli = Cli::parse_from(["dose", "fit", "--csv", "std.csv", "--inversion-policy", "full"]);
        let Command::Fit(args) = cli.command else {
            panic!("expected fit subcommand");
        };
        let config = config_from_args(&args);
        assert_eq!(config.policy, WeightPolicy::Half);
        assert_eq!(config.inversion_policy, WeightPolicy::Full);
    }

    #[test]
    fn partial_start_vector_is_rejected() {
        let parsed = Cli::try_parse_from(["dose", "fit", "--csv", "std.csv", "--top", "1.0"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn simulate_defaults_match_the_generator() {
        let cli = Cli::parse_from(["dose", "simulate", "--out", "sim.csv"]);
        let Command::Simulate(args) = cli.command else {
            panic!("expected simulate subcommand");
        };
        assert_eq!(simulation_from_args(&args), SimulationConfig::default());
    }
}
