#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use log::info;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rayon::prelude::*;
use std::error::Error;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process;

use nphsim::config::RunConfig;
use nphsim::design::DesignTable;
use nphsim::rates::{calibrate_censoring, calibrate_ph_power, calibrate_progression};
use nphsim::scenarios::{Scenario, ScenarioFamily};
use nphsim::simulate::SimulatedDataset;
use nphsim::truth::{EndpointSelection, true_summary_statistics};

type CliResult = Result<(), Box<dyn Error>>;

#[derive(Parser)]
#[command(
    name = "nphsim",
    about = "Survival data generation and true summary statistics under non-proportional hazards",
    long_about = "Generates patient-level survival data from piecewise-hazard and multi-state \
                 models, computes exact population summaries (median, RMST, averaged hazard \
                 ratios, milestone survival) for each scenario of a design table, and \
                 calibrates rates from interpretable design targets."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args)]
struct ScenarioArgs {
    /// Design table (CSV, one scenario per row)
    #[arg(long, value_name = "CSV")]
    design: PathBuf,

    /// Scenario family: delayed-effect, crossing-hazards, subgroup or progression
    #[arg(long)]
    family: Option<String>,

    /// Run configuration (TOML); flags given on the command line take precedence
    #[arg(long, value_name = "TOML")]
    config: Option<PathBuf>,

    /// Output file; standard output when omitted
    #[arg(long, value_name = "PATH")]
    out: Option<PathBuf>,
}

#[derive(Args)]
struct TruthArgs {
    #[command(flatten)]
    scenario: ScenarioArgs,

    /// Cutoff for RMST and averaged hazard ratios (repeatable); automatic when omitted
    #[arg(long = "cutoff", value_name = "TIME")]
    cutoffs: Vec<f64>,

    /// Milestone time for survival probabilities (repeatable)
    #[arg(long = "milestone", value_name = "TIME")]
    milestones: Vec<f64>,

    /// Event process to summarise: os, pfs or both
    #[arg(long)]
    what: Option<String>,

    /// Fail on the first numerical problem instead of writing NaN
    #[arg(long)]
    strict: bool,
}

#[derive(Args)]
struct GenerateArgs {
    #[command(flatten)]
    scenario: ScenarioArgs,

    /// Zero-based design row to simulate
    #[arg(long, default_value = "0")]
    row: usize,

    /// Seed of the first replicate; replicate r uses seed + r
    #[arg(long)]
    seed: Option<u64>,

    /// Number of replicates
    #[arg(long)]
    replicates: Option<usize>,

    /// Round event times up to whole time units
    #[arg(long)]
    discrete: bool,

    /// Analyse after this many events (administrative censoring at that calendar time)
    #[arg(long, value_name = "N")]
    target_events: Option<usize>,
}

#[derive(Clone, Copy, ValueEnum)]
enum CalibrationTarget {
    /// prog_prop_ctrl/prog_prop_trt -> prog_rate_ctrl/prog_rate_trt
    Progression,
    /// censoring_prop -> random_withdrawal
    Censoring,
    /// target_power_ph -> hr_ph, hazard_trt
    PhPower,
}

#[derive(Args)]
struct CalibrateArgs {
    #[command(flatten)]
    scenario: ScenarioArgs,

    #[arg(long, value_enum)]
    target: CalibrationTarget,

    /// Two-sided significance level for the power calibration
    #[arg(long)]
    alpha: Option<f64>,
}

#[derive(Args)]
struct GridArgs {
    /// Run configuration with one [[grid]] block per parameter
    #[arg(long, value_name = "TOML")]
    config: PathBuf,

    /// Output file; standard output when omitted
    #[arg(long, value_name = "PATH")]
    out: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute true summary statistics for every design row
    #[command(about = "Append true summary statistics to a design table")]
    Truth(TruthArgs),

    /// Simulate patient-level data for one design row
    #[command(about = "Simulate censored patient-level datasets")]
    Generate(GenerateArgs),

    /// Solve design targets for model rates
    #[command(about = "Calibrate rates from interpretable targets")]
    Calibrate(CalibrateArgs),

    /// Build a full-factorial design table
    #[command(about = "Expand a parameter grid into a design table")]
    Grid(GridArgs),
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Some(Commands::Truth(args)) => run_truth(args),
        Some(Commands::Generate(args)) => run_generate(args),
        Some(Commands::Calibrate(args)) => run_calibrate(args),
        Some(Commands::Grid(args)) => run_grid(args),
        None => {
            Cli::command().print_help().map_err(Into::into)
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn output(path: Option<&Path>) -> io::Result<Box<dyn Write>> {
    Ok(match path {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(BufWriter::new(io::stdout().lock())),
    })
}

fn load_config(path: Option<&Path>) -> Result<RunConfig, Box<dyn Error>> {
    match path {
        Some(path) => Ok(RunConfig::load(path)?),
        None => Ok(RunConfig::default()),
    }
}

fn resolve_family(flag: Option<&str>, config: &RunConfig) -> Result<ScenarioFamily, Box<dyn Error>> {
    match (flag, config.family) {
        (Some(name), _) => Ok(name.parse()?),
        (None, Some(family)) => Ok(family),
        (None, None) => Err("no scenario family given; use --family or set `family` in the configuration".into()),
    }
}

fn run_truth(args: TruthArgs) -> CliResult {
    let config = load_config(args.scenario.config.as_deref())?;
    let family = resolve_family(args.scenario.family.as_deref(), &config)?;
    let design = DesignTable::from_path(&args.scenario.design)?;

    let mut options = config.truth_options();
    if !args.cutoffs.is_empty() {
        options.cutoffs = args.cutoffs;
    }
    if !args.milestones.is_empty() {
        options.milestones = args.milestones;
    }
    if let Some(what) = args.what.as_deref() {
        options.endpoints = what.parse::<EndpointSelection>()?;
    }
    options.strict |= args.strict;

    let table = true_summary_statistics(&design, family, &options)?;
    table.write_csv(output(args.scenario.out.as_deref())?)?;
    info!("wrote true statistics for {} scenarios", table.len());
    Ok(())
}

fn run_generate(args: GenerateArgs) -> CliResult {
    let config = load_config(args.scenario.config.as_deref())?;
    let family = resolve_family(args.scenario.family.as_deref(), &config)?;
    let design = DesignTable::from_path(&args.scenario.design)?;
    let row = design.row(args.row).ok_or_else(|| {
        format!(
            "design row {} does not exist (the table has {} rows)",
            args.row,
            design.len()
        )
    })?;

    let mut scenario = Scenario::from_row(family, row)?;
    for (column, step) in [
        ("recruitment", scenario.censoring.recruitment),
        ("random_withdrawal", scenario.censoring.random_withdrawal),
        ("followup", scenario.censoring.followup),
    ] {
        if step.is_none() {
            info!("no '{column}' column; skipping that censoring step");
        }
    }
    scenario.censoring.target_events = args.target_events.or(config.target_events);

    let seed = args.seed.or(config.seed).unwrap_or(1);
    let replicates = args.replicates.or(config.replicates).unwrap_or(1);
    let discrete = args.discrete || config.discrete.unwrap_or(false);

    let datasets = (0..replicates)
        .into_par_iter()
        .map(|replicate| {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(replicate as u64));
            scenario.generate(&mut rng, discrete)
        })
        .collect::<Result<Vec<SimulatedDataset>, _>>()?;

    let mut writer = csv::Writer::from_writer(output(args.scenario.out.as_deref())?);
    for (replicate, data) in datasets.iter().enumerate() {
        data.write_csv(&mut writer, replicate)?;
    }
    writer.flush()?;

    let events: usize = datasets.iter().map(SimulatedDataset::n_events).sum();
    info!(
        "simulated {replicates} replicates of {} patients ({events} observed events in total)",
        scenario.n_ctrl + scenario.n_trt
    );
    Ok(())
}

fn run_calibrate(args: CalibrateArgs) -> CliResult {
    let config = load_config(args.scenario.config.as_deref())?;
    let design = DesignTable::from_path(&args.scenario.design)?;
    let table = match args.target {
        CalibrationTarget::Progression => calibrate_progression(&design)?,
        CalibrationTarget::Censoring => {
            let family = resolve_family(args.scenario.family.as_deref(), &config)?;
            calibrate_censoring(&design, family)?
        }
        CalibrationTarget::PhPower => {
            let alpha = args.alpha.or(config.alpha).unwrap_or(0.05);
            calibrate_ph_power(&design, alpha)?
        }
    };
    table.write_csv(output(args.scenario.out.as_deref())?)?;
    Ok(())
}

fn run_grid(args: GridArgs) -> CliResult {
    let config = RunConfig::load(&args.config)?;
    if config.grid.is_empty() {
        return Err("the configuration has no [[grid]] parameters".into());
    }
    let table = config.design_grid().build()?;
    table.write_csv(output(args.out.as_deref())?)?;
    info!("wrote {} design rows", table.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_parse_into_commands() {
        let cli = Cli::try_parse_from([
            "nphsim", "truth", "--design", "d.csv", "--family", "progression", "--cutoff", "12",
            "--cutoff", "24", "--what", "both",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Truth(args)) => {
                assert_eq!(args.cutoffs, vec![12.0, 24.0]);
                assert_eq!(args.what.as_deref(), Some("both"));
            }
            _ => panic!("expected the truth command"),
        }
    }

    #[test]
    fn family_flag_overrides_configuration() {
        let config = RunConfig::from_toml("family = \"subgroup\"").unwrap();
        assert_eq!(resolve_family(None, &config).unwrap(), ScenarioFamily::Subgroup);
        assert_eq!(
            resolve_family(Some("progression"), &config).unwrap(),
            ScenarioFamily::Progression
        );
        assert!(resolve_family(None, &RunConfig::default()).is_err());
    }
}
