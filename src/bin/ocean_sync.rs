use std::process::ExitCode;

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use ocean_sync::config::{ConfigLoader, ResolvedConfig};
use ocean_sync::domain::{DatasetId, parse_date};
use ocean_sync::engine::{RepairOptions, RunOutcome, SyncEngine, SyncOptions, read_status};
use ocean_sync::error::{Disposition, SyncError};
use ocean_sync::output::{ConsoleOutput, JsonOutput, OutputMode};

#[derive(Parser)]
#[command(name = "ocean-sync")]
#[command(about = "Incrementally mirror and harmonize ocean datasets into a local store")]
#[command(version, author)]
struct Cli {
    #[arg(
        long,
        global = true,
        visible_alias = "json",
        help = "Emit JSON on stdout instead of progress lines and summaries",
    )]
    non_interactive: bool,

    #[arg(
        long,
        global = true,
        help = "Path to ocean-sync.json (defaults to the current directory)",
    )]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Fetch, harmonize and validate every missing granule")]
    Sync(SyncArgs),
    #[command(about = "Re-validate harmonized artifacts already in the store")]
    Validate(DatasetArgs),
    #[command(about = "Reattempt quarantined dates, or the given dates")]
    Repair(RepairArgs),
    #[command(about = "Remove transient raw files and abandoned temp files")]
    Cleanup,
    #[command(about = "Show the ledger state of every dataset")]
    Status,
}

#[derive(Args)]
struct DatasetArgs {
    #[arg(long = "dataset", short = 'd', help = "Restrict to these datasets (repeatable)")]
    datasets: Vec<DatasetId>,
}

#[derive(Args)]
struct SyncArgs {
    #[command(flatten)]
    selection: DatasetArgs,

    #[arg(long, value_parser = parse_date)]
    start: Option<NaiveDate>,

    #[arg(long, value_parser = parse_date)]
    end: Option<NaiveDate>,

    #[arg(long)]
    max_granules: Option<usize>,

    #[arg(long, help = "Re-process dates that already have a harmonized artifact")]
    force: bool,

    #[arg(long, help = "Report missing dates and chosen sources without fetching")]
    dry_run: bool,
}

#[derive(Args)]
struct RepairArgs {
    #[command(flatten)]
    selection: DatasetArgs,

    #[arg(
        long = "date",
        value_parser = parse_date,
        help = "Dates to reprocess (repeatable, YYYY-MM-DD or YYYYMMDD)",
    )]
    dates: Vec<NaiveDate>,
}

fn main() -> ExitCode {
    match run() {
        Ok(outcome) => ExitCode::from(outcome_exit_code(outcome)),
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(error) = report.downcast_ref::<SyncError>() {
                return ExitCode::from(map_exit_code(error));
            }
            ExitCode::from(1)
        }
    }
}

fn outcome_exit_code(outcome: RunOutcome) -> u8 {
    match outcome {
        RunOutcome::Success => 0,
        RunOutcome::PartialFailure => 2,
        RunOutcome::Fatal => 3,
    }
}

fn map_exit_code(error: &SyncError) -> u8 {
    match error.disposition() {
        Disposition::FatalRun => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<RunOutcome> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };
    let config = ConfigLoader::resolve(cli.config.as_deref())?;

    match cli.command {
        Commands::Sync(args) => run_sync(args, config, output_mode),
        Commands::Validate(args) => run_validate(args, config, output_mode),
        Commands::Repair(args) => run_repair(args, config, output_mode),
        Commands::Cleanup => run_cleanup(config, output_mode),
        Commands::Status => run_status(&config, output_mode),
    }
}

fn run_sync(
    args: SyncArgs,
    config: ResolvedConfig,
    output_mode: OutputMode,
) -> miette::Result<RunOutcome> {
    let SyncArgs {
        selection,
        start,
        end,
        max_granules,
        force,
        dry_run,
    } = args;
    let options = SyncOptions {
        datasets: selection.datasets,
        start,
        end,
        max_granules,
        force,
        dry_run,
    };

    let engine = SyncEngine::open(config)?;
    match output_mode {
        OutputMode::NonInteractive => {
            let result = engine.sync(options, &JsonOutput)?;
            JsonOutput::print_sync(&result).into_diagnostic()?;
            Ok(result.outcome)
        }
        OutputMode::Interactive => {
            let result = engine.sync(options, &ConsoleOutput)?;
            ConsoleOutput::print_sync(&result);
            Ok(result.outcome)
        }
    }
}

fn run_validate(
    args: DatasetArgs,
    config: ResolvedConfig,
    output_mode: OutputMode,
) -> miette::Result<RunOutcome> {
    let engine = SyncEngine::open(config)?;
    match output_mode {
        OutputMode::NonInteractive => {
            let result = engine.validate_only(&args.datasets, &JsonOutput)?;
            JsonOutput::print_validate(&result).into_diagnostic()?;
            Ok(result.outcome)
        }
        OutputMode::Interactive => {
            let result = engine.validate_only(&args.datasets, &ConsoleOutput)?;
            ConsoleOutput::print_validate(&result);
            Ok(result.outcome)
        }
    }
}

fn run_repair(
    args: RepairArgs,
    config: ResolvedConfig,
    output_mode: OutputMode,
) -> miette::Result<RunOutcome> {
    let options = RepairOptions {
        datasets: args.selection.datasets,
        dates: args.dates,
    };
    let engine = SyncEngine::open(config)?;
    match output_mode {
        OutputMode::NonInteractive => {
            let result = engine.repair(options, &JsonOutput)?;
            JsonOutput::print_sync(&result).into_diagnostic()?;
            Ok(result.outcome)
        }
        OutputMode::Interactive => {
            let result = engine.repair(options, &ConsoleOutput)?;
            ConsoleOutput::print_sync(&result);
            Ok(result.outcome)
        }
    }
}

fn run_cleanup(config: ResolvedConfig, output_mode: OutputMode) -> miette::Result<RunOutcome> {
    let engine = SyncEngine::open(config)?;
    match output_mode {
        OutputMode::NonInteractive => {
            let result = engine.cleanup(&JsonOutput)?;
            JsonOutput::print_cleanup(&result).into_diagnostic()?;
        }
        OutputMode::Interactive => {
            let result = engine.cleanup(&ConsoleOutput)?;
            ConsoleOutput::print_cleanup(&result);
        }
    }
    Ok(RunOutcome::Success)
}

fn run_status(config: &ResolvedConfig, output_mode: OutputMode) -> miette::Result<RunOutcome> {
    let report = read_status(config)?;
    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_status(&report).into_diagnostic()?,
        OutputMode::Interactive => ConsoleOutput::print_status(&report),
    }
    Ok(RunOutcome::Success)
}
