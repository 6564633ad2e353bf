use std::io::{self, Write};

use serde::Serialize;

use crate::engine::{
    ProgressEvent, ProgressSink, RunOutcome, RunSummary, StatusReport, ValidationSummary,
};
use crate::store::CleanupReport;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_sync(result: &RunSummary) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_validate(result: &ValidationSummary) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_cleanup(result: &CleanupReport) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_status(result: &StatusReport) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

pub struct ConsoleOutput;

impl ConsoleOutput {
    pub fn print_sync(result: &RunSummary) {
        let color = outcome_color(result.outcome);
        let title = if result.dry_run { "dry run" } else { "sync" };
        println!("{CYAN}ocean-sync {title} summary{RESET}");
        println!("{color}outcome: {:?}{RESET}", result.outcome);
        if let Some(abort) = &result.aborted {
            println!("{RED}aborted ({}): {}{RESET}", abort.kind, abort.message);
        }
        for dataset in &result.datasets {
            println!(
                "{CYAN}{}{RESET} status={} last_synced={} target={}",
                dataset.dataset,
                dataset.state.status,
                dataset
                    .state
                    .last_synced_date
                    .map(|date| date.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                dataset.target_end
            );
            if result.dry_run {
                for planned in &dataset.planned {
                    let source = planned
                        .source
                        .as_ref()
                        .map(|source| source.to_string())
                        .unwrap_or_else(|| "gap".to_string());
                    println!("   {} <- {source}", planned.date);
                }
                continue;
            }
            println!(
                "{GREEN}   synced {}{RESET}, pending upstream {}, gaps {}, {YELLOW}quarantined {}{RESET}, aborted {}",
                dataset.synced,
                dataset.not_published,
                dataset.gaps_recorded,
                dataset.quarantined,
                dataset.fatal_aborted
            );
            if let Some(halted) = &dataset.halted {
                println!("{RED}   halted ({}): {}{RESET}", halted.kind, halted.message);
            }
        }
        println!(
            "store: {} granules, {} bytes",
            result.totals.granules, result.totals.storage_bytes
        );
    }

    pub fn print_validate(result: &ValidationSummary) {
        println!("{CYAN}ocean-sync validation at {}{RESET}", result.checked_at);
        for dataset in &result.datasets {
            let color = if dataset.failures.is_empty() { GREEN } else { YELLOW };
            println!(
                "{color}{}: {}/{} artifacts passed{RESET}",
                dataset.dataset, dataset.passed, dataset.checked
            );
            for failure in &dataset.failures {
                println!("{RED}   {} {}: {}{RESET}", failure.date, failure.path, failure.reason);
            }
        }
    }

    pub fn print_cleanup(result: &CleanupReport) {
        println!(
            "{GREEN}removed {} raw files, {} temp files, {} empty directories ({} bytes){RESET}",
            result.raw_removed, result.temp_removed, result.dirs_removed, result.bytes_freed
        );
    }

    pub fn print_status(result: &StatusReport) {
        println!("{CYAN}store {}{RESET}", result.store_root);
        if let Some(checked) = result.last_health_check {
            println!("last health check: {checked}");
        }
        for dataset in &result.datasets {
            let state = &dataset.state;
            let marker = if dataset.configured { "" } else { " (not configured)" };
            println!(
                "{}{marker}: {} last_synced={} granules={} bytes={} quarantined={} gaps={}",
                dataset.dataset,
                state.status,
                state
                    .last_synced_date
                    .map(|date| date.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                state.total_granules,
                state.storage_bytes,
                state.quarantined.len(),
                state.recorded_gaps.len()
            );
            if let Some(error) = &state.last_error {
                println!("{RED}   last error ({}): {}{RESET}", error.kind, error.message);
            }
        }
        println!(
            "total: {} granules, {} bytes",
            result.totals.granules, result.totals.storage_bytes
        );
    }
}

impl ProgressSink for ConsoleOutput {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => eprintln!("[{:>7.1}s] {}", elapsed.as_secs_f64(), event.message),
            None => eprintln!("{}", event.message),
        }
    }
}

fn outcome_color(outcome: RunOutcome) -> &'static str {
    match outcome {
        RunOutcome::Success => GREEN,
        RunOutcome::PartialFailure => YELLOW,
        RunOutcome::Fatal => RED,
    }
}
