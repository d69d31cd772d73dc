mod commands;
mod logging;
mod progress;

use std::io::{self, Write};
use std::process;

use clap::{CommandFactory, Parser};
use colored::*;
use commands::{Cli, Commands, QuarantineArgs, ScanArgs};
use dotenv::dotenv;
use dupfold_core::model::GroupLabel;
use dupfold_core::{
    FileEqualityMode, ScanManager, ScanReport, ScanRequest, StructurePolicy,
};
use progress::CliReporter;
use tracing::error;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    let _guard = logging::init_logger();

    let config = match dupfold_core::load_configuration() {
        Ok(config) => config,
        Err(err) => {
            error!("Error loading configuration: {}", err);
            process::exit(1);
        }
    };

    let args = Cli::parse();

    match args.command {
        Some(Commands::Scan(scan_args)) => {
            if let Err(err) = run_scan(config, scan_args) {
                error!("Error: {}", err);
                process::exit(1);
            }
        }
        Some(Commands::Quarantine(quarantine_args)) => {
            if let Err(err) = run_quarantine(config, quarantine_args) {
                error!("Error: {}", err);
                process::exit(1);
            }
        }
        Some(Commands::CacheStats) => {
            let manager = ScanManager::new(config)?;
            let count = manager.cache().len()?;
            println!("{} entries in fingerprint cache", count);
        }
        Some(Commands::ClearCache) => {
            match prompt_confirm("Clear the entire fingerprint cache?", Some(false)) {
                Ok(true) => {
                    let manager = ScanManager::new(config)?;
                    manager.cache().clear()?;
                    println!("Fingerprint cache cleared");
                }
                _ => process::exit(0),
            }
        }
        Some(Commands::PrintConfig) => {
            println!("Configuration: {:?}", config);
        }
        None => {
            let _ = Cli::command().print_long_help();
        }
    }

    Ok(())
}

fn build_request(args: &ScanArgs) -> ScanRequest {
    let mut request = ScanRequest::new(&args.root);
    if args.sha256 {
        request.file_equality = FileEqualityMode::Sha256;
    }
    request.similarity_threshold = args.threshold;
    if args.bag_of_files {
        request.structure_policy = StructurePolicy::BagOfFiles;
    }
    if !args.include.is_empty() {
        request.include = args.include.clone();
    }
    if !args.exclude.is_empty() {
        request.exclude = args.exclude.clone();
    }
    request.force_case_insensitive = args.case_insensitive;
    request.concurrency = args.concurrency;
    request.deletion_enabled = args.enable_deletion;
    request
}

fn run_scan(
    config: dupfold_core::AppConfig,
    args: ScanArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let manager = ScanManager::new(config)?;
    let reporter = CliReporter::new();
    let request = build_request(&args);
    let report = manager.run_blocking(request, &reporter)?;

    print_summary(&report);
    Ok(())
}

fn print_summary(report: &ScanReport) {
    let identical = report
        .groups
        .iter()
        .filter(|g| g.label == GroupLabel::Identical)
        .count();
    let near = report
        .groups
        .iter()
        .filter(|g| g.label == GroupLabel::NearDuplicate)
        .count();
    let reclaimable: u64 = report.groups.iter().map(reclaimable_bytes).sum();

    println!();
    println!(
        "Scan {} of {}",
        report.scan_id.cyan(),
        report.root_path.display()
    );
    println!(
        "{} identical groups, {} near-duplicate groups, {} bytes reclaimable",
        identical.to_string().green(),
        near.to_string().yellow(),
        reclaimable.to_string().red(),
    );

    let mut ranked: Vec<_> = report.groups.iter().collect();
    ranked.sort_by_key(|g| std::cmp::Reverse(reclaimable_bytes(g)));
    for group in ranked.iter().take(10) {
        println!(
            "  {} [{}] {} members, canonical {}, {} bytes reclaimable",
            group.group_id.cyan(),
            label_name(group),
            group.members.len(),
            group.canonical().relative_path,
            reclaimable_bytes(group).to_string().red(),
        );
    }
    if report.groups.len() > 10 {
        println!("  ... and {} more groups", report.groups.len() - 10);
    }
    if !report.warnings.is_empty() {
        println!("{} warnings (see report)", report.warnings.len().to_string().yellow());
    }
    println!("Report: {}", report.folder_index_ref.with_file_name("report.json").display());
}

fn label_name(group: &dupfold_core::GroupInfo) -> ColoredString {
    match group.label {
        GroupLabel::Identical => "identical".green(),
        GroupLabel::NearDuplicate => "near_duplicate".yellow(),
        GroupLabel::PartialOverlap => "partial_overlap".normal(),
    }
}

/// Bytes freed if every non-canonical member were quarantined.
fn reclaimable_bytes(group: &dupfold_core::GroupInfo) -> u64 {
    group
        .members
        .iter()
        .skip(1)
        .map(|member| member.total_bytes)
        .sum()
}

fn run_quarantine(
    config: dupfold_core::AppConfig,
    args: QuarantineArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let manager = ScanManager::new(config)?;
    let reporter = CliReporter::new();

    let mut request = ScanRequest::new(&args.root);
    request.deletion_enabled = true;
    let report = manager.run_blocking(request, &reporter)?;

    let plan = manager.create_plan(&report.scan_id, &args.paths)?;
    println!(
        "Plan {}: {} folders, {} bytes reclaimable, expires {}",
        plan.plan_id.cyan(),
        plan.queue.len(),
        plan.reclaimable_bytes.to_string().red(),
        plan.expires_at,
    );
    for path in &plan.queue {
        println!("  {}", path);
    }

    match prompt_confirm("Move these folders to quarantine?", Some(false)) {
        Ok(true) => {
            let outcome = manager.confirm_plan(&report.scan_id, &plan.plan_id, &plan.token)?;
            println!(
                "{} moved, {} failed, {} bytes now under {}",
                outcome.moved.len().to_string().green(),
                outcome.failed.len().to_string().red(),
                outcome.bytes_moved,
                outcome.quarantine_root.display(),
            );
            for failure in &outcome.failed {
                println!("  failed: {} ({})", failure.relative_path, failure.message);
            }
        }
        _ => {
            println!("Aborted; plan {} left unconfirmed", plan.plan_id);
        }
    }
    Ok(())
}

fn prompt_confirm(prompt: &str, default: Option<bool>) -> io::Result<bool> {
    let mut input = String::new();

    loop {
        input.clear();

        match default {
            Some(true) => print!("{} (Y/n): ", prompt),
            Some(false) | None => print!("{} (y/N): ", prompt),
        }
        io::stdout().flush()?;

        io::stdin().read_line(&mut input)?;

        match input.trim().to_uppercase().as_str() {
            "Y" => return Ok(true),
            "N" => return Ok(false),
            "" => match default {
                Some(default) => return Ok(default),
                None => continue,
            },
            _ => continue,
        }
    }
}
