//! # ncbackup CLI - Incremental backups of a Nextcloud data directory
//!
//! Thin command-line front end for the ncbackup library. Resolves the run
//! configuration from flags, environment variables and an optional JSON file,
//! runs one backup and prints a summary.
//!
//! ## Usage
//! ```bash
//! # Show what would be copied
//! ncbackup --source /var/www/nextcloud/data --backup /mnt/nextcloud_backup --dry-run
//!
//! # Mirror, removing files deleted from the data directory
//! NCBACKUP_PARTITION=/dev/sdc1 ncbackup -s /var/www/nextcloud/data -b /mnt/nextcloud_backup --delete
//!
//! # Everything from a config file, report written as JSON
//! ncbackup --config /etc/ncbackup.json --report /var/log/ncbackup/last.json
//! ```
//!
//! Exit status is 0 whenever the run completed, even if some entries failed
//! (they are listed in the summary and the report), and 1 when the run could
//! not start.

use anyhow::{bail, Context};
use clap::Parser;
use colored::*;
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use ncbackup::{BackupError, BackupExecutor, ProgressInfo, RunConfig, RunReport};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// Exclude applied when neither flags nor the config file name any: files
/// still being uploaded to Nextcloud
const DEFAULT_EXCLUDE: &str = "*.part";

/// Incremental backup of a data directory onto a backup partition
#[derive(Parser)]
#[command(name = "ncbackup")]
#[command(version)]
#[command(about = "Incremental, dry-run capable backups of a data directory onto a dedicated partition")]
#[command(long_about = None)]
struct Cli {
    /// Data directory to back up
    #[arg(short, long, env = "NCBACKUP_SOURCE")]
    source: Option<PathBuf>,

    /// Backup directory on the backup partition
    #[arg(short, long, env = "NCBACKUP_DEST")]
    backup: Option<PathBuf>,

    /// Backup partition, as a mount point or a device such as /dev/sdc1
    #[arg(short, long, env = "NCBACKUP_PARTITION")]
    partition: Option<String>,

    /// JSON configuration file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log every decision
    #[arg(short, long)]
    verbose: bool,

    /// Detect and report only, never touch the backup directory (implies --verbose)
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Remove backup entries that no longer exist in the data directory
    #[arg(long)]
    delete: bool,

    /// Glob pattern of entries to leave alone (repeatable, default: *.part)
    #[arg(short, long)]
    exclude: Vec<String>,

    /// Number of parallel copy workers
    #[arg(short, long)]
    workers: Option<usize>,

    /// Extra tolerance in milliseconds when comparing modification times (2000 for FAT)
    #[arg(long, value_name = "MS")]
    modify_window: Option<u64>,

    /// Maximum total size of the backup directory in bytes
    #[arg(long, value_name = "BYTES")]
    max_size: Option<u64>,

    /// Do not take the run lock on the backup directory
    #[arg(long)]
    no_lock: bool,

    /// Write the run report as JSON to this file
    #[arg(long, value_name = "FILE")]
    report: Option<PathBuf>,

    /// Show a progress spinner
    #[arg(long)]
    progress: bool,
}

fn main() {
    let cli = Cli::parse();

    // Set up logging
    let default_level = if cli.verbose || cli.dry_run { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // Disable colors if needed
    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli) {
        let message = match e.downcast_ref::<BackupError>() {
            Some(err) => err.user_message(),
            None => format!("{:#}", e),
        };
        eprintln!("{}: {}", "Error".red().bold(), message);
        std::process::exit(1);
    }
}

/// Main command runner
fn run(cli: Cli) -> anyhow::Result<()> {
    let show_progress = cli.progress;
    let report_path = cli.report.clone();
    let config = resolve_config(cli)?;

    if config.dry_run {
        println!("{}", "Dry run: nothing will be written".yellow().bold());
    }
    println!(
        "{} {} {} {}",
        "Backing up".blue().bold(),
        config.source_root.display().to_string().cyan(),
        "→".blue(),
        config.backup_root.display().to_string().cyan()
    );

    let start = Instant::now();
    let mut executor = BackupExecutor::new();
    let spinner = if show_progress {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.enable_steady_tick(Duration::from_millis(120));
        pb.set_message("Scanning...");

        let handle = pb.clone();
        executor = executor.with_progress(Arc::new(move |info: ProgressInfo| {
            handle.set_message(format!(
                "{}: {} entries, {} ({})",
                info.operation,
                info.processed,
                format_bytes(info.bytes_processed),
                info.current_item.unwrap_or_default()
            ));
        }));
        Some(pb)
    } else {
        None
    };

    let report = executor.run(&config)?;

    if let Some(pb) = spinner {
        pb.finish_and_clear();
    }

    print_report(&report, config.is_verbose(), start.elapsed());

    if let Some(path) = report_path {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(&path, json).with_context(|| format!("cannot write report to {}", path.display()))?;
        println!("  Report: {}", path.display().to_string().cyan());
    }

    Ok(())
}

/// Merge the config file (if any) with flags and environment variables
fn resolve_config(cli: Cli) -> anyhow::Result<RunConfig> {
    let mut config = match &cli.config {
        Some(path) => RunConfig::from_json_file(path)
            .with_context(|| format!("cannot load configuration from {}", path.display()))?,
        None => RunConfig {
            exclude: vec![DEFAULT_EXCLUDE.to_string()],
            ..RunConfig::default()
        },
    };

    if let Some(source) = cli.source {
        config.source_root = source;
    }
    if let Some(backup) = cli.backup {
        config.backup_root = backup;
    }
    if cli.partition.is_some() {
        config.backup_partition = cli.partition;
    }
    if config.source_root.as_os_str().is_empty() {
        bail!("no data directory given (use --source or NCBACKUP_SOURCE)");
    }
    if config.backup_root.as_os_str().is_empty() {
        bail!("no backup directory given (use --backup or NCBACKUP_DEST)");
    }

    config.verbose |= cli.verbose;
    config.dry_run |= cli.dry_run;
    config.delete_orphans |= cli.delete;
    if cli.no_lock {
        config.lock = false;
    }
    if !cli.exclude.is_empty() {
        config.exclude = cli.exclude;
    }
    if let Some(workers) = cli.workers {
        config = config.with_parallel_workers(workers);
    }
    if let Some(window) = cli.modify_window {
        config.modify_window_ms = window;
    }
    if cli.max_size.is_some() {
        config.space_limit = cli.max_size;
    }

    Ok(config)
}

/// Print the run summary
fn print_report(report: &RunReport, verbose: bool, elapsed: Duration) {
    if verbose {
        for action in &report.actions {
            let tag = format!("{:<6}", action.decision.to_string());
            let tag = match action.decision {
                ncbackup::DecisionKind::Create => tag.green(),
                ncbackup::DecisionKind::Update => tag.yellow(),
                ncbackup::DecisionKind::Delete => tag.red(),
                ncbackup::DecisionKind::Skip => tag.dimmed(),
            };
            println!("  {} {}", tag, action.path.display());
        }
    }

    let status = if report.interrupted {
        "⚠ Backup interrupted".yellow().bold()
    } else if report.has_errors() {
        "⚠ Backup completed with errors".yellow().bold()
    } else if report.dry_run {
        "✓ Dry run completed".green().bold()
    } else {
        "✓ Backup completed".green().bold()
    };
    println!("{}", status);

    println!(
        "  Created: {} ({} directories)",
        report.created.to_string().cyan(),
        report.directories_created
    );
    println!("  Updated: {}", report.updated.to_string().cyan());
    println!("  Skipped: {}", report.skipped.to_string().cyan());
    if report.deleted > 0 {
        println!(
            "  Deleted: {} ({})",
            report.deleted.to_string().cyan(),
            format_bytes(report.bytes_deleted)
        );
    }
    println!("  Copied: {}", format_bytes(report.bytes_copied).cyan());
    println!("  Time: {}", format_duration(round_to_millis(elapsed)).to_string().cyan());

    if report.has_errors() {
        println!("\n{} {}", "Errors:".red().bold(), report.errors.len());
        for error in &report.errors {
            println!(
                "  {} {}: {}",
                error.kind.to_string().red(),
                error.path.display(),
                error.message
            );
        }
    }
}

fn round_to_millis(duration: Duration) -> Duration {
    Duration::from_millis(duration.as_millis() as u64)
}

/// Format bytes in human-readable form
fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}
