//! # Keepsake CLI - Incremental backups you can verify
//!
//! Command-line interface for the keepsake backup library.
//!
//! ## Features
//! - Incremental backups of several source trees into one destination
//! - Verification of stored copies against their recorded fingerprints
//! - Backup history report and sources-by-runs table
//! - Restore scripts that only restore verified copies
//!
//! ## Usage
//! ```bash
//! # Back up using keepsake.json in the current directory
//! keepsake backup --progress
//!
//! # Back up without a config file
//! keepsake --source ~/Pictures --destination /mnt/History backup
//!
//! # Check every latest backup
//! keepsake verify
//!
//! # Write backup_info.txt and show the run table
//! keepsake history --table
//!
//! # Generate restore_backup.sh restoring under ~/Restore
//! keepsake --restore-to ~/Restore restore-script
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use keepsake::catalog::CatalogStore;
use keepsake::config::{preflight, BackupConfig, DEFAULT_CONFIG_FILE};
use keepsake::report::REPORT_FILE;
use keepsake::utils::format_bytes;
use keepsake::{
    FileOutcome, HistoryReport, KeepsakeError, ProgressInfo, RestoreStep, RestoreSynthesizer,
    Result, RunSummary, ScriptFlavor, Verifier,
};
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Keepsake CLI - Incremental, verifiable file backups
#[derive(Parser)]
#[command(name = "keepsake")]
#[command(version)]
#[command(about = "Incremental file backups with an auditable catalog and verified restores")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file (defaults to keepsake.json if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Source directory to back up (replaces configured sources; repeatable)
    #[arg(short, long, global = true)]
    source: Vec<PathBuf>,

    /// Backup destination directory
    #[arg(short, long, global = true)]
    destination: Option<PathBuf>,

    /// Directory to exclude by exact path (repeatable)
    #[arg(short, long, global = true)]
    exclude: Vec<PathBuf>,

    /// Root that restore scripts restore under
    #[arg(long, global = true)]
    restore_to: Option<PathBuf>,

    /// Number of parallel workers
    #[arg(short, long, global = true)]
    workers: Option<usize>,

    /// Append log output to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy every changed file and append a catalog segment
    Backup {
        /// Show a progress bar
        #[arg(long)]
        progress: bool,
    },

    /// Re-hash the latest backup of every source
    Verify,

    /// Write and print the full backup history
    #[command(alias = "info")]
    History {
        /// Also print the sources-by-runs table
        #[arg(long)]
        table: bool,

        /// Table rows to print
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },

    /// Generate a script restoring every verified backup
    RestoreScript {
        /// Script path (defaults to the destination directory)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Script language
        #[arg(long, value_enum)]
        flavor: Option<FlavorArg>,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum FlavorArg {
    Posix,
    Batch,
}

impl From<FlavorArg> for ScriptFlavor {
    fn from(arg: FlavorArg) -> Self {
        match arg {
            FlavorArg::Posix => ScriptFlavor::Posix,
            FlavorArg::Batch => ScriptFlavor::Batch,
        }
    }
}

fn main() {
    let cli = Cli::parse();

    // Set up logging
    if let Err(e) = init_logging(cli.verbose, cli.log_file.as_deref()) {
        eprintln!("{}: {}", "Error".red().bold(), e.user_message());
        std::process::exit(1);
    }

    // Disable colors if needed
    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli) {
        eprintln!("{}: {}", "Error".red().bold(), e.user_message());
        std::process::exit(1);
    }
}

/// Install the tracing subscriber
///
/// `RUST_LOG` takes precedence; otherwise warnings, or debug output with
/// `--verbose`. Logs go to stderr, or are appended to `log_file`.
fn init_logging(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| KeepsakeError::file_io(path, e))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

/// Main command runner
fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Backup { progress } => cmd_backup(&config, cli.verbose, progress),
        Commands::Verify => cmd_verify(&config),
        Commands::History { table, limit } => cmd_history(&config, table, limit),
        Commands::RestoreScript { output, flavor } => {
            cmd_restore_script(&config, output, flavor.map(Into::into))
        }
    }
}

/// Merge the configuration file with command line overrides
fn load_config(cli: &Cli) -> Result<BackupConfig> {
    let mut config = match &cli.config {
        Some(path) => BackupConfig::load(path)?,
        None => BackupConfig::load_or_default(Path::new(DEFAULT_CONFIG_FILE))?,
    };

    if !cli.source.is_empty() {
        config.sources = cli.source.clone();
    }
    if let Some(destination) = &cli.destination {
        config.destination = destination.clone();
    }
    config.exclusions.extend(cli.exclude.iter().cloned());
    if let Some(restore_to) = &cli.restore_to {
        config.restore_destination = Some(restore_to.clone());
    }
    if let Some(workers) = cli.workers {
        config.parallel_workers = Some(workers);
    }

    config.resolve()
}

/// Open the catalog in the configured destination
fn open_catalog(config: &BackupConfig) -> Result<CatalogStore> {
    if config.destination.as_os_str().is_empty() {
        return Err(KeepsakeError::config(
            PathBuf::new(),
            "no destination configured (use --destination or a config file)",
        ));
    }
    CatalogStore::open(config.destination.clone())
}

fn progress_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-")
}

/// Run one incremental backup
///
/// Every file is reported as soon as it is decided; the summary follows once
/// the catalog segment is written.
fn cmd_backup(config: &BackupConfig, verbose: bool, show_progress: bool) -> Result<()> {
    preflight(config)?;

    println!(
        "{} {} sources into {}",
        "Backing up".blue().bold(),
        config.sources.len(),
        config.destination.display().to_string().cyan()
    );

    let bar = if show_progress {
        let pb = ProgressBar::new(0);
        pb.set_style(progress_style());
        Some(pb)
    } else {
        None
    };

    // Live totals, updated from worker threads
    let tally = Arc::new(Mutex::new(RunSummary::default()));
    let callback_bar = bar.clone();
    let callback_tally = Arc::clone(&tally);

    let engine = config
        .engine_builder()
        .on_progress(Arc::new(move |info: ProgressInfo| {
            let line = describe_outcome(&info.outcome, verbose);
            let message = {
                let mut tally = callback_tally.lock();
                tally.record(&info.outcome);
                format!(
                    "{} copied, {} unchanged, {} failed",
                    tally.copied, tally.unchanged, tally.failed
                )
            };
            match &callback_bar {
                Some(pb) => {
                    pb.set_length(info.total as u64);
                    pb.set_position(info.processed as u64);
                    pb.set_message(message);
                    if let Some(line) = line {
                        pb.println(line);
                    }
                }
                None => {
                    if let Some(line) = line {
                        println!("{}", line);
                    }
                }
            }
        }))
        .build(config.destination.clone())?;

    let outcome = engine.run()?;

    if let Some(pb) = bar {
        pb.finish_and_clear();
    }

    let summary = &outcome.summary;
    let status = if summary.failed == 0 {
        "✓".green().bold()
    } else {
        "⚠".yellow().bold()
    };
    println!(
        "{} Backup run {} complete",
        status,
        outcome.run.run_id.to_string().yellow().bold()
    );
    println!(
        "  Copied: {} ({})",
        summary.copied.to_string().green(),
        format_bytes(summary.bytes_copied)
    );
    println!("  Unchanged: {}", summary.unchanged.to_string().cyan());
    if summary.duplicates > 0 {
        println!("  Duplicates: {}", summary.duplicates.to_string().cyan());
    }
    if summary.failed > 0 {
        println!("  Failed: {}", summary.failed.to_string().red());
    }
    if outcome.cancelled {
        println!("  Cancelled: {}", summary.cancelled.to_string().yellow());
    }
    println!(
        "  Time: {}",
        format_duration(Duration::from_millis(outcome.duration_ms))
            .to_string()
            .cyan()
    );

    Ok(())
}

/// One output line for a decided file, if it is worth printing
fn describe_outcome(outcome: &FileOutcome, verbose: bool) -> Option<String> {
    match outcome {
        FileOutcome::Copied { source, .. } => {
            Some(format!("  {} {}", "+".green().bold(), source.display()))
        }
        FileOutcome::Failed { source, reason } => Some(format!(
            "  {} {}: {}",
            "✗".red().bold(),
            source.display(),
            reason.red()
        )),
        FileOutcome::Unchanged { source } if verbose => {
            Some(format!("  {} {}", "=".dimmed(), source.display().to_string().dimmed()))
        }
        FileOutcome::Duplicate { source } if verbose => Some(format!(
            "  {} {} (duplicate)",
            "=".dimmed(),
            source.display().to_string().dimmed()
        )),
        _ => None,
    }
}

/// Verify the latest backup of every source
fn cmd_verify(config: &BackupConfig) -> Result<()> {
    let catalog = open_catalog(config)?;
    let index = catalog.latest_index()?;
    if index.is_empty() {
        println!("{}", "No backups recorded yet.".yellow());
        return Ok(());
    }

    println!(
        "{} {} backups",
        "Verifying".blue().bold(),
        index.len()
    );
    let spinner = ProgressBar::new_spinner();
    spinner.enable_steady_tick(Duration::from_millis(100));
    let report = Verifier::new().verify(&index);
    spinner.finish_and_clear();

    for entry in report.entries.values() {
        if entry.hash_match {
            println!("  {} {}", "✓".green(), entry.record.source.display());
        } else {
            let reason = entry.error.as_deref().unwrap_or("content does not match");
            println!(
                "  {} {} ({})",
                "✗".red(),
                entry.record.source.display(),
                reason.red()
            );
        }
    }

    println!("\n{}", "Verification Report:".bold());
    println!(
        "  Verified: {}/{}",
        report.verified_count().to_string().green(),
        report.len()
    );
    if !report.is_valid() {
        println!(
            "  Failed: {}",
            (report.len() - report.verified_count()).to_string().red()
        );
    }
    println!("  Verification time: {}ms", report.verification_time_ms);

    Ok(())
}

/// Write and print the backup history
fn cmd_history(config: &BackupConfig, show_table: bool, limit: usize) -> Result<()> {
    let catalog = open_catalog(config)?;
    let runs = catalog.read_all()?;
    let report = HistoryReport::build(&runs);

    if report.is_empty() {
        println!("{}", "No backup information found.".yellow());
        return Ok(());
    }

    let path = catalog.root().join(REPORT_FILE);
    report.write(&path)?;

    println!("{}", "All Backups:".bold());
    print!("{}", report.render());
    println!(
        "{} Saved history of {} backups to {}",
        "✓".green().bold(),
        report.backup_count(),
        path.display().to_string().cyan()
    );

    if show_table {
        println!();
        print!("{}", report.table().render(limit));
    }

    Ok(())
}

/// Verify and write a restore script
fn cmd_restore_script(
    config: &BackupConfig,
    output: Option<PathBuf>,
    flavor: Option<ScriptFlavor>,
) -> Result<()> {
    let catalog = open_catalog(config)?;
    let index = catalog.latest_index()?;
    let report = Verifier::new().verify(&index);

    let flavor = flavor.unwrap_or_else(|| config.flavor());
    let path = output.unwrap_or_else(|| catalog.root().join(flavor.file_name()));
    let synthesizer = RestoreSynthesizer::new(config.restore_root()).with_flavor(flavor);
    let plan = synthesizer.write_script(&index, &report, &path)?;

    println!(
        "{} Wrote restore script {}",
        "✓".green().bold(),
        path.display().to_string().cyan()
    );
    println!(
        "  Restores into: {}",
        plan.destination_root.display().to_string().cyan()
    );
    println!("  Restorable: {}", plan.restorable_count().to_string().green());

    if plan.refused_count() > 0 {
        println!(
            "\n{} {} backups failed verification and will not be restored:",
            "⚠".yellow().bold(),
            plan.refused_count()
        );
        for step in &plan.steps {
            if let RestoreStep::Refused { source, reason, .. } = step {
                println!("  {} {} ({})", "✗".red(), source.display(), reason);
            }
        }
    }

    Ok(())
}
