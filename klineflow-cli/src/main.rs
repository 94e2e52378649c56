//! klineflow CLI — extract, load, and inspect the kline pipeline.
//!
//! Commands:
//! - `extract`: fetch new klines for the configured symbols into the bucket
//! - `load`: load untracked objects into the warehouse
//! - `cycle`: `extract` then `load`, as the scheduled job runs them
//! - `watermark`: show where each symbol's next extraction resumes
//! - `status`: per-symbol object, watermark, and load counts
//!
//! Ctrl-C during `extract`, `load` or `cycle` stops the run between writes
//! and between file loads; the interrupted run exits with status 1.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use klineflow_runner::{ExtractSummary, LoadReport, Pipeline, PipelineConfig};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "klineflow",
    about = "klineflow — incremental kline extraction and exactly-once warehouse loading"
)]
struct Cli {
    /// Pipeline configuration file (TOML).
    #[arg(long, short, global = true, default_value = "klineflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract new klines into object storage.
    Extract {
        /// Restrict to these configured symbols (repeatable).
        #[arg(long = "symbol")]
        symbols: Vec<String>,
    },
    /// Load untracked objects into the warehouse.
    Load {
        /// Write a per-file CSV report here.
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Extract, then load.
    Cycle {
        /// Restrict extraction to these configured symbols (repeatable).
        #[arg(long = "symbol")]
        symbols: Vec<String>,

        /// Write a per-file CSV load report here.
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Show the resume timestamp of each symbol.
    Watermark {
        /// Restrict to these configured symbols (repeatable).
        #[arg(long = "symbol")]
        symbols: Vec<String>,
    },
    /// Show per-symbol storage and load status.
    Status,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_file(&cli.config)
        .with_context(|| format!("failed to load config {}", cli.config.display()))?;
    let pipeline = Pipeline::from_config(&config)?;
    let cancel = install_cancel_handler()?;

    let ok = match cli.command {
        Commands::Extract { symbols } => run_extract(&pipeline, &symbols, &cancel)?,
        Commands::Load { report } => run_load(&pipeline, report.as_deref(), &cancel)?,
        Commands::Cycle { symbols, report } => {
            run_cycle(&pipeline, &symbols, report.as_deref(), &cancel)?
        }
        Commands::Watermark { symbols } => run_watermark(&pipeline, &symbols)?,
        Commands::Status => run_status(&pipeline)?,
    };

    if !ok || cancel.load(Ordering::Relaxed) {
        std::process::exit(1);
    }
    Ok(())
}

/// Raise the returned flag on Ctrl-C. Workers finish the write or load in
/// hand and stop before the next one.
fn install_cancel_handler() -> Result<Arc<AtomicBool>> {
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = cancel.clone();
    ctrlc::set_handler(move || {
        warn!("interrupt received, stopping after the current operation");
        flag.store(true, Ordering::Relaxed);
    })
    .context("failed to install Ctrl-C handler")?;
    Ok(cancel)
}

fn run_extract(pipeline: &Pipeline, symbols: &[String], cancel: &AtomicBool) -> Result<bool> {
    let summary = pipeline.extract(symbols, klineflow_core::now_ms(), Some(cancel))?;
    print_extract_summary(&summary);
    Ok(summary.all_succeeded())
}

fn run_load(
    pipeline: &Pipeline,
    report_path: Option<&Path>,
    cancel: &AtomicBool,
) -> Result<bool> {
    let report = pipeline.load(Some(cancel))?;
    print_load_report(&report);
    if let Some(path) = report_path {
        write_report(&report, path)?;
    }
    Ok(report.all_succeeded())
}

fn run_cycle(
    pipeline: &Pipeline,
    symbols: &[String],
    report_path: Option<&Path>,
    cancel: &AtomicBool,
) -> Result<bool> {
    let cycle = pipeline.run_cycle(symbols, klineflow_core::now_ms(), Some(cancel))?;
    print_extract_summary(&cycle.extract);
    print_load_report(&cycle.load);
    if let Some(path) = report_path {
        write_report(&cycle.load, path)?;
    }
    Ok(cycle.all_succeeded())
}

fn run_watermark(pipeline: &Pipeline, symbols: &[String]) -> Result<bool> {
    let symbols = pipeline.select_symbols(symbols)?;
    let extraction = pipeline.extraction_loop();

    println!("{:<14} {:>15}  {}", "Symbol", "Watermark (ms)", "UTC");
    println!("{}", "-".repeat(58));
    for symbol in &symbols {
        let watermark = extraction
            .resolve_watermark(symbol)
            .with_context(|| format!("failed to resolve watermark for {symbol}"))?;
        println!("{:<14} {:>15}  {}", symbol, watermark, format_ms(watermark));
    }
    Ok(true)
}

fn run_status(pipeline: &Pipeline) -> Result<bool> {
    let statuses = pipeline.status()?;

    println!("Bucket: {}", pipeline.config().storage.bucket);
    println!();
    println!(
        "{:<14} {:>8} {:>8}  {:<25} {}",
        "Symbol", "Objects", "Loaded", "Resumes at (UTC)", "Latest object"
    );
    println!("{}", "-".repeat(100));
    for s in &statuses {
        let loaded = s.loaded.map_or_else(|| "-".to_string(), |n| n.to_string());
        println!(
            "{:<14} {:>8} {:>8}  {:<25} {}",
            s.symbol,
            s.objects,
            loaded,
            format_ms(s.watermark_ms),
            s.latest.as_deref().unwrap_or("(none)")
        );
    }
    Ok(true)
}

fn print_extract_summary(summary: &ExtractSummary) {
    for r in &summary.reports {
        println!(
            "{:<14} written {:>4}  skipped {:>4}  stop {:?}",
            r.symbol,
            r.written.len(),
            r.skipped.len(),
            r.stop
        );
    }
    for (symbol, err) in &summary.errors {
        eprintln!("Extraction failed for {symbol}: {err}");
    }
    println!(
        "Extraction: {}/{} symbols succeeded, {} objects written",
        summary.succeeded(),
        summary.total,
        summary.written()
    );
}

fn print_load_report(report: &LoadReport) {
    for f in &report.failures {
        eprintln!("Load failed for {} ({}): {}", f.path, f.symbol, f.error);
    }
    for f in &report.normalization_failures {
        eprintln!("Normalization failed for {} ({}): {}", f.table, f.symbol, f.error);
    }
    println!(
        "Load: {} loaded, {} already loaded, {} failed, {} ignored{}",
        report.loaded.len(),
        report.skipped.len(),
        report.failures.len(),
        report.ignored.len(),
        if report.cancelled { " (cancelled)" } else { "" }
    );
}

fn write_report(report: &LoadReport, path: &Path) -> Result<()> {
    let csv = report.to_csv()?;
    std::fs::write(path, csv)
        .with_context(|| format!("failed to write load report {}", path.display()))?;
    info!(path = %path.display(), "load report written");
    Ok(())
}

fn format_ms(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| "(out of range)".to_string())
}
