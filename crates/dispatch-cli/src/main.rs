//! dispatch-etl - AEMO dispatch price pipeline

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dispatch_common::logging::{init_logging, LogConfig, LogLevel};
use chrono::NaiveDateTime;
use dispatch_core::{
    db, parser::parse_timestamp, BatchOptions, CurateOptions, IngestOptions, Pipeline, PipelineConfig,
    ReportKind, RunSummary, ZipCursor,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "dispatch-etl")]
#[command(author, version, about = "Idempotent AEMO dispatch price ingestion and warehouse load")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply pending database migrations
    Migrate,

    /// Download new dispatch zips into the inbox
    Ingest {
        /// Report directory under REPORTS/CURRENT
        #[arg(long)]
        report: Option<ReportKind>,

        /// Only files newer than this cursor (YYYYMMDDHHMM)
        #[arg(long, conflicts_with = "backfill_days")]
        since: Option<ZipCursor>,

        /// Only files from the last N days
        #[arg(long)]
        backfill_days: Option<u32>,

        /// Maximum number of downloads
        #[arg(long)]
        limit: Option<usize>,

        /// List what would be downloaded
        #[arg(long)]
        dry_run: bool,

        /// Leave the ingest watermark where it is
        #[arg(long)]
        no_update_watermark: bool,
    },

    /// Load inbox files into the warehouse
    Process {
        /// Inbox directory (defaults to RAW_DIR)
        #[arg(long)]
        raw_dir: Option<PathBuf>,

        /// Maximum number of inbox files to load
        #[arg(long)]
        max_files: Option<usize>,

        /// Delete processed and duplicate files afterwards
        #[arg(long)]
        cleanup: bool,

        /// Leave the batch watermark where it is
        #[arg(long)]
        no_update_watermark: bool,
    },

    /// Write the latest batch as partitioned Parquet
    Convert,

    /// Recompute all daily summaries and rolling metrics
    Rollups,

    /// Refresh the one-price-per-interval region table
    #[command(name = "curate-5min")]
    Curate5min {
        /// First settlement interval to curate (YYYY-MM-DD HH:MM:SS)
        #[arg(long, value_parser = parse_settlement)]
        since: Option<NaiveDateTime>,
    },

    /// Inspect the run ledger
    Runs {
        #[command(subcommand)]
        command: RunsCommand,
    },
}

#[derive(Subcommand, Debug)]
enum RunsCommand {
    /// List runs still running past STALE_RUN_AFTER_SECS
    Stale {
        /// Mark them failed
        #[arg(long)]
        close: bool,
    },
}

fn parse_settlement(value: &str) -> Result<NaiveDateTime, String> {
    parse_timestamp(value).ok_or_else(|| format!("'{}' is not a settlement time", value))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Non-zero exit when any file failed, so schedulers notice partial runs
fn report(summary: &RunSummary) -> Result<ExitCode> {
    print_json(summary)?;
    Ok(if summary.counters.files_failed > 0 {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    })
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env().context("Invalid logging configuration")?;
    if cli.verbose {
        log_config.level = LogLevel::Debug;
    }
    let _guard = init_logging(&log_config)?;

    let mut config = PipelineConfig::from_env().context("Failed to load configuration")?;
    if let Command::Process {
        raw_dir: Some(dir), ..
    } = &cli.command
    {
        config.paths.raw_dir = dir.clone();
    }

    let pipeline = Pipeline::connect(config)
        .await
        .context("Failed to connect to the warehouse")?;

    let code = match cli.command {
        Command::Migrate => {
            db::health_check(pipeline.pool())
                .await
                .context("Warehouse is not reachable")?;
            db::run_migrations(pipeline.pool())
                .await
                .context("Failed to run migrations")?;
            info!("Migrations applied");
            ExitCode::SUCCESS
        }
        Command::Ingest {
            report: report_kind,
            since,
            backfill_days,
            limit,
            dry_run,
            no_update_watermark,
        } => {
            let summary = pipeline
                .ingest(IngestOptions {
                    report: report_kind,
                    since,
                    backfill_days,
                    limit,
                    dry_run,
                    update_watermark: !no_update_watermark,
                })
                .await
                .context("Ingest failed")?;
            report(&summary)?
        }
        Command::Process {
            max_files,
            cleanup,
            no_update_watermark,
            ..
        } => {
            let summary = pipeline
                .process_batch(BatchOptions {
                    max_files,
                    cleanup,
                    update_watermark: !no_update_watermark,
                })
                .await
                .context("Batch load failed")?;
            report(&summary)?
        }
        Command::Convert => {
            let summary = pipeline
                .convert_to_columnar()
                .await
                .context("Columnar conversion failed")?;
            report(&summary)?
        }
        Command::Rollups => {
            let summary = pipeline
                .build_rollups()
                .await
                .context("Rollup rebuild failed")?;
            report(&summary)?
        }
        Command::Curate5min { since } => {
            let summary = pipeline
                .curate_5min(CurateOptions { since })
                .await
                .context("Interval curation failed")?;
            report(&summary)?
        }
        Command::Runs {
            command: RunsCommand::Stale { close },
        } => {
            if close {
                let closed = pipeline.close_stale_runs().await?;
                info!(count = closed.len(), "Stale runs closed");
                print_json(&closed)?;
            } else {
                print_json(&pipeline.stale_runs().await?)?;
            }
            ExitCode::SUCCESS
        }
    };

    Ok(code)
}
