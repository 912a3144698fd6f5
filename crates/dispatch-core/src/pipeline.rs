//! Pipeline entry points
//!
//! Each entry point opens a run in the ledger, does its work and closes the run with the
//! counters it reached. Per-file problems are counted and the run carries on; a fatal error
//! rolls back the in-flight transaction, closes the run as `failed` and is returned.
//!
//! Watermarks only move after the work they cover has committed, and never past a file that
//! failed in the same run.

use crate::aggregator;
use crate::archive::{extract_csv_members, validate_zip};
use crate::columnar::{
    clean_csv_name, partition_rows, read_clean_csv, write_clean_csv, write_daily_rollup, write_partition,
    DAILY_ROLLUP_FILE,
};
use crate::config::PipelineConfig;
use crate::curated::{self, CURATED_5MIN_TABLE};
use crate::db;
use crate::error::Result;
use crate::ledger::{self, PipelineRun};
use crate::lineage;
use crate::loader::{self, dedupe_last_wins, LoadOutcome};
use crate::nemweb::{cursor_from_filename, effective_gate, pick_candidates, DispatchSource, NemwebClient, RemoteFile, ReportKind};
use crate::parser::{parse_mms, ParsedPrices, PriceRow};
use crate::registry::{self, Admission};
use crate::types::{command, ArtifactType, NodeRef, RunCounters, RunStatus, RunSummary, SourceType};
use crate::watermark::{self, next_watermark, ZipCursor, INGEST_WATERMARK, PROCESS_WATERMARK};
use chrono::{NaiveDateTime, Utc};
use dispatch_common::checksum::{sha256_bytes, verify_sha256};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{Acquire, PgConnection, PgPool};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Database artifact standing for the rollup tables
pub const ROLLUP_TABLE: &str = "public.daily_region_summary";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestOptions {
    /// Report directory; the configured one when `None`
    pub report: Option<ReportKind>,
    /// Explicit lower bound, overrides backfill and watermark
    pub since: Option<ZipCursor>,
    /// Look back this many days from now, overrides the watermark
    pub backfill_days: Option<u32>,
    /// Maximum downloads; the configured limit when `None`
    pub limit: Option<usize>,
    pub dry_run: bool,
    pub update_watermark: bool,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            report: None,
            since: None,
            backfill_days: None,
            limit: None,
            dry_run: false,
            update_watermark: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchOptions {
    /// Maximum inbox files loaded; the configured cap when `None`
    pub max_files: Option<usize>,
    /// Delete processed and duplicate inbox files afterwards
    pub cleanup: bool,
    pub update_watermark: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_files: None,
            cleanup: false,
            update_watermark: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CurateOptions {
    /// First settlement interval to curate; everything when `None`
    pub since: Option<NaiveDateTime>,
}

enum Download {
    Saved,
    OnDisk,
    AlreadyRegistered,
    DryRun,
}

enum FileLoad {
    Loaded {
        raw_object_id: Uuid,
        parsed: ParsedPrices,
        outcome: LoadOutcome,
    },
    Duplicate {
        raw_object_id: Uuid,
        /// Rows of a duplicate whose earlier load never reached a clean artifact
        unrecorded: Option<ParsedPrices>,
    },
}

/// Inbox files split into loose CSVs and zips, each sorted by name
pub fn list_inbox(dir: &Path) -> Result<(Vec<PathBuf>, Vec<PathBuf>)> {
    let mut csvs = Vec::new();
    let mut zips = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        match SourceType::from_path(&path) {
            Some(SourceType::Csv) => csvs.push(path),
            Some(SourceType::Zip) => zips.push(path),
            None => {}
        }
    }

    csvs.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    zips.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok((csvs, zips))
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn earliest(current: Option<ZipCursor>, failed: Option<ZipCursor>) -> Option<ZipCursor> {
    match (current, failed) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Parse a loose CSV or every CSV member of a zip
fn parse_file(source_type: SourceType, label: &str, bytes: &[u8]) -> Result<ParsedPrices> {
    match source_type {
        SourceType::Csv => parse_mms(bytes),
        SourceType::Zip => {
            validate_zip(label, bytes)?;
            let mut parsed = ParsedPrices::default();
            for member in extract_csv_members(label, bytes)? {
                parsed.extend(parse_mms(member.contents.as_slice())?);
            }
            Ok(parsed)
        }
    }
}

pub struct Pipeline {
    pool: PgPool,
    config: PipelineConfig,
    source: Arc<dyn DispatchSource>,
}

impl Pipeline {
    pub fn new(pool: PgPool, config: PipelineConfig, source: Arc<dyn DispatchSource>) -> Self {
        Self {
            pool,
            config,
            source,
        }
    }

    /// Pool and NEMweb client built from configuration
    pub async fn connect(config: PipelineConfig) -> Result<Self> {
        let pool = db::create_pool(&config.database).await?;
        let source = Arc::new(NemwebClient::new(&config.source)?);
        Ok(Self::new(pool, config, source))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    async fn finish(
        &self,
        conn: &mut PgConnection,
        run_id: Uuid,
        command: &str,
        counters: RunCounters,
        outcome: Result<Option<String>>,
    ) -> Result<RunSummary> {
        match outcome {
            Ok(watermark) => {
                ledger::close(&mut *conn, run_id, RunStatus::Success, &counters, None).await?;
                info!(
                    %run_id,
                    command,
                    files = counters.total_files,
                    processed = counters.files_processed,
                    duplicate = counters.files_duplicate,
                    skipped = counters.files_skipped,
                    failed = counters.files_failed,
                    inserted = counters.total_inserted,
                    updated = counters.total_updated,
                    invalid = counters.total_invalid,
                    "Run succeeded"
                );
                Ok(RunSummary {
                    run_id,
                    command: command.to_string(),
                    status: RunStatus::Success,
                    counters,
                    watermark,
                })
            }
            Err(e) => {
                error!(%run_id, command, error = %e, "Run failed");
                let message = e.to_string();
                if let Err(close_err) =
                    ledger::close(&mut *conn, run_id, RunStatus::Failed, &counters, Some(&message)).await
                {
                    warn!(%run_id, error = %close_err, "Could not close failed run; it stays running until reconciled");
                }
                Err(e)
            }
        }
    }

    /// Download new zips of a report into the inbox
    #[instrument(skip(self), fields(run_id))]
    pub async fn ingest(&self, opts: IngestOptions) -> Result<RunSummary> {
        let mut conn = self.pool.acquire().await?;
        let params = json!({
            "options": &opts,
            "raw_dir": self.config.paths.raw_dir.display().to_string(),
        });
        let run_id = ledger::open(&mut conn, command::INGEST, &params).await?;
        tracing::Span::current().record("run_id", tracing::field::display(run_id));

        let mut counters = RunCounters::default();
        let outcome = self.run_ingest(&mut conn, &opts, &mut counters).await;
        self.finish(&mut conn, run_id, command::INGEST, counters, outcome).await
    }

    async fn run_ingest(
        &self,
        conn: &mut PgConnection,
        opts: &IngestOptions,
        counters: &mut RunCounters,
    ) -> Result<Option<String>> {
        let report = opts.report.unwrap_or(self.config.source.report);
        let limit = opts.limit.unwrap_or(self.config.ingest_limit);
        let inbox = &self.config.paths.raw_dir;
        tokio::fs::create_dir_all(inbox).await?;

        let current = watermark::read_cursor(&mut *conn, INGEST_WATERMARK).await?;
        let gate = effective_gate(opts.since, opts.backfill_days, current, Utc::now())?;
        info!(
            report = %report,
            watermark = ?current.map(|c| c.to_string()),
            gate = ?gate.map(|c| c.to_string()),
            limit,
            "Discovering new files"
        );

        let candidates = pick_candidates(self.source.list(report).await?, gate, limit);
        counters.total_files = candidates.len() as i64;
        info!(count = candidates.len(), "Files to download this run");

        let mut completed = Vec::new();
        let mut earliest_failure = None;

        for file in &candidates {
            match self.download(&mut *conn, file, inbox, opts.dry_run).await {
                Ok(Download::Saved) => {
                    counters.files_processed += 1;
                    completed.push(file.cursor);
                }
                Ok(Download::OnDisk) => {
                    counters.files_skipped += 1;
                    completed.push(file.cursor);
                }
                Ok(Download::AlreadyRegistered) => {
                    counters.files_duplicate += 1;
                    completed.push(file.cursor);
                }
                Ok(Download::DryRun) => counters.files_skipped += 1,
                Err(e) if !e.is_fatal() => {
                    warn!(file = %file.name, error = %e, "Download failed");
                    counters.files_failed += 1;
                    earliest_failure = earliest(earliest_failure, Some(file.cursor));
                }
                Err(e) => return Err(e),
            }
        }

        if opts.dry_run || !opts.update_watermark {
            info!(dry_run = opts.dry_run, "Watermark left unchanged");
            return Ok(current.map(|c| c.to_string()));
        }

        match next_watermark(current, &completed, earliest_failure) {
            Some(next) => {
                watermark::advance(&mut *conn, INGEST_WATERMARK, next).await?;
                Ok(Some(next.to_string()))
            }
            None => Ok(current.map(|c| c.to_string())),
        }
    }

    async fn download(
        &self,
        conn: &mut PgConnection,
        file: &RemoteFile,
        inbox: &Path,
        dry_run: bool,
    ) -> Result<Download> {
        let final_path = inbox.join(&file.name);
        if tokio::fs::try_exists(&final_path).await? {
            debug!(file = %file.name, "Already on disk");
            return Ok(Download::OnDisk);
        }

        if dry_run {
            info!(url = %file.url, path = %final_path.display(), "Dry run, would download");
            return Ok(Download::DryRun);
        }

        let bytes = self.source.fetch(file).await?;
        validate_zip(&file.name, &bytes)?;

        let digest = sha256_bytes(&bytes);
        if registry::is_registered(&mut *conn, SourceType::Zip, &digest.hex).await? {
            info!(file = %file.name, sha256 = %digest.hex, "Content already registered, not saved");
            return Ok(Download::AlreadyRegistered);
        }

        let tmp_path = inbox.join(format!("{}.tmp", file.name));
        tokio::fs::write(&tmp_path, &bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp_path, &final_path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }

        info!(file = %file.name, bytes = bytes.len(), sha256 = %digest.hex, "Saved");
        Ok(Download::Saved)
    }

    /// Load inbox files into the warehouse
    #[instrument(skip(self), fields(run_id))]
    pub async fn process_batch(&self, opts: BatchOptions) -> Result<RunSummary> {
        let mut conn = self.pool.acquire().await?;
        let params = json!({
            "options": &opts,
            "raw_dir": self.config.paths.raw_dir.display().to_string(),
        });
        let run_id = ledger::open(&mut conn, command::PROCESS_BATCH, &params).await?;
        tracing::Span::current().record("run_id", tracing::field::display(run_id));

        let mut counters = RunCounters::default();
        let outcome = self.run_batch(&mut conn, run_id, &opts, &mut counters).await;
        self.finish(&mut conn, run_id, command::PROCESS_BATCH, counters, outcome).await
    }

    async fn run_batch(
        &self,
        conn: &mut PgConnection,
        run_id: Uuid,
        opts: &BatchOptions,
        counters: &mut RunCounters,
    ) -> Result<Option<String>> {
        let max_files = opts.max_files.unwrap_or(self.config.max_files);
        let inbox = &self.config.paths.raw_dir;
        tokio::fs::create_dir_all(inbox).await?;

        let (csv_files, zip_files) = list_inbox(inbox)?;
        let pattern = self.config.source.report.pattern()?;
        let current = watermark::read_cursor(&mut *conn, PROCESS_WATERMARK).await?;
        info!(
            raw_dir = %inbox.display(),
            csv_files = csv_files.len(),
            zip_files = zip_files.len(),
            max_files,
            watermark = ?current.map(|c| c.to_string()),
            "Processing inbox"
        );

        let mut batch_rows: Vec<PriceRow> = Vec::new();
        let mut sources: Vec<Uuid> = Vec::new();
        let mut handled_paths: Vec<PathBuf> = Vec::new();
        let mut completed = Vec::new();
        let mut earliest_failure = None;
        let mut attempted = 0usize;

        for path in csv_files.iter().chain(zip_files.iter()) {
            if attempted >= max_files {
                info!(max_files, "Reached max files cap, stopping early");
                break;
            }

            let label = file_label(path);
            let Some(source_type) = SourceType::from_path(path) else {
                continue;
            };
            let cursor = match source_type {
                SourceType::Zip => cursor_from_filename(&pattern, &label),
                SourceType::Csv => None,
            };
            counters.total_files += 1;

            if let (Some(c), Some(wm)) = (cursor, current) {
                if c <= wm {
                    debug!(file = %label, "At or behind watermark, skipped");
                    counters.files_skipped += 1;
                    continue;
                }
            }
            attempted += 1;

            match self.load_file(&mut *conn, run_id, source_type, path, &label).await {
                Ok(FileLoad::Loaded {
                    raw_object_id,
                    parsed,
                    outcome,
                }) => {
                    let distinct = outcome.stats.total();
                    info!(
                        file = %label,
                        rows = distinct,
                        collapsed = parsed.rows.len() as i64 - distinct,
                        invalid = parsed.invalid_count(),
                        inserted = outcome.stats.inserted,
                        updated = outcome.stats.updated,
                        unchanged = outcome.stats.unchanged,
                        "Loaded"
                    );
                    counters.files_processed += 1;
                    counters.total_rows += distinct;
                    counters.total_invalid += parsed.invalid_count() as i64;
                    counters.add_upsert(outcome.stats);
                    batch_rows.extend(parsed.rows);
                    sources.push(raw_object_id);
                    handled_paths.push(path.clone());
                    completed.extend(cursor);
                }
                Ok(FileLoad::Duplicate {
                    raw_object_id,
                    unrecorded,
                }) => {
                    counters.files_duplicate += 1;
                    match unrecorded {
                        Some(parsed) if !sources.contains(&raw_object_id) => {
                            info!(
                                file = %label,
                                %raw_object_id,
                                "Loaded earlier without a clean artifact, adding it to this batch"
                            );
                            batch_rows.extend(parsed.rows);
                            sources.push(raw_object_id);
                        }
                        _ => info!(file = %label, %raw_object_id, "Duplicate content, skipped"),
                    }
                    handled_paths.push(path.clone());
                    completed.extend(cursor);
                }
                Err(e) if !e.is_fatal() => {
                    warn!(file = %label, error = %e, "File failed");
                    counters.files_failed += 1;
                    earliest_failure = earliest(earliest_failure, cursor);
                }
                Err(e) => return Err(e),
            }
        }

        if !sources.is_empty() {
            counters.artifacts_written += self.record_batch_artifacts(&mut *conn, run_id, &batch_rows, &sources).await?;
        }

        if opts.cleanup {
            for path in &handled_paths {
                if let Err(e) = tokio::fs::remove_file(path).await {
                    warn!(path = %path.display(), error = %e, "Could not remove inbox file");
                }
            }
            info!(removed = handled_paths.len(), "Cleanup complete");
        }

        if !opts.update_watermark {
            return Ok(current.map(|c| c.to_string()));
        }

        match next_watermark(current, &completed, earliest_failure) {
            Some(next) => {
                watermark::advance(&mut *conn, PROCESS_WATERMARK, next).await?;
                Ok(Some(next.to_string()))
            }
            None => Ok(current.map(|c| c.to_string())),
        }
    }

    /// Admit, load and summarise one file in a single transaction
    async fn load_file(
        &self,
        conn: &mut PgConnection,
        run_id: Uuid,
        source_type: SourceType,
        path: &Path,
        label: &str,
    ) -> Result<FileLoad> {
        let bytes = tokio::fs::read(path).await?;
        let digest = sha256_bytes(&bytes);
        let parsed = parse_file(source_type, label, &bytes)?;

        let mut tx = conn.begin().await?;

        let raw_object_id = match registry::admit_digest(&mut tx, run_id, source_type, path, &digest).await? {
            Admission::Registered(id) => id,
            Admission::Duplicate(existing) => {
                tx.rollback().await?;
                let derived = lineage::has_derivations(&mut *conn, NodeRef::RawObject(existing)).await?;
                return Ok(FileLoad::Duplicate {
                    raw_object_id: existing,
                    unrecorded: (!derived).then_some(parsed),
                });
            }
        };

        let outcome = loader::load_rows(&mut tx, &parsed.rows).await?;
        let keys = aggregator::recompute_touched(&mut tx, &outcome.touched, self.config.rolling_window_days).await?;
        tx.commit().await?;

        debug!(file = %label, summaries = keys, "Committed");
        Ok(FileLoad::Loaded {
            raw_object_id,
            parsed,
            outcome,
        })
    }

    /// Clean CSV and rollup artifacts of a batch run with their lineage. Returns the number of
    /// artifacts registered.
    async fn record_batch_artifacts(
        &self,
        conn: &mut PgConnection,
        run_id: Uuid,
        rows: &[PriceRow],
        sources: &[Uuid],
    ) -> Result<i64> {
        let clean_path = self.config.paths.clean_dir.join(clean_csv_name(run_id));
        write_clean_csv(&clean_path, &dedupe_last_wins(rows))?;

        let mut tx = conn.begin().await?;

        let clean = lineage::register_artifact(&mut tx, run_id, ArtifactType::CleanCsv, &clean_path).await?;
        for raw_object_id in sources {
            lineage::record(&mut tx, run_id, NodeRef::RawObject(*raw_object_id), clean.id).await?;
        }

        let rollup = lineage::register_db_artifact(&mut tx, run_id, ArtifactType::Rollup, ROLLUP_TABLE).await?;
        lineage::record(&mut tx, run_id, clean.node(), rollup.id).await?;

        tx.commit().await?;

        info!(path = %clean_path.display(), sources = sources.len(), "Batch artifacts recorded");
        Ok(2)
    }

    /// Write the latest successful batch run as hive-partitioned Parquet
    #[instrument(skip(self), fields(run_id))]
    pub async fn convert_to_columnar(&self) -> Result<RunSummary> {
        let mut conn = self.pool.acquire().await?;
        let params = json!({ "curated_dir": self.config.paths.curated_dir.display().to_string() });
        let run_id = ledger::open(&mut conn, command::CONVERT_TO_COLUMNAR, &params).await?;
        tracing::Span::current().record("run_id", tracing::field::display(run_id));

        let mut counters = RunCounters::default();
        let outcome = self.run_convert(&mut conn, run_id, &mut counters).await;
        self.finish(&mut conn, run_id, command::CONVERT_TO_COLUMNAR, counters, outcome).await
    }

    async fn run_convert(
        &self,
        conn: &mut PgConnection,
        run_id: Uuid,
        counters: &mut RunCounters,
    ) -> Result<Option<String>> {
        let Some(batch) = ledger::latest_successful(&mut *conn, command::PROCESS_BATCH).await? else {
            info!("No successful batch run to convert");
            return Ok(None);
        };

        let cleans = lineage::artifacts_for_run(&mut *conn, batch.id, Some(ArtifactType::CleanCsv)).await?;
        counters.total_files = cleans.len() as i64;

        let mut rows = Vec::new();
        for artifact in &cleans {
            if let Some(expected) = &artifact.content_hash {
                verify_sha256(&artifact.path, expected)?;
            }
            rows.extend(read_clean_csv(Path::new(&artifact.path))?);
            counters.files_processed += 1;
        }

        // Part files are named after the batch run so a repeated conversion overwrites them
        let partitions = partition_rows(&rows);
        counters.total_rows = partitions.values().map(|p| p.len() as i64).sum();
        let mut written = Vec::with_capacity(partitions.len());
        for ((region_id, date), part_rows) in &partitions {
            written.push(write_partition(&self.config.paths.curated_dir, region_id, *date, batch.id, part_rows)?);
        }

        let mut tx = conn.begin().await?;
        for path in &written {
            let partition = lineage::register_artifact(&mut tx, run_id, ArtifactType::Partition, path).await?;
            for clean in &cleans {
                lineage::record(&mut tx, run_id, clean.node(), partition.id).await?;
            }
            counters.artifacts_written += 1;
        }
        tx.commit().await?;

        info!(
            batch_run_id = %batch.id,
            partitions = written.len(),
            rows = rows.len(),
            "Columnar output written"
        );
        Ok(None)
    }

    /// Recompute every daily summary and rolling metric from the facts
    #[instrument(skip(self), fields(run_id))]
    pub async fn build_rollups(&self) -> Result<RunSummary> {
        let mut conn = self.pool.acquire().await?;
        let params = json!({ "window_days": self.config.rolling_window_days });
        let run_id = ledger::open(&mut conn, command::BUILD_ROLLUPS, &params).await?;
        tracing::Span::current().record("run_id", tracing::field::display(run_id));

        let mut counters = RunCounters::default();
        let outcome = self.run_rollups(&mut conn, run_id, &mut counters).await;
        self.finish(&mut conn, run_id, command::BUILD_ROLLUPS, counters, outcome).await
    }

    async fn run_rollups(
        &self,
        conn: &mut PgConnection,
        run_id: Uuid,
        counters: &mut RunCounters,
    ) -> Result<Option<String>> {
        let partitions = match ledger::latest_successful(&mut *conn, command::CONVERT_TO_COLUMNAR).await? {
            Some(convert) => lineage::artifacts_for_run(&mut *conn, convert.id, Some(ArtifactType::Partition)).await?,
            None => Vec::new(),
        };

        let mut tx = conn.begin().await?;

        let keys = aggregator::rebuild_all(&mut tx, self.config.rolling_window_days).await?;
        counters.total_rows = keys as i64;

        let rollup = lineage::register_db_artifact(&mut tx, run_id, ArtifactType::Rollup, ROLLUP_TABLE).await?;
        for partition in &partitions {
            lineage::record(&mut tx, run_id, partition.node(), rollup.id).await?;
        }

        let export_path = self.config.paths.curated_dir.join(DAILY_ROLLUP_FILE);
        let export_rows = curated::daily_rollup_rows(&mut tx).await?;
        write_daily_rollup(&export_path, &export_rows)?;
        let export = lineage::register_artifact(&mut tx, run_id, ArtifactType::DailyRollup, &export_path).await?;
        lineage::record(&mut tx, run_id, rollup.node(), export.id).await?;
        counters.artifacts_written = 2;

        tx.commit().await?;

        info!(
            keys,
            sources = partitions.len(),
            export = %export_path.display(),
            "Rollups rebuilt"
        );
        Ok(None)
    }

    /// Refresh the one-price-per-interval table from the landed prices
    #[instrument(skip(self), fields(run_id))]
    pub async fn curate_5min(&self, opts: CurateOptions) -> Result<RunSummary> {
        let mut conn = self.pool.acquire().await?;
        let params = json!({ "options": &opts });
        let run_id = ledger::open(&mut conn, command::CURATE_5MIN, &params).await?;
        tracing::Span::current().record("run_id", tracing::field::display(run_id));

        let mut counters = RunCounters::default();
        let outcome = self.run_curate(&mut conn, run_id, &opts, &mut counters).await;
        self.finish(&mut conn, run_id, command::CURATE_5MIN, counters, outcome).await
    }

    async fn run_curate(
        &self,
        conn: &mut PgConnection,
        run_id: Uuid,
        opts: &CurateOptions,
        counters: &mut RunCounters,
    ) -> Result<Option<String>> {
        let cleans = match ledger::latest_successful(&mut *conn, command::PROCESS_BATCH).await? {
            Some(batch) => lineage::artifacts_for_run(&mut *conn, batch.id, Some(ArtifactType::CleanCsv)).await?,
            None => Vec::new(),
        };

        let mut tx = conn.begin().await?;

        let stats = curated::upsert_5min(&mut tx, opts.since).await?;
        counters.add_upsert(stats);
        counters.total_rows = stats.total();

        let table = lineage::register_db_artifact(&mut tx, run_id, ArtifactType::CuratedTable, CURATED_5MIN_TABLE).await?;
        for clean in &cleans {
            lineage::record(&mut tx, run_id, clean.node(), table.id).await?;
        }
        counters.artifacts_written = 1;

        let curated_rows = curated::count_since(&mut tx, opts.since).await?;
        tx.commit().await?;

        info!(
            since = ?opts.since,
            inserted = stats.inserted,
            updated = stats.updated,
            unchanged = stats.unchanged,
            curated_rows,
            "Interval prices curated"
        );
        Ok(None)
    }

    fn stale_after(&self) -> Duration {
        Duration::from_secs(self.config.stale_run_after_secs)
    }

    /// Runs still `running` past the configured threshold
    pub async fn stale_runs(&self) -> Result<Vec<PipelineRun>> {
        let mut conn = self.pool.acquire().await?;
        let runs = ledger::stale_runs(&mut conn, self.stale_after()).await?;
        for run in &runs {
            warn!(run_id = %run.id, command = %run.command, started_at = %run.started_at, "Stale run");
        }
        Ok(runs)
    }

    /// Mark stale runs `failed`. Returns their ids.
    pub async fn close_stale_runs(&self) -> Result<Vec<Uuid>> {
        let mut conn = self.pool.acquire().await?;
        ledger::close_stale(&mut conn, self.stale_after()).await
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cursor(s: &str) -> ZipCursor {
        ZipCursor::parse(s).unwrap()
    }

    #[test]
    fn test_list_inbox_splits_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.csv", "A.CSV", "z.zip", "y.ZIP", "partial.zip.tmp", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        std::fs::create_dir(dir.path().join("nested.csv")).unwrap();

        let (csvs, zips) = list_inbox(dir.path()).unwrap();
        let names = |v: &[PathBuf]| v.iter().map(|p| file_label(p)).collect::<Vec<_>>();
        assert_eq!(names(&csvs), ["A.CSV", "b.csv"]);
        assert_eq!(names(&zips), ["y.ZIP", "z.zip"]);
    }

    #[test]
    fn test_earliest_failure_tracking() {
        let a = cursor("202602052110");
        let b = cursor("202602052105");
        assert_eq!(earliest(None, None), None);
        assert_eq!(earliest(None, Some(a)), Some(a));
        assert_eq!(earliest(Some(a), Some(b)), Some(b));
        assert_eq!(earliest(Some(b), None), Some(b));
    }

    #[test]
    fn test_parse_file_rejects_corrupt_zip_without_fatality() {
        let err = parse_file(SourceType::Zip, "bad.zip", b"not a zip").unwrap_err();
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_default_options_update_watermark() {
        assert!(IngestOptions::default().update_watermark);
        assert!(!IngestOptions::default().dry_run);
        let batch = BatchOptions::default();
        assert!(batch.update_watermark && !batch.cleanup);
    }

    #[test]
    fn test_options_serialize_into_run_parameters() {
        let opts = IngestOptions {
            since: Some(cursor("202602050000")),
            ..IngestOptions::default()
        };
        let value = serde_json::to_value(&opts).unwrap();
        assert_eq!(value["dry_run"], false);
        assert!(value["since"].is_string());
    }
}
