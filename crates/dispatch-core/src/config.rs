//! Configuration management

use crate::db::DbConfig;
use crate::nemweb::ReportKind;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

// ============================================================================
// Pipeline Configuration Constants
// ============================================================================

/// NEMweb "current" reports root.
pub const DEFAULT_NEMWEB_BASE_URL: &str = "https://www.nemweb.com.au/REPORTS/CURRENT/";

/// HTTP request timeout in seconds.
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;

/// User agent sent to NEMweb.
pub const DEFAULT_USER_AGENT: &str = "energy-intel-pipeline/1.0";

/// Maximum number of zips downloaded per ingest run.
pub const DEFAULT_INGEST_LIMIT: usize = 50;

/// Maximum number of inbox files loaded per batch run.
pub const DEFAULT_MAX_FILES: usize = 50;

/// Download inbox.
pub const DEFAULT_RAW_DIR: &str = "data/raw/dispatch_inbox";

/// Clean CSV artifacts written by batch runs.
pub const DEFAULT_CLEAN_DIR: &str = "data/clean/dispatch_price";

/// Hive-partitioned Parquet output.
pub const DEFAULT_CURATED_DIR: &str = "data/curated/dispatch_price_parquet";

/// Trailing window of the rolling average, in days.
pub const DEFAULT_ROLLING_WINDOW_DAYS: u32 = 7;

/// Longest accepted rolling window.
pub const MAX_ROLLING_WINDOW_DAYS: u32 = 366;

/// Runs still `running` after this many seconds are reported as stale (6 hours).
pub const DEFAULT_STALE_RUN_AFTER_SECS: u64 = 6 * 60 * 60;

/// Parsed value of `key`; unset or unparsable values fall back to the default
fn env_parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|s| s.trim().parse().ok())
}

/// Upstream feed settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub report: ReportKind,
    pub base_url: String,
    pub http_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            report: ReportKind::DispatchIs,
            base_url: DEFAULT_NEMWEB_BASE_URL.to_string(),
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

/// Filesystem locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    pub raw_dir: PathBuf,
    pub clean_dir: PathBuf,
    pub curated_dir: PathBuf,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            raw_dir: PathBuf::from(DEFAULT_RAW_DIR),
            clean_dir: PathBuf::from(DEFAULT_CLEAN_DIR),
            curated_dir: PathBuf::from(DEFAULT_CURATED_DIR),
        }
    }
}

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub database: DbConfig,
    pub source: SourceConfig,
    pub paths: PathConfig,
    pub ingest_limit: usize,
    pub max_files: usize,
    pub rolling_window_days: u32,
    pub stale_run_after_secs: u64,
}

impl PipelineConfig {
    /// Defaults for everything except the database URL
    pub fn with_database_url(url: impl Into<String>) -> Self {
        Self {
            database: DbConfig {
                url: url.into(),
                ..DbConfig::default()
            },
            source: SourceConfig::default(),
            paths: PathConfig::default(),
            ingest_limit: DEFAULT_INGEST_LIMIT,
            max_files: DEFAULT_MAX_FILES,
            rolling_window_days: DEFAULT_ROLLING_WINDOW_DAYS,
            stale_run_after_secs: DEFAULT_STALE_RUN_AFTER_SECS,
        }
    }

    /// Load configuration from `.env` and the process environment
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let url = lookup("DATABASE_URL")
            .ok_or_else(|| anyhow::anyhow!("DATABASE_URL not set"))?;
        let mut config = Self::with_database_url(url);

        if let Some(v) = env_parse(&lookup, "DB_MAX_CONNECTIONS") {
            config.database.max_connections = v;
        }
        if let Some(v) = env_parse(&lookup, "DB_MIN_CONNECTIONS") {
            config.database.min_connections = v;
        }
        if let Some(v) = env_parse(&lookup, "DB_CONNECT_TIMEOUT") {
            config.database.connect_timeout_secs = v;
        }

        if let Some(report) = lookup("AEMO_REPORT") {
            config.source.report = report.parse()?;
        }
        if let Some(url) = lookup("NEMWEB_BASE_URL") {
            config.source.base_url = url;
        }
        config.source.http_timeout_secs =
            env_parse(&lookup, "HTTP_TIMEOUT_SECS").unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS);

        config.ingest_limit = env_parse(&lookup, "INGEST_LIMIT").unwrap_or(DEFAULT_INGEST_LIMIT);
        config.max_files = env_parse(&lookup, "MAX_FILES").unwrap_or(DEFAULT_MAX_FILES);
        config.rolling_window_days =
            env_parse(&lookup, "ROLLING_WINDOW_DAYS").unwrap_or(DEFAULT_ROLLING_WINDOW_DAYS);
        config.stale_run_after_secs =
            env_parse(&lookup, "STALE_RUN_AFTER_SECS").unwrap_or(DEFAULT_STALE_RUN_AFTER_SECS);

        if let Some(dir) = lookup("RAW_DIR") {
            config.paths.raw_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("CLEAN_DIR") {
            config.paths.clean_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("CURATED_DIR") {
            config.paths.curated_dir = PathBuf::from(dir);
        }

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "Database min_connections ({}) cannot exceed max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        if self.source.base_url.is_empty() {
            anyhow::bail!("NEMweb base URL cannot be empty");
        }

        if self.ingest_limit == 0 || self.max_files == 0 {
            anyhow::bail!("INGEST_LIMIT and MAX_FILES must be greater than 0");
        }

        if self.rolling_window_days == 0 || self.rolling_window_days > MAX_ROLLING_WINDOW_DAYS {
            anyhow::bail!(
                "ROLLING_WINDOW_DAYS must be between 1 and {}",
                MAX_ROLLING_WINDOW_DAYS
            );
        }

        Ok(())
    }
}
