//! NEMweb report directory client
//!
//! The feed is a plain HTTP directory listing per report. Zip names embed the dispatch
//! interval as `YYYYMMDDHHMM`, which is the cursor the ingest watermark tracks.

use crate::config::SourceConfig;
use crate::error::{PipelineError, Result};
use crate::watermark::ZipCursor;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use regex::{Regex, RegexBuilder};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Reports published under `REPORTS/CURRENT/`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReportKind {
    #[serde(rename = "DispatchIS_Reports")]
    DispatchIs,
    #[serde(rename = "Dispatch_SCADA")]
    DispatchScada,
}

impl ReportKind {
    pub const ALL: [ReportKind; 2] = [ReportKind::DispatchIs, ReportKind::DispatchScada];

    /// Directory name on NEMweb
    pub fn name(&self) -> &'static str {
        match self {
            Self::DispatchIs => "DispatchIS_Reports",
            Self::DispatchScada => "Dispatch_SCADA",
        }
    }

    fn file_prefix(&self) -> &'static str {
        match self {
            Self::DispatchIs => "PUBLIC_DISPATCHIS_",
            Self::DispatchScada => "PUBLIC_DISPATCHSCADA_",
        }
    }

    /// Case-insensitive file name pattern; group 1 is the interval timestamp
    pub fn pattern(&self) -> Result<Regex> {
        RegexBuilder::new(&format!(r"^{}(\d{{12}})(?:_\d{{16}})?\.zip$", self.file_prefix()))
            .case_insensitive(true)
            .build()
            .map_err(|e| PipelineError::config(format!("file pattern for {}: {}", self.name(), e)))
    }
}

impl std::fmt::Display for ReportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for ReportKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|r| r.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                PipelineError::config(format!(
                    "Unsupported report '{}'. Valid: DispatchIS_Reports, Dispatch_SCADA",
                    s
                ))
            })
    }
}

/// Cursor embedded in a zip name, if the name follows the report's pattern
pub fn cursor_from_filename(pattern: &Regex, name: &str) -> Option<ZipCursor> {
    let captures = pattern.captures(name)?;
    ZipCursor::parse(captures.get(1)?.as_str()).ok()
}

/// A zip listed in a report directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub name: String,
    pub url: String,
    pub cursor: ZipCursor,
}

/// Where dispatch bundles come from
#[async_trait]
pub trait DispatchSource: Send + Sync {
    /// Every zip of `report` that carries a cursor, in name order
    async fn list(&self, report: ReportKind) -> Result<Vec<RemoteFile>>;

    /// Full body of one file
    async fn fetch(&self, file: &RemoteFile) -> Result<Vec<u8>>;
}

/// File names of every `.zip` link in an HTML listing, de-duplicated and sorted
pub fn extract_zip_links(html: &str) -> Result<Vec<String>> {
    let href = RegexBuilder::new(r#"href="([^"]+)""#)
        .case_insensitive(true)
        .build()
        .map_err(|e| PipelineError::config(format!("href pattern: {}", e)))?;

    let names: BTreeSet<String> = href
        .captures_iter(html)
        .filter_map(|c| c.get(1))
        .filter_map(|m| m.as_str().trim().rsplit('/').next().map(str::to_string))
        .filter(|name| name.to_ascii_lowercase().ends_with(".zip"))
        .collect();

    Ok(names.into_iter().collect())
}

/// The lower bound for new files: an explicit `since` wins, then a backfill window from
/// `now`, then the stored watermark
pub fn effective_gate(
    since: Option<ZipCursor>,
    backfill_days: Option<u32>,
    watermark: Option<ZipCursor>,
    now: DateTime<Utc>,
) -> Result<Option<ZipCursor>> {
    if since.is_some() {
        return Ok(since);
    }
    if let Some(days) = backfill_days {
        let start = TimeDelta::try_days(i64::from(days))
            .and_then(|window| now.checked_sub_signed(window))
            .ok_or_else(|| PipelineError::config(format!("backfill of {} days is out of range", days)))?;
        return Ok(Some(ZipCursor::from_utc(start)));
    }
    Ok(watermark)
}

/// The oldest `limit` files strictly newer than `gate`
pub fn pick_candidates(
    files: Vec<RemoteFile>,
    gate: Option<ZipCursor>,
    limit: usize,
) -> Vec<RemoteFile> {
    let mut candidates: Vec<RemoteFile> = files
        .into_iter()
        .filter(|f| gate.map_or(true, |g| f.cursor > g))
        .collect();

    candidates.sort_by(|a, b| (a.cursor, &a.name).cmp(&(b.cursor, &b.name)));
    candidates.truncate(limit);
    candidates
}

/// HTTP implementation against the NEMweb `CURRENT` tree
pub struct NemwebClient {
    client: Client,
    base_url: String,
}

impl NemwebClient {
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.http_timeout_secs))
            .user_agent(config.user_agent.as_str())
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
        })
    }

    pub fn report_url(&self, report: ReportKind) -> String {
        format!("{}/{}/", self.base_url.trim_end_matches('/'), report.name())
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response> {
        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            return Err(PipelineError::HttpStatus {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        Ok(response)
    }
}

#[async_trait]
impl DispatchSource for NemwebClient {
    async fn list(&self, report: ReportKind) -> Result<Vec<RemoteFile>> {
        let url = self.report_url(report);
        info!(%url, "Fetching report listing");

        let html = self.get(&url).await?.text().await?;
        let pattern = report.pattern()?;

        let files: Vec<RemoteFile> = extract_zip_links(&html)?
            .into_iter()
            .filter_map(|name| {
                let cursor = cursor_from_filename(&pattern, &name)?;
                Some(RemoteFile {
                    url: format!("{}{}", url, name),
                    name,
                    cursor,
                })
            })
            .collect();

        info!(report = %report, count = files.len(), "Matching zips in listing");
        Ok(files)
    }

    async fn fetch(&self, file: &RemoteFile) -> Result<Vec<u8>> {
        debug!(url = %file.url, "Downloading");
        let bytes = self.get(&file.url).await?.bytes().await?;
        Ok(bytes.to_vec())
    }
}
