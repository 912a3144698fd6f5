//! Shared domain types: run states, node kinds and counters

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

/// Command names recorded on `pipeline_run.command`
pub mod command {
    pub const INGEST: &str = "ingest";
    pub const PROCESS_BATCH: &str = "process_batch";
    pub const CONVERT_TO_COLUMNAR: &str = "convert_to_columnar";
    pub const BUILD_ROLLUPS: &str = "build_rollups";
    pub const CURATE_5MIN: &str = "curate_5min";
}

/// Run state machine: `Running -> Success | Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl std::str::FromStr for RunStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            other => Err(PipelineError::config(format!("unknown run status '{}'", other))),
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of raw file admitted into the content registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Csv,
    Zip,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Csv => "csv",
            SourceType::Zip => "zip",
        }
    }

    /// Classify by extension, case-insensitive
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "csv" => Some(SourceType::Csv),
            "zip" => Some(SourceType::Zip),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    CleanCsv,
    Partition,
    Rollup,
    CuratedTable,
    DailyRollup,
}

impl ArtifactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactType::CleanCsv => "clean_csv",
            ArtifactType::Partition => "partition",
            ArtifactType::Rollup => "rollup",
            ArtifactType::CuratedTable => "curated_table",
            ArtifactType::DailyRollup => "daily_rollup",
        }
    }
}

impl std::str::FromStr for ArtifactType {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "clean_csv" => Ok(ArtifactType::CleanCsv),
            "partition" => Ok(ArtifactType::Partition),
            "rollup" => Ok(ArtifactType::Rollup),
            "curated_table" => Ok(ArtifactType::CuratedTable),
            "daily_rollup" => Ok(ArtifactType::DailyRollup),
            other => Err(PipelineError::config(format!("unknown artifact type '{}'", other))),
        }
    }
}

/// Typed endpoint of a lineage edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum NodeRef {
    RawObject(Uuid),
    Artifact(Uuid),
}

impl NodeRef {
    pub fn node_type(&self) -> &'static str {
        match self {
            NodeRef::RawObject(_) => "raw_object",
            NodeRef::Artifact(_) => "artifact",
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            NodeRef::RawObject(id) | NodeRef::Artifact(id) => *id,
        }
    }

    pub fn from_parts(node_type: &str, id: Uuid) -> Result<Self> {
        match node_type {
            "raw_object" => Ok(NodeRef::RawObject(id)),
            "artifact" => Ok(NodeRef::Artifact(id)),
            other => Err(PipelineError::lineage(format!("unknown node type '{}'", other))),
        }
    }
}

impl std::fmt::Display for NodeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.node_type(), self.id())
    }
}

/// Row outcomes of one fact upsert
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertStats {
    pub inserted: i64,
    pub updated: i64,
    pub unchanged: i64,
}

impl UpsertStats {
    pub fn merge(self, other: Self) -> Self {
        Self {
            inserted: self.inserted + other.inserted,
            updated: self.updated + other.updated,
            unchanged: self.unchanged + other.unchanged,
        }
    }

    pub fn written(&self) -> i64 {
        self.inserted + self.updated
    }

    /// Distinct natural keys the upsert saw
    pub fn total(&self) -> i64 {
        self.inserted + self.updated + self.unchanged
    }
}

/// Final counters of a run, persisted to `pipeline_run_metrics`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct RunCounters {
    /// Every candidate file the run looked at, including skipped ones
    pub total_files: i64,
    pub files_processed: i64,
    pub files_duplicate: i64,
    /// Files at or behind the watermark, or already present on disk
    pub files_skipped: i64,
    pub files_failed: i64,
    /// Distinct natural keys handled; repeats within one file count once
    pub total_rows: i64,
    pub total_inserted: i64,
    pub total_updated: i64,
    pub total_unchanged: i64,
    pub total_invalid: i64,
    pub artifacts_written: i64,
}

impl RunCounters {
    pub fn add_upsert(&mut self, stats: UpsertStats) {
        self.total_inserted += stats.inserted;
        self.total_updated += stats.updated;
        self.total_unchanged += stats.unchanged;
    }

    /// Value stored on `pipeline_run.rows_appended`
    pub fn rows_appended(&self) -> i64 {
        self.total_inserted + self.total_updated
    }
}

/// Result of every entry point
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub command: String,
    pub status: RunStatus,
    pub counters: RunCounters,
    /// Watermark value after the run, when the entry point maintains one
    pub watermark: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_round_trip_and_terminality() {
        for status in [RunStatus::Running, RunStatus::Success, RunStatus::Failed] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!("done".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_source_type_from_path() {
        assert_eq!(
            SourceType::from_path(Path::new("PUBLIC_DISPATCHIS_202602052110_0000000500000001.ZIP")),
            Some(SourceType::Zip)
        );
        assert_eq!(SourceType::from_path(Path::new("prices.csv")), Some(SourceType::Csv));
        assert_eq!(SourceType::from_path(Path::new("notes.txt")), None);
        assert_eq!(SourceType::from_path(Path::new("README")), None);
    }

    #[test]
    fn test_artifact_type_names() {
        for kind in [
            ArtifactType::CleanCsv,
            ArtifactType::Partition,
            ArtifactType::Rollup,
            ArtifactType::CuratedTable,
            ArtifactType::DailyRollup,
        ] {
            assert_eq!(kind.as_str().parse::<ArtifactType>().unwrap(), kind);
        }
        assert!("curated".parse::<ArtifactType>().is_err());
    }

    #[test]
    fn test_node_ref_parts() {
        let id = Uuid::new_v4();
        let node = NodeRef::from_parts("raw_object", id).unwrap();
        assert_eq!(node, NodeRef::RawObject(id));
        assert_eq!(node.to_string(), format!("raw_object:{}", id));
        assert!(NodeRef::from_parts("table", id).is_err());
    }

    #[test]
    fn test_counters_accumulate_upserts() {
        let mut counters = RunCounters::default();
        counters.add_upsert(UpsertStats {
            inserted: 3,
            updated: 1,
            unchanged: 2,
        });
        counters.add_upsert(UpsertStats {
            inserted: 0,
            updated: 2,
            unchanged: 0,
        });
        assert_eq!(counters.total_inserted, 3);
        assert_eq!(counters.total_updated, 3);
        assert_eq!(counters.total_unchanged, 2);
        assert_eq!(counters.rows_appended(), 6);
    }
}
