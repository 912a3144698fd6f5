//! Pipeline error taxonomy
//!
//! Errors split into two classes. Per-file failures (an unreadable or corrupt file, a failed
//! download) are logged and counted while the run carries on. Fatal errors abort the run, roll
//! back the in-flight transaction and close the run as `failed`. [`PipelineError::is_fatal`]
//! is the single place that decides which is which.

use dispatch_common::DispatchError;
use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP {status} fetching {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Zip archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("Invalid archive {path}: {reason}")]
    InvalidArchive { path: String, reason: String },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Common(#[from] DispatchError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid cursor value '{0}'")]
    InvalidCursor(String),

    #[error("Run {0} is already closed")]
    RunAlreadyClosed(Uuid),

    #[error("Run {0} not found")]
    RunNotFound(Uuid),

    #[error("Lineage violation: {0}")]
    LineageViolation(String),

    #[error("Invalid region id '{0}'")]
    InvalidRegion(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn lineage(message: impl Into<String>) -> Self {
        Self::LineageViolation(message.into())
    }

    pub fn invalid_archive(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArchive {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error must abort the whole run.
    ///
    /// Database, migration, ledger and lineage errors leave the warehouse in a state the run
    /// cannot reason about, so they are fatal. Everything that concerns one file or one HTTP
    /// exchange is not.
    pub fn is_fatal(&self) -> bool {
        match self {
            PipelineError::Database(_)
            | PipelineError::Migration(_)
            | PipelineError::InvalidCursor(_)
            | PipelineError::RunAlreadyClosed(_)
            | PipelineError::RunNotFound(_)
            | PipelineError::LineageViolation(_)
            | PipelineError::Config(_)
            | PipelineError::Serialization(_) => true,
            PipelineError::Common(_)
            | PipelineError::Http(_)
            | PipelineError::HttpStatus { .. }
            | PipelineError::Archive(_)
            | PipelineError::InvalidArchive { .. }
            | PipelineError::InvalidRegion(_)
            | PipelineError::Csv(_)
            | PipelineError::Arrow(_)
            | PipelineError::Parquet(_)
            | PipelineError::Io(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_file_errors_are_not_fatal() {
        let io = PipelineError::from(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert!(!io.is_fatal());
        assert!(!PipelineError::invalid_archive("a.zip", "empty").is_fatal());
        assert!(!PipelineError::HttpStatus {
            url: "http://x".into(),
            status: 503
        }
        .is_fatal());
        assert!(!PipelineError::from(DispatchError::parse("bad")).is_fatal());
        assert!(!PipelineError::InvalidRegion("../x".into()).is_fatal());
    }

    #[test]
    fn test_store_and_invariant_errors_are_fatal() {
        assert!(PipelineError::Database(sqlx::Error::PoolTimedOut).is_fatal());
        assert!(PipelineError::RunAlreadyClosed(Uuid::new_v4()).is_fatal());
        assert!(PipelineError::lineage("dangling endpoint").is_fatal());
        assert!(PipelineError::InvalidCursor("yesterday".into()).is_fatal());
    }
}
