//! Dispatch Core Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Idempotent ingestion and warehouse load of AEMO 5-minute dispatch prices.
//!
//! # Overview
//!
//! - **Content Registry** ([`registry`]): one `raw_object` per distinct file content
//! - **Watermark Store** ([`watermark`]): named incremental cursors
//! - **Run Ledger** ([`ledger`]): one `pipeline_run` per invocation, closed exactly once
//! - **Lineage Graph** ([`lineage`]): artifacts and the edges that produced them
//! - **Loader** ([`loader`], [`parser`], [`archive`]): parse MMS CSV and upsert facts
//! - **Aggregator** ([`aggregator`]): daily region summaries and rolling averages
//! - **Feed** ([`nemweb`]) and **columnar output** ([`columnar`])
//!
//! [`Pipeline`] ties them together behind four entry points: `ingest`, `process_batch`,
//! `convert_to_columnar` and `build_rollups`.
//!
//! # Example
//!
//! ```no_run
//! use dispatch_core::{BatchOptions, Pipeline, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = PipelineConfig::from_env()?;
//!     let pipeline = Pipeline::connect(config).await?;
//!     dispatch_core::db::run_migrations(pipeline.pool()).await?;
//!
//!     let summary = pipeline.process_batch(BatchOptions::default()).await?;
//!     println!("{} rows appended", summary.counters.rows_appended());
//!     Ok(())
//! }
//! ```

pub mod aggregator;
pub mod archive;
pub mod columnar;
pub mod config;
pub mod curated;
pub mod db;
pub mod error;
pub mod ledger;
pub mod lineage;
pub mod loader;
pub mod nemweb;
pub mod parser;
pub mod pipeline;
pub mod registry;
pub mod types;
pub mod watermark;

pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use nemweb::{DispatchSource, NemwebClient, RemoteFile, ReportKind};
pub use pipeline::{BatchOptions, CurateOptions, IngestOptions, Pipeline};
pub use types::{RunCounters, RunStatus, RunSummary};
pub use watermark::ZipCursor;
