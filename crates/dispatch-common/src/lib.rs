//! Dispatch Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared utilities for the dispatch price warehouse workspace.
//!
//! - **Error Handling**: [`DispatchError`] and the [`Result`] alias
//! - **Checksums**: SHA-256 content hashing for files, directories and in-memory payloads
//! - **Logging**: `tracing` subscriber setup driven by environment variables
//!
//! # Example
//!
//! ```no_run
//! use dispatch_common::checksum::sha256_file;
//!
//! fn fingerprint(path: &str) -> dispatch_common::Result<()> {
//!     let digest = sha256_file(path)?;
//!     tracing::info!(sha256 = %digest.hex, size = digest.size_bytes, "hashed file");
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;

pub use error::{DispatchError, Result};
