//! Content registry
//!
//! One `raw_object` row per distinct file content. Identity is `(source_type, content_hash)`;
//! the same bytes delivered under another name are reported as a duplicate of the first
//! admission. Rows are append-only.

use crate::error::Result;
use crate::types::SourceType;
use chrono::{DateTime, Utc};
use dispatch_common::checksum::{sha256_bytes, ContentDigest};
use sqlx::PgConnection;
use std::path::Path;
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RawObject {
    pub id: Uuid,
    pub run_id: Uuid,
    pub source_type: String,
    pub path: String,
    pub filename: String,
    pub size_bytes: i64,
    pub content_hash: Option<String>,
    pub discovered_at: DateTime<Utc>,
}

/// Outcome of offering a file to the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// First time this content was seen; the new `raw_object` id
    Registered(Uuid),
    /// Content already registered; the id of the earlier row
    Duplicate(Uuid),
}

impl Admission {
    pub fn raw_object_id(&self) -> Uuid {
        match self {
            Admission::Registered(id) | Admission::Duplicate(id) => *id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Admission::Duplicate(_))
    }
}

/// Hash `bytes` and register them, or report the existing row.
///
/// Meant to run inside the transaction that loads the file so admission and load commit
/// together.
pub async fn admit(
    conn: &mut PgConnection,
    run_id: Uuid,
    source_type: SourceType,
    path: &Path,
    bytes: &[u8],
) -> Result<Admission> {
    let digest = sha256_bytes(bytes);
    admit_digest(conn, run_id, source_type, path, &digest).await
}

/// Same as [`admit`] for a digest computed elsewhere
pub async fn admit_digest(
    conn: &mut PgConnection,
    run_id: Uuid,
    source_type: SourceType,
    path: &Path,
    digest: &ContentDigest,
) -> Result<Admission> {
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let path_str = path.to_string_lossy().into_owned();

    let inserted: Option<Uuid> = sqlx::query_scalar(
        r#"
        INSERT INTO raw_object (id, run_id, source_type, path, filename, size_bytes, content_hash)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (source_type, content_hash) WHERE content_hash IS NOT NULL DO NOTHING
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(run_id)
    .bind(source_type.as_str())
    .bind(&path_str)
    .bind(&filename)
    .bind(digest.size_bytes as i64)
    .bind(&digest.hex)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(id) = inserted {
        tracing::debug!(raw_object_id = %id, filename = %filename, sha256 = %digest.hex, "Registered raw object");
        return Ok(Admission::Registered(id));
    }

    let existing: Uuid = sqlx::query_scalar(
        "SELECT id FROM raw_object WHERE source_type = $1 AND content_hash = $2",
    )
    .bind(source_type.as_str())
    .bind(&digest.hex)
    .fetch_one(&mut *conn)
    .await?;

    tracing::info!(
        raw_object_id = %existing,
        filename = %filename,
        sha256 = %digest.hex,
        "Duplicate content, already registered"
    );

    Ok(Admission::Duplicate(existing))
}

/// Read-only lookup used before downloading
pub async fn is_registered(
    conn: &mut PgConnection,
    source_type: SourceType,
    content_hash: &str,
) -> Result<bool> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM raw_object WHERE source_type = $1 AND content_hash = $2)",
    )
    .bind(source_type.as_str())
    .bind(content_hash)
    .fetch_one(conn)
    .await?;

    Ok(exists)
}

pub async fn get(conn: &mut PgConnection, id: Uuid) -> Result<Option<RawObject>> {
    let row = sqlx::query_as::<_, RawObject>(
        r#"
        SELECT id, run_id, source_type, path, filename, size_bytes, content_hash, discovered_at
        FROM raw_object
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(conn)
    .await?;

    Ok(row)
}

pub async fn list_for_run(conn: &mut PgConnection, run_id: Uuid) -> Result<Vec<RawObject>> {
    let rows = sqlx::query_as::<_, RawObject>(
        r#"
        SELECT id, run_id, source_type, path, filename, size_bytes, content_hash, discovered_at
        FROM raw_object
        WHERE run_id = $1
        ORDER BY discovered_at, filename
        "#,
    )
    .bind(run_id)
    .fetch_all(conn)
    .await?;

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admission_accessors() {
        let id = Uuid::new_v4();
        assert_eq!(Admission::Registered(id).raw_object_id(), id);
        assert!(!Admission::Registered(id).is_duplicate());
        assert!(Admission::Duplicate(id).is_duplicate());
    }
}
