//! Lineage graph
//!
//! Artifacts are the outputs of runs (clean CSVs, Parquet partitions, rollup tables). Edges
//! point from a raw object or an artifact to the artifact derived from it and are only ever
//! appended. Traversal is on demand with a recursive CTE.

use crate::error::{PipelineError, Result};
use crate::registry::RawObject;
use crate::types::{ArtifactType, NodeRef};
use chrono::{DateTime, Utc};
use dispatch_common::checksum::sha256_path;
use serde::Serialize;
use sqlx::PgConnection;
use std::path::Path;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Artifact {
    pub id: Uuid,
    pub run_id: Uuid,
    pub artifact_type: String,
    pub path: String,
    pub content_hash: Option<String>,
    pub size_bytes: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn kind(&self) -> Result<ArtifactType> {
        self.artifact_type.parse()
    }

    pub fn node(&self) -> NodeRef {
        NodeRef::Artifact(self.id)
    }
}

const ARTIFACT_COLUMNS: &str = "id, run_id, artifact_type, path, content_hash, size_bytes, created_at";

/// Register a file or directory artifact, hashing its content
pub async fn register_artifact(
    conn: &mut PgConnection,
    run_id: Uuid,
    artifact_type: ArtifactType,
    path: &Path,
) -> Result<Artifact> {
    let digest = sha256_path(path)?;
    insert_artifact(
        conn,
        run_id,
        artifact_type,
        &path.to_string_lossy(),
        Some(&digest.hex),
        Some(digest.size_bytes as i64),
    )
    .await
}

/// Register a database table as an artifact (`db://<schema.table>`, no content hash)
pub async fn register_db_artifact(
    conn: &mut PgConnection,
    run_id: Uuid,
    artifact_type: ArtifactType,
    table: &str,
) -> Result<Artifact> {
    let path = format!("db://{}", table);
    insert_artifact(conn, run_id, artifact_type, &path, None, None).await
}

async fn insert_artifact(
    conn: &mut PgConnection,
    run_id: Uuid,
    artifact_type: ArtifactType,
    path: &str,
    content_hash: Option<&str>,
    size_bytes: Option<i64>,
) -> Result<Artifact> {
    let artifact = sqlx::query_as::<_, Artifact>(&format!(
        r#"
        INSERT INTO artifact (id, run_id, artifact_type, path, content_hash, size_bytes)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING {}
        "#,
        ARTIFACT_COLUMNS
    ))
    .bind(Uuid::new_v4())
    .bind(run_id)
    .bind(artifact_type.as_str())
    .bind(path)
    .bind(content_hash)
    .bind(size_bytes)
    .fetch_one(conn)
    .await?;

    tracing::debug!(
        artifact_id = %artifact.id,
        artifact_type = artifact_type.as_str(),
        path = %artifact.path,
        "Registered artifact"
    );

    Ok(artifact)
}

/// Start time of the run that produced a node, if the node exists
async fn producing_run_started(
    conn: &mut PgConnection,
    node: NodeRef,
) -> Result<Option<DateTime<Utc>>> {
    let sql = match node {
        NodeRef::RawObject(_) => {
            "SELECT r.started_at FROM raw_object o JOIN pipeline_run r ON r.id = o.run_id WHERE o.id = $1"
        }
        NodeRef::Artifact(_) => {
            "SELECT r.started_at FROM artifact a JOIN pipeline_run r ON r.id = a.run_id WHERE a.id = $1"
        }
    };

    let started: Option<DateTime<Utc>> = sqlx::query_scalar(sql)
        .bind(node.id())
        .fetch_optional(conn)
        .await?;

    Ok(started)
}

/// Append an edge `from -> to_artifact` on behalf of `run_id`.
///
/// Both endpoints must exist and come from `run_id` or an earlier run. Returns `false` when
/// the edge was already recorded.
pub async fn record(
    conn: &mut PgConnection,
    run_id: Uuid,
    from: NodeRef,
    to_artifact: Uuid,
) -> Result<bool> {
    let run_started: DateTime<Utc> =
        sqlx::query_scalar("SELECT started_at FROM pipeline_run WHERE id = $1")
            .bind(run_id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or(PipelineError::RunNotFound(run_id))?;

    let to = NodeRef::Artifact(to_artifact);
    for node in [from, to] {
        match producing_run_started(&mut *conn, node).await? {
            None => {
                return Err(PipelineError::lineage(format!("{} does not exist", node)));
            }
            Some(started) if started > run_started => {
                return Err(PipelineError::lineage(format!(
                    "{} was produced by a run later than {}",
                    node, run_id
                )));
            }
            Some(_) => {}
        }
    }

    let inserted = sqlx::query(
        r#"
        INSERT INTO lineage_edge (run_id, from_type, from_id, to_type, to_id)
        VALUES ($1, $2, $3, 'artifact', $4)
        ON CONFLICT ON CONSTRAINT uq_lineage_edge DO NOTHING
        "#,
    )
    .bind(run_id)
    .bind(from.node_type())
    .bind(from.id())
    .bind(to_artifact)
    .execute(conn)
    .await?
    .rows_affected();

    Ok(inserted == 1)
}

/// Whether any artifact has been derived from `node`
pub async fn has_derivations(conn: &mut PgConnection, node: NodeRef) -> Result<bool> {
    let derived: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM lineage_edge WHERE from_type = $1 AND from_id = $2)",
    )
    .bind(node.node_type())
    .bind(node.id())
    .fetch_one(conn)
    .await?;

    Ok(derived)
}

/// Artifacts written by a run, optionally restricted to one type
pub async fn artifacts_for_run(
    conn: &mut PgConnection,
    run_id: Uuid,
    artifact_type: Option<ArtifactType>,
) -> Result<Vec<Artifact>> {
    let artifacts = sqlx::query_as::<_, Artifact>(&format!(
        r#"
        SELECT {}
        FROM artifact
        WHERE run_id = $1 AND ($2::text IS NULL OR artifact_type = $2)
        ORDER BY created_at, path
        "#,
        ARTIFACT_COLUMNS
    ))
    .bind(run_id)
    .bind(artifact_type.map(|t| t.as_str()))
    .fetch_all(conn)
    .await?;

    Ok(artifacts)
}

/// Every node upstream of an artifact. Cycles terminate because `UNION` drops rows already
/// produced.
pub async fn ancestors(conn: &mut PgConnection, artifact_id: Uuid) -> Result<Vec<NodeRef>> {
    let rows: Vec<(String, Uuid)> = sqlx::query_as(
        r#"
        WITH RECURSIVE upstream (node_type, node_id) AS (
            SELECT from_type, from_id
            FROM lineage_edge
            WHERE to_type = 'artifact' AND to_id = $1
            UNION
            SELECT e.from_type, e.from_id
            FROM lineage_edge e
            JOIN upstream u ON u.node_type = 'artifact' AND e.to_type = 'artifact' AND e.to_id = u.node_id
        )
        SELECT node_type, node_id FROM upstream
        ORDER BY node_type, node_id
        "#,
    )
    .bind(artifact_id)
    .fetch_all(conn)
    .await?;

    rows.into_iter()
        .map(|(node_type, id)| NodeRef::from_parts(&node_type, id))
        .collect()
}

/// Raw objects an artifact was ultimately derived from
pub async fn raw_sources(conn: &mut PgConnection, artifact_id: Uuid) -> Result<Vec<RawObject>> {
    let ids: Vec<Uuid> = ancestors(&mut *conn, artifact_id)
        .await?
        .into_iter()
        .filter_map(|node| match node {
            NodeRef::RawObject(id) => Some(id),
            NodeRef::Artifact(_) => None,
        })
        .collect();

    let rows = sqlx::query_as::<_, RawObject>(
        r#"
        SELECT id, run_id, source_type, path, filename, size_bytes, content_hash, discovered_at
        FROM raw_object
        WHERE id = ANY($1)
        ORDER BY discovered_at, filename
        "#,
    )
    .bind(&ids)
    .fetch_all(conn)
    .await?;

    Ok(rows)
}
