//! Run ledger
//!
//! Every invocation opens one `pipeline_run` row in `running` and closes it exactly once with
//! its final status and counters. A terminal row is never touched again: the close statement
//! is guarded by `status = 'running'` and a trigger rejects any other update.

use crate::error::{PipelineError, Result};
use crate::types::{RunCounters, RunStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Acquire, PgConnection};
use std::time::Duration;
use uuid::Uuid;

/// Message recorded on runs closed by [`close_stale`]
pub const STALE_RUN_MESSAGE: &str = "stale: process did not close run";

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PipelineRun {
    pub id: Uuid,
    pub command: String,
    pub parameters: serde_json::Value,
    pub status: String,
    pub rows_appended: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl PipelineRun {
    pub fn status(&self) -> Result<RunStatus> {
        self.status.parse()
    }
}

const RUN_COLUMNS: &str =
    "id, command, parameters, status, rows_appended, started_at, finished_at, error_message";

pub async fn open(
    conn: &mut PgConnection,
    command: &str,
    parameters: &serde_json::Value,
) -> Result<Uuid> {
    let run_id = Uuid::new_v4();

    sqlx::query(
        r#"
        INSERT INTO pipeline_run (id, command, parameters, status, started_at)
        VALUES ($1, $2, $3, 'running', NOW())
        "#,
    )
    .bind(run_id)
    .bind(command)
    .bind(parameters)
    .execute(conn)
    .await?;

    tracing::info!(run_id = %run_id, command, "Run opened");
    Ok(run_id)
}

/// Move a running run to its terminal status and record its metrics.
///
/// Returns [`PipelineError::RunAlreadyClosed`] when the run is already terminal.
pub async fn close(
    conn: &mut PgConnection,
    run_id: Uuid,
    status: RunStatus,
    counters: &RunCounters,
    error_message: Option<&str>,
) -> Result<()> {
    if !status.is_terminal() {
        return Err(PipelineError::config("a run can only be closed as success or failed"));
    }

    let mut tx = conn.begin().await?;

    let closed = sqlx::query(
        r#"
        UPDATE pipeline_run
        SET status = $2, rows_appended = $3, finished_at = NOW(), error_message = $4
        WHERE id = $1 AND status = 'running'
        "#,
    )
    .bind(run_id)
    .bind(status.as_str())
    .bind(counters.rows_appended())
    .bind(error_message)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if closed == 0 {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pipeline_run WHERE id = $1)")
            .bind(run_id)
            .fetch_one(&mut *tx)
            .await?;
        return Err(if exists {
            PipelineError::RunAlreadyClosed(run_id)
        } else {
            PipelineError::RunNotFound(run_id)
        });
    }

    insert_metrics(&mut *tx, run_id, counters).await?;
    tx.commit().await?;

    tracing::info!(
        run_id = %run_id,
        status = %status,
        files = counters.total_files,
        processed = counters.files_processed,
        duplicates = counters.files_duplicate,
        failed = counters.files_failed,
        inserted = counters.total_inserted,
        updated = counters.total_updated,
        invalid = counters.total_invalid,
        "Run closed"
    );

    Ok(())
}

async fn insert_metrics(conn: &mut PgConnection, run_id: Uuid, c: &RunCounters) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO pipeline_run_metrics (
            run_id, total_files, files_processed, files_duplicate, files_skipped, files_failed,
            total_rows, total_inserted, total_updated, total_unchanged, total_invalid,
            artifacts_written
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        ON CONFLICT (run_id) DO NOTHING
        "#,
    )
    .bind(run_id)
    .bind(c.total_files)
    .bind(c.files_processed)
    .bind(c.files_duplicate)
    .bind(c.files_skipped)
    .bind(c.files_failed)
    .bind(c.total_rows)
    .bind(c.total_inserted)
    .bind(c.total_updated)
    .bind(c.total_unchanged)
    .bind(c.total_invalid)
    .bind(c.artifacts_written)
    .execute(conn)
    .await?;

    Ok(())
}

pub async fn get(conn: &mut PgConnection, run_id: Uuid) -> Result<Option<PipelineRun>> {
    let run = sqlx::query_as::<_, PipelineRun>(&format!(
        "SELECT {} FROM pipeline_run WHERE id = $1",
        RUN_COLUMNS
    ))
    .bind(run_id)
    .fetch_optional(conn)
    .await?;

    Ok(run)
}

pub async fn metrics(conn: &mut PgConnection, run_id: Uuid) -> Result<Option<RunCounters>> {
    let counters = sqlx::query_as::<_, RunCounters>(
        r#"
        SELECT total_files, files_processed, files_duplicate, files_skipped, files_failed,
               total_rows, total_inserted, total_updated, total_unchanged, total_invalid,
               artifacts_written
        FROM pipeline_run_metrics
        WHERE run_id = $1
        "#,
    )
    .bind(run_id)
    .fetch_optional(conn)
    .await?;

    Ok(counters)
}

/// Most recent successful run of `command`
pub async fn latest_successful(
    conn: &mut PgConnection,
    command: &str,
) -> Result<Option<PipelineRun>> {
    let run = sqlx::query_as::<_, PipelineRun>(&format!(
        r#"
        SELECT {}
        FROM pipeline_run
        WHERE command = $1 AND status = 'success'
        ORDER BY started_at DESC
        LIMIT 1
        "#,
        RUN_COLUMNS
    ))
    .bind(command)
    .fetch_optional(conn)
    .await?;

    Ok(run)
}

/// Runs still `running` that started more than `older_than` ago
pub async fn stale_runs(conn: &mut PgConnection, older_than: Duration) -> Result<Vec<PipelineRun>> {
    let runs = sqlx::query_as::<_, PipelineRun>(&format!(
        r#"
        SELECT {}
        FROM pipeline_run
        WHERE status = 'running'
          AND started_at < NOW() - make_interval(secs => $1)
        ORDER BY started_at
        "#,
        RUN_COLUMNS
    ))
    .bind(older_than.as_secs_f64())
    .fetch_all(conn)
    .await?;

    Ok(runs)
}

/// Manual reconciliation: mark stale runs `failed` and return their ids
pub async fn close_stale(conn: &mut PgConnection, older_than: Duration) -> Result<Vec<Uuid>> {
    let mut tx = conn.begin().await?;

    let ids: Vec<Uuid> = sqlx::query_scalar(
        r#"
        UPDATE pipeline_run
        SET status = 'failed', finished_at = NOW(), error_message = $2
        WHERE status = 'running'
          AND started_at < NOW() - make_interval(secs => $1)
        RETURNING id
        "#,
    )
    .bind(older_than.as_secs_f64())
    .bind(STALE_RUN_MESSAGE)
    .fetch_all(&mut *tx)
    .await?;

    for id in &ids {
        insert_metrics(&mut *tx, *id, &RunCounters::default()).await?;
        tracing::warn!(run_id = %id, "Closed stale run as failed");
    }

    tx.commit().await?;
    Ok(ids)
}
