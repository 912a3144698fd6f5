//! Region price series at the dispatch interval grain
//!
//! `dispatch_price` keeps every run and intervention flag of an interval. The curated table
//! keeps one price per `(settlement_date, region_id)`: the pricing run (intervention 0) when
//! present, then the highest run number.

use crate::error::Result;
use crate::types::UpsertStats;
use chrono::NaiveDateTime;
use sqlx::PgConnection;
use tracing::debug;

/// Database artifact standing for the curated table
pub const CURATED_5MIN_TABLE: &str = "public.dispatch_price_5min_region";

/// Bring the curated table up to date for intervals at or after `since` (all when `None`).
///
/// Rows whose price did not change are left alone, so a second call reports them all as
/// unchanged.
pub async fn upsert_5min(conn: &mut PgConnection, since: Option<NaiveDateTime>) -> Result<UpsertStats> {
    let (candidates, inserted, updated): (i64, i64, i64) = sqlx::query_as(
        r#"
        WITH chosen AS (
            SELECT DISTINCT ON (settlement_date, region_id)
                   settlement_date, region_id, rrp, ingested_at
            FROM dispatch_price
            WHERE $1::timestamp IS NULL OR settlement_date >= $1::timestamp
            ORDER BY settlement_date, region_id, intervention ASC, run_no DESC
        ),
        upserted AS (
            INSERT INTO dispatch_price_5min_region (settlement_date, region_id, rrp, ingested_at)
            SELECT settlement_date, region_id, rrp, ingested_at FROM chosen
            ON CONFLICT (settlement_date, region_id) DO UPDATE
            SET rrp = EXCLUDED.rrp,
                ingested_at = EXCLUDED.ingested_at,
                curated_at = NOW()
            WHERE dispatch_price_5min_region.rrp IS DISTINCT FROM EXCLUDED.rrp
            RETURNING (xmax = 0) AS inserted
        )
        SELECT
            (SELECT COUNT(*) FROM chosen),
            COUNT(*) FILTER (WHERE inserted),
            COUNT(*) FILTER (WHERE NOT inserted)
        FROM upserted
        "#,
    )
    .bind(since)
    .fetch_one(&mut *conn)
    .await?;

    let stats = UpsertStats {
        inserted,
        updated,
        unchanged: candidates - inserted - updated,
    };
    debug!(
        candidates,
        inserted = stats.inserted,
        updated = stats.updated,
        unchanged = stats.unchanged,
        "Curated interval prices"
    );
    Ok(stats)
}

/// Curated rows at or after `since`
pub async fn count_since(conn: &mut PgConnection, since: Option<NaiveDateTime>) -> Result<i64> {
    let n = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM dispatch_price_5min_region
        WHERE $1::timestamp IS NULL OR settlement_date >= $1::timestamp
        "#,
    )
    .bind(since)
    .fetch_one(conn)
    .await?;
    Ok(n)
}

/// One row of the daily rollup export
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct DailyRollupRow {
    pub region_id: String,
    pub date: chrono::NaiveDate,
    pub intervals: i64,
    pub rrp_avg: f64,
    pub rrp_min: f64,
    pub rrp_max: f64,
    pub rrp_std: Option<f64>,
}

/// Every daily summary, ordered by date then region
pub async fn daily_rollup_rows(conn: &mut PgConnection) -> Result<Vec<DailyRollupRow>> {
    let rows = sqlx::query_as::<_, DailyRollupRow>(
        r#"
        SELECT s.region_id, d.full_date AS date, s.interval_count AS intervals,
               s.avg_rrp AS rrp_avg, s.min_rrp AS rrp_min, s.max_rrp AS rrp_max,
               s.price_stddev AS rrp_std
        FROM daily_region_summary s
        JOIN dimension_date d ON d.date_id = s.date_id
        ORDER BY d.full_date, s.region_id
        "#,
    )
    .fetch_all(conn)
    .await?;
    Ok(rows)
}
