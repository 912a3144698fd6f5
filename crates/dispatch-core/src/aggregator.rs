//! Daily and rolling rollups
//!
//! Summaries are keyed by `(region_id, date_id)` and always recomputed from the fact rows of
//! that key, never accumulated, so recomputing twice leaves identical rows.

use crate::config::MAX_ROLLING_WINDOW_DAYS;
use crate::error::{PipelineError, Result};
use crate::loader::{date_from_id, date_id, TouchedKeys};
use chrono::{NaiveDate, TimeDelta};
use serde::Serialize;
use sqlx::PgConnection;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Statistics of one region-day
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DailyStats {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    /// Sample standard deviation; undefined below two observations
    pub stddev: Option<f64>,
    pub count: i64,
}

impl DailyStats {
    pub fn compute(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }

        let n = values.len() as f64;
        let avg = values.iter().sum::<f64>() / n;
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let stddev = (values.len() > 1).then(|| {
            let sq: f64 = values.iter().map(|v| (v - avg).powi(2)).sum();
            (sq / (n - 1.0)).sqrt()
        });

        Some(Self {
            avg,
            min,
            max,
            stddev,
            count: values.len() as i64,
        })
    }
}

/// Days before (and after) a date that share a trailing window with it
fn window_span(window_days: u32) -> TimeDelta {
    TimeDelta::days(i64::from(window_days.clamp(1, MAX_ROLLING_WINDOW_DAYS)) - 1)
}

/// Mean of the daily averages in the `window_days` ending on `date`, with the number of days
/// that contributed
pub fn rolling_average(
    daily_avgs: &BTreeMap<NaiveDate, f64>,
    date: NaiveDate,
    window_days: u32,
) -> Option<(f64, i32)> {
    let start = date.checked_sub_signed(window_span(window_days))?;
    let values: Vec<f64> = daily_avgs.range(start..=date).map(|(_, v)| *v).collect();

    if values.is_empty() {
        return None;
    }

    Some((
        values.iter().sum::<f64>() / values.len() as f64,
        values.len() as i32,
    ))
}

/// Recompute the summary of one key and the rolling metrics whose window contains it
pub async fn recompute(
    conn: &mut PgConnection,
    region_id: &str,
    key_date_id: i32,
    window_days: u32,
) -> Result<Option<DailyStats>> {
    let values: Vec<f64> = sqlx::query_scalar(
        r#"
        SELECT rrp FROM dispatch_fact
        WHERE region_id = $1 AND date_id = $2
        ORDER BY interval_timestamp, run_no, intervention
        "#,
    )
    .bind(region_id)
    .bind(key_date_id)
    .fetch_all(&mut *conn)
    .await?;

    let stats = DailyStats::compute(&values);

    match &stats {
        Some(s) => upsert_summary(&mut *conn, region_id, key_date_id, s).await?,
        None => {
            sqlx::query("DELETE FROM daily_region_summary WHERE region_id = $1 AND date_id = $2")
                .bind(region_id)
                .bind(key_date_id)
                .execute(&mut *conn)
                .await?;
            sqlx::query("DELETE FROM rolling_metrics WHERE region_id = $1 AND date_id = $2")
                .bind(region_id)
                .bind(key_date_id)
                .execute(&mut *conn)
                .await?;
            debug!(region_id, date_id = key_date_id, "No facts left, summary removed");
        }
    }

    if let Some(date) = date_from_id(key_date_id) {
        refresh_rolling(&mut *conn, region_id, date, window_days).await?;
    }

    Ok(stats)
}

async fn upsert_summary(
    conn: &mut PgConnection,
    region_id: &str,
    key_date_id: i32,
    s: &DailyStats,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO daily_region_summary
            (region_id, date_id, avg_rrp, min_rrp, max_rrp, price_stddev, interval_count, computed_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
        ON CONFLICT (region_id, date_id) DO UPDATE
        SET avg_rrp = EXCLUDED.avg_rrp,
            min_rrp = EXCLUDED.min_rrp,
            max_rrp = EXCLUDED.max_rrp,
            price_stddev = EXCLUDED.price_stddev,
            interval_count = EXCLUDED.interval_count,
            computed_at = NOW()
        WHERE (daily_region_summary.avg_rrp, daily_region_summary.min_rrp, daily_region_summary.max_rrp,
               daily_region_summary.price_stddev, daily_region_summary.interval_count)
              IS DISTINCT FROM
              (EXCLUDED.avg_rrp, EXCLUDED.min_rrp, EXCLUDED.max_rrp,
               EXCLUDED.price_stddev, EXCLUDED.interval_count)
        "#,
    )
    .bind(region_id)
    .bind(key_date_id)
    .bind(s.avg)
    .bind(s.min)
    .bind(s.max)
    .bind(s.stddev)
    .bind(s.count)
    .execute(conn)
    .await?;

    Ok(())
}

/// Rolling metrics for every summarised date whose trailing window contains `date`
async fn refresh_rolling(
    conn: &mut PgConnection,
    region_id: &str,
    date: NaiveDate,
    window_days: u32,
) -> Result<()> {
    let span = window_span(window_days);
    let (Some(first), Some(last)) = (date.checked_sub_signed(span), date.checked_add_signed(span)) else {
        return Err(PipelineError::config(format!("rolling window around {} is out of range", date)));
    };
    let rows: Vec<(i32, f64)> = sqlx::query_as(
        r#"
        SELECT date_id, avg_rrp FROM daily_region_summary
        WHERE region_id = $1 AND date_id BETWEEN $2 AND $3
        "#,
    )
    .bind(region_id)
    .bind(date_id(first))
    .bind(date_id(last))
    .fetch_all(&mut *conn)
    .await?;

    let daily_avgs: BTreeMap<NaiveDate, f64> = rows
        .into_iter()
        .filter_map(|(id, avg)| date_from_id(id).map(|d| (d, avg)))
        .collect();

    let affected: Vec<NaiveDate> = daily_avgs.range(date..=last).map(|(d, _)| *d).collect();
    for day in affected {
        let Some((avg, days)) = rolling_average(&daily_avgs, day, window_days) else {
            continue;
        };

        sqlx::query(
            r#"
            INSERT INTO rolling_metrics
                (region_id, date_id, window_days, rolling_avg_rrp, days_in_window, computed_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (region_id, date_id) DO UPDATE
            SET window_days = EXCLUDED.window_days,
                rolling_avg_rrp = EXCLUDED.rolling_avg_rrp,
                days_in_window = EXCLUDED.days_in_window,
                computed_at = NOW()
            WHERE (rolling_metrics.window_days, rolling_metrics.rolling_avg_rrp, rolling_metrics.days_in_window)
                  IS DISTINCT FROM
                  (EXCLUDED.window_days, EXCLUDED.rolling_avg_rrp, EXCLUDED.days_in_window)
            "#,
        )
        .bind(region_id)
        .bind(date_id(day))
        .bind(window_days.clamp(1, MAX_ROLLING_WINDOW_DAYS) as i32)
        .bind(avg)
        .bind(days)
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

/// Recompute every touched key in ascending order. Returns the number of keys.
pub async fn recompute_touched(
    conn: &mut PgConnection,
    touched: &TouchedKeys,
    window_days: u32,
) -> Result<usize> {
    for (region_id, key_date_id) in touched {
        recompute(&mut *conn, region_id, *key_date_id, window_days).await?;
    }
    Ok(touched.len())
}

/// Full rescan: every key with facts or an existing summary
pub async fn rebuild_all(conn: &mut PgConnection, window_days: u32) -> Result<usize> {
    let keys: Vec<(String, i32)> = sqlx::query_as(
        r#"
        SELECT region_id, date_id FROM dispatch_fact
        UNION
        SELECT region_id, date_id FROM daily_region_summary
        ORDER BY region_id, date_id
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;

    for (region_id, key_date_id) in &keys {
        recompute(&mut *conn, region_id, *key_date_id, window_days).await?;
    }

    // Rolling rows without a summary underneath can only be leftovers
    sqlx::query(
        r#"
        DELETE FROM rolling_metrics rm
        WHERE NOT EXISTS (
            SELECT 1 FROM daily_region_summary s
            WHERE s.region_id = rm.region_id AND s.date_id = rm.date_id
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;

    info!(keys = keys.len(), window_days, "Rebuilt all rollups");
    Ok(keys.len())
}
