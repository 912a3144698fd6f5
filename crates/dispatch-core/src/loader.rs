//! Fact loading
//!
//! Validated price rows are upserted into `dispatch_price` by natural key
//! `(settlement_date, region_id, run_no, intervention)`. The statement only rewrites a row
//! whose price differs, and `xmax = 0` on the returned rows separates inserts from updates;
//! rows not returned were identical. The same batch then maintains `dimension_date` and
//! promotes rows for known regions into `dispatch_fact`.

use crate::error::Result;
use crate::parser::{PriceKey, PriceRow};
use crate::types::UpsertStats;
use chrono::{Datelike, NaiveDate, Weekday};
use sqlx::{PgConnection, Postgres, QueryBuilder, Row};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// Rows per statement; 6 binds each keeps well under the 65535 parameter limit
pub const UPSERT_CHUNK_SIZE: usize = 500;

/// `(region_id, date_id)` pairs whose facts changed
pub type TouchedKeys = BTreeSet<(String, i32)>;

#[derive(Debug, Clone, Default)]
pub struct LoadOutcome {
    pub stats: UpsertStats,
    pub touched: TouchedKeys,
}

/// Collapse duplicate natural keys, keeping the value of the last occurrence
pub fn dedupe_last_wins(rows: &[PriceRow]) -> Vec<PriceRow> {
    let mut position: HashMap<PriceKey, usize> = HashMap::with_capacity(rows.len());
    let mut out: Vec<PriceRow> = Vec::with_capacity(rows.len());

    for row in rows {
        match position.get(&row.key()) {
            Some(&idx) => out[idx] = row.clone(),
            None => {
                position.insert(row.key(), out.len());
                out.push(row.clone());
            }
        }
    }

    out
}

/// `YYYYMMDD` surrogate key of `dimension_date`
pub fn date_id(date: NaiveDate) -> i32 {
    date.year() * 10_000 + date.month() as i32 * 100 + date.day() as i32
}

pub fn date_from_id(date_id: i32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(
        date_id / 10_000,
        (date_id / 100 % 100) as u32,
        (date_id % 100) as u32,
    )
}

/// Southern hemisphere season of a calendar month
pub fn season(month: u32) -> &'static str {
    match month {
        12 | 1 | 2 => "Summer",
        3..=5 => "Autumn",
        6..=8 => "Winter",
        _ => "Spring",
    }
}

/// Calendar attributes stored on `dimension_date`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateAttributes {
    pub date_id: i32,
    pub full_date: NaiveDate,
    pub day: i16,
    pub month: i16,
    pub year: i16,
    pub quarter: i16,
    pub week_of_year: i16,
    pub is_weekend: bool,
    pub season: &'static str,
}

impl DateAttributes {
    pub fn of(date: NaiveDate) -> Self {
        Self {
            date_id: date_id(date),
            full_date: date,
            day: date.day() as i16,
            month: date.month() as i16,
            year: date.year() as i16,
            quarter: ((date.month() - 1) / 3 + 1) as i16,
            week_of_year: date.iso_week().week() as i16,
            is_weekend: matches!(date.weekday(), Weekday::Sat | Weekday::Sun),
            season: season(date.month()),
        }
    }
}

/// Upsert price rows; duplicates within `rows` collapse to the last occurrence first
pub async fn upsert_prices(conn: &mut PgConnection, rows: &[PriceRow]) -> Result<UpsertStats> {
    let rows = dedupe_last_wins(rows);
    let mut stats = UpsertStats::default();

    for chunk in rows.chunks(UPSERT_CHUNK_SIZE) {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO dispatch_price (settlement_date, region_id, rrp, intervention, run_no) ",
        );
        qb.push_values(chunk, |mut b, row| {
            b.push_bind(row.settlement_date)
                .push_bind(&row.region_id)
                .push_bind(row.rrp)
                .push_bind(row.intervention)
                .push_bind(row.run_no);
        });
        qb.push(
            r#"
            ON CONFLICT (settlement_date, region_id, run_no, intervention) DO UPDATE
            SET rrp = EXCLUDED.rrp, ingested_at = NOW()
            WHERE dispatch_price.rrp IS DISTINCT FROM EXCLUDED.rrp
            RETURNING (xmax = 0) AS inserted
            "#,
        );

        let returned = qb.build().fetch_all(&mut *conn).await?;
        let mut chunk_stats = UpsertStats::default();
        for row in &returned {
            if row.try_get::<bool, _>("inserted")? {
                chunk_stats.inserted += 1;
            } else {
                chunk_stats.updated += 1;
            }
        }
        chunk_stats.unchanged = chunk.len() as i64 - returned.len() as i64;

        debug!(
            rows = chunk.len(),
            inserted = chunk_stats.inserted,
            updated = chunk_stats.updated,
            unchanged = chunk_stats.unchanged,
            "Upserted price chunk"
        );
        stats = stats.merge(chunk_stats);
    }

    Ok(stats)
}

/// Make sure every date has a `dimension_date` row
pub async fn ensure_dimension_dates(
    conn: &mut PgConnection,
    dates: &BTreeSet<NaiveDate>,
) -> Result<()> {
    if dates.is_empty() {
        return Ok(());
    }

    let attributes: Vec<DateAttributes> = dates.iter().copied().map(DateAttributes::of).collect();

    for chunk in attributes.chunks(UPSERT_CHUNK_SIZE) {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO dimension_date (date_id, full_date, day, month, year, quarter, week_of_year, is_weekend, season) ",
        );
        qb.push_values(chunk, |mut b, d| {
            b.push_bind(d.date_id)
                .push_bind(d.full_date)
                .push_bind(d.day)
                .push_bind(d.month)
                .push_bind(d.year)
                .push_bind(d.quarter)
                .push_bind(d.week_of_year)
                .push_bind(d.is_weekend)
                .push_bind(d.season);
        });
        qb.push(" ON CONFLICT (date_id) DO NOTHING");
        qb.build().execute(&mut *conn).await?;
    }

    Ok(())
}

/// Copy rows into `dispatch_fact` for regions with a current `dimension_region` row.
///
/// Returns the `(region_id, date_id)` keys whose facts were inserted or changed.
pub async fn promote_to_fact(conn: &mut PgConnection, rows: &[PriceRow]) -> Result<TouchedKeys> {
    let mut touched = TouchedKeys::new();

    for chunk in rows.chunks(UPSERT_CHUNK_SIZE) {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            r#"
            INSERT INTO dispatch_fact (date_id, region_key, region_id, interval_timestamp, rrp, intervention, run_no)
            SELECT v.date_id, r.region_key, v.region_id, v.interval_timestamp, v.rrp, v.intervention, v.run_no
            FROM (
            "#,
        );
        qb.push_values(chunk, |mut b, row| {
            b.push_bind(date_id(row.trading_date()))
                .push_bind(&row.region_id)
                .push_bind(row.settlement_date)
                .push_bind(row.rrp)
                .push_bind(row.intervention)
                .push_bind(row.run_no);
        });
        qb.push(
            r#"
            ) AS v (date_id, region_id, interval_timestamp, rrp, intervention, run_no)
            JOIN dimension_region r ON r.region_id = v.region_id AND r.is_current
            ON CONFLICT ON CONSTRAINT uq_dispatch_fact_key DO UPDATE
            SET rrp = EXCLUDED.rrp, date_id = EXCLUDED.date_id, ingested_at = NOW()
            WHERE dispatch_fact.rrp IS DISTINCT FROM EXCLUDED.rrp
            RETURNING region_id, date_id
            "#,
        );

        for row in qb.build().fetch_all(&mut *conn).await? {
            touched.insert((row.try_get("region_id")?, row.try_get("date_id")?));
        }
    }

    Ok(touched)
}

/// Upsert `rows` and maintain the star schema, all on the caller's transaction
pub async fn load_rows(conn: &mut PgConnection, rows: &[PriceRow]) -> Result<LoadOutcome> {
    if rows.is_empty() {
        return Ok(LoadOutcome::default());
    }

    let rows = dedupe_last_wins(rows);
    let stats = upsert_prices(&mut *conn, &rows).await?;

    let dates: BTreeSet<NaiveDate> = rows.iter().map(PriceRow::trading_date).collect();
    ensure_dimension_dates(&mut *conn, &dates).await?;
    let touched = promote_to_fact(&mut *conn, &rows).await?;

    Ok(LoadOutcome { stats, touched })
}
