//! Named incremental cursors
//!
//! A cursor is the `YYYYMMDDHHMM` timestamp embedded in NEMweb zip names. Values are stored
//! as text in `watermark_state`; readers also accept ISO timestamps written by older tooling.

use crate::error::{PipelineError, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgConnection;

/// Watermark of the download step
pub const INGEST_WATERMARK: &str = "dispatch_price_zip_ts";

/// Watermark of the batch load step
pub const PROCESS_WATERMARK: &str = "dispatch_price_processed_ts";

const CURSOR_FORMAT: &str = "%Y%m%d%H%M";
const ISO_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ZipCursor(NaiveDateTime);

impl ZipCursor {
    pub fn from_utc(at: DateTime<Utc>) -> Self {
        Self(at.naive_utc())
    }

    /// Parse `YYYYMMDDHHMM` or an ISO `YYYY-MM-DD HH:MM[:SS]` value
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();

        if value.len() == 12 && value.bytes().all(|b| b.is_ascii_digit()) {
            return NaiveDateTime::parse_from_str(&format!("{}00", value), "%Y%m%d%H%M%S")
                .map(Self)
                .map_err(|_| PipelineError::InvalidCursor(value.to_string()));
        }

        ISO_FORMATS
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
            .map(Self)
            .ok_or_else(|| PipelineError::InvalidCursor(value.to_string()))
    }
}

impl std::fmt::Display for ZipCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format(CURSOR_FORMAT))
    }
}

impl std::str::FromStr for ZipCursor {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

pub async fn read(conn: &mut PgConnection, name: &str) -> Result<Option<String>> {
    let value: Option<String> =
        sqlx::query_scalar("SELECT value FROM watermark_state WHERE name = $1")
            .bind(name)
            .fetch_optional(conn)
            .await?;

    Ok(value)
}

/// Stored value parsed as a cursor; an unparseable value is an error
pub async fn read_cursor(conn: &mut PgConnection, name: &str) -> Result<Option<ZipCursor>> {
    read(conn, name)
        .await?
        .filter(|v| !v.trim().is_empty())
        .map(|v| ZipCursor::parse(&v))
        .transpose()
}

/// Upsert the cursor. Callers only advance after the work it covers has committed.
pub async fn advance(conn: &mut PgConnection, name: &str, cursor: ZipCursor) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO watermark_state (name, value, updated_at)
        VALUES ($1, $2, NOW())
        ON CONFLICT (name) DO UPDATE
        SET value = EXCLUDED.value, updated_at = NOW()
        "#,
    )
    .bind(name)
    .bind(cursor.to_string())
    .execute(conn)
    .await?;

    tracing::info!(watermark = name, value = %cursor, "Watermark advanced");
    Ok(())
}

/// Where a watermark may move after a run.
///
/// Takes the newest completed cursor strictly below the earliest failure of the run and
/// returns it only if it moves the watermark forward.
pub fn next_watermark(
    current: Option<ZipCursor>,
    completed: &[ZipCursor],
    earliest_failure: Option<ZipCursor>,
) -> Option<ZipCursor> {
    let candidate = completed
        .iter()
        .copied()
        .filter(|c| earliest_failure.map_or(true, |failed| *c < failed))
        .max()?;

    match current {
        Some(current) if candidate <= current => None,
        _ => Some(candidate),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cursor(s: &str) -> ZipCursor {
        ZipCursor::parse(s).unwrap()
    }

    #[test]
    fn test_parse_formats() {
        let compact = cursor("202602052110");
        assert_eq!(compact.to_string(), "202602052110");
        assert_eq!(cursor("2026-02-05 21:10:00"), compact);
        assert_eq!(cursor("2026-02-05T21:10:00"), compact);
        assert_eq!(cursor(" 2026-02-05 21:10 "), compact);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            ZipCursor::parse("yesterday"),
            Err(PipelineError::InvalidCursor(_))
        ));
        assert!(ZipCursor::parse("202613011200").is_err());
        assert!(ZipCursor::parse("2026020521").is_err());
    }

    #[test]
    fn test_ordering_follows_time() {
        assert!(cursor("202602052105") < cursor("202602052110"));
        assert!(cursor("202512312355") < cursor("202601010000"));
    }

    #[test]
    fn test_next_watermark_moves_forward_only() {
        let done = [cursor("202602050005"), cursor("202602050010")];
        assert_eq!(next_watermark(None, &done, None), Some(cursor("202602050010")));
        assert_eq!(
            next_watermark(Some(cursor("202602050010")), &done, None),
            None
        );
        assert_eq!(next_watermark(Some(cursor("202602050000")), &[], None), None);
    }

    #[test]
    fn test_next_watermark_capped_below_failure() {
        let done = [
            cursor("202602050005"),
            cursor("202602050015"),
            cursor("202602050020"),
        ];
        let failed = Some(cursor("202602050010"));
        assert_eq!(
            next_watermark(None, &done, failed),
            Some(cursor("202602050005"))
        );
        assert_eq!(
            next_watermark(Some(cursor("202602050005")), &done, failed),
            None
        );
        assert_eq!(next_watermark(None, &[cursor("202602050010")], failed), None);
    }
}
