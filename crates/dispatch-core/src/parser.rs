//! MMS CSV parsing for the region price table
//!
//! MMS files interleave several tables. Each table is announced by an `I` row carrying its
//! column names, followed by `D` rows with values in the same positions; `C` rows are
//! comments. Only tables that carry a settlement time, a region and a price are read.

use crate::error::Result;
use chrono::{NaiveDate, NaiveDateTime};
use csv::{ReaderBuilder, StringRecord};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Read;
use thiserror::Error;

const SETTLEMENT_COLUMNS: [&str; 3] = ["SETTLEMENTDATE", "DATETIME", "INTERVALDATETIME"];
const REGION_COLUMNS: [&str; 2] = ["REGIONID", "REGION"];
const PRICE_COLUMNS: [&str; 3] = ["RRP", "REGIONPRICE", "PRICE"];
const RUN_NO_COLUMN: &str = "RUNNO";
const INTERVENTION_COLUMN: &str = "INTERVENTION";
const MAX_REGION_LEN: usize = 16;

const TIMESTAMP_FORMATS: [&str; 3] = ["%Y/%m/%d %H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];

/// One validated region price observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRow {
    pub settlement_date: NaiveDateTime,
    pub region_id: String,
    pub rrp: f64,
    pub intervention: i32,
    pub run_no: i32,
}

/// Natural key of a price row
pub type PriceKey = (NaiveDateTime, String, i32, i32);

impl PriceRow {
    pub fn key(&self) -> PriceKey {
        (
            self.settlement_date,
            self.region_id.clone(),
            self.run_no,
            self.intervention,
        )
    }

    pub fn trading_date(&self) -> NaiveDate {
        self.settlement_date.date()
    }
}

/// Why a data row was excluded
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RowRejection {
    #[error("missing required field {0}")]
    MissingField(&'static str),

    #[error("invalid number in {field}: '{value}'")]
    InvalidNumber { field: &'static str, value: String },

    #[error("invalid timestamp '{0}'")]
    InvalidTimestamp(String),

    #[error("invalid region id '{0}'")]
    InvalidRegion(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RejectedRow {
    pub line: u64,
    pub reason: RowRejection,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedPrices {
    pub rows: Vec<PriceRow>,
    pub rejected: Vec<RejectedRow>,
}

impl ParsedPrices {
    pub fn extend(&mut self, other: ParsedPrices) {
        self.rows.extend(other.rows);
        self.rejected.extend(other.rejected);
    }

    pub fn invalid_count(&self) -> usize {
        self.rejected.len()
    }
}

/// Column positions of a price table
#[derive(Debug, Clone, Copy, PartialEq)]
struct PriceColumns {
    settlement: usize,
    region: usize,
    price: usize,
    run_no: Option<usize>,
    intervention: Option<usize>,
}

impl PriceColumns {
    fn detect(header: &StringRecord) -> Option<Self> {
        let mut positions: HashMap<String, usize> = HashMap::new();
        // Marker, report, table and version precede the column names
        for (idx, name) in header.iter().enumerate().skip(4) {
            let key = normalize_header(name);
            if !key.is_empty() {
                positions.entry(key).or_insert(idx);
            }
        }

        let pick = |candidates: &[&str]| candidates.iter().find_map(|c| positions.get(*c).copied());

        Some(Self {
            settlement: pick(&SETTLEMENT_COLUMNS)?,
            region: pick(&REGION_COLUMNS)?,
            price: pick(&PRICE_COLUMNS)?,
            run_no: pick(&[RUN_NO_COLUMN]),
            intervention: pick(&[INTERVENTION_COLUMN]),
        })
    }

    fn extract(&self, record: &StringRecord) -> std::result::Result<PriceRow, RowRejection> {
        let settlement = field(record, self.settlement)
            .ok_or(RowRejection::MissingField("settlement_date"))?;
        let region_id = field(record, self.region).ok_or(RowRejection::MissingField("region_id"))?;
        let price = field(record, self.price).ok_or(RowRejection::MissingField("rrp"))?;
        if !is_region_id(region_id) {
            return Err(RowRejection::InvalidRegion(region_id.to_string()));
        }

        let settlement_date = parse_timestamp(settlement)
            .ok_or_else(|| RowRejection::InvalidTimestamp(settlement.to_string()))?;

        let rrp = price
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| RowRejection::InvalidNumber {
                field: "rrp",
                value: price.to_string(),
            })?;

        Ok(PriceRow {
            settlement_date,
            region_id: region_id.to_string(),
            rrp,
            intervention: optional_int(record, self.intervention, "intervention")?,
            run_no: optional_int(record, self.run_no, "run_no")?,
        })
    }
}

/// Region ids name partition directories, so only short ASCII identifiers pass: `NSW1`, `SNOWY1`
pub fn is_region_id(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= MAX_REGION_LEN
        && value.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// Trimmed, unquoted, non-empty value at `idx`
fn field(record: &StringRecord, idx: usize) -> Option<&str> {
    record
        .get(idx)
        .map(|v| v.trim().trim_matches('"').trim())
        .filter(|v| !v.is_empty())
}

fn optional_int(
    record: &StringRecord,
    idx: Option<usize>,
    name: &'static str,
) -> std::result::Result<i32, RowRejection> {
    match idx.and_then(|i| field(record, i)) {
        None => Ok(0),
        Some(value) => value.parse::<i32>().map_err(|_| RowRejection::InvalidNumber {
            field: name,
            value: value.to_string(),
        }),
    }
}

/// Canonical form of a column name: `"Region_Id "` -> `REGIONID`
pub fn normalize_header(name: &str) -> String {
    name.trim()
        .trim_matches('"')
        .chars()
        .filter(|c| *c != ' ' && *c != '_')
        .flat_map(char::to_uppercase)
        .collect()
}

pub fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim().trim_matches('"');
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
}

/// Parse every price table in an MMS CSV stream.
///
/// Malformed data rows are collected in [`ParsedPrices::rejected`]; only an unreadable
/// stream is an error.
pub fn parse_mms<R: Read>(reader: R) -> Result<ParsedPrices> {
    let mut csv = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(reader);

    let mut schemas: HashMap<(String, String), Option<PriceColumns>> = HashMap::new();
    let mut parsed = ParsedPrices::default();
    let mut record = StringRecord::new();

    while csv.read_record(&mut record)? {
        if record.len() < 2 {
            continue;
        }

        let marker = record
            .get(0)
            .unwrap_or_default()
            .trim_start_matches('\u{feff}')
            .trim()
            .to_ascii_uppercase();
        let table = (
            record.get(1).unwrap_or_default().trim().to_ascii_uppercase(),
            record.get(2).unwrap_or_default().trim().to_ascii_uppercase(),
        );

        match marker.as_str() {
            "I" => {
                schemas.insert(table, PriceColumns::detect(&record));
            }
            "D" => {
                let Some(Some(columns)) = schemas.get(&table) else {
                    continue;
                };
                match columns.extract(&record) {
                    Ok(row) => parsed.rows.push(row),
                    Err(reason) => {
                        let line = record.position().map(|p| p.line()).unwrap_or_default();
                        tracing::debug!(line, reason = %reason, "Rejected price row");
                        parsed.rejected.push(RejectedRow { line, reason });
                    }
                }
            }
            _ => {}
        }
    }

    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DISPATCHIS: &str = "\
C,NEMP.WORLD,DISPATCHIS,AEMO,PUBLIC,2026/02/05,21:05:14,0000000500000001,DISPATCHIS,0000000500000001
I,DISPATCH,CASESOLUTION,2,SETTLEMENTDATE,RUNNO,INTERVENTION,CASESUBTYPE,SOLUTIONSTATUS
D,DISPATCH,CASESOLUTION,2,\"2026/02/05 21:10:00\",1,0,,0
I,DISPATCH,PRICE,5,SETTLEMENTDATE,RUNNO,REGIONID,DISPATCHINTERVAL,INTERVENTION,RRP,EEP
D,DISPATCH,PRICE,5,\"2026/02/05 21:10:00\",1,NSW1,20260205254,0,95.47,0
D,DISPATCH,PRICE,5,\"2026/02/05 21:10:00\",1,QLD1,20260205254,0,-1000.50,0
D,DISPATCH,PRICE,5,\"2026/02/05 21:10:00\",1,SA1,20260205254,0,,0
C,\"END OF REPORT\",12
";

    #[test]
    fn test_parses_price_table_only() {
        let parsed = parse_mms(DISPATCHIS.as_bytes()).unwrap();

        assert_eq!(parsed.rows.len(), 2);
        assert_eq!(parsed.rows[0].region_id, "NSW1");
        assert_eq!(parsed.rows[0].rrp, 95.47);
        assert_eq!(parsed.rows[0].run_no, 1);
        assert_eq!(parsed.rows[0].intervention, 0);
        assert_eq!(
            parsed.rows[0].settlement_date,
            NaiveDate::from_ymd_opt(2026, 2, 5)
                .unwrap()
                .and_hms_opt(21, 10, 0)
                .unwrap()
        );
        assert_eq!(parsed.rows[1].rrp, -1000.50);
    }

    #[test]
    fn test_missing_price_is_rejected_not_fatal() {
        let parsed = parse_mms(DISPATCHIS.as_bytes()).unwrap();
        assert_eq!(parsed.invalid_count(), 1);
        assert_eq!(parsed.rejected[0].reason, RowRejection::MissingField("rrp"));
        assert_eq!(parsed.rejected[0].line, 7);
    }

    #[test]
    fn test_header_variants_and_defaults() {
        let csv = "\u{feff}I,P5MIN,REGIONSOLUTION,1,\"Interval_DateTime\",\"Region Id\",Region_Price\n\
                   D,P5MIN,REGIONSOLUTION,1,2026-02-05 21:15:00,VIC1,42\n";
        let parsed = parse_mms(csv.as_bytes()).unwrap();

        assert_eq!(parsed.rows.len(), 1);
        let row = &parsed.rows[0];
        assert_eq!(row.region_id, "VIC1");
        assert_eq!(row.rrp, 42.0);
        assert_eq!((row.run_no, row.intervention), (0, 0));
    }

    #[test]
    fn test_invalid_values() {
        let csv = "I,DISPATCH,PRICE,5,SETTLEMENTDATE,RUNNO,REGIONID,INTERVENTION,RRP\n\
                   D,DISPATCH,PRICE,5,2026/02/05 21:10:00,1,NSW1,0,abc\n\
                   D,DISPATCH,PRICE,5,2026/02/05 21:10:00,1,NSW1,0,NaN\n\
                   D,DISPATCH,PRICE,5,05/02/2026 21:10,1,NSW1,0,10\n\
                   D,DISPATCH,PRICE,5,2026/02/05 21:10:00,x,NSW1,0,10\n\
                   D,DISPATCH,PRICE,5,2026/02/05 21:10:00,1\n";
        let parsed = parse_mms(csv.as_bytes()).unwrap();

        assert!(parsed.rows.is_empty());
        let reasons: Vec<_> = parsed.rejected.iter().map(|r| r.reason.clone()).collect();
        assert!(matches!(reasons[0], RowRejection::InvalidNumber { field: "rrp", .. }));
        assert!(matches!(reasons[1], RowRejection::InvalidNumber { field: "rrp", .. }));
        assert!(matches!(reasons[2], RowRejection::InvalidTimestamp(_)));
        assert!(matches!(reasons[3], RowRejection::InvalidNumber { field: "run_no", .. }));
        assert_eq!(reasons[4], RowRejection::MissingField("region_id"));
    }

    #[test]
    fn test_region_id_must_be_a_plain_identifier() {
        let csv = "I,DISPATCH,PRICE,5,SETTLEMENTDATE,RUNNO,REGIONID,INTERVENTION,RRP\n\
                   D,DISPATCH,PRICE,5,2026/02/05 21:10:00,1,../../etc,0,10\n\
                   D,DISPATCH,PRICE,5,2026/02/05 21:10:00,1,NSW1/..,0,10\n\
                   D,DISPATCH,PRICE,5,2026/02/05 21:10:00,1,SA1,0,10\n";
        let parsed = parse_mms(csv.as_bytes()).unwrap();

        assert_eq!(parsed.rows.len(), 1);
        assert_eq!(parsed.rows[0].region_id, "SA1");
        assert_eq!(
            parsed.rejected[0].reason,
            RowRejection::InvalidRegion("../../etc".to_string())
        );
        assert!(matches!(parsed.rejected[1].reason, RowRejection::InvalidRegion(_)));

        assert!(is_region_id("SNOWY1"));
        assert!(!is_region_id(""));
        assert!(!is_region_id("NSW 1"));
        assert!(!is_region_id(&"A".repeat(17)));
    }

    #[test]
    fn test_data_before_schema_is_ignored() {
        let csv = "D,DISPATCH,PRICE,5,2026/02/05 21:10:00,1,NSW1,0,10\n";
        let parsed = parse_mms(csv.as_bytes()).unwrap();
        assert!(parsed.rows.is_empty());
        assert!(parsed.rejected.is_empty());
    }

    #[test]
    fn test_normalize_header() {
        assert_eq!(normalize_header(" \"Region_Id\" "), "REGIONID");
        assert_eq!(normalize_header("interval datetime"), "INTERVALDATETIME");
    }

    #[test]
    fn test_parse_timestamp_formats() {
        assert!(parse_timestamp("2026/02/05 21:10:00").is_some());
        assert!(parse_timestamp("\"2026-02-05 21:10:00\"").is_some());
        assert!(parse_timestamp("2026-02-05").is_none());
    }
}
