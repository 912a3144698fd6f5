//! Clean CSV and Parquet file formats
//!
//! Batch runs write one clean CSV per run; the columnar step turns those into a
//! hive-partitioned Parquet tree `region_id=<R>/date=<YYYY-MM-DD>/part-<run>.parquet`.
//! The rollup step exports daily summaries as one Parquet file.
//! Every file is written to a temporary name and renamed into place.

use crate::curated::DailyRollupRow;
use crate::error::{PipelineError, Result};
use crate::loader::dedupe_last_wins;
use crate::parser::{is_region_id, parse_timestamp, PriceRow};
use arrow::array::{
    Array, Date32Array, Float64Array, Int32Array, Int64Array, StringArray, TimestampMillisecondArray,
};
use arrow::datatypes::{DataType, Date32Type, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, NaiveDate};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use parquet::format::KeyValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

const CLEAN_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// File name of the daily rollup export under the curated directory
pub const DAILY_ROLLUP_FILE: &str = "dispatch_price_daily_region.parquet";

/// Row layout of a clean CSV
#[derive(Debug, Serialize, Deserialize)]
struct CleanRecord {
    settlement_date: String,
    region_id: String,
    rrp: f64,
    intervention: i32,
    run_no: i32,
}

impl From<&PriceRow> for CleanRecord {
    fn from(row: &PriceRow) -> Self {
        Self {
            settlement_date: row.settlement_date.format(CLEAN_TIMESTAMP_FORMAT).to_string(),
            region_id: row.region_id.clone(),
            rrp: row.rrp,
            intervention: row.intervention,
            run_no: row.run_no,
        }
    }
}

/// Clean CSV file name of a batch run
pub fn clean_csv_name(run_id: Uuid) -> String {
    format!("dispatch_price_clean_{}.csv", run_id)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write rows with a header line, replacing `path` atomically
pub fn write_clean_csv(path: &Path, rows: &[PriceRow]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp = tmp_path(path);
    {
        let mut writer = csv::Writer::from_path(&tmp)?;
        for row in rows {
            writer.serialize(CleanRecord::from(row))?;
        }
        writer.flush()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

pub fn read_clean_csv(path: &Path) -> Result<Vec<PriceRow>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut rows = Vec::new();

    for record in reader.deserialize::<CleanRecord>() {
        let record = record?;
        let settlement_date = parse_timestamp(&record.settlement_date).ok_or_else(|| {
            PipelineError::config(format!(
                "{}: invalid settlement_date '{}'",
                path.display(),
                record.settlement_date
            ))
        })?;
        rows.push(PriceRow {
            settlement_date,
            region_id: record.region_id,
            rrp: record.rrp,
            intervention: record.intervention,
            run_no: record.run_no,
        });
    }

    Ok(rows)
}

/// Group rows by `(region_id, trading date)` after collapsing duplicate keys (last wins).
/// Rows inside a partition are ordered by settlement time, run and intervention.
pub fn partition_rows(rows: &[PriceRow]) -> BTreeMap<(String, NaiveDate), Vec<PriceRow>> {
    let mut partitions: BTreeMap<(String, NaiveDate), Vec<PriceRow>> = BTreeMap::new();

    for row in dedupe_last_wins(rows) {
        partitions
            .entry((row.region_id.clone(), row.trading_date()))
            .or_default()
            .push(row);
    }

    for rows in partitions.values_mut() {
        rows.sort_by(|a, b| {
            (a.settlement_date, a.run_no, a.intervention).cmp(&(b.settlement_date, b.run_no, b.intervention))
        });
    }

    partitions
}

/// Directory of one hive partition. Fails for a region id that is not a plain identifier.
pub fn partition_dir(root: &Path, region_id: &str, date: NaiveDate) -> Result<PathBuf> {
    if !is_region_id(region_id) {
        return Err(PipelineError::InvalidRegion(region_id.to_string()));
    }
    Ok(root
        .join(format!("region_id={}", region_id))
        .join(format!("date={}", date.format("%Y-%m-%d"))))
}

fn price_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new(
            "settlement_date",
            DataType::Timestamp(TimeUnit::Millisecond, None),
            false,
        ),
        Field::new("region_id", DataType::Utf8, false),
        Field::new("rrp", DataType::Float64, false),
        Field::new("intervention", DataType::Int32, false),
        Field::new("run_no", DataType::Int32, false),
    ]))
}

fn writer_properties() -> WriterProperties {
    let created_by = KeyValue {
        key: "created_by".to_string(),
        value: Some("dispatch-etl".to_string()),
    };
    WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .set_key_value_metadata(Some(vec![created_by]))
        .build()
}

/// Encode rows as a single Parquet row group
pub fn encode_parquet(rows: &[PriceRow]) -> Result<Vec<u8>> {
    let schema = price_schema();

    let settlement = TimestampMillisecondArray::from(
        rows.iter()
            .map(|r| r.settlement_date.and_utc().timestamp_millis())
            .collect::<Vec<_>>(),
    );
    let regions = StringArray::from(rows.iter().map(|r| r.region_id.as_str()).collect::<Vec<_>>());
    let prices = Float64Array::from(rows.iter().map(|r| r.rrp).collect::<Vec<_>>());
    let interventions = Int32Array::from(rows.iter().map(|r| r.intervention).collect::<Vec<_>>());
    let run_nos = Int32Array::from(rows.iter().map(|r| r.run_no).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(settlement),
            Arc::new(regions),
            Arc::new(prices),
            Arc::new(interventions),
            Arc::new(run_nos),
        ],
    )?;

    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, schema, Some(writer_properties()))?;
    writer.write(&batch)?;
    writer.close()?;

    Ok(buffer)
}

/// Write one partition file for `run_id` and return its path
pub fn write_partition(
    root: &Path,
    region_id: &str,
    date: NaiveDate,
    run_id: Uuid,
    rows: &[PriceRow],
) -> Result<PathBuf> {
    let dir = partition_dir(root, region_id, date)?;
    std::fs::create_dir_all(&dir)?;

    let path = dir.join(format!("part-{}.parquet", run_id));
    let tmp = tmp_path(&path);
    std::fs::write(&tmp, encode_parquet(rows)?)?;
    std::fs::rename(&tmp, &path)?;

    Ok(path)
}

/// Decode a partition file back into rows
pub fn read_parquet(path: &Path) -> Result<Vec<PriceRow>> {
    let file = std::fs::File::open(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
    let mut rows = Vec::new();

    for batch in reader {
        let batch = batch?;
        let settlement = column::<TimestampMillisecondArray>(&batch, "settlement_date")?;
        let regions = column::<StringArray>(&batch, "region_id")?;
        let prices = column::<Float64Array>(&batch, "rrp")?;
        let interventions = column::<Int32Array>(&batch, "intervention")?;
        let run_nos = column::<Int32Array>(&batch, "run_no")?;

        for i in 0..batch.num_rows() {
            let settlement_date = DateTime::from_timestamp_millis(settlement.value(i))
                .map(|dt| dt.naive_utc())
                .ok_or_else(|| PipelineError::config("settlement_date out of range"))?;
            rows.push(PriceRow {
                settlement_date,
                region_id: regions.value(i).to_string(),
                rrp: prices.value(i),
                intervention: interventions.value(i),
                run_no: run_nos.value(i),
            });
        }
    }

    Ok(rows)
}

fn daily_rollup_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("region_id", DataType::Utf8, false),
        Field::new("date", DataType::Date32, false),
        Field::new("intervals", DataType::Int64, false),
        Field::new("rrp_avg", DataType::Float64, false),
        Field::new("rrp_min", DataType::Float64, false),
        Field::new("rrp_max", DataType::Float64, false),
        Field::new("rrp_std", DataType::Float64, true),
    ]))
}

/// Write the daily rollup export to `path`, replacing any previous file
pub fn write_daily_rollup(path: &Path, rows: &[DailyRollupRow]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let schema = daily_rollup_schema();

    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(StringArray::from(rows.iter().map(|r| r.region_id.as_str()).collect::<Vec<_>>())),
            Arc::new(Date32Array::from(
                rows.iter().map(|r| Date32Type::from_naive_date(r.date)).collect::<Vec<_>>(),
            )),
            Arc::new(Int64Array::from(rows.iter().map(|r| r.intervals).collect::<Vec<_>>())),
            Arc::new(Float64Array::from(rows.iter().map(|r| r.rrp_avg).collect::<Vec<_>>())),
            Arc::new(Float64Array::from(rows.iter().map(|r| r.rrp_min).collect::<Vec<_>>())),
            Arc::new(Float64Array::from(rows.iter().map(|r| r.rrp_max).collect::<Vec<_>>())),
            Arc::new(Float64Array::from(rows.iter().map(|r| r.rrp_std).collect::<Vec<_>>())),
        ],
    )?;

    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, schema, Some(writer_properties()))?;
    writer.write(&batch)?;
    writer.close()?;

    let tmp = tmp_path(path);
    std::fs::write(&tmp, buffer)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

pub fn read_daily_rollup(path: &Path) -> Result<Vec<DailyRollupRow>> {
    let file = std::fs::File::open(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
    let mut rows = Vec::new();

    for batch in reader {
        let batch = batch?;
        let regions = column::<StringArray>(&batch, "region_id")?;
        let dates = column::<Date32Array>(&batch, "date")?;
        let intervals = column::<Int64Array>(&batch, "intervals")?;
        let avgs = column::<Float64Array>(&batch, "rrp_avg")?;
        let mins = column::<Float64Array>(&batch, "rrp_min")?;
        let maxs = column::<Float64Array>(&batch, "rrp_max")?;
        let stds = column::<Float64Array>(&batch, "rrp_std")?;

        for i in 0..batch.num_rows() {
            rows.push(DailyRollupRow {
                region_id: regions.value(i).to_string(),
                date: Date32Type::to_naive_date(dates.value(i)),
                intervals: intervals.value(i),
                rrp_avg: avgs.value(i),
                rrp_min: mins.value(i),
                rrp_max: maxs.value(i),
                rrp_std: stds.is_valid(i).then(|| stds.value(i)),
            });
        }
    }

    Ok(rows)
}

fn column<'a, T: Array + 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<T>())
        .ok_or_else(|| PipelineError::config(format!("parquet column '{}' missing or mistyped", name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(ts: &str, region: &str, rrp: f64) -> PriceRow {
        PriceRow {
            settlement_date: parse_timestamp(ts).unwrap(),
            region_id: region.to_string(),
            rrp,
            intervention: 0,
            run_no: 1,
        }
    }

    #[test]
    fn test_clean_csv_preserves_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(clean_csv_name(Uuid::nil()));
        let rows = vec![
            row("2026/02/05 21:10:00", "NSW1", 95.47),
            row("2026/02/05 21:10:00", "SA1", -1000.5),
        ];

        write_clean_csv(&path, &rows).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("settlement_date,region_id,rrp,intervention,run_no\n"));
        assert!(text.contains("2026-02-05 21:10:00,SA1,-1000.5,0,1"));
        assert!(!tmp_path(&path).exists());

        assert_eq!(read_clean_csv(&path).unwrap(), rows);
    }

    #[test]
    fn test_partitions_by_region_and_day_last_wins() {
        let rows = vec![
            row("2026/02/05 23:55:00", "NSW1", 1.0),
            row("2026/02/06 00:00:00", "NSW1", 2.0),
            row("2026/02/05 21:10:00", "NSW1", 3.0),
            row("2026/02/05 23:55:00", "NSW1", 4.0),
            row("2026/02/05 21:10:00", "VIC1", 5.0),
        ];
        let partitions = partition_rows(&rows);

        let keys: Vec<_> = partitions
            .keys()
            .map(|(r, d)| format!("{}/{}", r, d))
            .collect();
        assert_eq!(keys, ["NSW1/2026-02-05", "NSW1/2026-02-06", "VIC1/2026-02-05"]);

        let nsw = &partitions[&("NSW1".to_string(), NaiveDate::from_ymd_opt(2026, 2, 5).unwrap())];
        let prices: Vec<f64> = nsw.iter().map(|r| r.rrp).collect();
        assert_eq!(prices, [3.0, 4.0]);
    }

    #[test]
    fn test_partition_file_layout_and_contents() {
        let dir = tempfile::tempdir().unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 2, 5).unwrap();
        let rows = vec![
            row("2026/02/05 21:10:00", "QLD1", 10.0),
            row("2026/02/05 21:15:00", "QLD1", 12.5),
        ];

        let path = write_partition(dir.path(), "QLD1", date, Uuid::nil(), &rows).unwrap();
        assert_eq!(
            path,
            dir.path()
                .join("region_id=QLD1")
                .join("date=2026-02-05")
                .join(format!("part-{}.parquet", Uuid::nil()))
        );
        assert_eq!(read_parquet(&path).unwrap(), rows);
    }

    #[test]
    fn test_daily_rollup_export() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("curated").join(DAILY_ROLLUP_FILE);
        let rows = vec![
            DailyRollupRow {
                region_id: "NSW1".to_string(),
                date: NaiveDate::from_ymd_opt(2026, 2, 5).unwrap(),
                intervals: 288,
                rrp_avg: 95.5,
                rrp_min: -40.0,
                rrp_max: 300.0,
                rrp_std: Some(12.25),
            },
            DailyRollupRow {
                region_id: "TAS1".to_string(),
                date: NaiveDate::from_ymd_opt(2026, 2, 5).unwrap(),
                intervals: 1,
                rrp_avg: 10.0,
                rrp_min: 10.0,
                rrp_max: 10.0,
                rrp_std: None,
            },
        ];

        write_daily_rollup(&path, &rows).unwrap();
        assert!(!tmp_path(&path).exists());
        assert_eq!(read_daily_rollup(&path).unwrap(), rows);

        // A second export replaces the first
        write_daily_rollup(&path, &rows[..1]).unwrap();
        assert_eq!(read_daily_rollup(&path).unwrap().len(), 1);
    }

    #[test]
    fn test_partition_rejects_unsafe_region() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("curated");
        let date = NaiveDate::from_ymd_opt(2026, 2, 5).unwrap();
        let rows = vec![row("2026/02/05 21:10:00", "../escape", 1.0)];

        let err = write_partition(&root, "../escape", date, Uuid::nil(), &rows).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidRegion(_)));
        assert!(partition_dir(&root, "NSW1/..", date).is_err());
        assert!(!root.exists());
        assert!(!dir.path().join("escape").exists());
    }
}
