use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use bus_stream_core::contract::{select_latest, DimensionFilter, MeasureValue, TimeSeriesRecord};
use bus_stream_core::naming::{batch_object_key, table_prefix, TableKind};
use chrono::{DateTime, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to encode batch for {table}: {reason}")]
    Encode { table: TableKind, reason: String },
    #[error("failed to write batch for {table}: {reason}")]
    Write { table: TableKind, reason: String },
    #[error("{rejected} of {attempted} records rejected by {table}: {reason}")]
    Rejected {
        table: TableKind,
        attempted: usize,
        rejected: usize,
        reason: String,
    },
    #[error("failed to query {table}: {reason}")]
    Query { table: TableKind, reason: String },
}

/// Time-series rows in, point lookups out. Feeders call `write_batch` at
/// most once per tick; the queries serve startup restore.
#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    /// Returns the number of records accepted.
    async fn write_batch(
        &self,
        table: TableKind,
        records: &[TimeSeriesRecord],
    ) -> Result<usize, StoreError>;

    async fn query_latest(
        &self,
        table: TableKind,
        filter: &DimensionFilter,
    ) -> Result<Option<TimeSeriesRecord>, StoreError>;

    async fn query_at_or_before(
        &self,
        table: TableKind,
        filter: &DimensionFilter,
        at: DateTime<Utc>,
    ) -> Result<Option<TimeSeriesRecord>, StoreError>;
}

/// Local store writing one Parquet file per batch under
/// `<root>/table=<table>/batch-<ms>.parquet`.
#[derive(Debug, Clone)]
pub struct ParquetDirectoryStore {
    root: PathBuf,
}

impl ParquetDirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn next_batch_path(&self, table: TableKind, time_ms: i64) -> PathBuf {
        let mut sequence = 0u32;
        loop {
            let path = self.root.join(batch_object_key(table, time_ms, sequence));
            if !path.exists() {
                return path;
            }
            sequence += 1;
        }
    }

    /// Reads every batch of `table` and picks the newest matching row.
    fn scan_latest(
        &self,
        table: TableKind,
        filter: &DimensionFilter,
        at_or_before_ms: Option<i64>,
    ) -> Result<Option<TimeSeriesRecord>, StoreError> {
        let partition = self.root.join(table_prefix(table));
        if !partition.is_dir() {
            return Ok(None);
        }
        let query_error = |reason: String| StoreError::Query { table, reason };
        let entries = fs::read_dir(&partition)
            .map_err(|error| query_error(format!("failed to list {}: {error}", partition.display())))?;

        let mut best: Option<TimeSeriesRecord> = None;
        for entry in entries {
            let path = entry
                .map_err(|error| query_error(format!("failed to list {}: {error}", partition.display())))?
                .path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("parquet") {
                continue;
            }
            let records = decode_records_parquet(&path).map_err(query_error)?;
            let candidate = select_latest(&records, filter, at_or_before_ms);
            if let Some(candidate) = candidate {
                let newer = best
                    .as_ref()
                    .map_or(true, |current| candidate.time_ms > current.time_ms);
                if newer {
                    best = Some(candidate.clone());
                }
            }
        }
        Ok(best)
    }

    fn write_file(&self, table: TableKind, records: &[TimeSeriesRecord]) -> Result<usize, StoreError> {
        let body = encode_records_parquet(records)
            .map_err(|reason| StoreError::Encode { table, reason })?;

        let time_ms = records.iter().map(|r| r.time_ms).max().unwrap_or_default();
        let path = self.next_batch_path(table, time_ms);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|error| StoreError::Write {
                table,
                reason: format!("failed to create {}: {error}", parent.display()),
            })?;
        }
        fs::write(&path, body).map_err(|error| StoreError::Write {
            table,
            reason: format!("failed to write {}: {error}", path.display()),
        })?;
        Ok(records.len())
    }

    /// Runs the file scan on the blocking pool.
    async fn query_blocking(
        &self,
        table: TableKind,
        filter: &DimensionFilter,
        at_or_before_ms: Option<i64>,
    ) -> Result<Option<TimeSeriesRecord>, StoreError> {
        let store = self.clone();
        let filter = filter.clone();
        tokio::task::spawn_blocking(move || store.scan_latest(table, &filter, at_or_before_ms))
            .await
            .map_err(|error| StoreError::Query {
                table,
                reason: format!("scan task failed: {error}"),
            })?
    }
}

#[async_trait]
impl TimeSeriesStore for ParquetDirectoryStore {
    async fn write_batch(
        &self,
        table: TableKind,
        records: &[TimeSeriesRecord],
    ) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        let store = self.clone();
        let records = records.to_vec();
        tokio::task::spawn_blocking(move || store.write_file(table, &records))
            .await
            .map_err(|error| StoreError::Write {
                table,
                reason: format!("write task failed: {error}"),
            })?
    }

    async fn query_latest(
        &self,
        table: TableKind,
        filter: &DimensionFilter,
    ) -> Result<Option<TimeSeriesRecord>, StoreError> {
        self.query_blocking(table, filter, None).await
    }

    async fn query_at_or_before(
        &self,
        table: TableKind,
        filter: &DimensionFilter,
        at: DateTime<Utc>,
    ) -> Result<Option<TimeSeriesRecord>, StoreError> {
        self.query_blocking(table, filter, Some(at.timestamp_millis()))
            .await
    }
}

/// Long layout: one row per (record, measure) so heterogeneous measures share a schema.
pub fn encode_records_parquet(records: &[TimeSeriesRecord]) -> Result<Vec<u8>, String> {
    let schema = Arc::new(Schema::new(vec![
        Field::new("time_ms", DataType::Int64, false),
        Field::new("measure_name", DataType::Utf8, false),
        Field::new("dimensions", DataType::Utf8, false),
        Field::new("measure", DataType::Utf8, false),
        Field::new("measure_type", DataType::Utf8, false),
        Field::new("value_double", DataType::Float64, true),
        Field::new("value_bigint", DataType::Int64, true),
        Field::new("value_varchar", DataType::Utf8, true),
        Field::new("value_boolean", DataType::Boolean, true),
    ]));

    let rows: usize = records.iter().map(|r| r.measures.len()).sum();
    let mut time_ms = Vec::with_capacity(rows);
    let mut measure_name = Vec::with_capacity(rows);
    let mut dimensions = Vec::with_capacity(rows);
    let mut measure = Vec::with_capacity(rows);
    let mut measure_type = Vec::with_capacity(rows);
    let mut value_double = Vec::with_capacity(rows);
    let mut value_bigint = Vec::with_capacity(rows);
    let mut value_varchar = Vec::with_capacity(rows);
    let mut value_boolean = Vec::with_capacity(rows);

    for record in records {
        let dimensions_json = serde_json::to_string(&record.dimensions)
            .map_err(|error| format!("failed to encode dimensions: {error}"))?;
        for (name, value) in &record.measures {
            time_ms.push(record.time_ms);
            measure_name.push(record.measure_name.clone());
            dimensions.push(dimensions_json.clone());
            measure.push(name.clone());
            measure_type.push(value.type_name());
            value_double.push(match value {
                MeasureValue::Double(v) => Some(*v),
                _ => None,
            });
            value_bigint.push(match value {
                MeasureValue::BigInt(v) => Some(*v),
                _ => None,
            });
            value_varchar.push(match value {
                MeasureValue::Varchar(v) => Some(v.clone()),
                _ => None,
            });
            value_boolean.push(match value {
                MeasureValue::Boolean(v) => Some(*v),
                _ => None,
            });
        }
    }

    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(Int64Array::from(time_ms)) as ArrayRef,
            Arc::new(StringArray::from(measure_name)),
            Arc::new(StringArray::from(dimensions)),
            Arc::new(StringArray::from(measure)),
            Arc::new(StringArray::from(measure_type)),
            Arc::new(Float64Array::from(value_double)),
            Arc::new(Int64Array::from(value_bigint)),
            Arc::new(StringArray::from(value_varchar)),
            Arc::new(BooleanArray::from(value_boolean)),
        ],
    )
    .map_err(|error| format!("failed to build record batch: {error}"))?;

    let props = WriterProperties::builder().build();
    let mut writer = ArrowWriter::try_new(Vec::new(), schema, Some(props))
        .map_err(|error| error.to_string())?;
    writer
        .write(&batch)
        .map_err(|error| format!("failed to write parquet batch: {error}"))?;
    writer
        .into_inner()
        .map_err(|error| format!("failed to close parquet writer: {error}"))
}

fn column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T, String> {
    batch
        .column_by_name(name)
        .and_then(|array| array.as_any().downcast_ref::<T>())
        .ok_or_else(|| format!("column '{name}' is missing or has an unexpected type"))
}

/// Reads a file written by [`encode_records_parquet`], folding measure rows
/// back into one record per (time, measure name, dimensions).
pub fn decode_records_parquet(path: &Path) -> Result<Vec<TimeSeriesRecord>, String> {
    let file = fs::File::open(path)
        .map_err(|error| format!("failed to open {}: {error}", path.display()))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .and_then(|builder| builder.build())
        .map_err(|error| format!("failed to read {}: {error}", path.display()))?;

    let mut records: Vec<TimeSeriesRecord> = Vec::new();
    let mut index: HashMap<(i64, String, String), usize> = HashMap::new();
    for batch in reader {
        let batch = batch.map_err(|error| format!("failed to read {}: {error}", path.display()))?;
        let time_ms = column::<Int64Array>(&batch, "time_ms")?;
        let measure_name = column::<StringArray>(&batch, "measure_name")?;
        let dimensions = column::<StringArray>(&batch, "dimensions")?;
        let measure = column::<StringArray>(&batch, "measure")?;
        let measure_type = column::<StringArray>(&batch, "measure_type")?;
        let value_double = column::<Float64Array>(&batch, "value_double")?;
        let value_bigint = column::<Int64Array>(&batch, "value_bigint")?;
        let value_varchar = column::<StringArray>(&batch, "value_varchar")?;
        let value_boolean = column::<BooleanArray>(&batch, "value_boolean")?;

        for row in 0..batch.num_rows() {
            let value = match measure_type.value(row) {
                "DOUBLE" if value_double.is_valid(row) => MeasureValue::Double(value_double.value(row)),
                "BIGINT" if value_bigint.is_valid(row) => MeasureValue::BigInt(value_bigint.value(row)),
                "VARCHAR" if value_varchar.is_valid(row) => {
                    MeasureValue::Varchar(value_varchar.value(row).to_string())
                }
                "BOOLEAN" if value_boolean.is_valid(row) => {
                    MeasureValue::Boolean(value_boolean.value(row))
                }
                other => return Err(format!("row {row} has no value for type '{other}'")),
            };
            let key = (
                time_ms.value(row),
                measure_name.value(row).to_string(),
                dimensions.value(row).to_string(),
            );
            let slot = match index.get(&key) {
                Some(slot) => *slot,
                None => {
                    let parsed: BTreeMap<String, String> = serde_json::from_str(&key.2)
                        .map_err(|error| format!("invalid dimensions in row {row}: {error}"))?;
                    records.push(TimeSeriesRecord {
                        measure_name: key.1.clone(),
                        time_ms: key.0,
                        dimensions: parsed,
                        measures: BTreeMap::new(),
                    });
                    index.insert(key, records.len() - 1);
                    records.len() - 1
                }
            };
            records[slot]
                .measures
                .insert(measure.value(row).to_string(), value);
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn records() -> Vec<TimeSeriesRecord> {
        let at = Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap();
        vec![
            TimeSeriesRecord::new("bus_state", at)
                .with_dimension("bus_id", "B1")
                .with_measure("passenger_count", 12u32)
                .with_measure("speed_kmh", 24.0)
                .with_measure("direction", "forward"),
            TimeSeriesRecord::new("bus_state", at)
                .with_dimension("bus_id", "B2")
                .with_measure("door_open", true),
        ]
    }

    fn row_count(path: &Path) -> usize {
        let file = fs::File::open(path).expect("open parquet");
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .expect("parquet reader")
            .build()
            .expect("build reader");
        reader
            .map(|batch| batch.expect("record batch").num_rows())
            .sum()
    }

    #[tokio::test]
    async fn writes_one_file_per_batch_under_the_table_partition() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ParquetDirectoryStore::new(dir.path());

        let written = store
            .write_batch(TableKind::BusPositions, &records())
            .await
            .expect("write");
        assert_eq!(written, 2);

        let again = store
            .write_batch(TableKind::BusPositions, &records())
            .await
            .expect("write");
        assert_eq!(again, 2);

        let partition = dir.path().join("table=bus_positions");
        let mut files: Vec<PathBuf> = fs::read_dir(&partition)
            .expect("partition dir")
            .map(|entry| entry.expect("entry").path())
            .collect();
        files.sort();
        assert_eq!(files.len(), 2);
        // One row per measure.
        assert_eq!(row_count(&files[0]), 4);
    }

    #[test]
    fn decoding_restores_the_written_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("batch.parquet");
        fs::write(&path, encode_records_parquet(&records()).expect("encode")).expect("write");

        let decoded = decode_records_parquet(&path).expect("decode");
        assert_eq!(decoded, records());
    }

    #[tokio::test]
    async fn queries_return_the_newest_matching_row() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ParquetDirectoryStore::new(dir.path());
        let first = Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap();
        for (minute, waiting) in [(0i64, 4u32), (1, 7), (2, 5)] {
            let at = first + chrono::Duration::minutes(minute);
            let batch = [
                TimeSeriesRecord::new("stop_state", at)
                    .with_dimension("stop_id", "S1")
                    .with_measure("waiting_count", waiting),
                TimeSeriesRecord::new("stop_state", at)
                    .with_dimension("stop_id", "S2")
                    .with_measure("waiting_count", 100u32),
            ];
            store
                .write_batch(TableKind::StopPeopleCount, &batch)
                .await
                .expect("write");
        }
        let filter = DimensionFilter::new()
            .measure_name("stop_state")
            .dimension("stop_id", "S1");

        let latest = store
            .query_latest(TableKind::StopPeopleCount, &filter)
            .await
            .expect("query")
            .expect("row");
        assert_eq!(latest.measures["waiting_count"], MeasureValue::BigInt(5));

        let earlier = store
            .query_at_or_before(
                TableKind::StopPeopleCount,
                &filter,
                first + chrono::Duration::seconds(90),
            )
            .await
            .expect("query")
            .expect("row");
        assert_eq!(earlier.measures["waiting_count"], MeasureValue::BigInt(7));

        let none = store
            .query_latest(TableKind::SensorReadings, &filter)
            .await
            .expect("query");
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn repeat_visits_in_one_tick_survive_as_separate_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ParquetDirectoryStore::new(dir.path());
        let at = Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap();
        let visit = |ordinal: u32, boarding: u32| {
            TimeSeriesRecord::new("stop_arrival", at)
                .with_dimension("bus_id", "B1")
                .with_dimension("stop_id", "S2")
                .with_dimension("visit", ordinal.to_string())
                .with_measure("boarding_count", boarding)
        };
        let batch = [visit(0, 3), visit(1, 8)];
        store
            .write_batch(TableKind::BusPositions, &batch)
            .await
            .expect("write");

        let partition = dir.path().join("table=bus_positions");
        let file = fs::read_dir(&partition)
            .expect("partition dir")
            .next()
            .expect("one file")
            .expect("entry")
            .path();
        assert_eq!(decode_records_parquet(&file).expect("decode"), batch.to_vec());

        let second = store
            .query_latest(
                TableKind::BusPositions,
                &DimensionFilter::new().dimension("stop_id", "S2").dimension("visit", "1"),
            )
            .await
            .expect("query")
            .expect("row");
        assert_eq!(second.measures["boarding_count"], MeasureValue::BigInt(8));
    }

    #[tokio::test]
    async fn empty_batch_writes_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ParquetDirectoryStore::new(dir.path());
        let written = store
            .write_batch(TableKind::SensorReadings, &[])
            .await
            .expect("write");
        assert_eq!(written, 0);
        assert!(!dir.path().join("table=sensor_readings").exists());
    }

    #[tokio::test]
    async fn unwritable_root_is_a_store_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, b"x").expect("write blocker");
        let store = ParquetDirectoryStore::new(&blocker);

        let error = store
            .write_batch(TableKind::StopPeopleCount, &records())
            .await
            .expect_err("root is a file");
        assert!(matches!(error, StoreError::Write { .. }));
    }
}
