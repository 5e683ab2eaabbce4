use std::collections::BTreeMap;
use std::process::ExitCode;
use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_sqs::types::MessageAttributeValue;
use aws_sdk_timestreamwrite::types::{
    Dimension, MeasureValue as TimestreamMeasure, MeasureValueType, Record, TimeUnit,
};
use bus_sim_core::catalog::Catalog;
use bus_sim_core::context::SimulationContext;
use bus_stream_core::contract::{DimensionFilter, MeasureValue, StreamEvent, TimeSeriesRecord};
use bus_stream_core::naming::{TableKind, TopicKind};
use bus_stream_lambda::adapters::event_bus::{
    EventPublisher, LogPublisher, NoopPublisher, PublishError,
};
use bus_stream_lambda::adapters::time_series::{
    ParquetDirectoryStore, StoreError, TimeSeriesStore,
};
use bus_stream_lambda::feeder::config::{CatalogSource, EventsTarget, FeederArgs, SinkTarget};
use bus_stream_lambda::feeder::restore::restore_waiting_counts;
use bus_stream_lambda::feeder::Feeder;
use bus_stream_lambda::logging::{log_error, log_info};
use chrono::{DateTime, NaiveDateTime, Utc};
use clap::Parser;
use serde_json::json;
use tokio::sync::watch;

/// WriteRecords accepts at most this many records per call.
const TIMESTREAM_MAX_RECORDS_PER_WRITE: usize = 100;

struct TimestreamStore {
    client: aws_sdk_timestreamwrite::Client,
    query_client: aws_sdk_timestreamquery::Client,
    database: String,
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn quote_identifier(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

/// SQL for the newest row of `table` matching `filter`, optionally bounded in time.
fn latest_row_query(
    database: &str,
    table: TableKind,
    filter: &DimensionFilter,
    at_or_before: Option<DateTime<Utc>>,
) -> String {
    let mut conditions = Vec::new();
    if let Some(name) = filter.measure() {
        conditions.push(format!("measure_name = {}", quote_literal(name)));
    }
    for (name, value) in filter.dimensions() {
        conditions.push(format!("{} = {}", quote_identifier(name), quote_literal(value)));
    }
    if let Some(at) = at_or_before {
        conditions.push(format!("time <= from_milliseconds({})", at.timestamp_millis()));
    }

    let mut sql = format!(
        "SELECT * FROM {}.{}",
        quote_identifier(database),
        quote_identifier(table.as_str())
    );
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
    sql.push_str(" ORDER BY time DESC LIMIT 1");
    sql
}

fn parse_timestream_time(value: &str) -> Result<i64, String> {
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f")
        .map(|time| time.and_utc().timestamp_millis())
        .map_err(|error| format!("invalid time '{value}': {error}"))
}

/// Rebuilds a record from one result row. `columns` pairs each column name
/// with its scalar type; null cells are `None`.
fn decode_row(
    table: TableKind,
    columns: &[(String, String)],
    values: &[Option<&str>],
) -> Result<TimeSeriesRecord, String> {
    let mut record = TimeSeriesRecord {
        measure_name: String::new(),
        time_ms: 0,
        dimensions: BTreeMap::new(),
        measures: BTreeMap::new(),
    };
    for ((name, scalar_type), value) in columns.iter().zip(values) {
        let Some(value) = value else {
            continue;
        };
        match name.as_str() {
            "measure_name" => record.measure_name = value.to_string(),
            "time" => record.time_ms = parse_timestream_time(value)?,
            dimension if table.dimension_names().iter().any(|known| *known == dimension) => {
                record
                    .dimensions
                    .insert(dimension.to_string(), value.to_string());
            }
            measure => {
                let parsed = MeasureValue::parse_rendered(scalar_type, value)
                    .map_err(|error| format!("column '{measure}': {error}"))?;
                record.measures.insert(measure.to_string(), parsed);
            }
        }
    }
    if record.measure_name.is_empty() {
        return Err("row has no measure_name column".to_string());
    }
    Ok(record)
}

impl TimestreamStore {
    async fn query_row(
        &self,
        table: TableKind,
        filter: &DimensionFilter,
        at_or_before: Option<DateTime<Utc>>,
    ) -> Result<Option<TimeSeriesRecord>, StoreError> {
        let sql = latest_row_query(&self.database, table, filter, at_or_before);
        let mut next_token: Option<String> = None;
        // Timestream may hand back empty pages with a continuation token.
        loop {
            let output = self
                .query_client
                .query()
                .query_string(&sql)
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|error| StoreError::Query {
                    table,
                    reason: format!("timestream query failed: {error}"),
                })?;
            if let Some(row) = output.rows().first() {
                let columns: Vec<(String, String)> = output
                    .column_info()
                    .iter()
                    .map(|column| {
                        let scalar_type = column
                            .r#type()
                            .and_then(|column_type| column_type.scalar_type())
                            .map(|scalar| scalar.as_str().to_string())
                            .unwrap_or_default();
                        (column.name().unwrap_or_default().to_string(), scalar_type)
                    })
                    .collect();
                let values: Vec<Option<&str>> = row
                    .data()
                    .iter()
                    .map(|datum| match datum.null_value() {
                        Some(true) => None,
                        _ => datum.scalar_value(),
                    })
                    .collect();
                return decode_row(table, &columns, &values)
                    .map(Some)
                    .map_err(|reason| StoreError::Query { table, reason });
            }
            match output.next_token() {
                Some(token) => next_token = Some(token.to_string()),
                None => return Ok(None),
            }
        }
    }
}

fn to_timestream_record(record: &TimeSeriesRecord) -> Result<Record, String> {
    let dimensions = record
        .dimensions
        .iter()
        .map(|(name, value)| {
            Dimension::builder()
                .name(name)
                .value(value)
                .build()
                .map_err(|error| format!("invalid dimension '{name}': {error}"))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let measures = record
        .measures
        .iter()
        .map(|(name, value)| {
            let value_type = match value {
                MeasureValue::Double(_) => MeasureValueType::Double,
                MeasureValue::BigInt(_) => MeasureValueType::Bigint,
                MeasureValue::Varchar(_) => MeasureValueType::Varchar,
                MeasureValue::Boolean(_) => MeasureValueType::Boolean,
            };
            TimestreamMeasure::builder()
                .name(name)
                .value(value.render())
                .r#type(value_type)
                .build()
                .map_err(|error| format!("invalid measure '{name}': {error}"))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Record::builder()
        .measure_name(&record.measure_name)
        .measure_value_type(MeasureValueType::Multi)
        .set_measure_values(Some(measures))
        .set_dimensions(Some(dimensions))
        .time(record.time_ms.to_string())
        .time_unit(TimeUnit::Milliseconds)
        .build())
}

#[async_trait]
impl TimeSeriesStore for TimestreamStore {
    async fn write_batch(
        &self,
        table: TableKind,
        records: &[TimeSeriesRecord],
    ) -> Result<usize, StoreError> {
        let mut written = 0usize;
        for chunk in records.chunks(TIMESTREAM_MAX_RECORDS_PER_WRITE) {
            let converted = chunk
                .iter()
                .map(to_timestream_record)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|reason| StoreError::Encode { table, reason })?;
            self.client
                .write_records()
                .database_name(&self.database)
                .table_name(table.as_str())
                .set_records(Some(converted))
                .send()
                .await
                .map_err(|error| StoreError::Write {
                    table,
                    reason: format!("timestream write failed after {written} records: {error}"),
                })?;
            written += chunk.len();
        }
        Ok(written)
    }

    async fn query_latest(
        &self,
        table: TableKind,
        filter: &DimensionFilter,
    ) -> Result<Option<TimeSeriesRecord>, StoreError> {
        self.query_row(table, filter, None).await
    }

    async fn query_at_or_before(
        &self,
        table: TableKind,
        filter: &DimensionFilter,
        at: DateTime<Utc>,
    ) -> Result<Option<TimeSeriesRecord>, StoreError> {
        self.query_row(table, filter, Some(at)).await
    }
}

struct SqsPublisher {
    client: aws_sdk_sqs::Client,
    queue_url: String,
}

#[async_trait]
impl EventPublisher for SqsPublisher {
    async fn publish(&self, topic: TopicKind, event: &StreamEvent) -> Result<(), PublishError> {
        let body = event.to_json().map_err(|error| PublishError::Encode {
            event_id: event.event_id.clone(),
            reason: error.to_string(),
        })?;
        let topic_attribute = MessageAttributeValue::builder()
            .data_type("String")
            .string_value(topic.as_str())
            .build()
            .map_err(|error| PublishError::Transport {
                topic,
                reason: error.to_string(),
            })?;
        self.client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(body)
            .message_attributes("topic", topic_attribute)
            .send()
            .await
            .map(|_| ())
            .map_err(|error| PublishError::Transport {
                topic,
                reason: format!("failed to enqueue event: {error}"),
            })
    }
}

async fn load_catalog(source: &CatalogSource) -> Result<Catalog, String> {
    match source {
        CatalogSource::Path(path) => Catalog::from_path(path).map_err(|error| error.to_string()),
        CatalogSource::S3 { bucket, key } => {
            let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
            let object = aws_sdk_s3::Client::new(&aws_config)
                .get_object()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map_err(|error| format!("failed to read s3://{bucket}/{key}: {error}"))?;
            let bytes = object
                .body
                .collect()
                .await
                .map_err(|error| format!("failed to read s3://{bucket}/{key}: {error}"))?
                .into_bytes();
            let text = String::from_utf8(bytes.to_vec())
                .map_err(|error| format!("catalog is not valid UTF-8: {error}"))?;
            Catalog::from_json_str(&text).map_err(|error| error.to_string())
        }
    }
}

async fn build_store(sink: &SinkTarget) -> Result<Arc<dyn TimeSeriesStore>, String> {
    match sink {
        SinkTarget::Parquet(dir) => Ok(Arc::new(ParquetDirectoryStore::new(dir))),
        SinkTarget::Timestream { database } => {
            let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
            let (client, reload) = aws_sdk_timestreamwrite::Client::new(&aws_config)
                .with_endpoint_discovery_enabled()
                .await
                .map_err(|error| format!("timestream endpoint discovery failed: {error}"))?;
            tokio::spawn(reload.reload_task());
            let (query_client, query_reload) = aws_sdk_timestreamquery::Client::new(&aws_config)
                .with_endpoint_discovery_enabled()
                .await
                .map_err(|error| format!("timestream query endpoint discovery failed: {error}"))?;
            tokio::spawn(query_reload.reload_task());
            Ok(Arc::new(TimestreamStore {
                client,
                query_client,
                database: database.clone(),
            }))
        }
    }
}

async fn build_publisher(events: &EventsTarget) -> Arc<dyn EventPublisher> {
    match events {
        EventsTarget::Sqs { queue_url } => {
            let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
            Arc::new(SqsPublisher {
                client: aws_sdk_sqs::Client::new(&aws_config),
                queue_url: queue_url.clone(),
            })
        }
        EventsTarget::Log => Arc::new(LogPublisher),
        EventsTarget::None => Arc::new(NoopPublisher),
    }
}

async fn run(args: FeederArgs) -> Result<(), String> {
    let configs = args.feeder_configs()?;
    let source = CatalogSource::parse(&args.catalog)?;
    let catalog = Arc::new(load_catalog(&source).await?);
    log_info(
        "feeder_process",
        "catalog_loaded",
        json!({
            "source": args.catalog,
            "lines": catalog.routes().count(),
            "stops": catalog.stops().count(),
            "buses": catalog.buses().len(),
        }),
    );
    let context = match args.seed {
        Some(seed) => SimulationContext::with_seed(Arc::clone(&catalog), seed),
        None => SimulationContext::new(Arc::clone(&catalog)),
    }
    .into_shared();

    let store = build_store(&args.sink).await?;
    let publisher = build_publisher(&args.events).await;
    if let Some(point) = args.restore {
        restore_waiting_counts(&context, store.as_ref(), point).await;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::with_capacity(configs.len());
    for config in configs {
        let mut feeder = Feeder::new(config);
        feeder
            .load_config(Arc::clone(&context))
            .map_err(|error| error.to_string())?;
        feeder
            .attach_clients(Arc::clone(&store), Arc::clone(&publisher))
            .map_err(|error| error.to_string())?;
        let shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move { feeder.run(shutdown).await }));
    }

    let signal = shutdown_signal().await;
    log_info(
        "feeder_process",
        "shutdown_requested",
        json!({ "signal": signal }),
    );
    // Receivers observe the flag between ticks; a send error only means every feeder already exited.
    let _ = shutdown_tx.send(true);

    for handle in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => log_error(
                "feeder_process",
                "feeder_stopped_with_error",
                json!({ "error": error.to_string() }),
            ),
            Err(error) => log_error(
                "feeder_process",
                "feeder_task_panicked",
                json!({ "error": error.to_string() }),
            ),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = FeederArgs::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            log_error("feeder_process", "startup_failed", json!({ "error": error }));
            ExitCode::FAILURE
        }
    }
}

/// Resolves on SIGINT, or on SIGTERM where the platform has it. A handler
/// that cannot be installed is logged and never resolves.
async fn shutdown_signal() -> &'static str {
    let interrupt = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => "interrupt",
            Err(error) => {
                log_error(
                    "feeder_process",
                    "signal_handler_failed",
                    json!({ "signal": "interrupt", "error": error.to_string() }),
                );
                std::future::pending().await
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                "terminate"
            }
            Err(error) => {
                log_error(
                    "feeder_process",
                    "signal_handler_failed",
                    json!({ "signal": "terminate", "error": error.to_string() }),
                );
                std::future::pending().await
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<&'static str>();

    tokio::select! {
        signal = interrupt => signal,
        signal = terminate => signal,
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn latest_row_query_quotes_every_user_value() {
        let filter = DimensionFilter::new()
            .measure_name("stop_state")
            .dimension("stop_id", "O'Connell");
        let at = Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap();

        let sql = latest_row_query("city_bus", TableKind::StopPeopleCount, &filter, Some(at));
        assert_eq!(
            sql,
            format!(
                "SELECT * FROM \"city_bus\".\"stop_people_count\" WHERE measure_name = 'stop_state' \
                 AND \"stop_id\" = 'O''Connell' AND time <= from_milliseconds({}) ORDER BY time DESC LIMIT 1",
                at.timestamp_millis()
            )
        );
        assert_eq!(
            latest_row_query("db", TableKind::SensorReadings, &DimensionFilter::new(), None),
            "SELECT * FROM \"db\".\"sensor_readings\" ORDER BY time DESC LIMIT 1"
        );
    }

    #[test]
    fn result_rows_split_into_dimensions_and_measures() {
        let columns: Vec<(String, String)> = [
            ("stop_id", "VARCHAR"),
            ("line_ids", "VARCHAR"),
            ("measure_name", "VARCHAR"),
            ("time", "TIMESTAMP"),
            ("waiting_count", "BIGINT"),
            ("demand_multiplier", "DOUBLE"),
            ("boarded", "BIGINT"),
        ]
        .iter()
        .map(|(name, kind)| (name.to_string(), kind.to_string()))
        .collect();
        let values = [
            Some("S3"),
            Some("L1,L2"),
            Some("stop_state"),
            Some("2026-03-02 08:00:00.000000000"),
            Some("17"),
            Some("2.5"),
            None,
        ];

        let record = decode_row(TableKind::StopPeopleCount, &columns, &values).expect("decode");
        assert_eq!(record.measure_name, "stop_state");
        assert_eq!(
            record.time_ms,
            Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap().timestamp_millis()
        );
        assert_eq!(record.dimension("line_ids"), Some("L1,L2"));
        assert_eq!(record.measures["waiting_count"], MeasureValue::BigInt(17));
        assert_eq!(record.measures["demand_multiplier"], MeasureValue::Double(2.5));
        assert!(!record.measures.contains_key("boarded"));
        assert!(decode_row(TableKind::StopPeopleCount, &columns[..2], &values[..2]).is_err());
    }

    #[test]
    fn records_become_multi_measure_rows() {
        let at = Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap();
        let record = TimeSeriesRecord::new("bus_state", at)
            .with_dimension("bus_id", "B1")
            .with_measure("passenger_count", 12u32)
            .with_measure("speed_kmh", 24.5);

        let converted = to_timestream_record(&record).expect("convert");
        assert_eq!(converted.measure_name(), Some("bus_state"));
        assert_eq!(converted.measure_value_type(), Some(&MeasureValueType::Multi));
        assert_eq!(converted.time_unit(), Some(&TimeUnit::Milliseconds));
        assert_eq!(converted.time(), Some(at.timestamp_millis().to_string().as_str()));
        assert_eq!(converted.dimensions().len(), 1);
        let measures = converted.measure_values();
        assert_eq!(measures.len(), 2);
        assert_eq!(measures[0].name(), "passenger_count");
        assert_eq!(measures[0].r#type(), &MeasureValueType::Bigint);
        assert_eq!(measures[1].value(), "24.5");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_signal_requests_shutdown() {
        let waiter = tokio::spawn(shutdown_signal());
        // Let the task install its handlers before the signal is raised.
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        let status = std::process::Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .expect("run kill");
        assert!(status.success());

        let signal = tokio::time::timeout(std::time::Duration::from_secs(5), waiter)
            .await
            .expect("signal observed")
            .expect("task completes");
        assert_eq!(signal, "terminate");
    }
}
