use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

pub const STREAM_EVENT_SCHEMA_VERSION: &str = "v1";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ValidationError {
    message: String,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// One typed measure of a multi-measure time-series row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MeasureValue {
    Double(f64),
    BigInt(i64),
    Varchar(String),
    Boolean(bool),
}

impl MeasureValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Double(_) => "DOUBLE",
            Self::BigInt(_) => "BIGINT",
            Self::Varchar(_) => "VARCHAR",
            Self::Boolean(_) => "BOOLEAN",
        }
    }

    /// String form used by stores that take every value as text.
    pub fn render(&self) -> String {
        match self {
            Self::Double(value) => value.to_string(),
            Self::BigInt(value) => value.to_string(),
            Self::Varchar(value) => value.clone(),
            Self::Boolean(value) => value.to_string(),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Double(value) => Some(*value),
            Self::BigInt(value) => Some(*value as f64),
            _ => None,
        }
    }

    /// Inverse of [`MeasureValue::render`] for a known type name.
    pub fn parse_rendered(type_name: &str, text: &str) -> Result<Self, ValidationError> {
        let invalid = |error: &dyn std::fmt::Display| {
            ValidationError::new(format!("invalid {type_name} value '{text}': {error}"))
        };
        match type_name {
            "DOUBLE" => text.parse().map(Self::Double).map_err(|e| invalid(&e)),
            "BIGINT" | "INTEGER" => text.parse().map(Self::BigInt).map_err(|e| invalid(&e)),
            "BOOLEAN" => text.parse().map(Self::Boolean).map_err(|e| invalid(&e)),
            "VARCHAR" => Ok(Self::Varchar(text.to_string())),
            other => Err(ValidationError::new(format!(
                "unsupported measure type '{other}'"
            ))),
        }
    }
}

impl From<f64> for MeasureValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<i64> for MeasureValue {
    fn from(value: i64) -> Self {
        Self::BigInt(value)
    }
}

impl From<u32> for MeasureValue {
    fn from(value: u32) -> Self {
        Self::BigInt(i64::from(value))
    }
}

impl From<bool> for MeasureValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<String> for MeasureValue {
    fn from(value: String) -> Self {
        Self::Varchar(value)
    }
}

impl From<&str> for MeasureValue {
    fn from(value: &str) -> Self {
        Self::Varchar(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesRecord {
    pub measure_name: String,
    pub time_ms: i64,
    pub dimensions: BTreeMap<String, String>,
    pub measures: BTreeMap<String, MeasureValue>,
}

impl TimeSeriesRecord {
    pub fn new(measure_name: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            measure_name: measure_name.into(),
            time_ms: at.timestamp_millis(),
            dimensions: BTreeMap::new(),
            measures: BTreeMap::new(),
        }
    }

    pub fn with_dimension(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.dimensions.insert(name.into(), value.into());
        self
    }

    pub fn with_measure(mut self, name: impl Into<String>, value: impl Into<MeasureValue>) -> Self {
        self.measures.insert(name.into(), value.into());
        self
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.time_ms).single()
    }

    pub fn dimension(&self, name: &str) -> Option<&str> {
        self.dimensions.get(name).map(String::as_str)
    }
}

/// Equality filter on measure name and dimensions. An empty filter matches every row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DimensionFilter {
    measure_name: Option<String>,
    dimensions: BTreeMap<String, String>,
}

impl DimensionFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn measure_name(mut self, name: impl Into<String>) -> Self {
        self.measure_name = Some(name.into());
        self
    }

    pub fn dimension(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.dimensions.insert(name.into(), value.into());
        self
    }

    pub fn measure(&self) -> Option<&str> {
        self.measure_name.as_deref()
    }

    pub fn dimensions(&self) -> impl Iterator<Item = (&str, &str)> {
        self.dimensions
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn matches(&self, record: &TimeSeriesRecord) -> bool {
        self.measure_name
            .as_deref()
            .map_or(true, |name| record.measure_name == name)
            && self
                .dimensions
                .iter()
                .all(|(name, value)| record.dimension(name) == Some(value.as_str()))
    }
}

/// Newest record matching `filter`, optionally no later than `at_or_before_ms`.
/// On equal timestamps the last one in iteration order wins.
pub fn select_latest<'a>(
    records: impl IntoIterator<Item = &'a TimeSeriesRecord>,
    filter: &DimensionFilter,
    at_or_before_ms: Option<i64>,
) -> Option<&'a TimeSeriesRecord> {
    records
        .into_iter()
        .filter(|record| filter.matches(record))
        .filter(|record| at_or_before_ms.map_or(true, |limit| record.time_ms <= limit))
        .max_by_key(|record| record.time_ms)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventKind {
    BusPositionChanged,
    BusArrivedAtStop,
    StopPeopleCountChanged,
    SensorReadingsPublished,
}

impl StreamEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BusPositionChanged => "bus_position_changed",
            Self::BusArrivedAtStop => "bus_arrived_at_stop",
            Self::StopPeopleCountChanged => "stop_people_count_changed",
            Self::SensorReadingsPublished => "sensor_readings_published",
        }
    }
}

/// Envelope for everything published to the event bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub event_id: String,
    pub kind: StreamEventKind,
    /// Entity the event is about (bus, stop, or `bus@stop` for arrivals).
    pub subject_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_id: Option<String>,
    pub emitted_at: DateTime<Utc>,
    pub schema_version: String,
    pub payload: Value,
}

impl StreamEvent {
    pub fn new(
        kind: StreamEventKind,
        subject_id: impl Into<String>,
        line_id: Option<String>,
        emitted_at: DateTime<Utc>,
        payload: Value,
    ) -> Self {
        let subject_id = subject_id.into();
        Self {
            event_id: event_fingerprint(kind, &subject_id, emitted_at),
            kind,
            subject_id,
            line_id,
            emitted_at,
            schema_version: STREAM_EVENT_SCHEMA_VERSION.to_string(),
            payload,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, ValidationError> {
        serde_json::from_str(text)
            .map_err(|error| ValidationError::new(format!("invalid stream event: {error}")))
    }
}

/// Stable id for de-duplicating at-least-once deliveries.
pub fn event_fingerprint(kind: StreamEventKind, subject_id: &str, at: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update([0x1f]);
    hasher.update(subject_id.as_bytes());
    hasher.update([0x1f]);
    hasher.update(at.timestamp_millis().to_be_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 8, 15, 0).unwrap()
    }

    #[test]
    fn record_builder_collects_dimensions_and_measures() {
        let record = TimeSeriesRecord::new("bus_state", at())
            .with_dimension("bus_id", "B1")
            .with_measure("passenger_count", 12u32)
            .with_measure("speed_kmh", 27.5)
            .with_measure("door_open", false);

        assert_eq!(record.time_ms, at().timestamp_millis());
        assert_eq!(record.timestamp(), Some(at()));
        assert_eq!(record.dimension("bus_id"), Some("B1"));
        assert_eq!(record.measures["passenger_count"], MeasureValue::BigInt(12));
        assert_eq!(record.measures["speed_kmh"].type_name(), "DOUBLE");
        assert_eq!(record.measures["door_open"].render(), "false");
    }

    #[test]
    fn rendered_measures_parse_back_by_type_name() {
        for value in [
            MeasureValue::Double(27.5),
            MeasureValue::BigInt(-3),
            MeasureValue::Boolean(true),
            MeasureValue::Varchar("forward".to_string()),
        ] {
            let parsed = MeasureValue::parse_rendered(value.type_name(), &value.render());
            assert_eq!(parsed, Ok(value));
        }
        assert!(MeasureValue::parse_rendered("BIGINT", "twelve").is_err());
        assert!(MeasureValue::parse_rendered("TIMESTAMP", "0").is_err());
    }

    #[test]
    fn select_latest_honours_filter_and_upper_bound() {
        let early = TimeSeriesRecord::new("stop_state", at())
            .with_dimension("stop_id", "S1")
            .with_measure("waiting_count", 4u32);
        let late = TimeSeriesRecord::new("stop_state", at() + chrono::Duration::minutes(5))
            .with_dimension("stop_id", "S1")
            .with_measure("waiting_count", 9u32);
        let other = TimeSeriesRecord::new("stop_state", at() + chrono::Duration::minutes(9))
            .with_dimension("stop_id", "S2");
        let rows = [early.clone(), late.clone(), other];

        let filter = DimensionFilter::new()
            .measure_name("stop_state")
            .dimension("stop_id", "S1");
        assert_eq!(select_latest(&rows, &filter, None), Some(&late));
        assert_eq!(
            select_latest(&rows, &filter, Some(at().timestamp_millis() + 1)),
            Some(&early)
        );
        assert_eq!(select_latest(&rows, &filter, Some(0)), None);
        assert!(!DimensionFilter::new().measure_name("bus_state").matches(&early));
        assert!(DimensionFilter::new().matches(&early));
    }

    #[test]
    fn measure_values_serialize_with_their_type_tag() {
        let encoded = serde_json::to_value(MeasureValue::BigInt(7)).expect("serialize");
        assert_eq!(encoded, json!({"type": "BIGINT", "value": 7}));
    }

    #[test]
    fn fingerprint_depends_on_kind_subject_and_time() {
        let base = event_fingerprint(StreamEventKind::BusPositionChanged, "B1", at());
        assert_eq!(base, event_fingerprint(StreamEventKind::BusPositionChanged, "B1", at()));
        assert_eq!(base.len(), 64);
        assert_ne!(base, event_fingerprint(StreamEventKind::BusPositionChanged, "B2", at()));
        assert_ne!(base, event_fingerprint(StreamEventKind::BusArrivedAtStop, "B1", at()));
        assert_ne!(
            base,
            event_fingerprint(
                StreamEventKind::BusPositionChanged,
                "B1",
                at() + chrono::Duration::seconds(15)
            )
        );
    }

    #[test]
    fn stream_event_survives_the_event_bus() {
        let event = StreamEvent::new(
            StreamEventKind::BusArrivedAtStop,
            "B1@S2",
            Some("L1".to_string()),
            at(),
            json!({"boarding_count": 16}),
        );
        let text = event.to_json().expect("serialize");
        assert!(text.contains("\"kind\":\"bus_arrived_at_stop\""));
        assert_eq!(StreamEvent::from_json(&text).expect("decode"), event);
    }

    #[test]
    fn undecodable_stream_event_is_a_validation_error() {
        let error = StreamEvent::from_json("{\"kind\":\"teleported\"}").expect_err("should fail");
        assert!(error.message().starts_with("invalid stream event"));
    }
}
