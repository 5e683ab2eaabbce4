//! Stable names for time-series tables, event topics and local batch files.

use std::str::FromStr;

use crate::contract::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TableKind {
    BusPositions,
    StopPeopleCount,
    SensorReadings,
}

impl TableKind {
    pub const ALL: [TableKind; 3] = [
        Self::BusPositions,
        Self::StopPeopleCount,
        Self::SensorReadings,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::BusPositions => "bus_positions",
            Self::StopPeopleCount => "stop_people_count",
            Self::SensorReadings => "sensor_readings",
        }
    }

    /// Dimension columns that rows of this table may carry.
    pub fn dimension_names(self) -> &'static [&'static str] {
        match self {
            Self::BusPositions => &["bus_id", "line_id", "stop_id", "visit"],
            Self::StopPeopleCount => &["stop_id", "line_ids"],
            Self::SensorReadings => &["bus_id", "line_id", "stop_id"],
        }
    }
}

impl std::fmt::Display for TableKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TableKind {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| ValidationError::new(format!("unknown table '{value}'")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TopicKind {
    BusPosition,
    StopPeopleCount,
    Sensor,
}

impl TopicKind {
    pub const ALL: [TopicKind; 3] = [Self::BusPosition, Self::StopPeopleCount, Self::Sensor];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::BusPosition => "bus.position",
            Self::StopPeopleCount => "stop.people_count",
            Self::Sensor => "sensor.readings",
        }
    }
}

impl std::fmt::Display for TopicKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TopicKind {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| ValidationError::new(format!("unknown topic '{value}'")))
    }
}

/// Measure names written into each table.
pub mod measures {
    pub const BUS_STATE: &str = "bus_state";
    pub const STOP_ARRIVAL: &str = "stop_arrival";
    pub const STOP_STATE: &str = "stop_state";
    pub const BUS_SENSORS: &str = "bus_sensors";
    pub const STOP_SENSORS: &str = "stop_sensors";
}

pub fn table_prefix(table: TableKind) -> String {
    format!("table={}", table.as_str())
}

/// Relative key of one persisted batch, e.g. `table=bus_positions/batch-1700000000000.parquet`.
/// A non-zero `sequence` disambiguates batches written within the same millisecond.
pub fn batch_object_key(table: TableKind, time_ms: i64, sequence: u32) -> String {
    if sequence == 0 {
        format!("{}/batch-{time_ms}.parquet", table_prefix(table))
    } else {
        format!("{}/batch-{time_ms}-{sequence}.parquet", table_prefix(table))
    }
}
