//! Mutable per-entity state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::{BusDefinition, Route};
use crate::error::SimulationError;
use crate::geo::LatLng;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Increasing stop index.
    #[default]
    Forward,
    /// Decreasing stop index.
    Reverse,
}

impl Direction {
    pub fn reversed(self) -> Self {
        match self {
            Self::Forward => Self::Reverse,
            Self::Reverse => Self::Forward,
        }
    }

    /// Next index in this direction, or `None` past either end.
    pub fn step(self, index: usize, last_index: usize) -> Option<usize> {
        match self {
            Self::Forward if index < last_index => Some(index + 1),
            Self::Reverse if index > 0 => Some(index - 1),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Forward => "forward",
            Self::Reverse => "reverse",
        }
    }
}

/// Live state of one bus. Lives for the whole process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusState {
    pub bus_id: String,
    pub line_id: String,
    pub capacity: u32,
    pub passenger_count: u32,
    pub direction: Direction,
    /// Stop the bus last departed from.
    pub previous_stop_index: usize,
    pub next_stop_index: usize,
    /// Distance travelled from the previous stop along the current segment.
    pub progress_km: f64,
    pub speed_kmh: f64,
    pub position: LatLng,
    /// Stop reached during the latest position tick, if any (doors open).
    pub at_stop: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl BusState {
    pub fn from_definition(definition: &BusDefinition, route: &Route) -> Self {
        let last = route.last_index();
        let start = definition.start_stop_index.min(last);
        let (direction, next) = match definition.direction.step(start, last) {
            Some(next) => (definition.direction, next),
            None => {
                let flipped = definition.direction.reversed();
                // Routes always have two or more stops, so the flipped step exists.
                (flipped, flipped.step(start, last).unwrap_or(start))
            }
        };
        Self {
            bus_id: definition.bus_id.clone(),
            line_id: definition.line_id.clone(),
            capacity: definition.capacity,
            passenger_count: definition.initial_passengers.min(definition.capacity),
            direction,
            previous_stop_index: start,
            next_stop_index: next,
            progress_km: 0.0,
            speed_kmh: 0.0,
            position: route.stops[start].location(),
            at_stop: None,
            last_updated: None,
        }
    }

    pub fn occupancy_pct(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        f64::from(self.passenger_count) / f64::from(self.capacity) * 100.0
    }

    /// Structural checks run before a bus is advanced.
    pub fn check(&self, route: &Route) -> Result<(), SimulationError> {
        let malformed = |reason: String| SimulationError::MalformedState {
            bus_id: self.bus_id.clone(),
            reason,
        };
        if self.capacity == 0 {
            return Err(malformed("capacity must be positive".to_string()));
        }
        if self.passenger_count > self.capacity {
            return Err(malformed(format!(
                "passenger_count {} exceeds capacity {}",
                self.passenger_count, self.capacity
            )));
        }
        let last = route.last_index();
        if self.previous_stop_index > last || self.next_stop_index > last {
            return Err(malformed(format!(
                "stop indices {}->{} outside line '{}'",
                self.previous_stop_index, self.next_stop_index, route.line_id
            )));
        }
        if self.direction.step(self.previous_stop_index, last) != Some(self.next_stop_index) {
            return Err(malformed(format!(
                "next stop {} does not follow {} in direction {}",
                self.next_stop_index,
                self.previous_stop_index,
                self.direction.as_str()
            )));
        }
        if !self.progress_km.is_finite() || self.progress_km < 0.0 {
            return Err(malformed(format!("progress_km {} is invalid", self.progress_km)));
        }
        Ok(())
    }
}

/// A bus crossing a stop boundary. Consumed by the persist/publish step, then dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrivalEvent {
    pub bus_id: String,
    pub line_id: String,
    pub stop_id: String,
    pub timestamp: DateTime<Utc>,
    pub boarding_count: u32,
    pub alighting_count: u32,
    pub bus_passenger_count: u32,
    pub stop_waiting_count: u32,
}
