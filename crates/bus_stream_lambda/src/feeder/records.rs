//! Mapping from simulation output to time-series rows and stream events.

use bus_sim_core::catalog::Catalog;
use bus_sim_core::context::{BusTick, StopTick};
use bus_sim_core::sensors::{BusSensorReading, StopSensorReading};
use bus_sim_core::state::{ArrivalEvent, BusState};
use bus_stream_core::contract::{StreamEvent, StreamEventKind, TimeSeriesRecord};
use bus_stream_core::naming::measures;
use chrono::{DateTime, Utc};
use serde_json::json;

fn next_stop_id<'a>(catalog: &'a Catalog, bus: &BusState) -> Option<&'a str> {
    catalog
        .route(&bus.line_id)
        .and_then(|route| route.stops.get(bus.next_stop_index))
        .map(|stop| stop.stop_id.as_str())
}

pub fn bus_position_record(catalog: &Catalog, tick: &BusTick, at: DateTime<Utc>) -> TimeSeriesRecord {
    let bus = &tick.state;
    let mut record = TimeSeriesRecord::new(measures::BUS_STATE, at)
        .with_dimension("bus_id", bus.bus_id.as_str())
        .with_dimension("line_id", bus.line_id.as_str())
        .with_measure("latitude", bus.position.latitude)
        .with_measure("longitude", bus.position.longitude)
        .with_measure("speed_kmh", bus.speed_kmh)
        .with_measure("distance_km", tick.distance_km)
        .with_measure("passenger_count", bus.passenger_count)
        .with_measure("capacity", bus.capacity)
        .with_measure("occupancy_pct", bus.occupancy_pct())
        .with_measure("direction", bus.direction.as_str());
    if let Some(stop_id) = next_stop_id(catalog, bus) {
        record = record.with_measure("next_stop_id", stop_id);
    }
    if let Some(stop_id) = &bus.at_stop {
        record = record.with_measure("at_stop", stop_id.as_str());
    }
    record
}

/// `ordinal` is the visit's position in the bus's tick; it keeps a stop passed
/// twice at one timestamp as two rows.
pub fn arrival_record(arrival: &ArrivalEvent, ordinal: usize) -> TimeSeriesRecord {
    TimeSeriesRecord::new(measures::STOP_ARRIVAL, arrival.timestamp)
        .with_dimension("bus_id", arrival.bus_id.as_str())
        .with_dimension("line_id", arrival.line_id.as_str())
        .with_dimension("stop_id", arrival.stop_id.as_str())
        .with_dimension("visit", ordinal.to_string())
        .with_measure("boarding_count", arrival.boarding_count)
        .with_measure("alighting_count", arrival.alighting_count)
        .with_measure("bus_passenger_count", arrival.bus_passenger_count)
        .with_measure("stop_waiting_count", arrival.stop_waiting_count)
}

pub fn bus_position_event(catalog: &Catalog, bus: &BusState, at: DateTime<Utc>) -> StreamEvent {
    StreamEvent::new(
        StreamEventKind::BusPositionChanged,
        bus.bus_id.as_str(),
        Some(bus.line_id.clone()),
        at,
        json!({
            "bus_id": bus.bus_id,
            "line_id": bus.line_id,
            "latitude": bus.position.latitude,
            "longitude": bus.position.longitude,
            "speed_kmh": bus.speed_kmh,
            "passenger_count": bus.passenger_count,
            "capacity": bus.capacity,
            "direction": bus.direction.as_str(),
            "next_stop_id": next_stop_id(catalog, bus),
            "at_stop": bus.at_stop,
            "timestamp": at.to_rfc3339(),
        }),
    )
}

/// `ordinal` keeps two visits to the same stop within one tick distinct.
pub fn arrival_event(arrival: &ArrivalEvent, ordinal: usize) -> StreamEvent {
    StreamEvent::new(
        StreamEventKind::BusArrivedAtStop,
        format!("{}@{}#{ordinal}", arrival.bus_id, arrival.stop_id),
        Some(arrival.line_id.clone()),
        arrival.timestamp,
        json!(arrival),
    )
}

pub fn stop_people_count_record(tick: &StopTick, at: DateTime<Utc>) -> TimeSeriesRecord {
    TimeSeriesRecord::new(measures::STOP_STATE, at)
        .with_dimension("stop_id", tick.stop_id.as_str())
        .with_dimension("line_ids", tick.line_ids.join(","))
        .with_measure("waiting_count", tick.update.waiting_count)
        .with_measure("previous_count", tick.previous_count)
        .with_measure("new_arrivals", tick.update.new_arrivals)
        .with_measure("boarded", tick.update.boarded)
        .with_measure("demand_multiplier", tick.update.multiplier)
}

/// One event per line serving the stop, so line subscribers see it.
pub fn stop_people_count_events(tick: &StopTick, at: DateTime<Utc>) -> Vec<StreamEvent> {
    tick.line_ids
        .iter()
        .map(|line_id| {
            StreamEvent::new(
                StreamEventKind::StopPeopleCountChanged,
                format!("{}@{line_id}", tick.stop_id),
                Some(line_id.clone()),
                at,
                json!({
                    "stop_id": tick.stop_id,
                    "line_id": line_id,
                    "waiting_count": tick.update.waiting_count,
                    "previous_count": tick.previous_count,
                    "timestamp": at.to_rfc3339(),
                }),
            )
        })
        .collect()
}

pub fn bus_sensor_record(reading: &BusSensorReading, at: DateTime<Utc>) -> TimeSeriesRecord {
    TimeSeriesRecord::new(measures::BUS_SENSORS, at)
        .with_dimension("bus_id", reading.bus_id.as_str())
        .with_dimension("line_id", reading.line_id.as_str())
        .with_measure("temperature_c", reading.temperature_c)
        .with_measure("humidity_pct", reading.humidity_pct)
        .with_measure("co2_ppm", reading.co2_ppm)
        .with_measure("noise_db", reading.noise_db)
        .with_measure("door_open", reading.door_open)
        .with_measure("passenger_count", reading.passenger_count)
}

pub fn stop_sensor_record(reading: &StopSensorReading, at: DateTime<Utc>) -> TimeSeriesRecord {
    TimeSeriesRecord::new(measures::STOP_SENSORS, at)
        .with_dimension("stop_id", reading.stop_id.as_str())
        .with_measure("temperature_c", reading.temperature_c)
        .with_measure("humidity_pct", reading.humidity_pct)
        .with_measure("noise_db", reading.noise_db)
        .with_measure("pm25_ugm3", reading.pm25_ugm3)
        .with_measure("waiting_count", reading.waiting_count)
}

pub fn bus_sensor_event(reading: &BusSensorReading, at: DateTime<Utc>) -> StreamEvent {
    StreamEvent::new(
        StreamEventKind::SensorReadingsPublished,
        reading.bus_id.as_str(),
        Some(reading.line_id.clone()),
        at,
        json!(reading),
    )
}
